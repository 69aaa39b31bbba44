//! Leader lease manager
//!
//! Per-node election state machine: `Follower -> Candidate -> Leader ->
//! Follower`. A node becomes Leader only after the store confirms the
//! acquisition; a lost compare-and-swap race leaves it Follower. Renewal
//! runs at TTL/3, well ahead of the TTL/2 deadline.
//!
//! The core safety rule is self-demotion on doubt: while Leader, if the
//! store has not confirmed the lease for a full TTL (failures or
//! unreachability), step down unilaterally even without confirmation that
//! the lease was revoked. A slow store link must never yield two primaries.

use crate::common::{jittered, Backoff, Result};
use crate::store::{bounded, CoordinationStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionState {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::Follower => write!(f, "follower"),
            ElectionState::Candidate => write!(f, "candidate"),
            ElectionState::Leader => write!(f, "leader"),
        }
    }
}

/// The lease manager's published view, consumed by the member agent and
/// the status endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseView {
    pub state: ElectionState,
    /// Fencing token while Leader
    pub token: Option<u64>,
    /// Last observed lease holder (self while Leader)
    pub holder: Option<String>,
}

impl Default for LeaseView {
    fn default() -> Self {
        Self {
            state: ElectionState::Follower,
            token: None,
            holder: None,
        }
    }
}

pub struct LeaseManager {
    store: Arc<dyn CoordinationStore>,
    key: String,
    member_id: String,
    ttl: Duration,
    op_timeout: Duration,
    view_tx: watch::Sender<LeaseView>,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        key: String,
        member_id: String,
        ttl: Duration,
        op_timeout: Duration,
    ) -> (Self, watch::Receiver<LeaseView>) {
        let (view_tx, view_rx) = watch::channel(LeaseView::default());
        (
            Self {
                store,
                key,
                member_id,
                ttl,
                op_timeout,
                view_tx,
            },
            view_rx,
        )
    }

    fn publish(&self, view: LeaseView) {
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    fn state(&self) -> ElectionState {
        self.view_tx.borrow().state
    }

    /// Run the election loop until cancelled. On clean shutdown a held
    /// lease is released so the successor need not wait out the TTL.
    pub async fn run(self, shutdown: CancellationToken) {
        let renew_every = self.ttl / 3;
        // Store failures retry with exponential backoff, capped so a
        // leader never sits out a full renewal window between attempts
        let mut backoff = Backoff::new(Duration::from_millis(100), renew_every);
        // Last successful store round-trip; the self-demotion clock
        let mut last_contact = Instant::now();
        let mut delay = Duration::ZERO;

        loop {
            // While Leader, a hard deadline enforces self-demotion at
            // exactly last_contact + TTL, independent of retry cadence
            let doubt_deadline = (self.state() == ElectionState::Leader)
                .then(|| last_contact + self.ttl);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = sleep_until_opt(doubt_deadline), if doubt_deadline.is_some() => {
                    tracing::warn!(
                        member = %self.member_id,
                        "no store contact for a full TTL, stepping down"
                    );
                    self.publish(LeaseView::default());
                    delay = Duration::ZERO;
                    continue;
                }
            }

            // Stand for election only once the lease looks free; a lease
            // held by a peer makes us a plain Follower, not a Candidate
            if self.state() == ElectionState::Follower
                && self.view_tx.borrow().holder.is_none()
            {
                self.publish(LeaseView {
                    state: ElectionState::Candidate,
                    token: None,
                    holder: None,
                });
            }

            let attempt = bounded(
                self.op_timeout,
                self.store
                    .acquire_or_renew(&self.key, &self.member_id, self.ttl),
            )
            .await;

            match attempt {
                Ok(grant) if grant.granted => {
                    last_contact = Instant::now();
                    backoff.reset();
                    if self.state() != ElectionState::Leader {
                        tracing::info!(
                            member = %self.member_id,
                            token = grant.token,
                            "acquired leader lease"
                        );
                    }
                    self.publish(LeaseView {
                        state: ElectionState::Leader,
                        token: Some(grant.token),
                        holder: Some(self.member_id.clone()),
                    });
                    delay = renew_every;
                }
                Ok(grant) => {
                    last_contact = Instant::now();
                    backoff.reset();
                    if self.state() == ElectionState::Leader {
                        tracing::warn!(
                            member = %self.member_id,
                            new_holder = %grant.holder,
                            "lost leader lease"
                        );
                    }
                    let holder = (!grant.holder.is_empty()).then(|| grant.holder.clone());
                    self.publish(LeaseView {
                        state: ElectionState::Follower,
                        token: None,
                        holder,
                    });
                    delay = jittered(renew_every, 0.1);
                }
                Err(e) => {
                    if self.state() == ElectionState::Leader {
                        // Self-demotion on doubt is handled by the deadline
                        // timer; until it fires, keep retrying
                        tracing::debug!(
                            member = %self.member_id,
                            "lease renewal failed, retrying: {}",
                            e
                        );
                    } else {
                        tracing::debug!(member = %self.member_id, "store unavailable: {}", e);
                        if self.state() == ElectionState::Candidate {
                            self.publish(LeaseView::default());
                        }
                    }
                    delay = if e.is_retryable() {
                        backoff.next_delay()
                    } else {
                        renew_every
                    };
                }
            }
        }

        if let Err(e) = self.shutdown().await {
            tracing::warn!(member = %self.member_id, "failed to release lease on shutdown: {}", e);
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let view = self.view_tx.borrow().clone();
        if view.state == ElectionState::Leader {
            if let Some(token) = view.token {
                bounded(
                    self.op_timeout,
                    self.store.release(&self.key, &self.member_id, token),
                )
                .await?;
                tracing::info!(member = %self.member_id, "released leader lease on shutdown");
            }
            self.publish(LeaseView::default());
        }
        Ok(())
    }
}

/// Sleep until an optional deadline; guarded by `if deadline.is_some()`
/// in the select, so the pending arm is never polled
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

