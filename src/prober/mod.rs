//! Health prober
//!
//! Sweeps all members on a fixed interval, issuing one bounded-timeout GET
//! against each member's status endpoint concurrently so one slow member
//! cannot delay the others. Health flips only after `rise` consecutive
//! successes or `fall` consecutive failures, which keeps a single flapping
//! probe from churning the routing table.
//!
//! The prober publishes observations and nothing more: failover is driven
//! by lease state, never by probe results, so there is exactly one source
//! of truth about leadership.

use crate::agent::{EngineRole, MemberStatus};
use crate::common::{timestamp_now_millis, ClusterConfig, Error, MemberSpec, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Latest known health of one member. Overwritten on every sweep; the
/// prober is its only writer.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub member_id: String,
    pub healthy: bool,
    pub observed_role: EngineRole,
    pub rtt: Option<Duration>,
    pub last_probe_ms: u64,
}

/// Snapshot of all members' health, published through a watch channel
#[derive(Debug, Clone, Default)]
pub struct HealthView {
    pub records: HashMap<String, HealthRecord>,
}

impl HealthView {
    pub fn is_healthy(&self, member_id: &str) -> bool {
        self.records
            .get(member_id)
            .map(|r| r.healthy)
            .unwrap_or(false)
    }
}

/// Per-member flap-resistance counters
#[derive(Debug, Clone, Default)]
struct ProbeState {
    consecutive_ok: u32,
    consecutive_fail: u32,
    healthy: bool,
}

impl ProbeState {
    /// Fold one probe outcome into the counters. Healthy flips up after
    /// exactly `rise` consecutive successes and down after exactly `fall`
    /// consecutive failures.
    fn observe(&mut self, ok: bool, rise: u32, fall: u32) -> bool {
        if ok {
            self.consecutive_ok += 1;
            self.consecutive_fail = 0;
            if !self.healthy && self.consecutive_ok >= rise {
                self.healthy = true;
            }
        } else {
            self.consecutive_fail += 1;
            self.consecutive_ok = 0;
            if self.healthy && self.consecutive_fail >= fall {
                self.healthy = false;
            }
        }
        self.healthy
    }
}

pub struct HealthProber {
    members: Vec<MemberSpec>,
    interval: Duration,
    timeout: Duration,
    rise: u32,
    fall: u32,
    client: reqwest::Client,
    states: HashMap<String, ProbeState>,
    view_tx: watch::Sender<HealthView>,
}

impl HealthProber {
    pub fn new(cluster: &ClusterConfig) -> (Self, watch::Receiver<HealthView>) {
        let (view_tx, view_rx) = watch::channel(HealthView::default());
        let states = cluster
            .members
            .iter()
            .map(|m| (m.id.clone(), ProbeState::default()))
            .collect();
        (
            Self {
                members: cluster.members.clone(),
                interval: cluster.probe_interval(),
                timeout: cluster.probe_timeout(),
                rise: cluster.rise,
                fall: cluster.fall,
                client: reqwest::Client::new(),
                states,
                view_tx,
            },
            view_rx,
        )
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.sweep().await;
        }
    }

    /// One sweep: probe every member concurrently, then fold the outcomes
    /// into the published view
    async fn sweep(&mut self) {
        let probes = self.members.iter().map(|member| {
            let client = self.client.clone();
            let member = member.clone();
            let timeout = self.timeout;
            async move {
                let outcome = probe_member(&client, &member, timeout).await;
                (member.id, outcome)
            }
        });
        let outcomes = futures_util::future::join_all(probes).await;

        let now = timestamp_now_millis();
        let mut records = HashMap::new();
        for (member_id, outcome) in outcomes {
            let state = self.states.entry(member_id.clone()).or_default();
            let (ok, role, rtt) = match &outcome {
                Ok((status, rtt)) => (true, status.role, Some(*rtt)),
                Err(_) => (false, EngineRole::Unknown, None),
            };
            let was_healthy = state.healthy;
            let healthy = state.observe(ok, self.rise, self.fall);
            if healthy != was_healthy {
                tracing::info!(
                    member = %member_id,
                    healthy,
                    "member health changed"
                );
            }
            if let Err(e) = &outcome {
                tracing::debug!(member = %member_id, "probe failed: {}", e);
            }
            records.insert(
                member_id.clone(),
                HealthRecord {
                    member_id,
                    healthy,
                    observed_role: role,
                    rtt,
                    last_probe_ms: now,
                },
            );
        }
        self.view_tx.send_replace(HealthView { records });
    }
}

/// Probe one member's status endpoint. Any non-200, timeout, or malformed
/// payload counts as a failure.
async fn probe_member(
    client: &reqwest::Client,
    member: &MemberSpec,
    timeout: Duration,
) -> Result<(MemberStatus, Duration)> {
    let started = Instant::now();
    let resp = client
        .get(member.status_url())
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                Error::ProbeTimeout(member.id.clone())
            } else {
                Error::ProbeFailed {
                    member: member.id.clone(),
                    reason: e.to_string(),
                }
            }
        })?;
    if !resp.status().is_success() {
        return Err(Error::ProbeFailed {
            member: member.id.clone(),
            reason: format!("status {}", resp.status()),
        });
    }
    let status: MemberStatus = resp.json().await.map_err(|e| Error::ProbeFailed {
        member: member.id.clone(),
        reason: format!("malformed status payload: {}", e),
    })?;
    Ok((status, started.elapsed()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{create_router, AgentState, CommandEngine, LeaseView};
    use std::future::IntoFuture;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_member_unhealthy_after_exactly_fall_failures() {
        let mut state = ProbeState::default();
        // Bring it up first (rise = 2)
        assert!(!state.observe(true, 2, 3));
        assert!(state.observe(true, 2, 3));

        // fall = 3: stays healthy through the first two failures
        assert!(state.observe(false, 2, 3));
        assert!(state.observe(false, 2, 3));
        assert!(!state.observe(false, 2, 3));
    }

    #[test]
    fn test_member_healthy_after_exactly_rise_successes() {
        let mut state = ProbeState::default();
        assert!(!state.observe(true, 3, 1));
        assert!(!state.observe(true, 3, 1));
        assert!(state.observe(true, 3, 1));
    }

    #[test]
    fn test_single_flap_does_not_reset_health() {
        let mut state = ProbeState::default();
        state.observe(true, 1, 2);
        assert!(state.healthy);

        // One failure with fall = 2 must not mark it down
        assert!(state.observe(false, 1, 2));
        // A success resets the failure streak
        assert!(state.observe(true, 1, 2));
        assert!(state.observe(false, 1, 2));
        assert!(!state.observe(false, 1, 2));
    }

    #[test]
    fn test_rise_one_recovers_immediately() {
        let mut state = ProbeState::default();
        state.observe(true, 1, 1);
        assert!(state.healthy);
        state.observe(false, 1, 1);
        assert!(!state.healthy);
        assert!(state.observe(true, 1, 1));
    }

    #[tokio::test]
    async fn test_sweep_against_live_status_endpoint() {
        // Real agent status endpoint on an ephemeral port
        let engine = Arc::new(CommandEngine::new(None, None));
        let (_lease_tx, lease_rx) = tokio::sync::watch::channel(LeaseView::default());
        let state = AgentState {
            id: "a".to_string(),
            engine,
            degraded: Arc::new(AtomicBool::new(false)),
            lease_rx,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, create_router(state)).into_future());

        let cluster = ClusterConfig {
            name: "pg-main".to_string(),
            members: vec![
                MemberSpec {
                    id: "a".to_string(),
                    status_addr: addr.to_string(),
                    backend_addr: "127.0.0.1:5432".to_string(),
                },
                // Nothing listens here: must stay unhealthy
                MemberSpec {
                    id: "b".to_string(),
                    status_addr: "127.0.0.1:1".to_string(),
                    backend_addr: "127.0.0.1:5433".to_string(),
                },
            ],
            store: Default::default(),
            lease_ttl_ms: 10_000,
            probe_interval_ms: 50,
            probe_timeout_ms: 2_000,
            rise: 1,
            fall: 1,
            store_timeout_ms: 1_000,
        };
        let (mut prober, view_rx) = HealthProber::new(&cluster);

        prober.sweep().await;
        let view = view_rx.borrow().clone();
        assert!(view.is_healthy("a"));
        assert!(!view.is_healthy("b"));
        let record = &view.records["a"];
        assert_eq!(record.observed_role, EngineRole::Replica);
        assert!(record.rtt.is_some());
    }
}
