//! Routing table derived from lease and health state
//!
//! The table is a pure function of (member list, current lease, latest
//! health view) and is recomputed by a single rebuilder task whenever any
//! input changes. Dispatch paths read a lock-free snapshot; nothing on the
//! connection hot path ever waits on lease or probe state.

use crate::common::{ClusterConfig, MemberSpec};
use crate::prober::HealthView;
use crate::store::{bounded, CoordinationStore, EventStream, LeaseRecord};
use arc_swap::ArcSwap;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Derived routing state. Never persisted; rebuilt from source-of-truth
/// state on every change.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    /// The single eligible write backend: the lease holder, unexpired,
    /// and healthy. `None` means write connections are refused
    /// (fail-closed, never guess).
    pub write_target: Option<MemberSpec>,
    /// All healthy members in stable id order; reads rotate over them
    pub read_targets: Vec<MemberSpec>,
}

impl RoutingTable {
    /// Recompute from source-of-truth state. Lease truth decides the write
    /// target, not any member's self-reported role.
    pub fn rebuild(
        members: &[MemberSpec],
        lease: Option<&LeaseRecord>,
        health: &HealthView,
    ) -> Self {
        let mut read_targets: Vec<MemberSpec> = members
            .iter()
            .filter(|m| health.is_healthy(&m.id))
            .cloned()
            .collect();
        read_targets.sort_by(|a, b| a.id.cmp(&b.id));

        let write_target = lease
            .filter(|l| !l.is_expired())
            .and_then(|l| members.iter().find(|m| m.id == l.holder))
            .filter(|m| health.is_healthy(&m.id))
            .cloned();

        Self {
            write_target,
            read_targets,
        }
    }
}

/// Shared routing state: one writer (the rebuilder), lock-free readers
pub struct Router {
    table: ArcSwap<RoutingTable>,
    read_cursor: AtomicUsize,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(RoutingTable::default()),
            read_cursor: AtomicUsize::new(0),
        }
    }

    /// Install a new table. Only new connections see it; in-flight relays
    /// keep their backend.
    pub fn install(&self, table: RoutingTable) {
        let previous = self.table.swap(Arc::new(table));
        let current = self.table.load();
        let prev_writer = previous.write_target.as_ref().map(|m| m.id.as_str());
        let new_writer = current.write_target.as_ref().map(|m| m.id.as_str());
        if prev_writer != new_writer {
            tracing::info!(?prev_writer, ?new_writer, "write target changed");
        }
    }

    /// Snapshot the table as seen by a connection accepted right now
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    pub fn write_target(&self) -> Option<MemberSpec> {
        self.table.load().write_target.clone()
    }

    /// Next read backend, rotating round-robin on every dispatch
    pub fn next_read_target(&self) -> Option<MemberSpec> {
        let table = self.table.load();
        if table.read_targets.is_empty() {
            return None;
        }
        let idx = self.read_cursor.fetch_add(1, Ordering::Relaxed) % table.read_targets.len();
        Some(table.read_targets[idx].clone())
    }
}

/// Single consumer merging lease-store truth and health-probe results into
/// the live routing table
pub struct RoutingRebuilder {
    store: Arc<dyn CoordinationStore>,
    cluster: ClusterConfig,
    router: Arc<Router>,
    health_rx: watch::Receiver<HealthView>,
}

impl RoutingRebuilder {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        cluster: ClusterConfig,
        router: Arc<Router>,
        health_rx: watch::Receiver<HealthView>,
    ) -> Self {
        Self {
            store,
            cluster,
            router,
            health_rx,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let key = self.cluster.lease_key();
        let timeout = self.cluster.store_timeout();
        // The tick notices lease expiry even when no event arrives
        let tick = self.cluster.probe_interval().min(Duration::from_millis(500));

        let mut lease: Option<LeaseRecord> = None;
        let mut cursor: Option<u64> = None;
        let mut events: Option<EventStream> = None;
        let mut health_open = true;

        loop {
            self.install(lease.as_ref());

            // The watch carries the current lease as its first event, so a
            // proxy started during a store outage converges as soon as a
            // watch can be established; retried on every tick until then
            if events.is_none() {
                match bounded(timeout, self.store.watch(&key, cursor)).await {
                    Ok(stream) => events = Some(stream),
                    Err(e) => tracing::debug!("lease watch unavailable, will retry: {}", e),
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(tick) => {}
                changed = self.health_rx.changed(), if health_open => {
                    if changed.is_err() {
                        health_open = false;
                    }
                }
                event = next_event(&mut events), if events.is_some() => {
                    match event {
                        Some(Ok(event)) => {
                            cursor = Some(event.revision);
                            lease = event.record;
                        }
                        Some(Err(e)) => {
                            tracing::debug!("lease watch broke, re-watching: {}", e);
                            events = None;
                        }
                        None => events = None,
                    }
                }
            }
        }
    }

    fn install(&self, lease: Option<&LeaseRecord>) {
        let health = self.health_rx.borrow().clone();
        let table = RoutingTable::rebuild(&self.cluster.members, lease, &health);
        self.router.install(table);
    }
}

async fn next_event(events: &mut Option<EventStream>) -> Option<crate::Result<crate::store::LeaseEvent>> {
    match events {
        Some(stream) => stream.next().await,
        // Guarded by `if events.is_some()`; never polled otherwise
        None => std::future::pending().await,
    }
}
