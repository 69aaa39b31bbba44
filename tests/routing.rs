//! Read pool behavior as health observations change

use leasehold::agent::EngineRole;
use leasehold::common::{ClusterConfig, MemberSpec, StoreConfig};
use leasehold::prober::{HealthRecord, HealthView};
use leasehold::proxy::{Router, RoutingRebuilder};
use leasehold::store::{CoordinationStore, MemoryStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

fn cluster() -> ClusterConfig {
    ClusterConfig {
        name: "pg-main".to_string(),
        members: ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, id)| MemberSpec {
                id: id.to_string(),
                status_addr: format!("127.0.0.1:800{}", i + 1),
                backend_addr: format!("10.0.0.{}:5432", i + 1),
            })
            .collect(),
        store: StoreConfig::default(),
        lease_ttl_ms: 10_000,
        probe_interval_ms: 1_000,
        probe_timeout_ms: 500,
        rise: 2,
        fall: 2,
        store_timeout_ms: 2_000,
    }
}

fn health(healthy_ids: &[&str]) -> HealthView {
    let mut records = HashMap::new();
    for id in ["a", "b", "c"] {
        records.insert(
            id.to_string(),
            HealthRecord {
                member_id: id.to_string(),
                healthy: healthy_ids.contains(&id),
                observed_role: EngineRole::Replica,
                rtt: None,
                last_probe_ms: 0,
            },
        );
    }
    HealthView { records }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// One full rotation's worth of read dispatches, as member ids
fn rotation(router: &Router, n: usize) -> Vec<String> {
    (0..n)
        .filter_map(|_| router.next_read_target().map(|m| m.id))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_read_pool_shrinks_and_regrows_with_health() {
    let store = Arc::new(MemoryStore::new());
    let (health_tx, health_rx) = watch::channel(health(&["a", "b", "c"]));
    let router = Arc::new(Router::new());
    let s: Arc<dyn CoordinationStore> = store.clone();
    let rebuilder = RoutingRebuilder::new(s, cluster(), router.clone(), health_rx);
    let shutdown = CancellationToken::new();
    tokio::spawn(rebuilder.run(shutdown.clone()));
    settle().await;

    let mut seen = rotation(&router, 6);
    seen.sort();
    seen.dedup();
    assert_eq!(seen, vec!["a", "b", "c"]);

    // b drops out of the pool the moment it probes unhealthy
    health_tx.send(health(&["a", "c"])).unwrap();
    settle().await;
    let seen = rotation(&router, 6);
    assert_eq!(seen.len(), 6);
    assert!(!seen.contains(&"b".to_string()));

    // b recovering restores it to the rotation
    health_tx.send(health(&["a", "b", "c"])).unwrap();
    settle().await;
    let mut seen = rotation(&router, 6);
    seen.sort();
    seen.dedup();
    assert_eq!(seen, vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn test_no_healthy_members_refuses_reads() {
    let store = Arc::new(MemoryStore::new());
    let (health_tx, health_rx) = watch::channel(health(&["a", "b", "c"]));
    let router = Arc::new(Router::new());
    let s: Arc<dyn CoordinationStore> = store.clone();
    let rebuilder = RoutingRebuilder::new(s, cluster(), router.clone(), health_rx);
    tokio::spawn(rebuilder.run(CancellationToken::new()));
    settle().await;
    assert!(router.next_read_target().is_some());

    health_tx.send(health(&[])).unwrap();
    settle().await;
    assert!(router.next_read_target().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_reads_keep_flowing_without_any_leader() {
    // An empty lease key never blocks the read path
    let store = Arc::new(MemoryStore::new());
    let (_health_tx, health_rx) = watch::channel(health(&["a", "b", "c"]));
    let router = Arc::new(Router::new());
    let s: Arc<dyn CoordinationStore> = store.clone();
    let rebuilder = RoutingRebuilder::new(s, cluster(), router.clone(), health_rx);
    tokio::spawn(rebuilder.run(CancellationToken::new()));
    settle().await;

    assert!(router.write_target().is_none());
    let seen = rotation(&router, 3);
    assert_eq!(seen, vec!["a", "b", "c"]);
}
