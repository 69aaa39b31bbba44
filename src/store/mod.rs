//! Coordination store client
//!
//! Typed wrapper over a strongly-consistent key-value store with
//! compare-and-swap writes, TTL-bound leases, and watches. The store is the
//! single durable source of truth for leadership; everything else in the
//! system is a rebuildable cache of it.
//!
//! Two backends: [`EtcdStore`] for production and [`MemoryStore`] for tests
//! and single-node development. Both enforce the same contract: at most one
//! live lease per key, fencing tokens strictly increasing across distinct
//! acquisitions, and all failures surfaced as
//! [`Error::StoreUnavailable`](crate::Error::StoreUnavailable), never a
//! silent "not holder".

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use crate::common::{Error, Result, StoreBackend, StoreConfig};
use async_trait::async_trait;
use futures_util::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// The lease record stored under the cluster's leader key
#[derive(Debug, Clone)]
pub struct LeaseRecord {
    /// Member id of the current holder
    pub holder: String,
    /// Fencing token: strictly increasing across acquisitions, never reused
    pub token: u64,
    /// When the lease expires. `None` when the backend enforces expiry
    /// itself (etcd deletes the key when its lease runs out).
    pub expires_at: Option<Instant>,
}

impl LeaseRecord {
    pub fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| Instant::now() >= at)
    }
}

/// Outcome of an acquire-or-renew attempt
#[derive(Debug, Clone)]
pub struct LeaseGrant {
    /// True when the caller now holds the lease
    pub granted: bool,
    /// Fencing token of the live lease (the caller's on grant, the
    /// winner's on refusal)
    pub token: u64,
    /// Member id of the live holder (empty if the lease vanished mid-call)
    pub holder: String,
}

/// One change observed on a watched key
#[derive(Debug, Clone)]
pub struct LeaseEvent {
    /// Store revision of this change, usable as a watch cursor
    pub revision: u64,
    /// The lease after the change; `None` means released or expired
    pub record: Option<LeaseRecord>,
}

/// Infinite stream of lease changes
pub type EventStream = Pin<Box<dyn Stream<Item = Result<LeaseEvent>> + Send>>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Acquire the lease for `key`, or renew it when `holder` already owns
    /// it. Succeeds only if no other holder currently holds a live lease;
    /// the store's compare-and-swap guarantees exactly one winner per race.
    async fn acquire_or_renew(&self, key: &str, holder: &str, ttl: Duration)
        -> Result<LeaseGrant>;

    /// Release the lease. A stale release (wrong holder or token) is a
    /// no-op so a demoted former holder cannot revoke its successor.
    async fn release(&self, key: &str, holder: &str, token: u64) -> Result<()>;

    /// Read the current lease, if any
    async fn current_lease(&self, key: &str) -> Result<Option<LeaseRecord>>;

    /// Watch `key` for changes. `cursor` resumes after a previously seen
    /// revision; a missing or expired cursor degrades to a full resync
    /// (the current state arrives as the first event).
    async fn watch(&self, key: &str, cursor: Option<u64>) -> Result<EventStream>;
}

/// Run a store call under an explicit deadline. No store call may block
/// indefinitely; a missed deadline counts as the store being unavailable.
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::StoreUnavailable(format!(
            "call exceeded {}ms deadline",
            limit.as_millis()
        ))),
    }
}

/// Build the configured store backend
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn CoordinationStore>> {
    match config.backend {
        StoreBackend::Etcd => Ok(Arc::new(EtcdStore::connect(&config.endpoints).await?)),
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let res: Result<()> = bounded(Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(Error::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let res = bounded(Duration::from_secs(1), async { Ok(42u32) }).await;
        assert_eq!(res.unwrap(), 42);
    }
}
