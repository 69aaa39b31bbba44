//! In-process coordination store
//!
//! Same contract as the etcd backend: single live lease per key behind
//! compare-and-swap, monotonic fencing tokens, revision-cursored watches.
//! Expiry runs on tokio time, so paused-clock tests can drive it
//! deterministically. Reachability injection simulates partitions.

use crate::common::{Error, Result};
use crate::store::{CoordinationStore, EventStream, LeaseEvent, LeaseGrant, LeaseRecord};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Watch replay history kept per store; older revisions force a full resync
const HISTORY_CAP: usize = 256;

/// Broadcast capacity for watch fan-out; a lagging watcher gets an error
/// and is expected to re-watch from its cursor
const EVENT_CAP: usize = 64;

pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<(String, LeaseEvent)>,
}

struct Inner {
    leases: HashMap<String, LeaseRecord>,
    history: VecDeque<(String, LeaseEvent)>,
    next_token: u64,
    revision: u64,
    reachable: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAP);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                leases: HashMap::new(),
                history: VecDeque::new(),
                next_token: 1,
                revision: 0,
                reachable: true,
            })),
            events,
        }
    }

    /// Simulate a partition between this client and the store. While
    /// unreachable every operation fails with `StoreUnavailable`.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().unwrap().reachable = reachable;
    }

    fn record_event(&self, inner: &mut Inner, key: &str, record: Option<LeaseRecord>) {
        inner.revision += 1;
        let event = LeaseEvent {
            revision: inner.revision,
            record,
        };
        inner.history.push_back((key.to_string(), event.clone()));
        if inner.history.len() > HISTORY_CAP {
            inner.history.pop_front();
        }
        // No receivers is fine; watchers subscribe lazily
        let _ = self.events.send((key.to_string(), event));
    }

    /// Drop an expired lease, emitting the expiry event. Expiry is noticed
    /// lazily: on the next operation that touches the key.
    fn expire(&self, inner: &mut Inner, key: &str) {
        let expired = inner
            .leases
            .get(key)
            .map(|lease| lease.is_expired())
            .unwrap_or(false);
        if expired {
            inner.leases.remove(key);
            self.record_event(inner, key, None);
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn acquire_or_renew(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LeaseGrant> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.reachable {
            return Err(Error::StoreUnavailable("store unreachable".into()));
        }
        self.expire(&mut inner, key);

        match inner.leases.get(key).cloned() {
            None => {
                let token = inner.next_token;
                inner.next_token += 1;
                let record = LeaseRecord {
                    holder: holder.to_string(),
                    token,
                    expires_at: Some(Instant::now() + ttl),
                };
                inner.leases.insert(key.to_string(), record.clone());
                self.record_event(&mut inner, key, Some(record));
                Ok(LeaseGrant {
                    granted: true,
                    token,
                    holder: holder.to_string(),
                })
            }
            Some(live) if live.holder == holder => {
                // Renewal: expiry advances, the fencing token does not
                let record = LeaseRecord {
                    holder: live.holder.clone(),
                    token: live.token,
                    expires_at: Some(Instant::now() + ttl),
                };
                inner.leases.insert(key.to_string(), record.clone());
                self.record_event(&mut inner, key, Some(record));
                Ok(LeaseGrant {
                    granted: true,
                    token: live.token,
                    holder: live.holder,
                })
            }
            Some(live) => Ok(LeaseGrant {
                granted: false,
                token: live.token,
                holder: live.holder,
            }),
        }
    }

    async fn release(&self, key: &str, holder: &str, token: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.reachable {
            return Err(Error::StoreUnavailable("store unreachable".into()));
        }
        self.expire(&mut inner, key);

        let matches = inner
            .leases
            .get(key)
            .map(|lease| lease.holder == holder && lease.token == token)
            .unwrap_or(false);
        if matches {
            inner.leases.remove(key);
            self.record_event(&mut inner, key, None);
        }
        Ok(())
    }

    async fn current_lease(&self, key: &str) -> Result<Option<LeaseRecord>> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.reachable {
            return Err(Error::StoreUnavailable("store unreachable".into()));
        }
        self.expire(&mut inner, key);
        Ok(inner.leases.get(key).cloned())
    }

    async fn watch(&self, key: &str, cursor: Option<u64>) -> Result<EventStream> {
        let key = key.to_string();
        let (mut rx, replay) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.reachable {
                return Err(Error::StoreUnavailable("store unreachable".into()));
            }
            self.expire(&mut inner, &key);

            // Subscribe under the lock: senders also hold it, so nothing
            // can slip between the replay snapshot and the subscription.
            let rx = self.events.subscribe();
            let oldest = inner.history.front().map(|(_, e)| e.revision);
            let replay: Vec<LeaseEvent> = match (cursor, oldest) {
                // Cursor still inside the retained history: replay the gap
                (Some(cur), Some(old)) if cur + 1 >= old => inner
                    .history
                    .iter()
                    .filter(|(k, e)| *k == key && e.revision > cur)
                    .map(|(_, e)| e.clone())
                    .collect(),
                // Cursor expired or absent: full resync with current state
                _ => vec![LeaseEvent {
                    revision: inner.revision,
                    record: inner.leases.get(&key).cloned(),
                }],
            };
            (rx, replay)
        };

        let stream = async_stream::stream! {
            for event in replay {
                yield Ok(event);
            }
            loop {
                match rx.recv().await {
                    Ok((event_key, event)) => {
                        if event_key == key {
                            yield Ok(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        yield Err(Error::StoreUnavailable(format!(
                            "watch lagged by {} events, re-watch required",
                            n
                        )));
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
