//! etcd-backed coordination store
//!
//! Lease semantics map directly onto etcd primitives:
//! - acquisition is a transaction guarded by `create_revision == 0`, writing
//!   the holder id under a TTL lease;
//! - the fencing token is the key's `create_revision`, which etcd increases
//!   monotonically across acquisitions and never reuses;
//! - renewal is a single keep-alive round-trip on the attached lease;
//! - expiry is enforced server-side (etcd deletes the key when the lease
//!   runs out), so watchers see it as a plain DELETE event.

use crate::common::{Error, Result};
use crate::store::{CoordinationStore, EventStream, LeaseEvent, LeaseGrant, LeaseRecord};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, PutOptions, Txn, TxnOp, TxnOpResponse, WatchOptions,
};
use std::time::Duration;
use tokio::time::Instant;

pub struct EtcdStore {
    client: Client,
}

fn unavailable(e: etcd_client::Error) -> Error {
    Error::StoreUnavailable(e.to_string())
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await.map_err(unavailable)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn acquire_or_renew(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LeaseGrant> {
        let mut client = self.client.clone();

        let resp = client.get(key, None).await.map_err(unavailable)?;
        if let Some(kv) = resp.kvs().first() {
            let live_holder = kv
                .value_str()
                .map_err(unavailable)?
                .to_string();
            let token = kv.create_revision() as u64;
            if live_holder != holder {
                return Ok(LeaseGrant {
                    granted: false,
                    token,
                    holder: live_holder,
                });
            }
            // Renewal: refresh the TTL on our attached lease
            let (mut keeper, mut responses) = client
                .lease_keep_alive(kv.lease())
                .await
                .map_err(unavailable)?;
            keeper.keep_alive().await.map_err(unavailable)?;
            let granted = match responses.message().await.map_err(unavailable)? {
                // TTL 0 means the lease already expired server-side
                Some(resp) => resp.ttl() > 0,
                None => false,
            };
            return Ok(LeaseGrant {
                granted,
                token,
                holder: live_holder,
            });
        }

        // Vacant: grant a fresh lease, then create the key iff still absent
        let lease = client
            .lease_grant(ttl.as_secs().max(1) as i64, None)
            .await
            .map_err(unavailable)?;
        let txn = Txn::new()
            .when([Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(
                key,
                holder,
                Some(PutOptions::new().with_lease(lease.id())),
            )])
            .or_else([TxnOp::get(key, None)]);
        let resp = client.txn(txn).await.map_err(unavailable)?;

        if resp.succeeded() {
            // The put created the key at the transaction's revision
            let token = resp.header().map(|h| h.revision()).unwrap_or_default() as u64;
            return Ok(LeaseGrant {
                granted: true,
                token,
                holder: holder.to_string(),
            });
        }

        // Lost the race; drop our unused lease and report the winner
        let _ = client.lease_revoke(lease.id()).await;
        for op in resp.op_responses() {
            if let TxnOpResponse::Get(get) = op {
                if let Some(kv) = get.kvs().first() {
                    return Ok(LeaseGrant {
                        granted: false,
                        token: kv.create_revision() as u64,
                        holder: kv.value_str().map_err(unavailable)?.to_string(),
                    });
                }
            }
        }
        // Winner vanished between the txn branches; caller retries next tick
        Ok(LeaseGrant {
            granted: false,
            token: 0,
            holder: String::new(),
        })
    }

    async fn release(&self, key: &str, holder: &str, token: u64) -> Result<()> {
        let mut client = self.client.clone();

        let resp = client.get(key, None).await.map_err(unavailable)?;
        let Some(kv) = resp.kvs().first() else {
            return Ok(());
        };
        let live_holder = kv.value_str().map_err(unavailable)?;
        if live_holder != holder || kv.create_revision() as u64 != token {
            // Stale release from a demoted former holder: leave the
            // successor's lease alone
            return Ok(());
        }
        let lease_id = kv.lease();

        let txn = Txn::new()
            .when([Compare::create_revision(
                key,
                CompareOp::Equal,
                token as i64,
            )])
            .and_then([TxnOp::delete(key, None)]);
        client.txn(txn).await.map_err(unavailable)?;
        if lease_id != 0 {
            let _ = client.lease_revoke(lease_id).await;
        }
        Ok(())
    }

    async fn current_lease(&self, key: &str) -> Result<Option<LeaseRecord>> {
        let mut client = self.client.clone();

        let resp = client.get(key, None).await.map_err(unavailable)?;
        let Some(kv) = resp.kvs().first() else {
            return Ok(None);
        };
        let holder = kv.value_str().map_err(unavailable)?.to_string();
        let token = kv.create_revision() as u64;

        let expires_at = if kv.lease() != 0 {
            let ttl_resp = client
                .lease_time_to_live(kv.lease(), None)
                .await
                .map_err(unavailable)?;
            (ttl_resp.ttl() >= 0)
                .then(|| Instant::now() + Duration::from_secs(ttl_resp.ttl() as u64))
        } else {
            None
        };

        Ok(Some(LeaseRecord {
            holder,
            token,
            expires_at,
        }))
    }

    async fn watch(&self, key: &str, cursor: Option<u64>) -> Result<EventStream> {
        let mut client = self.client.clone();
        let key = key.to_string();

        let stream = async_stream::try_stream! {
            // No cursor means full resync: read the current state, hand it
            // to the caller as the first event, and watch from there. A
            // cursor that etcd has compacted away degrades to the same
            // resync instead of looping on cancelled watches.
            let mut start = cursor.map(|c| c + 1);
            loop {
                if start.is_none() {
                    let resp = client.get(key.as_str(), None).await.map_err(unavailable)?;
                    let revision = resp.header().map(|h| h.revision()).unwrap_or_default() as u64;
                    let record = match resp.kvs().first() {
                        Some(kv) => Some(LeaseRecord {
                            holder: kv.value_str().map_err(unavailable)?.to_string(),
                            token: kv.create_revision() as u64,
                            expires_at: None,
                        }),
                        None => None,
                    };
                    yield LeaseEvent { revision, record };
                    start = Some(revision + 1);
                }

                let mut options = WatchOptions::new();
                if let Some(rev) = start {
                    options = options.with_start_revision(rev as i64);
                }
                // Keep the watcher alive while its responses are consumed;
                // dropping it cancels the watch server-side.
                let (_watcher, mut responses) = client
                    .watch(key.as_str(), Some(options))
                    .await
                    .map_err(unavailable)?;

                let mut compacted = false;
                while let Some(resp) = responses.message().await.map_err(unavailable)? {
                    if resp.canceled() {
                        compacted = resp.compact_revision() > 0;
                        break;
                    }
                    for event in resp.events() {
                        let Some(kv) = event.kv() else { continue };
                        let revision = kv.mod_revision() as u64;
                        let record = match event.event_type() {
                            EventType::Put => Some(LeaseRecord {
                                holder: kv.value_str().map_err(unavailable)?.to_string(),
                                token: kv.create_revision() as u64,
                                // etcd enforces expiry itself: the key is
                                // deleted when its lease runs out
                                expires_at: None,
                            }),
                            EventType::Delete => None,
                        };
                        yield LeaseEvent { revision, record };
                        start = Some(revision + 1);
                    }
                }

                if compacted {
                    start = None;
                    continue;
                }
                // Server ended the stream; the caller re-watches from its
                // cursor
                break;
            }
        };
        Ok(Box::pin(stream))
    }
}
