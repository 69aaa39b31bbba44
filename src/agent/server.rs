//! Member agent: per-node control loop and status endpoint
//!
//! The agent observes the lease manager's view and drives the engine to
//! match it: promote when this node becomes Leader, demote (and reattach
//! to the new primary) when it stops being Leader. Engine operation
//! failures mark the node degraded instead of being retried blindly; the
//! status endpoint then answers 503 so the health prober excludes the
//! member from routing.

use crate::agent::engine::{CommandEngine, DatabaseEngine, EngineRole};
use crate::agent::lease::{ElectionState, LeaseManager, LeaseView};
use crate::common::{AgentConfig, ClusterConfig, MemberSpec, Result};
use crate::store;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Body of the status endpoint, consumed by the health prober and the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberStatus {
    pub id: String,
    pub role: EngineRole,
    pub replication_lag: u64,
    pub election: ElectionState,
    pub state: String,
}

/// Control loop reconciling engine role with lease state
pub struct MemberAgent {
    id: String,
    engine: Arc<dyn DatabaseEngine>,
    members: Vec<MemberSpec>,
    lease_rx: watch::Receiver<LeaseView>,
    degraded: Arc<AtomicBool>,
}

impl MemberAgent {
    pub fn new(
        id: String,
        engine: Arc<dyn DatabaseEngine>,
        members: Vec<MemberSpec>,
        lease_rx: watch::Receiver<LeaseView>,
        degraded: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            engine,
            members,
            lease_rx,
            degraded,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let view = self.lease_rx.borrow_and_update().clone();
            self.reconcile(&view).await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = self.lease_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Bring the engine role in line with the lease view. Failures mark
    /// the node degraded; the next lease transition retries naturally.
    async fn reconcile(&self, view: &LeaseView) {
        let role = match self.engine.role().await {
            Ok(role) => role,
            Err(e) => {
                tracing::error!(member = %self.id, "cannot read engine role: {}", e);
                self.degraded.store(true, Ordering::SeqCst);
                return;
            }
        };

        if view.state == ElectionState::Leader && role != EngineRole::Primary {
            match self.engine.promote().await {
                Ok(()) => {
                    tracing::info!(member = %self.id, token = ?view.token, "promoted engine to primary");
                    self.degraded.store(false, Ordering::SeqCst);
                }
                Err(e) => {
                    tracing::error!(member = %self.id, "engine promote failed: {}", e);
                    self.degraded.store(true, Ordering::SeqCst);
                }
            }
        } else if view.state != ElectionState::Leader && role == EngineRole::Primary {
            // Reattach to the new primary when the lease names one
            let target = view
                .holder
                .as_deref()
                .filter(|holder| *holder != self.id)
                .and_then(|holder| self.members.iter().find(|m| m.id == holder))
                .map(|m| m.backend_addr.clone());
            match self.engine.demote(target.as_deref()).await {
                Ok(()) => {
                    tracing::info!(member = %self.id, new_primary = ?target, "demoted engine to replica");
                    self.degraded.store(false, Ordering::SeqCst);
                }
                Err(e) => {
                    tracing::error!(member = %self.id, "engine demote failed: {}", e);
                    self.degraded.store(true, Ordering::SeqCst);
                }
            }
        }
    }
}

/// Shared state for the status endpoint
#[derive(Clone)]
pub struct AgentState {
    pub id: String,
    pub engine: Arc<dyn DatabaseEngine>,
    pub degraded: Arc<AtomicBool>,
    pub lease_rx: watch::Receiver<LeaseView>,
}

pub fn create_router(state: AgentState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn get_status(State(state): State<AgentState>) -> impl IntoResponse {
    let degraded = state.degraded.load(Ordering::SeqCst);
    let election = state.lease_rx.borrow().state;

    // An engine that cannot report its role is not routable, whatever the
    // degraded flag says
    let role = match state.engine.role().await {
        Ok(role) => role,
        Err(e) => {
            let status = MemberStatus {
                id: state.id.clone(),
                role: EngineRole::Unknown,
                replication_lag: 0,
                election,
                state: "degraded".to_string(),
            };
            return (e.to_http_status(), Json(status));
        }
    };
    let replication_lag = state.engine.replication_lag().await.unwrap_or(0);

    let status = MemberStatus {
        id: state.id.clone(),
        role,
        replication_lag,
        election,
        state: if degraded { "degraded" } else { "running" }.to_string(),
    };
    let code = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(status))
}

/// Agent daemon: lease manager + member agent + status endpoint
pub struct Agent {
    cluster: ClusterConfig,
    config: AgentConfig,
}

impl Agent {
    pub fn new(cluster: ClusterConfig, config: AgentConfig) -> Self {
        Self { cluster, config }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting agent: {}", self.config.member_id);
        tracing::info!("  Cluster: {}", self.cluster.name);
        tracing::info!("  Status endpoint: {}", self.config.listen_addr);
        tracing::info!("  Lease TTL: {}ms", self.cluster.lease_ttl_ms);
        tracing::info!("  Store: {:?}", self.cluster.store.backend);

        let store = store::connect(&self.cluster.store).await?;
        let engine: Arc<dyn DatabaseEngine> = Arc::new(CommandEngine::new(
            self.config.promote_command.clone(),
            self.config.demote_command.clone(),
        ));

        let (manager, lease_rx) = LeaseManager::new(
            store,
            self.cluster.lease_key(),
            self.config.member_id.clone(),
            self.cluster.lease_ttl(),
            self.cluster.store_timeout(),
        );

        let degraded = Arc::new(AtomicBool::new(false));
        let member_agent = MemberAgent::new(
            self.config.member_id.clone(),
            engine.clone(),
            self.cluster.members.clone(),
            lease_rx.clone(),
            degraded.clone(),
        );

        let router = create_router(AgentState {
            id: self.config.member_id.clone(),
            engine,
            degraded,
            lease_rx,
        });
        let listener = tokio::net::TcpListener::bind(self.config.listen_addr).await?;

        let shutdown = CancellationToken::new();
        let lease_task = tokio::spawn(manager.run(shutdown.clone()));
        let agent_task = tokio::spawn(member_agent.run(shutdown.clone()));

        tracing::info!("✓ Agent ready");

        tokio::select! {
            res = axum::serve(listener, router) => {
                if let Err(e) = res {
                    tracing::error!("Status endpoint error: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
            }
        }

        // Release the lease before exiting so a successor can take over
        // without waiting out the TTL
        shutdown.cancel();
        let _ = lease_task.await;
        let _ = agent_task.await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;
    use async_trait::async_trait;
    use std::future::IntoFuture;
    use std::sync::Mutex;

    /// Engine double recording operations, with injectable failure
    struct RecordingEngine {
        role: Mutex<EngineRole>,
        calls: Mutex<Vec<String>>,
        fail_next: AtomicBool,
        fail_role: AtomicBool,
    }

    impl RecordingEngine {
        fn new(role: EngineRole) -> Self {
            Self {
                role: Mutex::new(role),
                calls: Mutex::new(Vec::new()),
                fail_next: AtomicBool::new(false),
                fail_role: AtomicBool::new(false),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DatabaseEngine for RecordingEngine {
        async fn role(&self) -> crate::Result<EngineRole> {
            if self.fail_role.load(Ordering::SeqCst) {
                return Err(Error::EngineOperation {
                    op: "role".into(),
                    reason: "connection refused".into(),
                });
            }
            Ok(*self.role.lock().unwrap())
        }

        async fn promote(&self) -> crate::Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(Error::EngineOperation {
                    op: "promote".into(),
                    reason: "disk full".into(),
                });
            }
            self.calls.lock().unwrap().push("promote".into());
            *self.role.lock().unwrap() = EngineRole::Primary;
            Ok(())
        }

        async fn demote(&self, primary: Option<&str>) -> crate::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("demote:{}", primary.unwrap_or("-")));
            *self.role.lock().unwrap() = EngineRole::Replica;
            Ok(())
        }

        async fn replication_lag(&self) -> crate::Result<u64> {
            Ok(0)
        }
    }

    fn members() -> Vec<MemberSpec> {
        ["a", "b"]
            .iter()
            .enumerate()
            .map(|(i, id)| MemberSpec {
                id: id.to_string(),
                status_addr: format!("127.0.0.1:800{}", i + 1),
                backend_addr: format!("10.0.0.{}:5432", i + 1),
            })
            .collect()
    }

    fn agent_with(engine: Arc<RecordingEngine>) -> (MemberAgent, Arc<AtomicBool>) {
        let (_tx, rx) = watch::channel(LeaseView::default());
        let degraded = Arc::new(AtomicBool::new(false));
        let agent = MemberAgent::new(
            "a".to_string(),
            engine,
            members(),
            rx,
            degraded.clone(),
        );
        (agent, degraded)
    }

    fn leader_view() -> LeaseView {
        LeaseView {
            state: ElectionState::Leader,
            token: Some(7),
            holder: Some("a".to_string()),
        }
    }

    #[tokio::test]
    async fn test_promotes_on_leader_transition() {
        let engine = Arc::new(RecordingEngine::new(EngineRole::Replica));
        let (agent, degraded) = agent_with(engine.clone());

        agent.reconcile(&leader_view()).await;
        assert_eq!(engine.calls(), vec!["promote"]);
        assert!(!degraded.load(Ordering::SeqCst));

        // Already primary: reconciling again is a no-op
        agent.reconcile(&leader_view()).await;
        assert_eq!(engine.calls(), vec!["promote"]);
    }

    #[tokio::test]
    async fn test_demotes_toward_new_holder() {
        let engine = Arc::new(RecordingEngine::new(EngineRole::Primary));
        let (agent, _) = agent_with(engine.clone());

        let view = LeaseView {
            state: ElectionState::Follower,
            token: None,
            holder: Some("b".to_string()),
        };
        agent.reconcile(&view).await;
        assert_eq!(engine.calls(), vec!["demote:10.0.0.2:5432"]);
    }

    #[tokio::test]
    async fn test_failed_promote_marks_degraded() {
        let engine = Arc::new(RecordingEngine::new(EngineRole::Replica));
        engine.fail_next.store(true, Ordering::SeqCst);
        let (agent, degraded) = agent_with(engine.clone());

        agent.reconcile(&leader_view()).await;
        assert!(degraded.load(Ordering::SeqCst));
        assert!(engine.calls().is_empty());

        // The next transition retries and clears the flag on success
        agent.reconcile(&leader_view()).await;
        assert!(!degraded.load(Ordering::SeqCst));
        assert_eq!(engine.calls(), vec!["promote"]);
    }

    #[tokio::test]
    async fn test_status_endpoint_reports_degraded() {
        let engine = Arc::new(RecordingEngine::new(EngineRole::Replica));
        let (_tx, lease_rx) = watch::channel(LeaseView::default());
        let degraded = Arc::new(AtomicBool::new(false));
        let state = AgentState {
            id: "a".to_string(),
            engine: engine.clone(),
            degraded: degraded.clone(),
            lease_rx,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, create_router(state)).into_future());

        let url = format!("http://{}/status", addr);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let status: MemberStatus = resp.json().await.unwrap();
        assert_eq!(status.id, "a");
        assert_eq!(status.role, EngineRole::Replica);
        assert_eq!(status.state, "running");

        degraded.store(true, Ordering::SeqCst);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 503);

        // An unreadable engine role is an error response, not a 200 with
        // stale data
        degraded.store(false, Ordering::SeqCst);
        engine.fail_role.store(true, Ordering::SeqCst);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 500);
        let status: MemberStatus = resp.json().await.unwrap();
        assert_eq!(status.role, EngineRole::Unknown);
        assert_eq!(status.state, "degraded");
    }
}
