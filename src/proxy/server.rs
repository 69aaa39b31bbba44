//! TCP proxy: client-facing listeners and the byte relay
//!
//! One listener routes write traffic to the current primary only, the
//! other spreads read traffic round-robin over every healthy member. Each
//! accepted connection gets its own task and reads the routing table once,
//! at accept time; table changes only affect connections accepted later.
//! With no eligible backend the client connection is closed immediately so
//! callers fail fast instead of hanging.

use crate::common::{ClusterConfig, ProxyConfig, Result};
use crate::prober::HealthProber;
use crate::proxy::routing::{Router, RoutingRebuilder};
use crate::store;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Write,
    Read,
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKind::Write => write!(f, "write"),
            PoolKind::Read => write!(f, "read"),
        }
    }
}

pub struct ProxyServer {
    cluster: ClusterConfig,
    config: ProxyConfig,
}

impl ProxyServer {
    pub fn new(cluster: ClusterConfig, config: ProxyConfig) -> Self {
        Self { cluster, config }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting proxy for cluster: {}", self.cluster.name);
        tracing::info!("  Write listener: {}", self.config.write_listen);
        tracing::info!("  Read listener: {}", self.config.read_listen);
        tracing::info!("  Members: {}", self.cluster.members.len());
        tracing::info!("  Store: {:?}", self.cluster.store.backend);

        let store = store::connect(&self.cluster.store).await?;
        let (prober, health_rx) = HealthProber::new(&self.cluster);
        let router = Arc::new(Router::new());
        let rebuilder = RoutingRebuilder::new(
            store,
            self.cluster.clone(),
            router.clone(),
            health_rx,
        );

        // Bind before spawning anything: bad listener config is fatal
        let write_listener = TcpListener::bind(self.config.write_listen).await?;
        let read_listener = TcpListener::bind(self.config.read_listen).await?;

        let shutdown = CancellationToken::new();
        let prober_task = tokio::spawn(prober.run(shutdown.clone()));
        let rebuilder_task = tokio::spawn(rebuilder.run(shutdown.clone()));

        tracing::info!("✓ Proxy ready");

        let connect_timeout = self.config.connect_timeout();
        tokio::select! {
            _ = accept_loop(write_listener, PoolKind::Write, router.clone(), connect_timeout, shutdown.clone()) => {}
            _ = accept_loop(read_listener, PoolKind::Read, router.clone(), connect_timeout, shutdown.clone()) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
            }
        }

        shutdown.cancel();
        let _ = prober_task.await;
        let _ = rebuilder_task.await;

        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    pool: PoolKind,
    router: Arc<Router>,
    connect_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let router = router.clone();
                    tokio::spawn(async move {
                        handle_conn(stream, peer, pool, router, connect_timeout).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(pool = %pool, "accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Dispatch one client connection: pick a backend from the routing table
/// snapshot, connect, and relay bytes until either side closes
async fn handle_conn(
    mut client: TcpStream,
    peer: SocketAddr,
    pool: PoolKind,
    router: Arc<Router>,
    connect_timeout: Duration,
) {
    let target = match pool {
        PoolKind::Write => router.write_target(),
        PoolKind::Read => router.next_read_target(),
    };
    let Some(target) = target else {
        // Fail closed: an immediate close beats a hang, the client can
        // retry elsewhere
        tracing::debug!(%peer, pool = %pool, "refusing connection: no eligible backend");
        return;
    };

    let backend =
        match tokio::time::timeout(connect_timeout, TcpStream::connect(&target.backend_addr))
            .await
        {
            Ok(Ok(backend)) => backend,
            Ok(Err(e)) => {
                tracing::warn!(
                    %peer,
                    backend = %target.backend_addr,
                    pool = %pool,
                    "backend connect failed: {}",
                    e
                );
                return;
            }
            Err(_) => {
                tracing::warn!(
                    %peer,
                    backend = %target.backend_addr,
                    pool = %pool,
                    "backend connect timed out"
                );
                return;
            }
        };

    let mut backend = backend;
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((to_backend, to_client)) => {
            tracing::debug!(
                %peer,
                backend = %target.backend_addr,
                to_backend,
                to_client,
                "relay finished"
            );
        }
        Err(e) => {
            tracing::debug!(%peer, backend = %target.backend_addr, "relay ended: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MemberSpec;
    use crate::proxy::routing::RoutingTable;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn spawn_echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    async fn spawn_proxy_listener(pool: PoolKind, router: Arc<Router>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(
            listener,
            pool,
            router,
            Duration::from_secs(1),
            shutdown,
        ));
        addr
    }

    #[tokio::test]
    async fn test_relay_bytes_to_write_target() {
        let backend = spawn_echo_backend().await;
        let router = Arc::new(Router::new());
        router.install(RoutingTable {
            write_target: Some(MemberSpec {
                id: "a".to_string(),
                status_addr: "127.0.0.1:8001".to_string(),
                backend_addr: backend.to_string(),
            }),
            read_targets: vec![],
        });
        let proxy = spawn_proxy_listener(PoolKind::Write, router).await;

        let mut conn = TcpStream::connect(proxy).await.unwrap();
        conn.write_all(b"INSERT INTO t VALUES (1);").await.unwrap();
        conn.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        conn.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"INSERT INTO t VALUES (1);");
    }

    #[tokio::test]
    async fn test_refused_when_no_eligible_backend() {
        // Empty routing table: connection must close immediately, not hang
        let router = Arc::new(Router::new());
        let proxy = spawn_proxy_listener(PoolKind::Write, router).await;

        let mut conn = TcpStream::connect(proxy).await.unwrap();
        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), conn.read_to_end(&mut buf))
            .await
            .expect("refusal must not hang");
        assert_eq!(read.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_inflight_connection_survives_table_change() {
        let backend = spawn_echo_backend().await;
        let router = Arc::new(Router::new());
        let member = MemberSpec {
            id: "a".to_string(),
            status_addr: "127.0.0.1:8001".to_string(),
            backend_addr: backend.to_string(),
        };
        router.install(RoutingTable {
            write_target: Some(member),
            read_targets: vec![],
        });
        let proxy = spawn_proxy_listener(PoolKind::Write, router.clone()).await;

        let mut conn = TcpStream::connect(proxy).await.unwrap();
        conn.write_all(b"before").await.unwrap();

        // Table flips to empty while the connection is in flight
        router.install(RoutingTable::default());

        conn.write_all(b"-after").await.unwrap();
        conn.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        conn.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"before-after");
    }
}
