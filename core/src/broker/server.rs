use super::admission::{AdmissionPermit, ConnectionLimiter};
use super::handler::{ConnectionHandler, REJECT_LINGER};
use super::listener::Listener;
use super::router::{Router, RouterHandle};
use super::{ConnectionInfo, Registry};
use crate::config::BrokerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::metrics::{BrokerMetrics, MetricsSnapshot};
use crate::protocol::RejectReason;
use crate::queue::QueueStats;
use crate::{MqError, Result};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct BrokerServer {
    config: Arc<BrokerConfig>,
    metrics: Arc<BrokerMetrics>,
}

impl BrokerServer {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        config.validate().map_err(MqError::Config)?;
        Ok(Self {
            config: Arc::new(config),
            metrics: Arc::new(BrokerMetrics::new()),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Bind the listener and spawn the accept loop and the router.
    pub async fn start(self) -> Result<BrokerHandle> {
        let cancel = CancellationToken::new();
        let addr = self.config.bind_address();
        let listener = Listener::bind(&addr, cancel.child_token(), self.config.max_message_size).await?;
        let local_addr = listener.local_addr();

        let (router, router_task) = Router::spawn(
            self.config.queue_settings(),
            self.config.monitor_period(),
            cancel.child_token(),
        );
        let limiter = Arc::new(ConnectionLimiter::new(self.config.max_connections));
        let registry: Registry = Arc::new(DashMap::new());

        let accept_loop = AcceptLoop {
            listener,
            limiter: Arc::clone(&limiter),
            router: router.clone(),
            registry: Arc::clone(&registry),
            metrics: Arc::clone(&self.metrics),
            config: Arc::clone(&self.config),
            cancel: cancel.clone(),
        };
        let accept_task = tokio::spawn(accept_loop.run());

        info!(
            "MQueue broker listening on {} (max connections {}, max retries {}, max message size {})",
            local_addr,
            self.config.max_connections,
            self.config.max_retries,
            self.config.max_message_size
        );

        Ok(BrokerHandle {
            local_addr,
            cancel,
            accept_task,
            router_task,
            router,
            limiter,
            registry,
            metrics: self.metrics,
        })
    }
}

/// A running broker. Call [`shutdown`](Self::shutdown) to stop it.
pub struct BrokerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    router_task: JoinHandle<QueueStats>,
    router: RouterHandle,
    limiter: Arc<ConnectionLimiter>,
    registry: Registry,
    metrics: Arc<BrokerMetrics>,
}

impl BrokerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn router(&self) -> &RouterHandle {
        &self.router
    }

    /// Admitted connections that have not closed yet.
    pub fn active_connections(&self) -> usize {
        self.limiter.active_connections()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut connections: Vec<ConnectionInfo> =
            self.registry.iter().map(|entry| entry.value().clone()).collect();
        connections.sort_by_key(|info| info.id);
        connections
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.router.stats().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop accepting, cancel every handler and the router, and wait for them
    /// within the configured grace period. Returns the final queue counters.
    pub async fn shutdown(self) -> QueueStats {
        info!("Initiating graceful shutdown...");
        self.cancel.cancel();

        if let Err(e) = self.accept_task.await {
            error!("Accept loop failed: {}", e);
        }
        let stats = match self.router_task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Router task failed: {}", e);
                QueueStats::default()
            }
        };

        match serde_json::to_string(&self.metrics.snapshot()) {
            Ok(json) => info!("Broker metrics: {}", json),
            Err(e) => warn!("Failed to encode broker metrics: {}", e),
        }
        info!("Server shutdown complete");
        stats
    }
}

/// Frees the registry entry and the admission slot when a handler ends,
/// whichever way it ends.
struct ConnectionGuard {
    id: ConnectionId,
    registry: Registry,
    metrics: Arc<BrokerMetrics>,
    _permit: AdmissionPermit,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
        self.metrics.connection_closed();
    }
}

struct AcceptLoop {
    listener: Listener,
    limiter: Arc<ConnectionLimiter>,
    router: RouterHandle,
    registry: Registry,
    metrics: Arc<BrokerMetrics>,
    config: Arc<BrokerConfig>,
    cancel: CancellationToken,
}

impl AcceptLoop {
    async fn run(mut self) {
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => self.admit(conn, &mut handlers),
                    Err(MqError::ListenerClosed) => break,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        self.listener.close();
        info!(
            "Stopped accepting; waiting for {} connections to close",
            handlers.len()
        );
        let drained = tokio::time::timeout(self.config.shutdown_grace(), async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connections still open after grace period, aborting",
                handlers.len()
            );
            handlers.abort_all();
            while handlers.join_next().await.is_some() {}
        }
    }

    fn admit(&self, mut conn: Connection<TcpStream>, handlers: &mut JoinSet<()>) {
        let id = conn.id();
        let peer = conn.peer().to_string();

        let permit = match self.limiter.try_admit() {
            Ok(permit) => permit,
            Err(e) => {
                self.metrics.connection_rejected();
                warn!("Rejecting connection from {}: {}", peer, e);
                let cancel = self.cancel.clone();
                handlers.spawn(async move {
                    tokio::select! {
                        _ = conn.reject(RejectReason::AdmissionLimit, REJECT_LINGER) => {}
                        _ = cancel.cancelled() => {}
                    }
                });
                return;
            }
        };

        self.metrics.connection_opened();
        self.registry.insert(
            id,
            ConnectionInfo {
                id,
                peer: peer.clone(),
                role: None,
                client_id: None,
                connected_at: SystemTime::now(),
            },
        );
        info!(
            "New client connected: {} (active: {})",
            peer,
            self.limiter.active_connections()
        );

        let guard = ConnectionGuard {
            id,
            registry: Arc::clone(&self.registry),
            metrics: Arc::clone(&self.metrics),
            _permit: permit,
        };
        let handler = ConnectionHandler::new(
            conn,
            self.router.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.metrics),
            Arc::clone(&self.registry),
            self.cancel.child_token(),
        );
        handlers.spawn(async move {
            let _guard = guard;
            match handler.run().await {
                Ok(()) => info!("Client {} disconnected", peer),
                Err(e) if e.is_transient() => debug!("Client {} dropped: {}", peer, e),
                Err(e) => warn!("Closed connection {} from {}: {}", id, peer, e),
            }
        });
    }
}
