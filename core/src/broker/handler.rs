use super::router::RouterHandle;
use super::Registry;
use crate::config::BrokerConfig;
use crate::connection::{Connection, ConnectionError, Welcome};
use crate::metrics::BrokerMetrics;
use crate::protocol::{ErrorCode, Packet, RejectReason, Role, MAX_IDS_PER_PACKET};
use crate::queue::Delivery;
use crate::MqError;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) const REJECT_LINGER: Duration = Duration::from_secs(1);

enum Flow {
    Continue,
    Stop,
}

/// Serves one connection from handshake to close.
pub struct ConnectionHandler<T> {
    conn: Connection<T>,
    router: RouterHandle,
    config: Arc<BrokerConfig>,
    metrics: Arc<BrokerMetrics>,
    registry: Registry,
    cancel: CancellationToken,
}

impl<T> ConnectionHandler<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        conn: Connection<T>,
        router: RouterHandle,
        config: Arc<BrokerConfig>,
        metrics: Arc<BrokerMetrics>,
        registry: Registry,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conn,
            router,
            config,
            metrics,
            registry,
            cancel,
        }
    }

    /// Run until the peer leaves, errors, idles out or the broker shuts down.
    /// Deliveries still held by this connection go back to the queue.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let result = self.serve().await;
        self.router.release(self.conn.id()).await;
        self.conn.close().await;
        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        let hello = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.conn.reject(RejectReason::ShuttingDown, REJECT_LINGER).await;
                return Ok(());
            }
            hello = self.conn.await_hello(self.config.handshake_timeout()) => hello,
        };
        let (role, client_id) = match hello {
            Ok(hello) => hello,
            Err(e) => {
                self.metrics.handshake_failed();
                return Err(e);
            }
        };

        let id = self.conn.id();
        if let Some(mut info) = self.registry.get_mut(&id) {
            info.role = Some(role);
            info.client_id = Some(client_id.clone());
        }
        self.conn
            .accept_hello(Welcome {
                connection_id: id,
                max_message_size: self.config.max_message_size as u32,
                max_retries: self.config.max_retries,
            })
            .await?;
        info!(
            "Connection {} from {} open as {} '{}'",
            id,
            self.conn.peer(),
            role,
            client_id
        );

        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Connection {} closing for shutdown", id);
                    return Ok(());
                }
                packet = self.conn.receive_timeout(self.config.idle_timeout()) => packet,
            };

            let packet = match received {
                Ok(packet) => packet,
                Err(ConnectionError::Closed) => return Ok(()),
                Err(ConnectionError::Timeout { timeout_ms }) => {
                    info!("Connection {} idle for {}ms, closing", id, timeout_ms);
                    return Ok(());
                }
                Err(e) => {
                    if matches!(e, ConnectionError::MalformedFrame(_)) {
                        self.metrics.protocol_violation();
                    }
                    return Err(e);
                }
            };

            self.metrics.request_received();
            if let Flow::Stop = self.dispatch(role, packet).await? {
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, role: Role, packet: Packet) -> Result<Flow, ConnectionError> {
        let conn_id = self.conn.id();
        let reply = match (role, packet) {
            (_, Packet::Goodbye) => {
                debug!("Connection {} said goodbye", conn_id);
                return Ok(Flow::Stop);
            }
            (_, Packet::Count) => self.router.counts().await.map(Packet::Counts),
            (Role::Producer, Packet::Push { id, payload, .. })
                if payload.len() > self.config.max_message_size =>
            {
                debug!(
                    "Connection {} push of '{}' refused: {} bytes",
                    conn_id,
                    id,
                    payload.len()
                );
                Ok(Packet::error(
                    ErrorCode::MessageTooLarge,
                    format!(
                        "message {} has {} bytes, limit is {}",
                        id,
                        payload.len(),
                        self.config.max_message_size
                    ),
                ))
            }
            (
                Role::Producer,
                Packet::Push {
                    id,
                    priority,
                    delay_ms,
                    payload,
                },
            ) => self
                .router
                .push(conn_id, id.clone(), payload, priority, millis(delay_ms))
                .await
                .map(|()| Packet::Accepted { id }),
            (Role::Consumer, Packet::Pop { wait_ms }) => {
                let wait = (wait_ms > 0)
                    .then(|| millis(wait_ms).min(self.config.idle_timeout()));
                self.router
                    .pop(conn_id, wait, &self.cancel)
                    .await
                    .map(deliver_or_empty)
            }
            (
                Role::Consumer,
                Packet::AckPop {
                    id,
                    token,
                    requeue,
                    delay_ms,
                    wait_ms,
                },
            ) => {
                let wait = (wait_ms > 0)
                    .then(|| millis(wait_ms).min(self.config.idle_timeout()));
                self.router
                    .ack_pop(
                        conn_id,
                        id,
                        token,
                        requeue,
                        millis(delay_ms),
                        wait,
                        &self.cancel,
                    )
                    .await
                    .map(deliver_or_empty)
            }
            (
                Role::Consumer,
                Packet::Ack {
                    id,
                    token,
                    requeue,
                    delay_ms,
                },
            ) => self
                .router
                .ack(conn_id, id.clone(), token, requeue, millis(delay_ms))
                .await
                .map(|()| Packet::Acked { id }),
            (Role::Monitor, Packet::ListFailed { limit }) => self
                .router
                .failed((limit as usize).min(MAX_IDS_PER_PACKET))
                .await
                .map(|(ids, truncated)| Packet::Failed { ids, truncated }),
            (Role::Monitor, Packet::EraseFailed { ids }) => self
                .router
                .erase_failed(ids)
                .await
                .map(|ids| Packet::Erased { ids }),
            (_, Packet::Hello { .. }) => Ok(Packet::error(
                ErrorCode::InvalidMessage,
                "handshake already completed",
            )),
            (role, packet) if packet.is_client_packet() => {
                debug!(
                    "Connection {} ({}) sent {}: role violation",
                    conn_id,
                    role,
                    packet.kind()
                );
                Ok(Packet::error(
                    ErrorCode::RoleViolation,
                    format!("{} is not allowed for a {}", packet.kind(), role),
                ))
            }
            (_, packet) => {
                warn!(
                    "Connection {} sent broker-only packet {}, closing",
                    conn_id,
                    packet.kind()
                );
                self.metrics.protocol_violation();
                let _ = self
                    .conn
                    .send(Packet::error(
                        ErrorCode::InvalidMessage,
                        format!("{} may only be sent by the broker", packet.kind()),
                    ))
                    .await;
                return Err(ConnectionError::MalformedFrame(format!(
                    "unexpected {} from client",
                    packet.kind()
                )));
            }
        };

        self.reply(reply).await
    }

    async fn reply(&mut self, reply: crate::Result<Packet>) -> Result<Flow, ConnectionError> {
        let (packet, flow) = match reply {
            Ok(packet) => (packet, Flow::Continue),
            Err(MqError::Queue(e)) => (Packet::error(e.code(), e.to_string()), Flow::Continue),
            Err(MqError::ShuttingDown) => (
                Packet::error(ErrorCode::ShuttingDown, "broker is shutting down"),
                Flow::Stop,
            ),
            Err(e) => (Packet::error(ErrorCode::Unknown, e.to_string()), Flow::Continue),
        };
        if let Packet::Error { code, .. } = &packet {
            self.metrics.error_sent();
            if matches!(code, ErrorCode::RoleViolation) {
                self.metrics.protocol_violation();
            }
        }
        self.conn.send(packet).await?;
        Ok(flow)
    }
}

fn millis(ms: u32) -> Duration {
    Duration::from_millis(u64::from(ms))
}

fn deliver_or_empty(delivery: Option<Delivery>) -> Packet {
    match delivery {
        Some(d) => Packet::Deliver {
            id: d.id,
            token: d.token,
            attempt: d.attempt,
            payload: d.payload,
        },
        None => Packet::Empty,
    }
}
