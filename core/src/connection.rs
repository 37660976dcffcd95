//! Framed packet connection shared by the broker and the client.
//!
//! A [`Connection`] wraps any async byte stream in a [`PacketCodec`] and
//! tracks the connection state machine:
//!
//! ```text
//! Connecting --handshake--> Open --error/EOF/close--> Closing --> Closed
//! ```
//!
//! Only handshake packets move while `Connecting`; general `send`/`receive`
//! require `Open`. Once `Closing` or `Closed`, every operation fails with
//! [`ConnectionError::Closed`].

use crate::protocol::{CodecError, Packet, PacketCodec, RejectReason, Role};
use futures::{SinkExt, StreamExt};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

pub type ConnectionId = u64;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Message size {size} exceeds maximum {max_size}")]
    Oversize { size: usize, max_size: usize },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Connection rejected by broker: {reason}")]
    AdmissionRejected { reason: RejectReason },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_ms: duration.as_millis() as u64,
        }
    }

    /// Errors worth retrying on a fresh connection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionError::Closed
                | ConnectionError::Timeout { .. }
                | ConnectionError::Io(_)
                | ConnectionError::AdmissionRejected { .. }
        )
    }
}

impl From<CodecError> for ConnectionError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Oversize { size, max_size } => ConnectionError::Oversize { size, max_size },
            CodecError::MalformedFrame(msg) => ConnectionError::MalformedFrame(msg),
            CodecError::Io(e) => from_io(e),
        }
    }
}

fn from_io(err: io::Error) -> ConnectionError {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => ConnectionError::Closed,
        _ => ConnectionError::Io(err),
    }
}

/// Parameters the broker hands back in `Welcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Welcome {
    pub connection_id: ConnectionId,
    pub max_message_size: u32,
    pub max_retries: u32,
}

pub struct Connection<T> {
    id: ConnectionId,
    peer: String,
    framed: Framed<T, PacketCodec>,
    state: ConnectionState,
}

impl<T> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .finish()
    }
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(id: ConnectionId, peer: impl Into<String>, io: T, max_message_size: usize) -> Self {
        Self {
            id,
            peer: peer.into(),
            framed: Framed::new(io, PacketCodec::new(max_message_size)),
            state: ConnectionState::Connecting,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn max_message_size(&self) -> usize {
        self.framed.codec().max_message_size()
    }

    /// Apply the limit negotiated during the handshake.
    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        self.framed.codec_mut().set_max_message_size(max_message_size);
    }

    /// Client side of the handshake: send `Hello`, wait for `Welcome`.
    pub async fn greet(
        &mut self,
        role: Role,
        client_id: &str,
        handshake_timeout: Duration,
    ) -> Result<Welcome, ConnectionError> {
        self.expect_state(ConnectionState::Connecting)?;
        self.write(Packet::Hello {
            role,
            client_id: client_id.to_string(),
        })
        .await?;

        let reply = match timeout(handshake_timeout, self.read()).await {
            Ok(reply) => reply?,
            Err(_) => {
                self.state = ConnectionState::Closing;
                return Err(ConnectionError::timeout(handshake_timeout));
            }
        };

        match reply {
            Packet::Welcome {
                connection_id,
                max_message_size,
                max_retries,
            } => {
                self.id = connection_id;
                self.state = ConnectionState::Open;
                debug!(
                    "Connection {} to {} open as {}",
                    connection_id, self.peer, role
                );
                Ok(Welcome {
                    connection_id,
                    max_message_size,
                    max_retries,
                })
            }
            Packet::Rejected { reason } => {
                self.state = ConnectionState::Closing;
                Err(ConnectionError::AdmissionRejected { reason })
            }
            other => {
                self.state = ConnectionState::Closing;
                Err(ConnectionError::Handshake(format!(
                    "expected Welcome, got {}",
                    other.kind()
                )))
            }
        }
    }

    /// Broker side: wait for the peer's `Hello`.
    pub async fn await_hello(
        &mut self,
        handshake_timeout: Duration,
    ) -> Result<(Role, String), ConnectionError> {
        self.expect_state(ConnectionState::Connecting)?;
        let packet = match timeout(handshake_timeout, self.read()).await {
            Ok(packet) => packet?,
            Err(_) => {
                self.state = ConnectionState::Closing;
                return Err(ConnectionError::timeout(handshake_timeout));
            }
        };

        match packet {
            Packet::Hello { role, client_id } => Ok((role, client_id)),
            other => {
                self.state = ConnectionState::Closing;
                Err(ConnectionError::Handshake(format!(
                    "expected Hello, got {}",
                    other.kind()
                )))
            }
        }
    }

    /// Broker side: complete the handshake and open the connection.
    pub async fn accept_hello(&mut self, welcome: Welcome) -> Result<(), ConnectionError> {
        self.expect_state(ConnectionState::Connecting)?;
        self.write(Packet::Welcome {
            connection_id: welcome.connection_id,
            max_message_size: welcome.max_message_size,
            max_retries: welcome.max_retries,
        })
        .await?;
        self.state = ConnectionState::Open;
        Ok(())
    }

    /// Broker side: refuse the peer and close.
    ///
    /// After `Rejected` is flushed the write half is shut down and the read
    /// half drained until the peer hangs up or `linger` elapses, so the
    /// rejection is not lost to a reset.
    pub async fn reject(&mut self, reason: RejectReason, linger: Duration) {
        if self.state != ConnectionState::Connecting {
            self.close().await;
            return;
        }
        if self.write(Packet::Rejected { reason }).await.is_ok() {
            self.state = ConnectionState::Closing;
            let _ = timeout(CLOSE_TIMEOUT, SinkExt::<Packet>::close(&mut self.framed)).await;
            let _ = timeout(linger, async {
                while let Some(Ok(_)) = self.framed.next().await {}
            })
            .await;
        }
        self.state = ConnectionState::Closed;
    }

    pub async fn send(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        self.expect_state(ConnectionState::Open)?;
        self.write(packet).await
    }

    pub async fn receive(&mut self) -> Result<Packet, ConnectionError> {
        self.expect_state(ConnectionState::Open)?;
        self.read().await
    }

    /// Like [`receive`](Self::receive), failing with `Timeout` if no packet
    /// arrives in time. A timeout leaves the connection open.
    pub async fn receive_timeout(&mut self, limit: Duration) -> Result<Packet, ConnectionError> {
        self.expect_state(ConnectionState::Open)?;
        match timeout(limit, self.read()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::timeout(limit)),
        }
    }

    /// Send a request and wait for its reply.
    pub async fn request(
        &mut self,
        packet: Packet,
        limit: Duration,
    ) -> Result<Packet, ConnectionError> {
        self.send(packet).await?;
        self.receive_timeout(limit).await
    }

    /// Flush and shut down the transport. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;
        if let Err(e) = timeout(CLOSE_TIMEOUT, SinkExt::<Packet>::close(&mut self.framed))
            .await
            .unwrap_or(Ok(()))
        {
            trace!("Connection {} close: {}", self.id, e);
        }
        self.state = ConnectionState::Closed;
    }

    fn expect_state(&self, expected: ConnectionState) -> Result<(), ConnectionError> {
        if self.state == expected {
            return Ok(());
        }
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed => Err(ConnectionError::Closed),
            _ => Err(ConnectionError::Handshake(format!(
                "connection is {:?}, expected {:?}",
                self.state, expected
            ))),
        }
    }

    async fn write(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        let kind = packet.kind();
        match self.framed.send(packet).await {
            Ok(()) => {
                trace!("Connection {} sent {}", self.id, kind);
                Ok(())
            }
            // Nothing was written; the connection is still usable.
            Err(CodecError::Oversize { size, max_size }) => {
                Err(ConnectionError::Oversize { size, max_size })
            }
            Err(e) => {
                self.state = ConnectionState::Closing;
                Err(e.into())
            }
        }
    }

    async fn read(&mut self) -> Result<Packet, ConnectionError> {
        match self.framed.next().await {
            Some(Ok(packet)) => {
                trace!("Connection {} received {}", self.id, packet.kind());
                Ok(packet)
            }
            Some(Err(e)) => {
                self.state = ConnectionState::Closing;
                Err(e.into())
            }
            None => {
                self.state = ConnectionState::Closing;
                Err(ConnectionError::Closed)
            }
        }
    }
}
