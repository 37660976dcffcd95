//! # MQueue
//!
//! A bounded work-queue message broker. Producers push messages with an id, a
//! priority and an optional delay; consumers pop them one at a time and
//! acknowledge each delivery with the token it came with. Deliveries that are
//! never acknowledged are redelivered up to a retry budget and then parked in
//! a failed set that monitors can inspect and erase.
//!
//! ## Architecture
//!
//! ```text
//! TcpListener -> accept loop -> admission (semaphore)
//!                     |
//!                     v
//!        per-connection handler task  --mpsc/oneshot-->  router task
//!          (Framed<TcpStream, PacketCodec>)                (owns MessageQueue)
//! ```
//!
//! - [`protocol`] - length-prefixed frames and typed packets
//! - [`connection`] - framed connection with its state machine and timeouts
//! - [`queue`] - the priority queue with tokens, redelivery and boosting
//! - [`broker`] - listener, admission, handlers, router and server lifecycle
//! - [`retry`] - bounded retry with backoff, shared with the client crate
//! - [`config`] - `BrokerConfig` with environment loading
//! - [`metrics`] - lock-free broker counters
//!
//! ## Example
//!
//! ```rust,no_run
//! use mqueue::{BrokerConfig, BrokerServer, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = BrokerConfig::default().with_address("127.0.0.1", 9092);
//!     let broker = BrokerServer::new(config)?.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     broker.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod connection;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod retry;

pub use broker::{BrokerHandle, BrokerServer, ConnectionInfo, RouterHandle};
pub use config::BrokerConfig;
pub use connection::{Connection, ConnectionError, ConnectionId, ConnectionState, Welcome};
pub use metrics::{BrokerMetrics, MetricsSnapshot};
pub use protocol::{
    CodecError, ErrorCode, FrameCodec, Packet, PacketCodec, QueueCounts, RejectReason, Role,
};
pub use queue::{Delivery, MessageQueue, QueueError, QueueSettings, QueueStats};
pub use retry::{
    deliver_with_retry, Backoff, DeliveryOutcome, RetryPolicy, RetryState, Step, Transient,
};

use thiserror::Error;

/// MQueue error types
///
/// Lower layers keep their own error enums ([`CodecError`],
/// [`ConnectionError`], [`QueueError`]); this one covers broker lifecycle and
/// wraps the others where they cross module boundaries.
#[derive(Debug, Error)]
pub enum MqError {
    /// The listen address could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// `accept` after the listener was shut down
    #[error("Listener closed")]
    ListenerClosed,

    /// The admission limit is reached
    #[error("Admission rejected: limit of {limit} connections reached")]
    AdmissionRejected { limit: usize },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The router is gone or shutdown is in progress
    #[error("Broker is shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for MQueue operations
pub type Result<T> = std::result::Result<T, MqError>;
