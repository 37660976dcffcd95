//! # Broker
//!
//! TCP front end and message routing.
//!
//! - [`listener`] - accepts peers, closes on cancellation
//! - [`admission`] - semaphore-backed connection limit
//! - [`handler`] - per-connection task: handshake, role dispatch, cleanup
//! - [`router`] - single task owning the queue; parks waiting consumers
//! - [`server`] - wires the pieces together and owns shutdown
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use mqueue::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> mqueue::Result<()> {
//!     let config = BrokerConfig {
//!         max_connections: 1000,
//!         max_retries: 2,
//!         max_message_size: 250,
//!         ..Default::default()
//!     };
//!     let broker = BrokerServer::new(config)?.start().await?;
//!     println!("listening on {}", broker.local_addr());
//!     broker.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod handler;
pub mod listener;
pub mod router;
pub mod server;

use crate::connection::ConnectionId;
use crate::protocol::Role;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::SystemTime;

pub use admission::{AdmissionPermit, ConnectionLimiter, ConnectionStats};
pub use listener::Listener;
pub use router::{Router, RouterHandle};
pub use server::{BrokerHandle, BrokerServer};

/// Registry entry for a live connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: String,
    /// Known once the handshake completes.
    pub role: Option<Role>,
    pub client_id: Option<String>,
    pub connected_at: SystemTime,
}

pub(crate) type Registry = Arc<DashMap<ConnectionId, ConnectionInfo>>;
