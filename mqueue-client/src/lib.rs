//! # MQueue Client Library
//!
//! An async Rust client for the MQueue work-queue broker.
//!
//! ## Features
//!
//! - **Retrying producer**: transport failures are retried on a fresh
//!   connection under a bounded budget; message ids make retries idempotent
//! - **Consumer**: pop with an optional broker-side wait, ack or requeue with
//!   a delay, or settle one delivery and take the next in a single round trip
//! - **Monitor**: queue counts, failed-message listing and cleanup
//! - **Driver**: a scripted push/pop/verify run that ends in an exit status
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mqueue_client::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ClientConfigBuilder::new()
//!         .brokers(vec!["127.0.0.1:9092"])
//!         .build();
//!
//!     let mut producer = Producer::connect(config.clone()).await?;
//!     let record = PushRecord::new("job-1", "Hello MQueue!").priority(1);
//!     println!("push: {}", producer.push(&record).await);
//!
//!     let mut consumer = Consumer::connect(config).await?;
//!     if let Some(delivery) = consumer.pop(Some(Duration::from_secs(1))).await? {
//!         println!("Received {}", delivery.id);
//!         consumer.ack(&delivery).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod consumer;
pub mod driver;
pub mod error;
pub mod monitor;
pub mod producer;

pub use config::*;
pub use connection::BrokerConnection;
pub use consumer::*;
pub use driver::{run_script, ExitStatus, Report, Script};
pub use error::*;
pub use monitor::*;
pub use producer::*;
pub use mqueue::{Delivery, DeliveryOutcome, QueueCounts};

/// Client library result type
pub type Result<T> = std::result::Result<T, MqClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
