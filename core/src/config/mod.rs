pub mod settings;

use crate::protocol::ENVELOPE_HEADROOM;
use crate::queue::QueueSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub max_retries: u32,
    pub max_message_size: usize,
    pub queue_capacity: usize,
    pub priority_levels: u8,

    // Timers, in milliseconds. Zero disables ack redelivery and boosting.
    pub ack_timeout_ms: u64,
    pub boost_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub monitor_period_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9092,
            max_connections: 1000,
            max_retries: 2,
            max_message_size: 1024 * 1024, // 1MB
            queue_capacity: 10_000,
            priority_levels: 3,

            ack_timeout_ms: 30_000,
            boost_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            idle_timeout_ms: 5 * 60 * 1000,
            monitor_period_ms: 100,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl BrokerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn with_address(mut self, host: &str, port: u16) -> Self {
        self.host = host.to_string();
        self.port = port;
        self
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.ack_timeout_ms)
    }

    pub fn boost_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.boost_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn monitor_period(&self) -> Duration {
        Duration::from_millis(self.monitor_period_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            capacity: self.queue_capacity,
            priority_levels: self.priority_levels,
            max_retries: self.max_retries,
            ack_timeout: self.ack_timeout(),
            boost_timeout: self.boost_timeout(),
        }
    }

    /// Validate configuration bounds to prevent zero-sized resources and
    /// lengths the wire format cannot carry
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }
        if self.max_connections > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(format!(
                "max_connections must be <= {}",
                tokio::sync::Semaphore::MAX_PERMITS
            ));
        }
        if self.max_message_size == 0 {
            return Err("max_message_size must be > 0".to_string());
        }
        if self.max_message_size > u32::MAX as usize - ENVELOPE_HEADROOM {
            return Err(format!(
                "max_message_size must be <= {}",
                u32::MAX as usize - ENVELOPE_HEADROOM
            ));
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be > 0".to_string());
        }
        if self.priority_levels == 0 {
            return Err("priority_levels must be > 0".to_string());
        }
        if self.handshake_timeout_ms == 0 {
            return Err("handshake_timeout_ms must be > 0".to_string());
        }
        if self.idle_timeout_ms == 0 {
            return Err("idle_timeout_ms must be > 0".to_string());
        }
        if self.monitor_period_ms == 0 {
            return Err("monitor_period_ms must be > 0".to_string());
        }
        Ok(())
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
