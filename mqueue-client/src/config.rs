//! Configuration types for the MQueue client

use crate::error::MqClientError;
use mqueue::{Backoff, RetryPolicy};
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker addresses, tried in order
    pub brokers: Vec<String>,
    /// Timeout for the TCP connect and for the handshake
    pub connection_timeout: Duration,
    /// Timeout for a single request/reply exchange
    pub request_timeout: Duration,
    /// Retry configuration
    pub retry_config: RetryConfig,
    /// Client identifier sent in `Hello`
    pub client_id: Option<String>,
    /// Frame ceiling used until the broker announces its own limit
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["127.0.0.1:9092".to_string()],
            connection_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            retry_config: RetryConfig::default(),
            client_id: None,
            max_message_size: 1024 * 1024, // 1MB
        }
    }
}

impl ClientConfig {
    /// The id sent to the broker, `mqclient` when none is configured
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("mqclient")
    }

    pub fn validate(&self) -> Result<(), MqClientError> {
        if self.brokers.is_empty() {
            return Err(MqClientError::invalid_config(
                "At least one broker must be specified",
            ));
        }
        if let Some(broker) = self.brokers.iter().find(|b| b.trim().is_empty()) {
            return Err(MqClientError::invalid_config(format!(
                "Invalid broker address '{}'",
                broker
            )));
        }
        if self.connection_timeout.is_zero() {
            return Err(MqClientError::invalid_config(
                "connection_timeout must be greater than zero",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(MqClientError::invalid_config(
                "request_timeout must be greater than zero",
            ));
        }
        if self.max_message_size == 0 || self.max_message_size > u32::MAX as usize {
            return Err(MqClientError::invalid_config(format!(
                "max_message_size must be between 1 and {}",
                u32::MAX
            )));
        }
        if let Some(id) = &self.client_id {
            if id.len() > mqueue::protocol::MAX_ID_LEN {
                return Err(MqClientError::invalid_config(format!(
                    "client_id is longer than {} bytes",
                    mqueue::protocol::MAX_ID_LEN
                )));
            }
        }
        self.retry_config.validate()
    }
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Initial retry delay
    pub initial_delay: Duration,
    /// Maximum retry delay
    pub max_delay: Duration,
    /// Retry delay multiplier
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Backoff::Exponential {
                initial: self.initial_delay,
                max: self.max_delay,
                multiplier: self.multiplier,
            },
        )
    }

    fn validate(&self) -> Result<(), MqClientError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(MqClientError::invalid_config(
                "retry multiplier must be at least 1.0",
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(MqClientError::invalid_config(
                "retry max_delay must not be below initial_delay",
            ));
        }
        Ok(())
    }
}

/// Builder for client configuration
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Create a new client config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set broker addresses
    pub fn brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.brokers = brokers.into_iter().map(|s| s.into()).collect();
        self
    }

    /// Set connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Set request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set client ID
    pub fn client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.config.client_id = Some(client_id.into());
        self
    }

    /// Set retry configuration
    pub fn retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.config.retry_config = retry_config;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry_config.max_retries = max_retries;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.client_id(), "mqclient");
    }

    #[test]
    fn test_builder() {
        let config = ClientConfigBuilder::new()
            .brokers(vec!["10.0.0.1:9092", "10.0.0.2:9092"])
            .client_id("worker-1")
            .request_timeout(Duration::from_secs(2))
            .max_retries(2)
            .build();

        assert_eq!(config.brokers.len(), 2);
        assert_eq!(config.client_id(), "worker-1");
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.retry_config.policy().max_attempts(), 3);
    }

    #[test]
    fn test_invalid_configs() {
        let no_brokers = ClientConfigBuilder::new()
            .brokers(Vec::<String>::new())
            .build();
        assert!(matches!(
            no_brokers.validate(),
            Err(MqClientError::InvalidConfig { .. })
        ));

        let zero_timeout = ClientConfigBuilder::new()
            .request_timeout(Duration::ZERO)
            .build();
        assert!(zero_timeout.validate().is_err());

        let long_id = ClientConfigBuilder::new().client_id("x".repeat(300)).build();
        assert!(long_id.validate().is_err());

        let shrinking = ClientConfigBuilder::new()
            .retry_config(RetryConfig {
                multiplier: 0.5,
                ..RetryConfig::default()
            })
            .build();
        assert!(shrinking.validate().is_err());
    }

    #[test]
    fn test_retry_policy_is_bounded() {
        let policy = RetryConfig::default().policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff.delay_for(20), Duration::from_secs(5));
    }
}
