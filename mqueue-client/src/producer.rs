//! Producer client for pushing messages to an MQueue broker

use crate::config::ClientConfig;
use crate::connection::Session;
use crate::error::MqClientError;
use crate::Result;
use bytes::Bytes;
use mqueue::{DeliveryOutcome, ErrorCode, Packet, RetryPolicy, RetryState, Role, Step};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A message to push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRecord {
    pub id: String,
    pub priority: u8,
    pub delay: Duration,
    pub payload: Bytes,
}

impl PushRecord {
    pub fn new(id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            delay: Duration::ZERO,
            payload: payload.into(),
        }
    }

    /// 0 is the most urgent level
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Hold the message back until `delay` has elapsed on the broker
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn to_packet(&self) -> Packet {
        Packet::Push {
            id: self.id.clone(),
            priority: self.priority,
            delay_ms: self.delay.as_millis().min(u32::MAX as u128) as u32,
            payload: self.payload.clone(),
        }
    }
}

/// Pushes messages, retrying transport failures on a fresh connection.
///
/// Retries are idempotent: the broker refuses a second message with the same
/// id, so a `DuplicateMessage` reply to a retry means an earlier attempt
/// already landed.
pub struct Producer {
    session: Session,
    policy: RetryPolicy,
}

impl Producer {
    /// Connect a producer with the given configuration
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let policy = config.retry_config.policy();
        let session = Session::connect(config, Role::Producer).await?;
        Ok(Self { session, policy })
    }

    pub fn config(&self) -> &ClientConfig {
        self.session.config()
    }

    /// Largest payload the broker accepts, once connected
    pub fn max_message_size(&self) -> Option<usize> {
        self.session.connection().map(|c| c.max_message_size())
    }

    /// Push one message. The result is always terminal: the message was
    /// accepted, refused for good, or every attempt failed.
    pub async fn push(&mut self, record: &PushRecord) -> DeliveryOutcome<String, MqClientError> {
        let mut state = RetryState::start(&self.policy);
        loop {
            let attempt = state.attempt();
            let result = self.try_push(record, attempt).await;
            if let Err(e) = &result {
                debug!(
                    "Push of {} attempt {}/{} failed: {}",
                    record.id,
                    attempt,
                    self.policy.max_attempts(),
                    e
                );
            }
            match state.advance(result, &self.policy) {
                Step::Done(outcome) => {
                    if !outcome.is_delivered() {
                        warn!("Push of {} {}", record.id, outcome);
                    }
                    return outcome;
                }
                Step::Retry { delay } => tokio::time::sleep(delay).await,
            }
        }
    }

    async fn try_push(&mut self, record: &PushRecord, attempt: u32) -> Result<String> {
        if let Some(max_size) = self.max_message_size() {
            if record.payload.len() > max_size {
                return Err(MqClientError::MessageTooLarge {
                    size: record.payload.len(),
                    max_size,
                });
            }
        }

        match self.session.request(record.to_packet()).await {
            Ok(Packet::Accepted { id }) => Ok(id),
            Ok(other) => {
                self.session.reset().await;
                Err(MqClientError::protocol(format!(
                    "expected Accepted, got {}",
                    other.kind()
                )))
            }
            Err(e) if attempt > 1 && e.broker_code() == Some(ErrorCode::DuplicateMessage) => {
                info!("Message {} was accepted by an earlier attempt", record.id);
                Ok(record.id.clone())
            }
            Err(e) => Err(e),
        }
    }

    /// Close the producer
    pub async fn close(&mut self) {
        self.session.reset().await;
        debug!("Producer closed");
    }
}
