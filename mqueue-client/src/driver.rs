//! Scripted end-to-end run against a broker.
//!
//! The driver pushes a fixed number of messages through a producer, pops
//! them back through a consumer, checks every payload byte for byte, acks
//! each delivery and folds the whole run into one [`ExitStatus`].

use crate::config::ClientConfig;
use crate::consumer::Consumer;
use crate::error::MqClientError;
use crate::producer::{Producer, PushRecord};
use bytes::Bytes;
use mqueue::DeliveryOutcome;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Terminal status of a script run, usable as a process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    Success,
    /// Invalid client configuration
    Usage,
    /// No broker connection within the retry budget
    ConnectFailed,
    /// A push exhausted its retries or an expected message never arrived
    DeliveryFailed,
    /// The broker or the client refused a message for good
    Rejected,
    /// Protocol violation or payload mismatch
    ProtocolFailed,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Usage => 1,
            ExitStatus::ConnectFailed => 2,
            ExitStatus::DeliveryFailed => 3,
            ExitStatus::Rejected => 4,
            ExitStatus::ProtocolFailed => 5,
        }
    }

    pub fn is_success(self) -> bool {
        self == ExitStatus::Success
    }

    /// Status for an error raised after both connections were up.
    fn for_error(e: &MqClientError) -> Self {
        match e {
            MqClientError::InvalidConfig { .. } => ExitStatus::Usage,
            e if e.is_rejection() => ExitStatus::Rejected,
            e if e.is_retryable() => ExitStatus::DeliveryFailed,
            MqClientError::Exhausted { .. } => ExitStatus::DeliveryFailed,
            _ => ExitStatus::ProtocolFailed,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitStatus::Success => "success",
            ExitStatus::Usage => "usage error",
            ExitStatus::ConnectFailed => "connect failed",
            ExitStatus::DeliveryFailed => "delivery failed",
            ExitStatus::Rejected => "rejected",
            ExitStatus::ProtocolFailed => "protocol failed",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// What a run does
#[derive(Debug, Clone)]
pub struct Script {
    pub messages: usize,
    /// Payload size in bytes
    pub size: usize,
    pub priority: u8,
    /// How long each pop may wait on the broker for a message
    pub pop_wait: Duration,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            messages: 1,
            size: 100,
            priority: 0,
            pop_wait: Duration::from_secs(5),
        }
    }
}

/// Outcome of a run with its counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub status: ExitStatus,
    pub pushed: usize,
    pub received: usize,
    pub acked: usize,
    pub elapsed: Duration,
    /// Why the run stopped early
    pub detail: Option<String>,
}

impl Report {
    fn new() -> Self {
        Self {
            status: ExitStatus::Success,
            pushed: 0,
            received: 0,
            acked: 0,
            elapsed: Duration::ZERO,
            detail: None,
        }
    }

    fn fail(mut self, status: ExitStatus, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        error!("Script failed with {}: {}", status, detail);
        self.status = status;
        self.detail = Some(detail);
        self
    }
}

/// Deterministic payload for message `index`, so the consumer can check it
/// without sharing state with the producer.
pub fn payload_for(index: usize, size: usize) -> Bytes {
    (0..size)
        .map(|i| (index.wrapping_mul(31).wrapping_add(i) % 251) as u8)
        .collect::<Vec<u8>>()
        .into()
}

/// Run `script` against the brokers in `config`.
pub async fn run_script(config: ClientConfig, script: &Script) -> Report {
    let started = Instant::now();
    let mut report = execute(config, script, Report::new()).await;
    report.elapsed = started.elapsed();
    info!(
        "Script finished: {} (pushed {}, received {}, acked {}, {:?})",
        report.status, report.pushed, report.received, report.acked, report.elapsed
    );
    report
}

async fn execute(config: ClientConfig, script: &Script, mut report: Report) -> Report {
    if let Err(e) = config.validate() {
        return report.fail(ExitStatus::Usage, e.to_string());
    }
    let prefix = format!("{}-{}", config.client_id(), std::process::id());

    let mut producer = match Producer::connect(config.clone()).await {
        Ok(producer) => producer,
        Err(e) => return report.fail(ExitStatus::ConnectFailed, e.to_string()),
    };
    let mut consumer = match Consumer::connect(config).await {
        Ok(consumer) => consumer,
        Err(e) => {
            producer.close().await;
            return report.fail(ExitStatus::ConnectFailed, e.to_string());
        }
    };

    report = push_all(&mut producer, script, &prefix, report).await;
    if report.status.is_success() {
        report = pop_all(&mut consumer, script, &prefix, report).await;
    }

    producer.close().await;
    consumer.close().await;
    report
}

async fn push_all(
    producer: &mut Producer,
    script: &Script,
    prefix: &str,
    mut report: Report,
) -> Report {
    for index in 0..script.messages {
        let record = PushRecord::new(
            format!("{}-{}", prefix, index),
            payload_for(index, script.size),
        )
        .priority(script.priority);

        match producer.push(&record).await {
            DeliveryOutcome::Delivered(id) => {
                debug!("Pushed {}", id);
                report.pushed += 1;
            }
            DeliveryOutcome::Rejected(e) => {
                let status = match ExitStatus::for_error(&e) {
                    ExitStatus::ProtocolFailed => ExitStatus::ProtocolFailed,
                    _ => ExitStatus::Rejected,
                };
                return report.fail(status, format!("push of {} rejected: {}", record.id, e));
            }
            DeliveryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                return report.fail(
                    ExitStatus::DeliveryFailed,
                    format!(
                        "push of {} failed after {} attempts: {}",
                        record.id, attempts, last_error
                    ),
                );
            }
        }
    }
    report
}

async fn pop_all(
    consumer: &mut Consumer,
    script: &Script,
    prefix: &str,
    mut report: Report,
) -> Report {
    let mut expected: HashMap<String, Bytes> = (0..script.messages)
        .map(|index| (format!("{}-{}", prefix, index), payload_for(index, script.size)))
        .collect();
    if expected.is_empty() {
        return report;
    }

    let mut next = consumer.pop(Some(script.pop_wait)).await;
    loop {
        let delivery = match next {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                return report.fail(
                    ExitStatus::DeliveryFailed,
                    format!("{} expected messages never arrived", expected.len()),
                );
            }
            Err(e) => return report.fail(ExitStatus::for_error(&e), format!("pop failed: {}", e)),
        };
        report.received += 1;

        let Some(payload) = expected.remove(&delivery.id) else {
            return report.fail(
                ExitStatus::ProtocolFailed,
                format!("unexpected message {}", delivery.id),
            );
        };
        if payload != delivery.payload {
            return report.fail(
                ExitStatus::ProtocolFailed,
                format!("payload mismatch for {}", delivery.id),
            );
        }

        // Settle and fetch together while more messages are due.
        let settled = if expected.is_empty() {
            consumer.ack(&delivery).await.map(|()| None)
        } else {
            consumer
                .ack_and_pop(&delivery, Some(script.pop_wait))
                .await
                .map(Some)
        };
        match settled {
            Ok(following) => {
                report.acked += 1;
                match following {
                    Some(following) => next = Ok(following),
                    None => return report,
                }
            }
            Err(e) => {
                let status = match ExitStatus::for_error(&e) {
                    ExitStatus::Rejected => ExitStatus::ProtocolFailed,
                    status => status,
                };
                return report.fail(status, format!("ack of {} failed: {}", delivery.id, e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqueue::{ConnectionError, ErrorCode};

    #[test]
    fn test_exit_codes() {
        let codes: Vec<i32> = [
            ExitStatus::Success,
            ExitStatus::Usage,
            ExitStatus::ConnectFailed,
            ExitStatus::DeliveryFailed,
            ExitStatus::Rejected,
            ExitStatus::ProtocolFailed,
        ]
        .iter()
        .map(|s| s.code())
        .collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(ExitStatus::Rejected.to_string(), "rejected (4)");
    }

    #[test]
    fn test_error_classification() {
        let too_large = MqClientError::MessageTooLarge {
            size: 300,
            max_size: 250,
        };
        assert_eq!(ExitStatus::for_error(&too_large), ExitStatus::Rejected);

        let full = MqClientError::from_broker(ErrorCode::QueueFull, "full");
        assert_eq!(ExitStatus::for_error(&full), ExitStatus::Rejected);

        let closed = MqClientError::from(ConnectionError::Closed);
        assert_eq!(ExitStatus::for_error(&closed), ExitStatus::DeliveryFailed);

        let role = MqClientError::from_broker(ErrorCode::RoleViolation, "nope");
        assert_eq!(ExitStatus::for_error(&role), ExitStatus::ProtocolFailed);

        let config = MqClientError::invalid_config("bad");
        assert_eq!(ExitStatus::for_error(&config), ExitStatus::Usage);
    }

    #[test]
    fn test_payloads_are_deterministic() {
        assert_eq!(payload_for(3, 100), payload_for(3, 100));
        assert_ne!(payload_for(3, 100), payload_for(4, 100));
        assert_eq!(payload_for(7, 0).len(), 0);
        assert_eq!(payload_for(7, 1000).len(), 1000);
    }

    #[tokio::test]
    async fn test_invalid_config_is_usage() {
        let config = ClientConfig {
            brokers: Vec::new(),
            ..ClientConfig::default()
        };
        let report = run_script(config, &Script::default()).await;
        assert_eq!(report.status, ExitStatus::Usage);
        assert_eq!(report.pushed, 0);
        assert!(report.detail.is_some());
    }
}
