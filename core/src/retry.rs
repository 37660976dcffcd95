//! Bounded retry with backoff.
//!
//! Retries exclude the first attempt: a policy with `max_retries = 2` runs an
//! operation at most three times. The loop is an explicit state machine
//! ([`RetryState`]) whose transition function is pure, so the budget can be
//! inspected and tested without timers.

use crate::connection::ConnectionError;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Classifies failures as worth retrying or permanent.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for ConnectionError {
    fn is_transient(&self) -> bool {
        ConnectionError::is_transient(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (starting at 1). Never exceeds the
    /// configured maximum and never decreases as `retry` grows.
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exponent = retry.saturating_sub(1).min(64) as i32;
                let factor = multiplier.max(1.0).powi(exponent);
                let millis = initial.as_millis() as f64 * factor;
                if !millis.is_finite() || millis >= max.as_millis() as f64 {
                    *max
                } else {
                    Duration::from_millis(millis as u64).min(*max)
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(5),
                multiplier: 2.0,
            },
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::new(max_retries, Backoff::Fixed(delay))
    }

    pub fn no_retry() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    /// Upper bound on how many times an operation runs.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Terminal result of a retried operation.
#[derive(Debug)]
pub enum DeliveryOutcome<T, E> {
    Delivered(T),
    /// Permanent failure; no retry budget was consumed for it.
    Rejected(E),
    Exhausted { attempts: u32, last_error: E },
}

impl<T, E> DeliveryOutcome<T, E> {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered(_))
    }

    pub fn delivered(self) -> Option<T> {
        match self {
            DeliveryOutcome::Delivered(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DeliveryOutcome<U, E> {
        match self {
            DeliveryOutcome::Delivered(value) => DeliveryOutcome::Delivered(f(value)),
            DeliveryOutcome::Rejected(e) => DeliveryOutcome::Rejected(e),
            DeliveryOutcome::Exhausted {
                attempts,
                last_error,
            } => DeliveryOutcome::Exhausted {
                attempts,
                last_error,
            },
        }
    }
}

impl<T, E: fmt::Display> fmt::Display for DeliveryOutcome<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Delivered(_) => write!(f, "delivered"),
            DeliveryOutcome::Rejected(e) => write!(f, "rejected: {}", e),
            DeliveryOutcome::Exhausted {
                attempts,
                last_error,
            } => write!(f, "exhausted after {} attempts: {}", attempts, last_error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting { attempt: u32, remaining: u32 },
    Finished,
}

/// What the driver of a [`RetryState`] should do next.
#[derive(Debug)]
pub enum Step<T, E> {
    Retry { delay: Duration },
    Done(DeliveryOutcome<T, E>),
}

impl RetryState {
    pub fn start(policy: &RetryPolicy) -> Self {
        RetryState::Attempting {
            attempt: 1,
            remaining: policy.max_retries,
        }
    }

    /// 1-based number of the attempt about to run.
    pub fn attempt(&self) -> u32 {
        match self {
            RetryState::Attempting { attempt, .. } => *attempt,
            RetryState::Finished => 0,
        }
    }

    pub fn remaining(&self) -> u32 {
        match self {
            RetryState::Attempting { remaining, .. } => *remaining,
            RetryState::Finished => 0,
        }
    }

    /// Feed the result of the current attempt.
    pub fn advance<T, E: Transient>(
        &mut self,
        result: Result<T, E>,
        policy: &RetryPolicy,
    ) -> Step<T, E> {
        let (attempt, remaining) = match *self {
            RetryState::Attempting { attempt, remaining } => (attempt, remaining),
            RetryState::Finished => {
                return Step::Done(match result {
                    Ok(value) => DeliveryOutcome::Delivered(value),
                    Err(e) => DeliveryOutcome::Rejected(e),
                })
            }
        };

        match result {
            Ok(value) => {
                *self = RetryState::Finished;
                Step::Done(DeliveryOutcome::Delivered(value))
            }
            Err(e) if !e.is_transient() => {
                *self = RetryState::Finished;
                Step::Done(DeliveryOutcome::Rejected(e))
            }
            Err(e) if remaining == 0 => {
                *self = RetryState::Finished;
                Step::Done(DeliveryOutcome::Exhausted {
                    attempts: attempt,
                    last_error: e,
                })
            }
            Err(_) => {
                *self = RetryState::Attempting {
                    attempt: attempt + 1,
                    remaining: remaining - 1,
                };
                Step::Retry {
                    delay: policy.backoff.delay_for(attempt),
                }
            }
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the budget runs out.
/// `op` receives the 1-based attempt number.
pub async fn deliver_with_retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> DeliveryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + fmt::Display,
{
    let mut state = RetryState::start(policy);
    loop {
        let attempt = state.attempt();
        let result = op(attempt).await;
        if let Err(e) = &result {
            debug!(
                "Attempt {}/{} failed: {}",
                attempt,
                policy.max_attempts(),
                e
            );
        }
        match state.advance(result, policy) {
            Step::Done(outcome) => return outcome,
            Step::Retry { delay } => tokio::time::sleep(delay).await,
        }
    }
}
