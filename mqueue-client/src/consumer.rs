//! Consumer client for receiving messages from an MQueue broker

use crate::config::ClientConfig;
use crate::connection::Session;
use crate::error::MqClientError;
use crate::Result;
use mqueue::{Delivery, Packet, Role};
use std::time::Duration;
use tracing::debug;

/// Pops deliveries and settles them.
///
/// A delivery must be acked (or requeued) with the token it came with. If the
/// connection drops first, the broker hands the message to someone else and
/// the token goes stale.
pub struct Consumer {
    session: Session,
}

impl Consumer {
    /// Connect a consumer with the given configuration
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let session = Session::connect(config, Role::Consumer).await?;
        Ok(Self { session })
    }

    pub fn config(&self) -> &ClientConfig {
        self.session.config()
    }

    /// Take the next ready message. With `wait`, the broker parks the request
    /// until a message is ready or the wait runs out; `None` means nothing
    /// arrived.
    pub async fn pop(&mut self, wait: Option<Duration>) -> Result<Option<Delivery>> {
        let wait = wait.unwrap_or(Duration::ZERO);
        self.receive(Packet::Pop { wait_ms: millis(wait) }, wait).await
    }

    /// Ack `delivery` and take the next message in one round trip. If the
    /// broker refuses the ack, the error comes back and nothing is taken.
    pub async fn ack_and_pop(
        &mut self,
        delivery: &Delivery,
        wait: Option<Duration>,
    ) -> Result<Option<Delivery>> {
        self.settle_and_pop(delivery, false, Duration::ZERO, wait).await
    }

    /// Requeue `delivery` after `delay` and take the next message in one
    /// round trip. The next message may be the requeued one.
    pub async fn requeue_and_pop(
        &mut self,
        delivery: &Delivery,
        delay: Duration,
        wait: Option<Duration>,
    ) -> Result<Option<Delivery>> {
        self.settle_and_pop(delivery, true, delay, wait).await
    }

    async fn settle_and_pop(
        &mut self,
        delivery: &Delivery,
        requeue: bool,
        delay: Duration,
        wait: Option<Duration>,
    ) -> Result<Option<Delivery>> {
        let wait = wait.unwrap_or(Duration::ZERO);
        let packet = Packet::AckPop {
            id: delivery.id.clone(),
            token: delivery.token,
            requeue,
            delay_ms: millis(delay),
            wait_ms: millis(wait),
        };
        self.receive(packet, wait).await
    }

    async fn receive(&mut self, packet: Packet, wait: Duration) -> Result<Option<Delivery>> {
        let limit = self.session.config().request_timeout + wait;
        match self.session.request_within(packet, limit).await? {
            Packet::Deliver {
                id,
                token,
                attempt,
                payload,
            } => {
                debug!("Received {} (attempt {}, {} bytes)", id, attempt, payload.len());
                Ok(Some(Delivery {
                    id,
                    token,
                    attempt,
                    payload,
                }))
            }
            Packet::Empty => Ok(None),
            other => self.unexpected("Deliver", other).await,
        }
    }

    /// Mark a delivery done
    pub async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        self.settle(delivery, false, Duration::ZERO).await
    }

    /// Give a delivery back, to become ready again after `delay`
    pub async fn requeue(&mut self, delivery: &Delivery, delay: Duration) -> Result<()> {
        self.settle(delivery, true, delay).await
    }

    async fn settle(&mut self, delivery: &Delivery, requeue: bool, delay: Duration) -> Result<()> {
        let packet = Packet::Ack {
            id: delivery.id.clone(),
            token: delivery.token,
            requeue,
            delay_ms: millis(delay),
        };
        match self.session.request(packet).await? {
            Packet::Acked { id } if id == delivery.id => Ok(()),
            other => self.unexpected("Acked", other).await,
        }
    }

    async fn unexpected<T>(&mut self, expected: &str, got: Packet) -> Result<T> {
        self.session.reset().await;
        Err(MqClientError::protocol(format!(
            "expected {}, got {}",
            expected,
            got.kind()
        )))
    }

    /// Close the consumer. Unsettled deliveries go back to the queue.
    pub async fn close(&mut self) {
        self.session.reset().await;
        debug!("Consumer closed");
    }
}

fn millis(duration: Duration) -> u32 {
    duration.as_millis().min(u32::MAX as u128) as u32
}
