//! Single-owner router task.
//!
//! The router owns the [`MessageQueue`] and applies every mutation in the
//! order commands arrive. Handlers talk to it through a [`RouterHandle`]
//! (bounded `mpsc` with a `oneshot` reply per command). Consumers waiting for
//! a message are parked here and served as soon as one becomes ready.
//! Every pop is answered explicitly, `None` included, so a reply channel
//! dropped without an answer always means the router stopped.

use crate::connection::ConnectionId;
use crate::protocol::QueueCounts;
use crate::queue::{Delivery, MessageQueue, QueueError, QueueSettings, QueueStats};
use crate::{MqError, Result};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const COMMAND_BUFFER: usize = 1024;

#[derive(Debug)]
pub enum RouterCommand {
    Push {
        from: ConnectionId,
        id: String,
        payload: Bytes,
        priority: u8,
        delay: Duration,
        reply: oneshot::Sender<std::result::Result<(), QueueError>>,
    },
    Pop {
        from: ConnectionId,
        wait: bool,
        reply: oneshot::Sender<Option<Delivery>>,
    },
    /// Ack followed by a pop in one step. `settled` carries the ack result;
    /// on success the pop is answered on `reply` exactly as for `Pop`.
    AckPop {
        from: ConnectionId,
        id: String,
        token: u64,
        requeue: bool,
        delay: Duration,
        wait: bool,
        settled: oneshot::Sender<std::result::Result<(), QueueError>>,
        reply: oneshot::Sender<Option<Delivery>>,
    },
    Ack {
        from: ConnectionId,
        id: String,
        token: u64,
        requeue: bool,
        delay: Duration,
        reply: oneshot::Sender<std::result::Result<(), QueueError>>,
    },
    Counts {
        reply: oneshot::Sender<QueueCounts>,
    },
    ListFailed {
        limit: usize,
        reply: oneshot::Sender<(Vec<String>, bool)>,
    },
    EraseFailed {
        ids: Vec<String>,
        reply: oneshot::Sender<Vec<String>>,
    },
    Stats {
        reply: oneshot::Sender<QueueStats>,
    },
    /// The connection is gone: drop its waiters and take back its deliveries.
    Release { conn: ConnectionId },
}

/// Cloneable sender side of the router.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterCommand>,
}

impl RouterHandle {
    async fn call<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> RouterCommand) -> Result<R> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| MqError::ShuttingDown)?;
        rx.await.map_err(|_| MqError::ShuttingDown)
    }

    /// Route a producer's message into the queue.
    pub async fn push(
        &self,
        from: ConnectionId,
        id: String,
        payload: Bytes,
        priority: u8,
        delay: Duration,
    ) -> Result<()> {
        self.call(|reply| RouterCommand::Push {
            from,
            id,
            payload,
            priority,
            delay,
            reply,
        })
        .await?
        .map_err(MqError::from)
    }

    /// Take the next message for `from`. With `wait`, park until one is
    /// ready, the wait elapses (`Ok(None)`) or `cancel` fires.
    ///
    /// A delivery that races the timeout is recovered from the closed reply
    /// channel rather than lost.
    pub async fn pop(
        &self,
        from: ConnectionId,
        wait: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::Pop {
                from,
                wait: wait.is_some(),
                reply,
            })
            .await
            .map_err(|_| MqError::ShuttingDown)?;
        Self::receive(rx, wait, cancel).await
    }

    /// Settle `id` and take the next message for `from` without another
    /// round trip. A refused ack is returned as an error and nothing is
    /// taken; otherwise this behaves like [`RouterHandle::pop`].
    #[allow(clippy::too_many_arguments)]
    pub async fn ack_pop(
        &self,
        from: ConnectionId,
        id: String,
        token: u64,
        requeue: bool,
        delay: Duration,
        wait: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery>> {
        let (settled, settled_rx) = oneshot::channel();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::AckPop {
                from,
                id,
                token,
                requeue,
                delay,
                wait: wait.is_some(),
                settled,
                reply,
            })
            .await
            .map_err(|_| MqError::ShuttingDown)?;
        settled_rx.await.map_err(|_| MqError::ShuttingDown)??;
        Self::receive(rx, wait, cancel).await
    }

    async fn receive(
        mut rx: oneshot::Receiver<Option<Delivery>>,
        wait: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery>> {
        let Some(wait) = wait else {
            return rx.await.map_err(|_| MqError::ShuttingDown);
        };

        tokio::select! {
            result = &mut rx => result.map_err(|_| MqError::ShuttingDown),
            _ = tokio::time::sleep(wait) => {
                rx.close();
                Ok(rx.try_recv().ok().flatten())
            }
            _ = cancel.cancelled() => {
                rx.close();
                // Anything that slipped through is still Running under `from`
                // and comes back when the connection is released.
                let _ = rx.try_recv();
                Err(MqError::ShuttingDown)
            }
        }
    }

    pub async fn ack(
        &self,
        from: ConnectionId,
        id: String,
        token: u64,
        requeue: bool,
        delay: Duration,
    ) -> Result<()> {
        self.call(|reply| RouterCommand::Ack {
            from,
            id,
            token,
            requeue,
            delay,
            reply,
        })
        .await?
        .map_err(MqError::from)
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        self.call(|reply| RouterCommand::Counts { reply }).await
    }

    pub async fn failed(&self, limit: usize) -> Result<(Vec<String>, bool)> {
        self.call(|reply| RouterCommand::ListFailed { limit, reply })
            .await
    }

    pub async fn erase_failed(&self, ids: Vec<String>) -> Result<Vec<String>> {
        self.call(|reply| RouterCommand::EraseFailed { ids, reply })
            .await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.call(|reply| RouterCommand::Stats { reply }).await
    }

    pub async fn release(&self, conn: ConnectionId) {
        if self.tx.send(RouterCommand::Release { conn }).await.is_err() {
            trace!("Router gone, release of connection {} skipped", conn);
        }
    }
}

struct Waiter {
    conn: ConnectionId,
    reply: oneshot::Sender<Option<Delivery>>,
}

pub struct Router {
    queue: MessageQueue,
    rx: mpsc::Receiver<RouterCommand>,
    waiters: VecDeque<Waiter>,
    monitor_period: Duration,
    cancel: CancellationToken,
}

impl Router {
    /// Start the router task.
    pub fn spawn(
        settings: QueueSettings,
        monitor_period: Duration,
        cancel: CancellationToken,
    ) -> (RouterHandle, JoinHandle<QueueStats>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let router = Router {
            queue: MessageQueue::new(settings),
            rx,
            waiters: VecDeque::new(),
            monitor_period,
            cancel,
        };
        (RouterHandle { tx }, tokio::spawn(router.run()))
    }

    async fn run(mut self) -> QueueStats {
        let mut ticker = interval(self.monitor_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_due = self.queue.next_due();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    self.sweep();
                }
                _ = ticker.tick() => self.sweep(),
            }
            self.dispatch();
        }

        // Dropping the waiters wakes parked consumers.
        self.waiters.clear();
        let stats = self.queue.stats();
        match serde_json::to_string(&stats) {
            Ok(json) => info!("Router stopped; queue stats: {}", json),
            Err(e) => warn!("Router stopped; failed to encode queue stats: {}", e),
        }
        stats
    }

    fn handle(&mut self, command: RouterCommand) {
        let now = Instant::now();
        match command {
            RouterCommand::Push {
                from,
                id,
                payload,
                priority,
                delay,
                reply,
            } => {
                let result = self.queue.push(id.clone(), payload, priority, delay, now);
                match &result {
                    Ok(()) => trace!("Connection {} pushed '{}' at priority {}", from, id, priority),
                    Err(e) => debug!("Connection {} push of '{}' refused: {}", from, id, e),
                }
                let _ = reply.send(result);
            }
            RouterCommand::Pop { from, wait, reply } => {
                let next = self.queue.pop(from, now);
                self.serve(from, wait, reply, next);
            }
            RouterCommand::AckPop {
                from,
                id,
                token,
                requeue,
                delay,
                wait,
                settled,
                reply,
            } => match self.queue.ack_pop(&id, token, requeue, delay, from, now) {
                Ok(next) => {
                    let _ = settled.send(Ok(()));
                    self.serve(from, wait, reply, next);
                }
                Err(e) => {
                    debug!("Connection {} ack of '{}' refused, nothing popped: {}", from, id, e);
                    let _ = settled.send(Err(e));
                }
            },
            RouterCommand::Ack {
                from,
                id,
                token,
                requeue,
                delay,
                reply,
            } => {
                let result = self.queue.ack(&id, token, requeue, delay, now);
                if let Err(e) = &result {
                    debug!("Connection {} ack of '{}' refused: {}", from, id, e);
                }
                let _ = reply.send(result);
            }
            RouterCommand::Counts { reply } => {
                let _ = reply.send(self.queue.counts());
            }
            RouterCommand::ListFailed { limit, reply } => {
                let _ = reply.send(self.queue.failed_ids(limit));
            }
            RouterCommand::EraseFailed { ids, reply } => {
                let erased = self.queue.erase_failed(&ids);
                if !erased.is_empty() {
                    info!("Erased {} failed messages", erased.len());
                }
                let _ = reply.send(erased);
            }
            RouterCommand::Stats { reply } => {
                let _ = reply.send(self.queue.stats());
            }
            RouterCommand::Release { conn } => {
                self.waiters.retain(|w| w.conn != conn);
                let released = self.queue.release(conn, now);
                if released > 0 {
                    debug!(
                        "Connection {} closed holding {} messages; returned to queue",
                        conn, released
                    );
                }
            }
        }
    }

    fn sweep(&mut self) {
        let report = self.queue.sweep(Instant::now());
        if report.failed > 0 {
            warn!(
                "{} messages exceeded the retry budget and moved to the failed set",
                report.failed
            );
        }
        if !report.is_empty() {
            debug!("Sweep: {:?}", report);
        }
    }

    /// Answer a pop: hand over `next`, park the consumer, or report empty.
    fn serve(
        &mut self,
        from: ConnectionId,
        wait: bool,
        reply: oneshot::Sender<Option<Delivery>>,
        next: Option<Delivery>,
    ) {
        self.waiters.retain(|w| !w.reply.is_closed());
        match next {
            Some(delivery) => self.hand_over(reply, delivery),
            None if wait => self.waiters.push_back(Waiter { conn: from, reply }),
            None => {
                let _ = reply.send(None);
            }
        }
    }

    /// Serve parked consumers while messages are ready.
    fn dispatch(&mut self) {
        while self.queue.has_ready() {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.reply.is_closed() {
                continue;
            }
            let Some(delivery) = self.queue.pop(waiter.conn, Instant::now()) else {
                break;
            };
            self.hand_over(waiter.reply, delivery);
        }
    }

    fn hand_over(&mut self, reply: oneshot::Sender<Option<Delivery>>, delivery: Delivery) {
        if let Err(Some(delivery)) = reply.send(Some(delivery)) {
            trace!("Consumer left before delivery of '{}'", delivery.id);
            self.queue.unpop(&delivery);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> QueueSettings {
        QueueSettings {
            capacity: 8,
            priority_levels: 3,
            max_retries: 1,
            ack_timeout: Some(Duration::from_secs(1)),
            boost_timeout: None,
        }
    }

    fn spawn() -> (RouterHandle, CancellationToken, JoinHandle<QueueStats>) {
        let cancel = CancellationToken::new();
        let (handle, task) = Router::spawn(settings(), Duration::from_millis(10), cancel.clone());
        (handle, cancel, task)
    }

    #[tokio::test]
    async fn test_push_pop_ack() {
        let (router, cancel, task) = spawn();
        let never = CancellationToken::new();

        router
            .push(1, "a".into(), Bytes::from("x"), 0, Duration::ZERO)
            .await
            .unwrap();
        let delivery = router.pop(2, None, &never).await.unwrap().unwrap();
        assert_eq!(delivery.payload, Bytes::from("x"));
        router
            .ack(2, "a".into(), delivery.token, false, Duration::ZERO)
            .await
            .unwrap();

        assert!(router.pop(2, None, &never).await.unwrap().is_none());
        cancel.cancel();
        let stats = task.await.unwrap();
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_push_errors_are_typed() {
        let (router, _cancel, _task) = spawn();
        let err = router
            .push(1, "a".into(), Bytes::new(), 9, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MqError::Queue(QueueError::InvalidPriority { priority: 9, .. })
        ));
    }

    #[tokio::test]
    async fn test_parked_consumer_receives_later_push() {
        let (router, _cancel, _task) = spawn();
        let consumer = router.clone();
        let waiting = tokio::spawn(async move {
            consumer
                .pop(5, Some(Duration::from_secs(5)), &CancellationToken::new())
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        router
            .push(1, "late".into(), Bytes::from("y"), 1, Duration::ZERO)
            .await
            .unwrap();

        let delivery = waiting.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.id, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_wait_times_out_without_losing_messages() {
        let (router, _cancel, _task) = spawn();
        let never = CancellationToken::new();

        let result = router
            .pop(5, Some(Duration::from_millis(50)), &never)
            .await
            .unwrap();
        assert!(result.is_none());

        router
            .push(1, "m".into(), Bytes::new(), 0, Duration::ZERO)
            .await
            .unwrap();
        let delivery = router.pop(6, None, &never).await.unwrap();
        assert_eq!(delivery.map(|d| d.id), Some("m".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_push_delivered_when_due() {
        let (router, _cancel, _task) = spawn();
        let never = CancellationToken::new();
        router
            .push(1, "d".into(), Bytes::new(), 0, Duration::from_millis(200))
            .await
            .unwrap();

        assert!(router.pop(2, None, &never).await.unwrap().is_none());
        let delivery = router
            .pop(2, Some(Duration::from_secs(1)), &never)
            .await
            .unwrap();
        assert_eq!(delivery.map(|d| d.id), Some("d".to_string()));
    }

    #[tokio::test]
    async fn test_release_returns_deliveries() {
        let (router, _cancel, _task) = spawn();
        let never = CancellationToken::new();
        router
            .push(1, "a".into(), Bytes::new(), 0, Duration::ZERO)
            .await
            .unwrap();
        let first = router.pop(2, None, &never).await.unwrap().unwrap();
        router.release(2).await;

        let second = router.pop(3, None, &never).await.unwrap().unwrap();
        assert_eq!(second.id, "a");
        assert_eq!(second.attempt, 2);
        assert_ne!(second.token, first.token);

        // max_retries = 1: the second failure parks it.
        router.release(3).await;
        let counts = router.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        let (failed, truncated) = router.failed(10).await.unwrap();
        assert_eq!(failed, vec!["a".to_string()]);
        assert!(!truncated);
        assert_eq!(
            router.erase_failed(failed).await.unwrap(),
            vec!["a".to_string()]
        );
        assert_eq!(router.counts().await.unwrap().free, 8);
    }

    #[tokio::test]
    async fn test_ack_pop_refusal_takes_nothing() {
        let (router, _cancel, _task) = spawn();
        let never = CancellationToken::new();
        for id in ["a", "b"] {
            router
                .push(1, id.into(), Bytes::from(id), 0, Duration::ZERO)
                .await
                .unwrap();
        }
        let first = router.pop(2, None, &never).await.unwrap().unwrap();

        let err = router
            .ack_pop(2, "a".into(), first.token + 1, false, Duration::ZERO, None, &never)
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::Queue(QueueError::InvalidToken(_))));

        // "b" is still queued for someone else.
        let other = router.pop(3, None, &never).await.unwrap().unwrap();
        assert_eq!(other.id, "b");
        assert_eq!(router.stats().await.unwrap().completed, 0);
    }

    #[tokio::test]
    async fn test_ack_pop_hands_over_next_message() {
        let (router, _cancel, _task) = spawn();
        let never = CancellationToken::new();
        for id in ["a", "b"] {
            router
                .push(1, id.into(), Bytes::from(id), 0, Duration::ZERO)
                .await
                .unwrap();
        }
        let first = router.pop(2, None, &never).await.unwrap().unwrap();

        let next = router
            .ack_pop(2, "a".into(), first.token, false, Duration::ZERO, None, &never)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, "b");
        assert_eq!(next.payload, Bytes::from("b"));

        let last = router
            .ack_pop(2, "b".into(), next.token, false, Duration::ZERO, None, &never)
            .await
            .unwrap();
        assert!(last.is_none());
        assert_eq!(router.stats().await.unwrap().completed, 2);
    }

    #[tokio::test]
    async fn test_ack_pop_parks_until_a_push() {
        let (router, _cancel, _task) = spawn();
        let never = CancellationToken::new();
        router
            .push(1, "a".into(), Bytes::new(), 0, Duration::ZERO)
            .await
            .unwrap();
        let first = router.pop(2, None, &never).await.unwrap().unwrap();

        let consumer = router.clone();
        let waiting = tokio::spawn(async move {
            consumer
                .ack_pop(
                    2,
                    "a".into(),
                    first.token,
                    false,
                    Duration::ZERO,
                    Some(Duration::from_secs(5)),
                    &CancellationToken::new(),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        router
            .push(1, "b".into(), Bytes::new(), 0, Duration::ZERO)
            .await
            .unwrap();
        let next = waiting.await.unwrap().unwrap().unwrap();
        assert_eq!(next.id, "b");
    }

    #[tokio::test]
    async fn test_pop_dropped_by_stopping_router_is_shutdown() {
        // A command still buffered when the router stops is dropped unanswered.
        let (tx, mut rx) = mpsc::channel(1);
        let router = RouterHandle { tx };
        let stopping = tokio::spawn(async move {
            drop(rx.recv().await);
        });

        let result = router.pop(2, None, &CancellationToken::new()).await;
        assert!(matches!(result, Err(MqError::ShuttingDown)));
        stopping.await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let (router, cancel, task) = spawn();
        cancel.cancel();
        task.await.unwrap();

        assert!(matches!(
            router.counts().await,
            Err(MqError::ShuttingDown)
        ));
    }
}
