//! Bounded priority work queue.
//!
//! Messages carry a producer-chosen id and a priority (0 is highest). A pop
//! hands the head of the highest non-empty priority lane to a consumer with a
//! fresh token; only that token can later acknowledge the message. Running
//! messages that are never acknowledged come back on [`MessageQueue::sweep`]
//! or [`MessageQueue::release`] and fail for good once their failed attempts
//! exceed the retry budget.
//!
//! The queue is synchronous and takes the current time as an argument. It is
//! owned by the router task, which serializes every mutation.

use crate::connection::ConnectionId;
use crate::protocol::{ErrorCode, QueueCounts};
use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Invalid priority {priority}: {levels} levels configured")]
    InvalidPriority { priority: u8, levels: u8 },

    #[error("Duplicate message id '{0}'")]
    DuplicateMessage(String),

    #[error("Queue full: capacity {capacity}")]
    QueueFull { capacity: usize },

    #[error("No message with id '{0}'")]
    UnknownMessage(String),

    #[error("Invalid token for message '{0}'")]
    InvalidToken(String),

    #[error("Message '{0}' is not running")]
    InvalidState(String),
}

impl QueueError {
    pub fn code(&self) -> ErrorCode {
        match self {
            QueueError::InvalidPriority { .. } => ErrorCode::InvalidPriority,
            QueueError::DuplicateMessage(_) => ErrorCode::DuplicateMessage,
            QueueError::QueueFull { .. } => ErrorCode::QueueFull,
            QueueError::UnknownMessage(_) => ErrorCode::UnknownMessage,
            QueueError::InvalidToken(_) => ErrorCode::InvalidToken,
            QueueError::InvalidState(_) => ErrorCode::InvalidState,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub capacity: usize,
    pub priority_levels: u8,
    pub max_retries: u32,
    /// `None` disables redelivery of unacknowledged messages.
    pub ack_timeout: Option<Duration>,
    /// `None` disables starvation boosting.
    pub boost_timeout: Option<Duration>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            priority_levels: 3,
            max_retries: 2,
            ack_timeout: Some(Duration::from_secs(30)),
            boost_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub token: u64,
    /// 1-based; failed attempts so far plus one.
    pub attempt: u32,
    pub payload: Bytes,
}

/// Lifetime counters. `accepted == completed + erased + held` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub accepted: u64,
    pub delivered: u64,
    pub completed: u64,
    pub requeued: u64,
    pub redelivered: u64,
    pub failed: u64,
    pub erased: u64,
    pub boosted: u64,
}

/// What one [`MessageQueue::sweep`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub promoted: usize,
    pub redelivered: usize,
    pub failed: usize,
    pub boosted: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Queued,
    Delayed,
    Running {
        token: u64,
        owner: ConnectionId,
        since: Instant,
    },
    Failed,
}

#[derive(Debug)]
struct Entry {
    priority: u8,
    /// Lane the message currently waits in; 0 after a boost.
    lane: u8,
    payload: Bytes,
    state: State,
    queued_at: Instant,
    failures: u32,
}

#[derive(Debug)]
pub struct MessageQueue {
    settings: QueueSettings,
    lanes: Vec<VecDeque<String>>,
    entries: HashMap<String, Entry>,
    delayed: BTreeMap<(Instant, u64), String>,
    queued: usize,
    failed: usize,
    next_token: u64,
    next_seq: u64,
    stats: QueueStats,
}

impl MessageQueue {
    pub fn new(settings: QueueSettings) -> Self {
        let levels = settings.priority_levels.max(1) as usize;
        Self {
            lanes: (0..levels).map(|_| VecDeque::new()).collect(),
            entries: HashMap::new(),
            delayed: BTreeMap::new(),
            queued: 0,
            failed: 0,
            next_token: 1,
            next_seq: 0,
            stats: QueueStats::default(),
            settings,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Messages held in any state, failed ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a pop would return a message right now.
    pub fn has_ready(&self) -> bool {
        self.queued > 0
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    pub fn push(
        &mut self,
        id: String,
        payload: Bytes,
        priority: u8,
        delay: Duration,
        now: Instant,
    ) -> Result<(), QueueError> {
        if priority as usize >= self.lanes.len() {
            return Err(QueueError::InvalidPriority {
                priority,
                levels: self.lanes.len() as u8,
            });
        }
        if self.entries.contains_key(&id) {
            return Err(QueueError::DuplicateMessage(id));
        }
        if self.entries.len() >= self.settings.capacity {
            return Err(QueueError::QueueFull {
                capacity: self.settings.capacity,
            });
        }

        self.entries.insert(
            id.clone(),
            Entry {
                priority,
                lane: priority,
                payload,
                state: State::Queued,
                queued_at: now,
                failures: 0,
            },
        );
        self.stats.accepted += 1;
        if delay.is_zero() {
            self.enqueue_back(id, now);
        } else {
            self.park(id, now + delay);
        }
        Ok(())
    }

    /// Take the next ready message for `owner`.
    pub fn pop(&mut self, owner: ConnectionId, now: Instant) -> Option<Delivery> {
        let token = self.next_token;
        for lane in self.lanes.iter_mut() {
            while let Some(id) = lane.pop_front() {
                let Some(entry) = self.entries.get_mut(&id) else {
                    continue;
                };
                if entry.state != State::Queued {
                    continue;
                }
                entry.state = State::Running {
                    token,
                    owner,
                    since: now,
                };
                self.next_token += 1;
                self.queued -= 1;
                self.stats.delivered += 1;
                return Some(Delivery {
                    attempt: entry.failures + 1,
                    payload: entry.payload.clone(),
                    id,
                    token,
                });
            }
        }
        None
    }

    /// Put back a delivery that never reached its consumer. Restores the
    /// message to the head of its lane without counting a failure.
    pub fn unpop(&mut self, delivery: &Delivery) -> bool {
        let Some(entry) = self.entries.get_mut(&delivery.id) else {
            return false;
        };
        match entry.state {
            State::Running { token, .. } if token == delivery.token => {
                entry.state = State::Queued;
                self.lanes[entry.lane as usize].push_front(delivery.id.clone());
                self.queued += 1;
                self.stats.delivered = self.stats.delivered.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    /// Acknowledge a running message: complete it, or requeue it (optionally
    /// delayed) without counting a failure.
    pub fn ack(
        &mut self,
        id: &str,
        token: u64,
        requeue: bool,
        delay: Duration,
        now: Instant,
    ) -> Result<(), QueueError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| QueueError::UnknownMessage(id.to_string()))?;
        match entry.state {
            State::Running { token: current, .. } if current == token => {}
            State::Running { .. } => return Err(QueueError::InvalidToken(id.to_string())),
            _ => return Err(QueueError::InvalidState(id.to_string())),
        }

        if !requeue {
            self.entries.remove(id);
            self.stats.completed += 1;
            return Ok(());
        }

        entry.lane = entry.priority;
        self.stats.requeued += 1;
        if delay.is_zero() {
            self.enqueue_back(id.to_string(), now);
        } else {
            self.park(id.to_string(), now + delay);
        }
        Ok(())
    }

    /// Settle a running message and take the next ready one for `owner` in a
    /// single step. A refused ack takes nothing.
    #[allow(clippy::too_many_arguments)]
    pub fn ack_pop(
        &mut self,
        id: &str,
        token: u64,
        requeue: bool,
        delay: Duration,
        owner: ConnectionId,
        now: Instant,
    ) -> Result<Option<Delivery>, QueueError> {
        self.ack(id, token, requeue, delay, now)?;
        Ok(self.pop(owner, now))
    }

    /// Apply timers: queue due delayed messages, redeliver or fail running
    /// messages whose ack timeout elapsed, and boost starving messages.
    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let id = entry.remove();
            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.state == State::Delayed {
                    entry.state = State::Queued;
                    entry.queued_at = now;
                    self.lanes[entry.lane as usize].push_front(id);
                    self.queued += 1;
                    report.promoted += 1;
                }
            }
        }

        if let Some(ack_timeout) = self.settings.ack_timeout {
            let expired: Vec<String> = self
                .entries
                .iter()
                .filter(|(_, e)| matches!(e.state, State::Running { since, .. } if now.saturating_duration_since(since) >= ack_timeout))
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                if self.record_failure(&id, now) {
                    report.failed += 1;
                } else {
                    report.redelivered += 1;
                }
            }
        }

        if let Some(boost_timeout) = self.settings.boost_timeout {
            let mut starving: Vec<(Instant, String)> = self
                .entries
                .iter()
                .filter(|(_, e)| {
                    e.state == State::Queued
                        && e.lane > 0
                        && now.saturating_duration_since(e.queued_at) >= boost_timeout
                })
                .map(|(id, e)| (e.queued_at, id.clone()))
                .collect();
            starving.sort();
            for (_, id) in starving {
                let Some(entry) = self.entries.get_mut(&id) else {
                    continue;
                };
                let lane = &mut self.lanes[entry.lane as usize];
                if let Some(pos) = lane.iter().position(|queued| *queued == id) {
                    lane.remove(pos);
                    entry.lane = 0;
                    self.lanes[0].push_back(id);
                    self.stats.boosted += 1;
                    report.boosted += 1;
                }
            }
        }

        report
    }

    /// Return every message `owner` holds, each counting one failed attempt.
    pub fn release(&mut self, owner: ConnectionId, now: Instant) -> usize {
        let held: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.state, State::Running { owner: o, .. } if o == owner))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &held {
            self.record_failure(id, now);
        }
        held.len()
    }

    /// Earliest time a delayed message becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.delayed.keys().next().map(|(due, _)| *due)
    }

    pub fn counts(&self) -> QueueCounts {
        let held = self.entries.len() as u64;
        let capacity = self.settings.capacity as u64;
        QueueCounts {
            capacity,
            active: held - self.failed as u64,
            failed: self.failed as u64,
            free: capacity.saturating_sub(held),
        }
    }

    /// Ids of failed messages in sorted order, at most `limit` of them, and
    /// whether more exist.
    pub fn failed_ids(&self, limit: usize) -> (Vec<String>, bool) {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == State::Failed)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        let truncated = ids.len() > limit;
        ids.truncate(limit);
        (ids, truncated)
    }

    /// Remove failed messages. Ids that are unknown or not failed are skipped.
    pub fn erase_failed(&mut self, ids: &[String]) -> Vec<String> {
        let mut erased = Vec::new();
        for id in ids {
            let is_failed = self
                .entries
                .get(id)
                .is_some_and(|e| e.state == State::Failed);
            if is_failed {
                self.entries.remove(id);
                self.failed -= 1;
                self.stats.erased += 1;
                erased.push(id.clone());
            }
        }
        erased
    }

    /// Count one failed attempt. Returns `true` if the message is now failed.
    fn record_failure(&mut self, id: &str, now: Instant) -> bool {
        let max_retries = self.settings.max_retries;
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        entry.failures += 1;
        if entry.failures > max_retries {
            entry.state = State::Failed;
            self.failed += 1;
            self.stats.failed += 1;
            return true;
        }
        entry.lane = entry.priority;
        self.stats.redelivered += 1;
        self.enqueue_back(id.to_string(), now);
        false
    }

    fn enqueue_back(&mut self, id: String, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.state = State::Queued;
            entry.queued_at = now;
            self.lanes[entry.lane as usize].push_back(id);
            self.queued += 1;
        }
    }

    fn park(&mut self, id: String, until: Instant) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.state = State::Delayed;
            self.delayed.insert((until, self.next_seq), id);
            self.next_seq += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> QueueSettings {
        QueueSettings {
            capacity: 4,
            priority_levels: 3,
            max_retries: 2,
            ack_timeout: Some(Duration::from_secs(1)),
            boost_timeout: Some(Duration::from_secs(5)),
        }
    }

    fn push(q: &mut MessageQueue, id: &str, priority: u8, now: Instant) {
        q.push(
            id.to_string(),
            Bytes::from(id.to_string()),
            priority,
            Duration::ZERO,
            now,
        )
        .unwrap();
    }

    fn assert_accounting(q: &MessageQueue) {
        let stats = q.stats();
        assert_eq!(stats.accepted, stats.completed + stats.erased + q.len() as u64);
    }

    #[test]
    fn test_push_validation() {
        let now = Instant::now();
        let mut q = MessageQueue::new(settings());
        assert_eq!(
            q.push("a".into(), Bytes::new(), 3, Duration::ZERO, now),
            Err(QueueError::InvalidPriority {
                priority: 3,
                levels: 3
            })
        );
        push(&mut q, "a", 0, now);
        assert_eq!(
            q.push("a".into(), Bytes::new(), 0, Duration::ZERO, now),
            Err(QueueError::DuplicateMessage("a".into()))
        );
        push(&mut q, "b", 0, now);
        push(&mut q, "c", 0, now);
        push(&mut q, "d", 0, now);
        assert_eq!(
            q.push("e".into(), Bytes::new(), 0, Duration::ZERO, now),
            Err(QueueError::QueueFull { capacity: 4 })
        );
        assert_eq!(q.counts().free, 0);
    }

    #[test]
    fn test_priority_then_fifo_order() {
        let now = Instant::now();
        let mut q = MessageQueue::new(settings());
        push(&mut q, "low", 2, now);
        push(&mut q, "high-1", 0, now);
        push(&mut q, "mid", 1, now);
        push(&mut q, "high-2", 0, now);

        let order: Vec<String> = std::iter::from_fn(|| q.pop(1, now).map(|d| d.id)).collect();
        assert_eq!(order, vec!["high-1", "high-2", "mid", "low"]);
        assert!(!q.has_ready());
    }

    #[test]
    fn test_ack_requires_current_token() {
        let now = Instant::now();
        let mut q = MessageQueue::new(settings());
        push(&mut q, "a", 0, now);
        let delivery = q.pop(1, now).unwrap();

        assert_eq!(
            q.ack("a", delivery.token + 1, false, Duration::ZERO, now),
            Err(QueueError::InvalidToken("a".into()))
        );
        assert_eq!(
            q.ack("zzz", delivery.token, false, Duration::ZERO, now),
            Err(QueueError::UnknownMessage("zzz".into()))
        );
        q.ack("a", delivery.token, false, Duration::ZERO, now).unwrap();
        assert!(q.is_empty());
        assert_accounting(&q);
    }

    #[test]
    fn test_ack_of_queued_message_is_invalid_state() {
        let now = Instant::now();
        let mut q = MessageQueue::new(settings());
        push(&mut q, "a", 0, now);
        assert_eq!(
            q.ack("a", 1, false, Duration::ZERO, now),
            Err(QueueError::InvalidState("a".into()))
        );
    }

    #[test]
    fn test_ack_pop_settles_then_takes_next() {
        let now = Instant::now();
        let mut q = MessageQueue::new(settings());
        push(&mut q, "a", 0, now);
        push(&mut q, "b", 0, now);
        let first = q.pop(1, now).unwrap();

        assert_eq!(
            q.ack_pop("a", first.token + 1, false, Duration::ZERO, 1, now),
            Err(QueueError::InvalidToken("a".into()))
        );
        // The refused ack left "b" queued.
        assert_eq!(q.stats().delivered, 1);

        let next = q
            .ack_pop("a", first.token, false, Duration::ZERO, 1, now)
            .unwrap()
            .unwrap();
        assert_eq!(next.id, "b");
        assert_eq!(
            q.ack_pop("b", next.token, false, Duration::ZERO, 1, now),
            Ok(None)
        );
        assert!(q.is_empty());
        assert_eq!(q.stats().completed, 2);
        assert_accounting(&q);
    }

    #[test]
    fn test_requeue_goes_to_tail_without_failure() {
        let now = Instant::now();
        let mut q = MessageQueue::new(settings());
        push(&mut q, "a", 0, now);
        push(&mut q, "b", 0, now);
        let first = q.pop(1, now).unwrap();
        q.ack("a", first.token, true, Duration::ZERO, now).unwrap();

        assert_eq!(q.pop(1, now).unwrap().id, "b");
        let again = q.pop(1, now).unwrap();
        assert_eq!(again.id, "a");
        assert_eq!(again.attempt, 1);
        assert_ne!(again.token, first.token);
        assert_eq!(q.stats().requeued, 1);
    }

    #[test]
    fn test_delayed_message_waits_until_due() {
        let now = Instant::now();
        let mut q = MessageQueue::new(settings());
        q.push(
            "later".into(),
            Bytes::new(),
            1,
            Duration::from_millis(500),
            now,
        )
        .unwrap();
        push(&mut q, "other", 1, now);

        assert_eq!(q.next_due(), Some(now + Duration::from_millis(500)));
        assert_eq!(q.sweep(now + Duration::from_millis(100)).promoted, 0);
        assert_eq!(q.pop(1, now).unwrap().id, "other");
        assert!(q.pop(1, now).is_none());

        let due = now + Duration::from_millis(500);
        assert_eq!(q.sweep(due).promoted, 1);
        assert_eq!(q.next_due(), None);
        assert_eq!(q.pop(1, due).unwrap().id, "later");
    }

    #[test]
    fn test_due_message_served_before_waiting_ones() {
        let now = Instant::now();
        let mut q = MessageQueue::new(settings());
        push(&mut q, "waiting", 0, now);
        q.push("due".into(), Bytes::new(), 0, Duration::from_millis(10), now)
            .unwrap();

        let later = now + Duration::from_millis(10);
        q.sweep(later);
        assert_eq!(q.pop(1, later).unwrap().id, "due");
    }

    #[test]
    fn test_ack_timeout_redelivers_then_fails() {
        let mut now = Instant::now();
        let mut q = MessageQueue::new(settings());
        push(&mut q, "a", 0, now);

        for attempt in 1..=3 {
            let delivery = q.pop(1, now).unwrap();
            assert_eq!(delivery.attempt, attempt);
            now += Duration::from_secs(1);
            let report = q.sweep(now);
            if attempt < 3 {
                assert_eq!(report.redelivered, 1);
            } else {
                assert_eq!(report.failed, 1);
            }
        }

        assert!(q.pop(1, now).is_none());
        let counts = q.counts();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.active, 0);
        assert_eq!(counts.free, 3);
        assert_eq!(q.failed_ids(10), (vec!["a".to_string()], false));
        assert_accounting(&q);
    }

    #[test]
    fn test_release_counts_a_failure_per_message() {
        let now = Instant::now();
        let mut q = MessageQueue::new(settings());
        push(&mut q, "a", 0, now);
        push(&mut q, "b", 0, now);
        push(&mut q, "c", 0, now);
        q.pop(7, now).unwrap();
        q.pop(7, now).unwrap();
        q.pop(8, now).unwrap();

        assert_eq!(q.release(7, now), 2);
        let redelivered = q.pop(9, now).unwrap();
        assert_eq!(redelivered.attempt, 2);
        assert_eq!(q.stats().redelivered, 2);
    }

    #[test]
    fn test_unpop_restores_head_without_failure() {
        let now = Instant::now();
        let mut q = MessageQueue::new(settings());
        push(&mut q, "a", 0, now);
        push(&mut q, "b", 0, now);
        let delivery = q.pop(1, now).unwrap();

        assert!(q.unpop(&delivery));
        assert!(!q.unpop(&delivery));
        let again = q.pop(2, now).unwrap();
        assert_eq!(again.id, "a");
        assert_eq!(again.attempt, 1);
        assert_eq!(q.stats().delivered, 1);
    }

    #[test]
    fn test_boost_moves_starving_message_once() {
        let now = Instant::now();
        let mut q = MessageQueue::new(settings());
        push(&mut q, "old-low", 2, now);
        push(&mut q, "top", 0, now);

        let later = now + Duration::from_secs(5);
        push(&mut q, "fresh-top", 0, later);
        assert_eq!(q.sweep(later).boosted, 1);
        assert_eq!(q.sweep(later + Duration::from_secs(10)).boosted, 0);

        let order: Vec<String> = std::iter::from_fn(|| q.pop(1, later).map(|d| d.id)).collect();
        assert_eq!(order, vec!["top", "fresh-top", "old-low"]);
    }

    #[test]
    fn test_erase_failed_and_truncated_listing() {
        let mut now = Instant::now();
        let mut q = MessageQueue::new(QueueSettings {
            max_retries: 0,
            ..settings()
        });
        for id in ["a", "b", "c"] {
            push(&mut q, id, 0, now);
            q.pop(1, now).unwrap();
        }
        now += Duration::from_secs(1);
        assert_eq!(q.sweep(now).failed, 3);

        let (ids, truncated) = q.failed_ids(2);
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert!(truncated);

        let erased = q.erase_failed(&["a".to_string(), "missing".to_string()]);
        assert_eq!(erased, vec!["a".to_string()]);
        assert_eq!(q.counts().failed, 2);
        assert_eq!(q.stats().erased, 1);
        assert_accounting(&q);
    }

    #[test]
    fn test_disabled_timers_do_nothing() {
        let now = Instant::now();
        let mut q = MessageQueue::new(QueueSettings {
            ack_timeout: None,
            boost_timeout: None,
            ..settings()
        });
        push(&mut q, "low", 2, now);
        push(&mut q, "run", 0, now);
        q.pop(1, now).unwrap();

        assert!(q.sweep(now + Duration::from_secs(3600)).is_empty());
    }
}
