//! Dead letter queue
//!
//! Terminal storage for messages that could not be delivered or handled
//! within policy. Ring-buffered by count; per-reason counters survive
//! eviction so metrics stay accurate.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::message::{DeadLetterReason, Message};
use crate::domain_types::Timestamp;

/// A dead-lettered message with its terminal reason.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    /// The message at the time it was given up on.
    pub message: Message,
    /// Why it ended here.
    pub reason: DeadLetterReason,
    /// When the bus recorded it.
    pub recorded_at: Timestamp,
}

/// Aggregate view of the dead letter queue.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterStats {
    /// Total messages ever dead-lettered, including evicted ones.
    pub total: u64,
    /// Total per terminal reason, including evicted entries.
    pub by_reason: HashMap<String, u64>,
    /// Messages currently retained.
    pub retained: usize,
    /// Age of the oldest retained entry relative to `now`, if any.
    pub oldest_age_ms: Option<u64>,
}

/// Bounded terminal storage for undeliverable messages
#[derive(Debug)]
pub struct DeadLetterQueue {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetter>>,
    by_reason: DashMap<DeadLetterReason, u64>,
    total: AtomicU64,
}

impl DeadLetterQueue {
    /// Creates a queue retaining at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
            by_reason: DashMap::new(),
            total: AtomicU64::new(0),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, VecDeque<DeadLetter>> {
        self.entries.lock().expect("dead letter lock poisoned")
    }

    /// Records a dead letter, evicting the oldest entry when full.
    pub fn record(&self, message: Message, reason: DeadLetterReason, recorded_at: Timestamp) {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.by_reason.entry(reason).or_insert(0) += 1;

        let mut entries = self.locked();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(DeadLetter {
            message,
            reason,
            recorded_at,
        });
    }

    /// Messages currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locked().len()
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locked().is_empty()
    }

    /// Total messages ever dead-lettered.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// The most recent `limit` entries, newest last.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<DeadLetter> {
        let entries = self.locked();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Aggregate statistics as of `now`.
    #[must_use]
    pub fn stats(&self, now: Timestamp) -> DeadLetterStats {
        let entries = self.locked();
        let oldest_age_ms = entries.front().map(|entry| {
            u64::try_from(
                now.saturating_duration_since(entry.recorded_at)
                    .as_millis(),
            )
            .unwrap_or(u64::MAX)
        });
        let retained = entries.len();
        drop(entries);

        let by_reason = self
            .by_reason
            .iter()
            .map(|entry| (entry.key().label().to_string(), *entry.value()))
            .collect();

        DeadLetterStats {
            total: self.total(),
            by_reason,
            retained,
            oldest_age_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{AgentId, AttemptCount, CorrelationId, MessageId};
    use crate::messaging::message::{
        AckPolicy, Address, MessageKind, MessagePriority, Payload, Sender,
    };
    use std::time::Duration;

    fn message(id: u64) -> Message {
        Message {
            message_id: MessageId::new(id),
            correlation_id: CorrelationId::generate(),
            from: Sender::External,
            to: Address::Agent(AgentId::new(1)),
            kind: MessageKind::Event,
            payload: Payload::empty(),
            priority: MessagePriority::Normal,
            enqueued_at: Timestamp::epoch(),
            deadline_at: Timestamp::epoch(),
            attempts: AttemptCount::zero(),
            ack_policy: AckPolicy::AtLeastOnce,
        }
    }

    #[test]
    fn records_and_counts_by_reason() {
        let dlq = DeadLetterQueue::new(10);
        dlq.record(message(1), DeadLetterReason::Deadline, Timestamp::epoch());
        dlq.record(
            message(2),
            DeadLetterReason::AttemptsExhausted,
            Timestamp::epoch(),
        );
        dlq.record(message(3), DeadLetterReason::Deadline, Timestamp::epoch());

        let stats = dlq.stats(Timestamp::epoch().saturating_add(Duration::from_secs(1)));
        assert_eq!(stats.total, 3);
        assert_eq!(stats.retained, 3);
        assert_eq!(stats.by_reason.get("deadline"), Some(&2));
        assert_eq!(stats.by_reason.get("attempts_exhausted"), Some(&1));
        assert_eq!(stats.oldest_age_ms, Some(1_000));
    }

    #[test]
    fn eviction_preserves_totals() {
        let dlq = DeadLetterQueue::new(2);
        for id in 1..=5 {
            dlq.record(message(id), DeadLetterReason::Undrained, Timestamp::epoch());
        }
        assert_eq!(dlq.len(), 2);
        assert_eq!(dlq.total(), 5);

        let recent = dlq.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message.message_id.as_u64(), 4);
        assert_eq!(recent[1].message.message_id.as_u64(), 5);
    }
}
