//! Metrics registry
//!
//! Labeled counters, gauges, and histograms backing the observation
//! endpoints. Updates are atomic adds under a shared read lock; `snapshot`
//! takes the write lock, so the returned view is a consistent point in time
//! with no torn reads across metrics.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::domain_types::AgentId;
use crate::lifecycle::AgentState;
use crate::messaging::message::{
    AckOutcome, DeadLetterReason, MessageKind, MessagePriority, RejectReason,
};

/// Histogram bucket upper bounds for handler duration, in seconds.
const DURATION_BUCKETS: [f64; 9] = [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0];

#[derive(Debug, Default)]
struct Histogram {
    buckets: [AtomicU64; 9],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Histogram {
    fn observe(&self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        for (bound, bucket) in DURATION_BUCKETS.iter().zip(&self.buckets) {
            if seconds <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(
            u64::try_from(duration.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let buckets = DURATION_BUCKETS
            .iter()
            .zip(&self.buckets)
            .map(|(bound, bucket)| (*bound, bucket.load(Ordering::Relaxed)))
            .collect();
        HistogramSnapshot {
            buckets,
            count: self.count.load(Ordering::Relaxed),
            sum_seconds: self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Cumulative histogram view: per-bucket counts of observations at or under
/// each upper bound.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    /// `(upper_bound_seconds, observations <= bound)` pairs.
    pub buckets: Vec<(f64, u64)>,
    /// Total observations.
    pub count: u64,
    /// Sum of observed durations in seconds.
    pub sum_seconds: f64,
}

#[derive(Debug, Default)]
struct MetricsInner {
    agents_total: DashMap<AgentState, u64>,
    messages_sent: DashMap<(MessageKind, MessagePriority), AtomicU64>,
    messages_acked: DashMap<&'static str, AtomicU64>,
    messages_dead_lettered: DashMap<DeadLetterReason, AtomicU64>,
    handler_duration: DashMap<AgentId, Histogram>,
    inbox_depth: DashMap<AgentId, u64>,
    restarts: DashMap<AgentId, AtomicU64>,
}

/// Consistent point-in-time view of every metric, keyed by display labels.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// `agents_total{state}` gauge.
    pub agents_total: BTreeMap<String, u64>,
    /// `messages_sent_total{kind,priority}` counter, keyed `kind/priority`.
    pub messages_sent_total: BTreeMap<String, u64>,
    /// `messages_acked_total{outcome}` counter.
    pub messages_acked_total: BTreeMap<String, u64>,
    /// `messages_dead_lettered_total{reason}` counter.
    pub messages_dead_lettered_total: BTreeMap<String, u64>,
    /// `handler_duration_seconds{agent}` histogram.
    pub handler_duration_seconds: BTreeMap<String, HistogramSnapshot>,
    /// `inbox_depth{agent}` gauge, sampled by the supervisor.
    pub inbox_depth: BTreeMap<String, u64>,
    /// `restarts_total{agent}` counter.
    pub restarts_total: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// Restart count for one agent, zero when never restarted.
    #[must_use]
    pub fn restarts_for(&self, agent_id: AgentId) -> u64 {
        self.restarts_total
            .get(&agent_id.to_string())
            .copied()
            .unwrap_or(0)
    }

    /// Dead letter count for one reason, zero when never recorded.
    #[must_use]
    pub fn dead_lettered_for(&self, reason: DeadLetterReason) -> u64 {
        self.messages_dead_lettered_total
            .get(reason.label())
            .copied()
            .unwrap_or(0)
    }

    /// Total dead-lettered messages across reasons.
    #[must_use]
    pub fn dead_lettered_total(&self) -> u64 {
        self.messages_dead_lettered_total.values().sum()
    }
}

/// Runtime metrics registry
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    inner: RwLock<MetricsInner>,
}

impl MetricsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<R>(&self, f: impl FnOnce(&MetricsInner) -> R) -> R {
        f(&self.inner.read().expect("metrics lock poisoned"))
    }

    /// Counts an accepted message.
    pub fn record_sent(&self, kind: MessageKind, priority: MessagePriority) {
        self.with_inner(|inner| {
            inner
                .messages_sent
                .entry((kind, priority))
                .or_default()
                .fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Counts an acknowledgement by outcome.
    pub fn record_ack(&self, outcome: &AckOutcome) {
        let label = match outcome {
            AckOutcome::Handled => "handled",
            AckOutcome::Deferred => "deferred",
            AckOutcome::Rejected(reason) => match reason {
                RejectReason::HandlerTimeout => "rejected_handler_timeout",
                RejectReason::Transient => "rejected_transient",
                RejectReason::Permanent => "rejected_permanent",
                RejectReason::PolicyDenied => "rejected_policy_denied",
            },
        };
        self.with_inner(|inner| {
            inner
                .messages_acked
                .entry(label)
                .or_default()
                .fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Counts a dead-lettered message by reason.
    pub fn record_dead_letter(&self, reason: DeadLetterReason) {
        self.with_inner(|inner| {
            inner
                .messages_dead_lettered
                .entry(reason)
                .or_default()
                .fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Observes one handler invocation's wall-clock duration.
    pub fn observe_handler_duration(&self, agent_id: AgentId, duration: Duration) {
        self.with_inner(|inner| {
            inner
                .handler_duration
                .entry(agent_id)
                .or_default()
                .observe(duration);
        });
    }

    /// Sets the sampled inbox depth gauge for one agent.
    pub fn set_inbox_depth(&self, agent_id: AgentId, depth: usize) {
        self.with_inner(|inner| {
            inner
                .inbox_depth
                .insert(agent_id, u64::try_from(depth).unwrap_or(u64::MAX));
        });
    }

    /// Counts one restart of an agent.
    pub fn record_restart(&self, agent_id: AgentId) {
        self.with_inner(|inner| {
            inner
                .restarts
                .entry(agent_id)
                .or_default()
                .fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Replaces the per-state agent gauge with a fresh sample.
    pub fn set_agents_total(&self, counts: &HashMap<AgentState, usize>) {
        self.with_inner(|inner| {
            inner.agents_total.clear();
            for (state, count) in counts {
                inner
                    .agents_total
                    .insert(*state, u64::try_from(*count).unwrap_or(u64::MAX));
            }
        });
    }

    /// Drops gauges and histograms for a deregistered agent.
    pub fn forget_agent(&self, agent_id: AgentId) {
        self.with_inner(|inner| {
            inner.inbox_depth.remove(&agent_id);
            inner.handler_duration.remove(&agent_id);
        });
    }

    /// Takes a consistent point-in-time snapshot of every metric.
    ///
    /// Holding the write lock excludes concurrent updates, so no metric in
    /// the result can reflect a later moment than another.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.write().expect("metrics lock poisoned");

        MetricsSnapshot {
            agents_total: inner
                .agents_total
                .iter()
                .map(|entry| (entry.key().to_string(), *entry.value()))
                .collect(),
            messages_sent_total: inner
                .messages_sent
                .iter()
                .map(|entry| {
                    let (kind, priority) = entry.key();
                    (
                        format!("{}/{}", kind.label(), priority.label()),
                        entry.value().load(Ordering::Relaxed),
                    )
                })
                .collect(),
            messages_acked_total: inner
                .messages_acked
                .iter()
                .map(|entry| ((*entry.key()).to_string(), entry.value().load(Ordering::Relaxed)))
                .collect(),
            messages_dead_lettered_total: inner
                .messages_dead_lettered
                .iter()
                .map(|entry| {
                    (
                        entry.key().label().to_string(),
                        entry.value().load(Ordering::Relaxed),
                    )
                })
                .collect(),
            handler_duration_seconds: inner
                .handler_duration
                .iter()
                .map(|entry| (entry.key().to_string(), entry.value().snapshot()))
                .collect(),
            inbox_depth: inner
                .inbox_depth
                .iter()
                .map(|entry| (entry.key().to_string(), *entry.value()))
                .collect(),
            restarts_total: inner
                .restarts
                .iter()
                .map(|entry| (entry.key().to_string(), entry.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_by_label() {
        let metrics = MetricsRegistry::new();
        metrics.record_sent(MessageKind::Event, MessagePriority::Normal);
        metrics.record_sent(MessageKind::Event, MessagePriority::Normal);
        metrics.record_sent(MessageKind::Control, MessagePriority::Critical);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent_total.get("event/normal"), Some(&2));
        assert_eq!(
            snapshot.messages_sent_total.get("control/critical"),
            Some(&1)
        );
    }

    #[test]
    fn ack_outcomes_use_distinct_labels() {
        let metrics = MetricsRegistry::new();
        metrics.record_ack(&AckOutcome::Handled);
        metrics.record_ack(&AckOutcome::Rejected(RejectReason::HandlerTimeout));
        metrics.record_ack(&AckOutcome::Rejected(RejectReason::Permanent));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_acked_total.get("handled"), Some(&1));
        assert_eq!(
            snapshot.messages_acked_total.get("rejected_handler_timeout"),
            Some(&1)
        );
        assert_eq!(
            snapshot.messages_acked_total.get("rejected_permanent"),
            Some(&1)
        );
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = MetricsRegistry::new();
        let agent = AgentId::new(1);
        metrics.observe_handler_duration(agent, Duration::from_millis(2));
        metrics.observe_handler_duration(agent, Duration::from_millis(80));

        let snapshot = metrics.snapshot();
        let histogram = snapshot
            .handler_duration_seconds
            .get(&agent.to_string())
            .unwrap();
        assert_eq!(histogram.count, 2);
        // 2ms lands at the 5ms bound, 80ms at the 100ms bound.
        let at = |bound: f64| {
            histogram
                .buckets
                .iter()
                .find(|(b, _)| (*b - bound).abs() < f64::EPSILON)
                .map(|(_, count)| *count)
                .unwrap()
        };
        assert_eq!(at(0.001), 0);
        assert_eq!(at(0.005), 1);
        assert_eq!(at(0.1), 2);
        assert_eq!(at(10.0), 2);
    }

    #[test]
    fn restart_counter_keyed_by_agent() {
        let metrics = MetricsRegistry::new();
        let agent = AgentId::new(7);
        for _ in 0..3 {
            metrics.record_restart(agent);
        }
        assert_eq!(metrics.snapshot().restarts_for(agent), 3);
        assert_eq!(metrics.snapshot().restarts_for(AgentId::new(8)), 0);
    }

    #[test]
    fn agents_total_is_replaced_per_sample() {
        let metrics = MetricsRegistry::new();
        let mut counts = HashMap::new();
        counts.insert(AgentState::Running, 2);
        counts.insert(AgentState::Idle, 1);
        metrics.set_agents_total(&counts);

        let mut next = HashMap::new();
        next.insert(AgentState::Running, 3);
        metrics.set_agents_total(&next);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.agents_total.get("running"), Some(&3));
        assert!(!snapshot.agents_total.contains_key("idle"));
    }
}
