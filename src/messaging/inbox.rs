//! Bounded, priority-aware per-agent inbox
//!
//! Two FIFO classes under a single lock: Critical messages are always
//! dequeued before Normal ones, and each class preserves insertion order.
//! Producers block on a full inbox up to their enqueue timeout; the consumer
//! side is cancellation-aware so a stopping agent can leave its dequeue point
//! immediately.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::message::{Message, MessagePriority};

/// Error returned when a message cannot be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    /// The inbox refuses new messages (agent stopping or stopped).
    #[error("inbox is closed")]
    Closed,
    /// The inbox stayed full past the enqueue timeout.
    #[error("inbox full past the enqueue timeout")]
    Timeout,
}

#[derive(Debug, Default)]
struct InboxState {
    critical: VecDeque<Message>,
    normal: VecDeque<Message>,
    closed: bool,
}

impl InboxState {
    fn len(&self) -> usize {
        self.critical.len() + self.normal.len()
    }

    fn push(&mut self, message: Message) {
        match message.priority {
            MessagePriority::Critical => self.critical.push_back(message),
            MessagePriority::Normal => self.normal.push_back(message),
        }
    }

    fn pop(&mut self) -> Option<Message> {
        self.critical.pop_front().or_else(|| self.normal.pop_front())
    }
}

/// Bounded two-class FIFO owned by the bus, one per agent
#[derive(Debug)]
pub struct AgentInbox {
    capacity: usize,
    state: Mutex<InboxState>,
    space: Notify,
    items: Notify,
}

impl AgentInbox {
    /// Creates an inbox bounded at `capacity` messages across both classes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(InboxState::default()),
            space: Notify::new(),
            items: Notify::new(),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, InboxState> {
        self.state.lock().expect("inbox lock poisoned")
    }

    /// Queued messages across both classes.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.locked().len()
    }

    /// Whether the inbox refuses new messages.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.locked().closed
    }

    /// Stops accepting messages and wakes every blocked producer and consumer.
    pub fn close(&self) {
        self.locked().closed = true;
        self.space.notify_waiters();
        self.items.notify_waiters();
    }

    /// Enqueues `message`, blocking up to `timeout` when the inbox is full.
    ///
    /// # Errors
    /// Returns [`PushError::Closed`] when the inbox refuses new messages and
    /// [`PushError::Timeout`] when no slot opened within `timeout`. On either
    /// error the message never entered the inbox.
    pub async fn push(&self, message: Message, timeout: Duration) -> Result<(), PushError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.locked();
                if state.closed {
                    return Err(PushError::Closed);
                }
                if state.len() < self.capacity {
                    state.push(message);
                    drop(state);
                    self.items.notify_one();
                    return Ok(());
                }
            }
            // Re-check under the lock after waking; another producer may have
            // won the slot.
            let space = self.space.notified();
            if tokio::time::timeout_at(deadline, space).await.is_err() {
                return Err(PushError::Timeout);
            }
        }
    }

    /// Dequeues the next message, Critical before Normal.
    ///
    /// Waits until a message arrives, the token is cancelled, or the inbox is
    /// closed and empty; the latter two return `None`.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<Message> {
        loop {
            {
                let mut state = self.locked();
                if let Some(message) = state.pop() {
                    drop(state);
                    self.space.notify_one();
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = self.items.notified() => {}
            }
        }
    }

    /// Dequeues the next message without waiting.
    #[must_use]
    pub fn try_pop(&self) -> Option<Message> {
        let popped = self.locked().pop();
        if popped.is_some() {
            self.space.notify_one();
        }
        popped
    }

    /// Empties the inbox, Critical entries first, and returns the contents.
    #[must_use]
    pub fn drain_remaining(&self) -> Vec<Message> {
        let mut state = self.locked();
        let mut drained = Vec::with_capacity(state.len());
        drained.extend(state.critical.drain(..));
        drained.extend(state.normal.drain(..));
        drop(state);
        self.space.notify_waiters();
        drained
    }

    /// Clones the queued messages in dequeue order, for persistence.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        let state = self.locked();
        state
            .critical
            .iter()
            .chain(state.normal.iter())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{
        AgentId, AttemptCount, CorrelationId, MessageId, Timestamp,
    };
    use crate::messaging::message::{
        AckPolicy, Address, MessageKind, Payload, Sender,
    };

    fn message(id: u64, priority: MessagePriority) -> Message {
        Message {
            message_id: MessageId::new(id),
            correlation_id: CorrelationId::generate(),
            from: Sender::External,
            to: Address::Agent(AgentId::new(1)),
            kind: MessageKind::Event,
            payload: Payload::empty(),
            priority,
            enqueued_at: Timestamp::epoch(),
            deadline_at: Timestamp::epoch().saturating_add(Duration::from_secs(60)),
            attempts: AttemptCount::zero(),
            ack_policy: AckPolicy::AtLeastOnce,
        }
    }

    #[tokio::test]
    async fn critical_preempts_queued_normals() {
        let inbox = AgentInbox::new(10);
        let timeout = Duration::from_millis(50);
        inbox
            .push(message(1, MessagePriority::Normal), timeout)
            .await
            .unwrap();
        inbox
            .push(message(2, MessagePriority::Normal), timeout)
            .await
            .unwrap();
        inbox
            .push(message(3, MessagePriority::Critical), timeout)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let first = inbox.pop(&cancel).await.unwrap();
        assert_eq!(first.message_id.as_u64(), 3);
        let second = inbox.pop(&cancel).await.unwrap();
        assert_eq!(second.message_id.as_u64(), 1);
        let third = inbox.pop(&cancel).await.unwrap();
        assert_eq!(third.message_id.as_u64(), 2);
    }

    #[tokio::test]
    async fn fifo_within_each_class() {
        let inbox = AgentInbox::new(10);
        let timeout = Duration::from_millis(50);
        for id in 1..=4 {
            inbox
                .push(message(id, MessagePriority::Normal), timeout)
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        for expected in 1..=4 {
            let popped = inbox.pop(&cancel).await.unwrap();
            assert_eq!(popped.message_id.as_u64(), expected);
        }
    }

    #[tokio::test]
    async fn full_inbox_times_out_producers() {
        let inbox = AgentInbox::new(2);
        let timeout = Duration::from_millis(50);
        inbox
            .push(message(1, MessagePriority::Normal), timeout)
            .await
            .unwrap();
        inbox
            .push(message(2, MessagePriority::Normal), timeout)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let result = inbox.push(message(3, MessagePriority::Normal), timeout).await;
        assert_eq!(result, Err(PushError::Timeout));
        assert!(started.elapsed() >= timeout);
        assert_eq!(inbox.depth(), 2);
    }

    #[tokio::test]
    async fn blocked_producer_proceeds_when_space_opens() {
        let inbox = std::sync::Arc::new(AgentInbox::new(1));
        inbox
            .push(message(1, MessagePriority::Normal), Duration::from_millis(10))
            .await
            .unwrap();

        let producer = {
            let inbox = std::sync::Arc::clone(&inbox);
            tokio::spawn(async move {
                inbox
                    .push(message(2, MessagePriority::Normal), Duration::from_secs(1))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let cancel = CancellationToken::new();
        let popped = inbox.pop(&cancel).await.unwrap();
        assert_eq!(popped.message_id.as_u64(), 1);

        producer.await.unwrap().unwrap();
        assert_eq!(inbox.depth(), 1);
    }

    #[tokio::test]
    async fn closed_inbox_rejects_producers_and_drains_consumers() {
        let inbox = AgentInbox::new(4);
        inbox
            .push(message(1, MessagePriority::Normal), Duration::from_millis(10))
            .await
            .unwrap();
        inbox.close();

        let refused = inbox
            .push(message(2, MessagePriority::Normal), Duration::from_millis(10))
            .await;
        assert_eq!(refused, Err(PushError::Closed));

        let cancel = CancellationToken::new();
        assert!(inbox.pop(&cancel).await.is_some());
        assert!(inbox.pop(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn cancellation_interrupts_waiting_consumer() {
        let inbox = std::sync::Arc::new(AgentInbox::new(4));
        let cancel = CancellationToken::new();

        let consumer = {
            let inbox = std::sync::Arc::clone(&inbox);
            let cancel = cancel.clone();
            tokio::spawn(async move { inbox.pop(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert!(consumer.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn drain_returns_critical_entries_first() {
        let inbox = AgentInbox::new(10);
        let timeout = Duration::from_millis(10);
        inbox
            .push(message(1, MessagePriority::Normal), timeout)
            .await
            .unwrap();
        inbox
            .push(message(2, MessagePriority::Critical), timeout)
            .await
            .unwrap();
        inbox.close();

        let drained = inbox.drain_remaining();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].message_id.as_u64(), 2);
        assert_eq!(drained[1].message_id.as_u64(), 1);
        assert_eq!(inbox.depth(), 0);
    }
}
