//! Message data model for the bus
//!
//! A [`Message`] is the unit the bus transfers: addressed, typed by a closed
//! kind set, carrying an opaque payload, and stamped with everything the
//! retry and deadline machinery needs. Callers construct a [`MessageDraft`];
//! the bus mints the identifier, resolves the address, and freezes the result
//! into a `Message`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::capability::RoutingPolicy;
use crate::domain_types::{
    AgentId, AttemptCount, CapabilityName, ContentType, CorrelationId, MessageId, Timestamp,
};

/// Default time-to-live for drafts that do not set one.
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(60);

/// The closed set of message kinds the bus reserves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Ask an agent to exercise a capability.
    CapabilityRequest,
    /// Answer to a `CapabilityRequest`, correlation id copied.
    CapabilityResponse,
    /// Liveness or lifecycle notification.
    StatusUpdate,
    /// Domain event fan-out.
    Event,
    /// A failure report addressed to the original requester.
    Error,
    /// Runtime control traffic; always audited.
    Control,
}

impl MessageKind {
    /// Stable lowercase label used for metrics and logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::CapabilityRequest => "capability_request",
            Self::CapabilityResponse => "capability_response",
            Self::StatusUpdate => "status_update",
            Self::Event => "event",
            Self::Error => "error",
            Self::Control => "control",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Delivery priority: Critical jumps ahead of Normal in every inbox
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    /// FIFO behind any queued Critical traffic.
    #[default]
    Normal,
    /// Preempts Normal; FIFO among Criticals.
    Critical,
}

impl MessagePriority {
    /// Stable lowercase label used for metrics and logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Critical => "critical",
        }
    }
}

/// Acknowledgement contract for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Sender can await a terminal status; redelivery until acked or dead.
    #[default]
    AtLeastOnce,
    /// No terminal status reported back to the sender.
    FireAndForget,
}

/// Message origin: a registered agent or the external sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sender {
    /// A registered agent.
    Agent(AgentId),
    /// The world outside the runtime (operators, the HTTP surface, the
    /// supervisor's own notifications).
    External,
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "{id}"),
            Self::External => f.write_str("external"),
        }
    }
}

/// Message destination as submitted by the sender
///
/// Capability and broadcast addressing are resolved to concrete agent ids at
/// enqueue time; a delivered message always carries `Address::Agent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Address {
    /// A specific agent.
    Agent(AgentId),
    /// Any agent holding the capability, chosen by the draft's routing policy.
    Capability(CapabilityName),
    /// Every deliverable agent except the sender.
    Broadcast,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "{id}"),
            Self::Capability(cap) => write!(f, "cap:{cap}"),
            Self::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// Opaque payload plus its content-type label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Label senders and receivers agree on; the bus never inspects it.
    pub content_type: ContentType,
    /// Raw bytes.
    pub bytes: Bytes,
}

impl Payload {
    /// An empty octet-stream payload.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            content_type: ContentType::octet_stream(),
            bytes: Bytes::new(),
        }
    }

    /// A JSON payload serialized from `value`.
    ///
    /// # Errors
    /// Returns the serde error if `value` cannot be serialized.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            content_type: ContentType::json(),
            bytes: Bytes::from(serde_json::to_vec(value)?),
        })
    }

    /// Deserializes a JSON payload.
    ///
    /// # Errors
    /// Returns the serde error if the bytes are not valid JSON for `T`.
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.bytes)
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// The unit transferred by the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique per message; fresh for every broadcast recipient.
    pub message_id: MessageId,
    /// Copied across replies and follow-ups; the idempotency key.
    pub correlation_id: CorrelationId,
    /// Origin of the message.
    pub from: Sender,
    /// Destination; frozen to `Address::Agent` at enqueue time.
    pub to: Address,
    /// Kind tag the receiving handler dispatches on.
    pub kind: MessageKind,
    /// Opaque content.
    pub payload: Payload,
    /// Delivery priority.
    pub priority: MessagePriority,
    /// When the bus accepted the message.
    pub enqueued_at: Timestamp,
    /// Past this instant the message is dead-lettered instead of delivered.
    pub deadline_at: Timestamp,
    /// Delivery attempts so far; monotone non-decreasing.
    pub attempts: AttemptCount,
    /// Acknowledgement contract.
    pub ack_policy: AckPolicy,
}

impl Message {
    /// The concrete recipient, once the address has been frozen.
    #[must_use]
    pub fn recipient(&self) -> Option<AgentId> {
        match self.to {
            Address::Agent(id) => Some(id),
            Address::Capability(_) | Address::Broadcast => None,
        }
    }

    /// Whether the deadline has passed as of `now`.
    #[must_use]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.deadline_at
    }
}

/// What a caller submits to `send`
///
/// The bus assigns `message_id` and `enqueued_at`, resolves the address, and
/// computes `deadline_at` from the time-to-live.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    /// Origin.
    pub from: Sender,
    /// Destination; may be a capability or broadcast.
    pub to: Address,
    /// Kind tag.
    pub kind: MessageKind,
    /// Opaque content.
    pub payload: Payload,
    /// Delivery priority.
    pub priority: MessagePriority,
    /// Acknowledgement contract.
    pub ack_policy: AckPolicy,
    /// Correlation id; generated when absent.
    pub correlation_id: Option<CorrelationId>,
    /// Time-to-live from acceptance; bounds retries and queue residence.
    pub ttl: Duration,
    /// Recipient selection policy for capability addressing.
    pub routing: RoutingPolicy,
    /// Overrides the bus enqueue timeout for this send.
    pub enqueue_timeout: Option<Duration>,
}

impl MessageDraft {
    /// Creates a draft with default priority, ack policy, ttl, and routing.
    #[must_use]
    pub fn new(from: Sender, to: Address, kind: MessageKind, payload: Payload) -> Self {
        Self {
            from,
            to,
            kind,
            payload,
            priority: MessagePriority::default(),
            ack_policy: AckPolicy::default(),
            correlation_id: None,
            ttl: DEFAULT_MESSAGE_TTL,
            routing: RoutingPolicy::default(),
            enqueue_timeout: None,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the acknowledgement policy.
    #[must_use]
    pub fn with_ack_policy(mut self, ack_policy: AckPolicy) -> Self {
        self.ack_policy = ack_policy;
        self
    }

    /// Propagates an existing correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the time-to-live.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the capability routing policy.
    #[must_use]
    pub fn with_routing(mut self, routing: RoutingPolicy) -> Self {
        self.routing = routing;
        self
    }

    /// Overrides the bus enqueue timeout for this send.
    #[must_use]
    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = Some(timeout);
        self
    }

    /// A reply draft to `original`: addressed to its sender, correlation
    /// id copied.
    ///
    /// Returns `None` when the original came from outside the runtime.
    #[must_use]
    pub fn reply_to(
        original: &Message,
        from: Sender,
        kind: MessageKind,
        payload: Payload,
    ) -> Option<Self> {
        match original.from {
            Sender::Agent(id) => Some(
                Self::new(from, Address::Agent(id), kind, payload)
                    .with_correlation_id(original.correlation_id),
            ),
            Sender::External => None,
        }
    }
}

/// Outcome reported by `ack`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckOutcome {
    /// The handler completed; the message is done.
    Handled,
    /// The handler refused the message.
    Rejected(RejectReason),
    /// The agent is not ready; redeliver without counting an attempt.
    Deferred,
}

/// Why a message was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The handler exceeded its time budget; retriable.
    HandlerTimeout,
    /// A temporary fault; retriable.
    Transient,
    /// Retry is pointless.
    Permanent,
    /// A policy guard refused the action; never retried.
    PolicyDenied,
}

impl RejectReason {
    /// Whether the bus may redeliver after this rejection.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::HandlerTimeout | Self::Transient)
    }

    /// Stable lowercase label used for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::HandlerTimeout => "handler_timeout",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::PolicyDenied => "policy_denied",
        }
    }
}

/// Why a message ended in the dead letter queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// `deadline_at` passed while the message was queued.
    Deadline,
    /// Transient rejections exhausted `max_attempts`.
    AttemptsExhausted,
    /// The handler rejected it permanently.
    RejectedPermanent,
    /// A policy guard refused it.
    PolicyDenied,
    /// The recipient stopped before draining it.
    Undrained,
}

impl DeadLetterReason {
    /// Stable lowercase label used for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Deadline => "deadline",
            Self::AttemptsExhausted => "attempts_exhausted",
            Self::RejectedPermanent => "rejected_permanent",
            Self::PolicyDenied => "policy_denied",
            Self::Undrained => "undrained",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Terminal status of an accepted message, reported through the send receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Acked `Handled`.
    Handled,
    /// Moved to the dead letter queue.
    DeadLettered(DeadLetterReason),
    /// The runtime shut down before a terminal outcome was reached.
    Abandoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_outranks_normal() {
        assert!(MessagePriority::Critical > MessagePriority::Normal);
    }

    #[test]
    fn reject_reasons_classify_retriability() {
        assert!(RejectReason::HandlerTimeout.is_transient());
        assert!(RejectReason::Transient.is_transient());
        assert!(!RejectReason::Permanent.is_transient());
        assert!(!RejectReason::PolicyDenied.is_transient());
    }

    #[test]
    fn reply_copies_correlation_and_targets_sender() {
        let origin = AgentId::new(7);
        let correlation = CorrelationId::generate();
        let message = Message {
            message_id: MessageId::new(1),
            correlation_id: correlation,
            from: Sender::Agent(origin),
            to: Address::Agent(AgentId::new(8)),
            kind: MessageKind::CapabilityRequest,
            payload: Payload::empty(),
            priority: MessagePriority::Normal,
            enqueued_at: Timestamp::epoch(),
            deadline_at: Timestamp::epoch().saturating_add(Duration::from_secs(1)),
            attempts: AttemptCount::zero(),
            ack_policy: AckPolicy::AtLeastOnce,
        };

        let reply = MessageDraft::reply_to(
            &message,
            Sender::Agent(AgentId::new(8)),
            MessageKind::CapabilityResponse,
            Payload::empty(),
        )
        .unwrap();

        assert_eq!(reply.to, Address::Agent(origin));
        assert_eq!(reply.correlation_id, Some(correlation));
    }

    #[test]
    fn reply_to_external_origin_is_none() {
        let message = Message {
            message_id: MessageId::new(1),
            correlation_id: CorrelationId::generate(),
            from: Sender::External,
            to: Address::Agent(AgentId::new(8)),
            kind: MessageKind::Control,
            payload: Payload::empty(),
            priority: MessagePriority::Normal,
            enqueued_at: Timestamp::epoch(),
            deadline_at: Timestamp::epoch(),
            attempts: AttemptCount::zero(),
            ack_policy: AckPolicy::FireAndForget,
        };
        assert!(
            MessageDraft::reply_to(
                &message,
                Sender::Agent(AgentId::new(8)),
                MessageKind::Error,
                Payload::empty(),
            )
            .is_none()
        );
    }

    #[test]
    fn payload_json_round_trip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Ping {
            seq: u32,
        }

        let payload = Payload::json(&Ping { seq: 9 }).unwrap();
        assert_eq!(payload.content_type, ContentType::json());
        let parsed: Ping = payload.parse_json().unwrap();
        assert_eq!(parsed, Ping { seq: 9 });
    }

    #[test]
    fn expiry_is_strict() {
        let enqueued = Timestamp::epoch().saturating_add(Duration::from_secs(10));
        let deadline = enqueued.saturating_add(Duration::from_millis(200));
        let message = Message {
            message_id: MessageId::new(1),
            correlation_id: CorrelationId::generate(),
            from: Sender::External,
            to: Address::Agent(AgentId::new(1)),
            kind: MessageKind::Event,
            payload: Payload::empty(),
            priority: MessagePriority::Normal,
            enqueued_at: enqueued,
            deadline_at: deadline,
            attempts: AttemptCount::zero(),
            ack_policy: AckPolicy::AtLeastOnce,
        };
        assert!(!message.is_expired(deadline));
        assert!(message.is_expired(deadline.saturating_add(Duration::from_millis(1))));
    }
}
