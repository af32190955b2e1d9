//! Message bus
//!
//! Accepts typed messages, resolves capability and broadcast addressing to
//! concrete recipients at enqueue time, queues per-agent, and owns the
//! acknowledge/retry/dead-letter machinery. Delivery is at-least-once:
//! every accepted message eventually ends acked `Handled`, rejected
//! permanently, or dead-lettered, never silently dropped.

use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::dead_letter::DeadLetterQueue;
use super::inbox::{AgentInbox, PushError};
use super::message::{
    AckOutcome, AckPolicy, Address, DeadLetterReason, DeliveryStatus, Message, MessageDraft,
    RejectReason, Sender,
};
use crate::audit::{ActionCategory, ActionStatus, Actor, AuditLog};
use crate::config::RuntimeConfig;
use crate::domain_types::{AgentId, CorrelationId, InboxCapacity, MessageId};
use crate::metrics::MetricsRegistry;
use crate::registry::{Registry, RegistryError};
use crate::time::{Clock, IdMinter};

/// Bus errors surfaced to senders
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The address resolved to nobody able to receive.
    #[error("no recipient for {to}")]
    NoSuchRecipient {
        /// The address as submitted.
        to: String,
    },

    /// The recipient's inbox stayed full past the enqueue timeout.
    #[error("inbox full for {agent_id} past the enqueue timeout")]
    BackpressureTimeout {
        /// The congested recipient.
        agent_id: AgentId,
    },

    /// The bus is shutting down and accepts nothing new.
    #[error("the bus is shutting down")]
    ShutDown,
}

/// One accepted per-recipient copy of a sent message.
#[derive(Debug)]
pub struct Delivery {
    /// The copy's unique id.
    pub message_id: MessageId,
    /// Who it was queued for.
    pub recipient: AgentId,
    status: Option<oneshot::Receiver<DeliveryStatus>>,
}

impl Delivery {
    /// Awaits the terminal status.
    ///
    /// `None` for fire-and-forget sends, which report nothing back.
    pub async fn wait(self) -> Option<DeliveryStatus> {
        match self.status {
            Some(receiver) => Some(receiver.await.unwrap_or(DeliveryStatus::Abandoned)),
            None => None,
        }
    }
}

/// Receipt for an accepted send
///
/// Capability sends carry exactly one delivery; broadcasts carry one per
/// recipient (possibly zero on an empty fleet).
#[derive(Debug)]
pub struct SendReceipt {
    /// Correlation id of the accepted message(s).
    pub correlation_id: CorrelationId,
    /// Per-recipient deliveries.
    pub deliveries: Vec<Delivery>,
}

impl SendReceipt {
    /// The single delivery's message id, when exactly one copy was queued.
    #[must_use]
    pub fn message_id(&self) -> Option<MessageId> {
        match self.deliveries.as_slice() {
            [only] => Some(only.message_id),
            _ => None,
        }
    }

    /// Every recipient that got a copy.
    #[must_use]
    pub fn recipients(&self) -> Vec<AgentId> {
        self.deliveries
            .iter()
            .map(|delivery| delivery.recipient)
            .collect()
    }

    /// Awaits every tracked delivery's terminal status.
    pub async fn wait(self) -> Vec<(AgentId, DeliveryStatus)> {
        let mut outcomes = Vec::with_capacity(self.deliveries.len());
        for delivery in self.deliveries {
            let recipient = delivery.recipient;
            if let Some(status) = delivery.wait().await {
                outcomes.push((recipient, status));
            }
        }
        outcomes
    }

    /// Awaits the single delivery's terminal status.
    ///
    /// `None` for fire-and-forget or empty-broadcast receipts.
    pub async fn wait_one(mut self) -> Option<DeliveryStatus> {
        if self.deliveries.len() == 1 {
            self.deliveries.remove(0).wait().await
        } else {
            None
        }
    }
}

struct InFlight {
    message: Message,
    notify: Option<oneshot::Sender<DeliveryStatus>>,
}

/// The runtime's message bus
pub struct MessageBus {
    registry: Arc<Registry>,
    inboxes: DashMap<AgentId, Arc<AgentInbox>>,
    in_flight: DashMap<MessageId, InFlight>,
    dead_letters: Arc<DeadLetterQueue>,
    metrics: Arc<MetricsRegistry>,
    audit: Arc<AuditLog>,
    clock: Arc<Clock>,
    minter: Arc<IdMinter>,
    enqueue_timeout: Duration,
    max_attempts: u8,
    retry_base: Duration,
    max_backoff: Duration,
    shutting_down: AtomicBool,
    // Handed to spawned redelivery tasks; breaks the Arc cycle.
    weak_self: Weak<MessageBus>,
}

impl MessageBus {
    /// Creates a bus wired to the given subsystems.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        dead_letters: Arc<DeadLetterQueue>,
        metrics: Arc<MetricsRegistry>,
        audit: Arc<AuditLog>,
        clock: Arc<Clock>,
        minter: Arc<IdMinter>,
        config: &RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            registry,
            inboxes: DashMap::new(),
            in_flight: DashMap::new(),
            dead_letters,
            metrics,
            audit,
            clock,
            minter,
            enqueue_timeout: config.enqueue_timeout_ms.as_duration(),
            max_attempts: config.max_attempts.as_u8(),
            retry_base: config.retry_base_ms.as_duration(),
            max_backoff: config.max_backoff_ms.as_duration(),
            shutting_down: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    /// Creates the bounded inbox for a newly registered agent.
    pub fn attach_inbox(&self, agent_id: AgentId, capacity: InboxCapacity) {
        self.inboxes
            .insert(agent_id, Arc::new(AgentInbox::new(capacity.as_usize())));
    }

    /// Drops a deregistered agent's inbox.
    pub fn detach_inbox(&self, agent_id: AgentId) {
        self.inboxes.remove(&agent_id);
    }

    /// The inbox handle for an agent, used by its runner.
    #[must_use]
    pub fn inbox(&self, agent_id: AgentId) -> Option<Arc<AgentInbox>> {
        self.inboxes
            .get(&agent_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Current queue depth for an agent, `0` when it has no inbox.
    #[must_use]
    pub fn inbox_depth(&self, agent_id: AgentId) -> usize {
        self.inboxes
            .get(&agent_id)
            .map_or(0, |entry| entry.depth())
    }

    /// Closes an agent's inbox so producers are refused immediately.
    pub fn close_inbox(&self, agent_id: AgentId) {
        if let Some(inbox) = self.inboxes.get(&agent_id) {
            inbox.close();
        }
    }

    /// The dead letter queue.
    #[must_use]
    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    /// Accepts a draft: resolves the address, freezes it, and queues one
    /// copy per recipient.
    ///
    /// Capability addressing resolves through the index under the draft's
    /// routing policy *now*; the recipient never changes afterwards. A
    /// broadcast to an empty fleet succeeds with zero deliveries. If one
    /// recipient of a multi-recipient broadcast fails to enqueue, copies
    /// already queued stand; the error reports the failing recipient.
    ///
    /// # Errors
    /// [`BusError::NoSuchRecipient`] when resolution finds nobody able to
    /// receive, [`BusError::BackpressureTimeout`] when a full inbox stays
    /// full past the enqueue timeout, [`BusError::ShutDown`] during
    /// shutdown.
    pub async fn send(&self, draft: MessageDraft) -> Result<SendReceipt, BusError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BusError::ShutDown);
        }

        let recipients = self.resolve_recipients(&draft)?;
        let correlation_id = draft
            .correlation_id
            .unwrap_or_else(CorrelationId::generate);
        let enqueue_timeout = draft.enqueue_timeout.unwrap_or(self.enqueue_timeout);

        let mut deliveries = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let enqueued_at = self.clock.now();
            let message = Message {
                message_id: self.minter.message_id(),
                correlation_id,
                from: draft.from,
                to: Address::Agent(recipient),
                kind: draft.kind,
                payload: draft.payload.clone(),
                priority: draft.priority,
                enqueued_at,
                deadline_at: enqueued_at.saturating_add(draft.ttl),
                attempts: crate::domain_types::AttemptCount::zero(),
                ack_policy: draft.ack_policy,
            };
            let message_id = message.message_id;

            let (notify, status) = match draft.ack_policy {
                AckPolicy::AtLeastOnce => {
                    let (tx, rx) = oneshot::channel();
                    (Some(tx), Some(rx))
                }
                AckPolicy::FireAndForget => (None, None),
            };
            self.in_flight.insert(
                message_id,
                InFlight {
                    message: message.clone(),
                    notify,
                },
            );

            let inbox = self.inbox(recipient).ok_or_else(|| {
                self.in_flight.remove(&message_id);
                BusError::NoSuchRecipient {
                    to: draft.to.to_string(),
                }
            })?;

            match inbox.push(message, enqueue_timeout).await {
                Ok(()) => {
                    self.metrics.record_sent(draft.kind, draft.priority);
                    trace!(%message_id, %recipient, "message queued");
                    deliveries.push(Delivery {
                        message_id,
                        recipient,
                        status,
                    });
                }
                Err(PushError::Timeout) => {
                    self.in_flight.remove(&message_id);
                    return Err(BusError::BackpressureTimeout {
                        agent_id: recipient,
                    });
                }
                Err(PushError::Closed) => {
                    self.in_flight.remove(&message_id);
                    return Err(BusError::NoSuchRecipient {
                        to: draft.to.to_string(),
                    });
                }
            }
        }

        Ok(SendReceipt {
            correlation_id,
            deliveries,
        })
    }

    fn resolve_recipients(&self, draft: &MessageDraft) -> Result<Vec<AgentId>, BusError> {
        let refused = || BusError::NoSuchRecipient {
            to: draft.to.to_string(),
        };

        match &draft.to {
            Address::Agent(agent_id) => {
                let descriptor = self.registry.get(*agent_id).map_err(|error| match error {
                    RegistryError::NoSuchAgent { .. } => refused(),
                    other => {
                        warn!(%agent_id, %other, "unexpected registry error on send");
                        refused()
                    }
                })?;
                if descriptor.state.accepts_messages() {
                    Ok(vec![*agent_id])
                } else {
                    Err(refused())
                }
            }
            Address::Capability(capability) => self
                .registry
                .capability_index()
                .resolve(capability, draft.routing, |id| self.inbox_depth(id))
                .map(|id| vec![id])
                .ok_or_else(refused),
            Address::Broadcast => {
                let sender = match draft.from {
                    Sender::Agent(id) => Some(id),
                    Sender::External => None,
                };
                let recipients: Vec<AgentId> = self
                    .registry
                    .list(&crate::registry::ListFilter::default())
                    .into_iter()
                    .filter(|descriptor| descriptor.state.is_deliverable())
                    .map(|descriptor| descriptor.id)
                    .filter(|id| Some(*id) != sender)
                    .collect();
                Ok(recipients)
            }
        }
    }

    /// Dequeues the next deliverable message from `inbox`.
    ///
    /// Messages found past their deadline are dead-lettered with reason
    /// `Deadline` instead of being returned; they are never executed.
    /// Returns `None` when the token is cancelled or the inbox is closed
    /// and empty.
    pub async fn next_deliverable(
        &self,
        inbox: &AgentInbox,
        cancel: &CancellationToken,
    ) -> Option<Message> {
        loop {
            let message = inbox.pop(cancel).await?;
            if message.is_expired(self.clock.now()) {
                self.dead_letter(message.message_id, DeadLetterReason::Deadline)
                    .await;
            } else {
                return Some(message);
            }
        }
    }

    /// Acknowledges a delivered message. Idempotent: a second terminal ack
    /// for the same id is a no-op.
    pub async fn ack(&self, message_id: MessageId, outcome: AckOutcome) {
        self.metrics.record_ack(&outcome);
        match outcome {
            AckOutcome::Handled => {
                if let Some((_, entry)) = self.in_flight.remove(&message_id) {
                    if let Some(notify) = entry.notify {
                        let _ = notify.send(DeliveryStatus::Handled);
                    }
                }
            }
            AckOutcome::Deferred => {
                // Deferral does not consume an attempt; it is bounded by the
                // message deadline alone.
                let Some(message) = self
                    .in_flight
                    .get(&message_id)
                    .map(|entry| entry.message.clone())
                else {
                    return;
                };
                if message.is_expired(self.clock.now()) {
                    self.dead_letter(message_id, DeadLetterReason::Deadline)
                        .await;
                } else {
                    self.schedule_redelivery(message, self.retry_base);
                }
            }
            AckOutcome::Rejected(reason) => self.handle_rejection(message_id, reason).await,
        }
    }

    async fn handle_rejection(&self, message_id: MessageId, reason: RejectReason) {
        match reason {
            RejectReason::Permanent => {
                self.dead_letter(message_id, DeadLetterReason::RejectedPermanent)
                    .await;
            }
            RejectReason::PolicyDenied => {
                self.dead_letter(message_id, DeadLetterReason::PolicyDenied)
                    .await;
            }
            RejectReason::HandlerTimeout | RejectReason::Transient => {
                let Some(message) = self.in_flight.get_mut(&message_id).map(|mut entry| {
                    entry.message.attempts = entry.message.attempts.increment();
                    entry.message.clone()
                }) else {
                    return;
                };

                if message.is_expired(self.clock.now()) {
                    self.dead_letter(message_id, DeadLetterReason::Deadline)
                        .await;
                } else if message.attempts.as_u8() >= self.max_attempts {
                    // `attempts` counts failed deliveries and never exceeds
                    // the configured budget.
                    self.dead_letter(message_id, DeadLetterReason::AttemptsExhausted)
                        .await;
                } else {
                    let delay = self.backoff(message.attempts.as_u8());
                    debug!(%message_id, attempts = message.attempts.as_u8(), ?delay, "scheduling redelivery");
                    self.schedule_redelivery(message, delay);
                }
            }
        }
    }

    /// Exponential backoff: `base * 2^(attempts-1)`, capped, jittered +/-25%.
    fn backoff(&self, attempts: u8) -> Duration {
        let exponent = u32::from(attempts.saturating_sub(1)).min(16);
        let exponential = self
            .retry_base
            .saturating_mul(2_u32.saturating_pow(exponent));
        let capped = exponential.min(self.max_backoff);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        capped.mul_f64(jitter)
    }

    fn schedule_redelivery(&self, message: Message, delay: Duration) {
        let Some(bus) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            bus.clock.sleep(delay).await;
            let message_id = message.message_id;
            if bus.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            let Some(recipient) = message.recipient() else {
                return;
            };
            let Some(inbox) = bus.inbox(recipient) else {
                bus.dead_letter(message_id, DeadLetterReason::Undrained)
                    .await;
                return;
            };
            match inbox.push(message, bus.enqueue_timeout).await {
                Ok(()) => trace!(%message_id, "message requeued"),
                Err(PushError::Closed) => {
                    bus.dead_letter(message_id, DeadLetterReason::Undrained)
                        .await;
                }
                Err(PushError::Timeout) => {
                    bus.dead_letter(message_id, DeadLetterReason::AttemptsExhausted)
                        .await;
                }
            }
        });
    }

    /// Re-queues a message restored from the durable store on warm restart.
    ///
    /// The message keeps its identifier, attempts, and deadline; it is
    /// tracked in flight again so the usual ack and retry machinery applies.
    pub async fn rehydrate(&self, message: Message) {
        let Some(recipient) = message.recipient() else {
            return;
        };
        let Some(inbox) = self.inbox(recipient) else {
            warn!(message_id = %message.message_id, "rehydrated message has no inbox");
            return;
        };
        let message_id = message.message_id;
        self.in_flight.insert(
            message_id,
            InFlight {
                message: message.clone(),
                notify: None,
            },
        );
        if inbox.push(message, self.enqueue_timeout).await.is_err() {
            self.in_flight.remove(&message_id);
            warn!(%message_id, "rehydrated message dropped; inbox unavailable");
        }
    }

    /// Moves a message to the dead letter queue, emitting audit and metric.
    ///
    /// Idempotent; returns `false` when the message was already terminal.
    pub async fn dead_letter(&self, message_id: MessageId, reason: DeadLetterReason) -> bool {
        let Some((_, entry)) = self.in_flight.remove(&message_id) else {
            return false;
        };
        let message = entry.message;
        let actor = match message.from {
            Sender::Agent(id) => Actor::Agent(id),
            Sender::External => Actor::Operator,
        };

        debug!(%message_id, %reason, "message dead-lettered");
        self.metrics.record_dead_letter(reason);
        self.dead_letters
            .record(message.clone(), reason, self.clock.now());

        if let Err(error) = self
            .audit
            .record_terminal(
                actor,
                ActionCategory::StateChange,
                message.correlation_id,
                ActionStatus::Failed,
                serde_json::json!({
                    "event": "dead_letter",
                    "message_id": message_id.to_string(),
                    "reason": reason.label(),
                }),
            )
            .await
        {
            warn!(%error, "dead letter audit record lost");
        }

        if let Some(notify) = entry.notify {
            let _ = notify.send(DeliveryStatus::DeadLettered(reason));
        }
        true
    }

    /// Refuses new sends, closes every inbox, and abandons tracked senders.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for entry in &self.inboxes {
            entry.value().close();
        }
        let pending: Vec<MessageId> = self
            .in_flight
            .iter()
            .map(|entry| *entry.key())
            .collect();
        for message_id in pending {
            if let Some((_, entry)) = self.in_flight.remove(&message_id) {
                if let Some(notify) = entry.notify {
                    let _ = notify.send(DeliveryStatus::Abandoned);
                }
            }
        }
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("inboxes", &self.inboxes.len())
            .field("in_flight", &self.in_flight.len())
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
