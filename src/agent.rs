//! Agent behavior contract
//!
//! "Behaves like an agent" is this trait: initialize, handle one message,
//! report health, shut down. Most agents are built as a [`HandlerTable`], a
//! per-kind dispatch table registered at construction, but anything
//! implementing [`Agent`] can be hosted.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::audit::ActionCategory;
use crate::config::AgentConfig;
use crate::domain_types::{AgentId, Timestamp};
use crate::messaging::bus::{BusError, MessageBus, SendReceipt};
use crate::messaging::message::{Address, Message, MessageDraft, MessageKind, Payload, Sender};
use crate::time::Clock;

/// Failure category a handler signals to the runner
///
/// The closed taxonomy the runtime recognizes; the runner maps these onto
/// ack outcomes and descriptor updates. Matching on this enum is always
/// exhaustive.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// Temporary fault; the message is redelivered with backoff.
    #[error("transient failure: {reason}")]
    Transient {
        /// What went wrong.
        reason: String,
    },

    /// Input or state makes retry pointless; the message is dead-lettered.
    #[error("permanent failure: {reason}")]
    Permanent {
        /// What went wrong.
        reason: String,
    },

    /// A guard refused the action; no retry, surfaced as policy denial.
    #[error("refused by policy: {reason}")]
    Policy {
        /// What was refused.
        reason: String,
    },

    /// A runtime invariant is violated; the agent's task aborts and the
    /// supervisor takes over.
    #[error("fatal: {reason}")]
    Fatal {
        /// The violated invariant.
        reason: String,
    },
}

impl HandlerError {
    /// A transient failure.
    #[must_use]
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// A permanent failure.
    #[must_use]
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    /// A policy refusal.
    #[must_use]
    pub fn policy(reason: impl Into<String>) -> Self {
        Self::Policy {
            reason: reason.into(),
        }
    }

    /// A fatal invariant violation.
    #[must_use]
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }
}

/// Self-reported agent health, consulted by the supervisor's poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// Whether the agent considers itself able to serve.
    pub healthy: bool,
    /// Optional explanation, surfaced in alerts.
    pub detail: Option<String>,
}

impl HealthReport {
    /// A healthy report.
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            detail: None,
        }
    }

    /// An unhealthy report with an explanation.
    #[must_use]
    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

/// Capabilities the runtime hands a running agent
///
/// Cheap to clone; handlers receive one per invocation and use it to emit
/// further messages back into the bus.
#[derive(Clone)]
pub struct AgentContext {
    /// The agent this context belongs to.
    pub agent_id: AgentId,
    bus: Arc<MessageBus>,
    clock: Arc<Clock>,
}

impl AgentContext {
    pub(crate) fn new(agent_id: AgentId, bus: Arc<MessageBus>, clock: Arc<Clock>) -> Self {
        Self {
            agent_id,
            bus,
            clock,
        }
    }

    /// Current runtime time.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// A draft originating from this agent.
    #[must_use]
    pub fn draft(&self, to: Address, kind: MessageKind, payload: Payload) -> MessageDraft {
        MessageDraft::new(Sender::Agent(self.agent_id), to, kind, payload)
    }

    /// Sends a draft through the bus.
    ///
    /// # Errors
    /// Propagates the bus error; see [`MessageBus::send`].
    pub async fn send(&self, draft: MessageDraft) -> Result<SendReceipt, BusError> {
        self.bus.send(draft).await
    }

    /// Replies to `original`, copying its correlation id.
    ///
    /// Returns `Ok(None)` when the original came from outside the runtime
    /// and has no agent to reply to.
    ///
    /// # Errors
    /// Propagates the bus error; see [`MessageBus::send`].
    pub async fn reply(
        &self,
        original: &Message,
        kind: MessageKind,
        payload: Payload,
    ) -> Result<Option<SendReceipt>, BusError> {
        match MessageDraft::reply_to(original, Sender::Agent(self.agent_id), kind, payload) {
            Some(draft) => Ok(Some(self.bus.send(draft).await?)),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentContext")
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

/// A hosted unit of work with a declared capability set
#[async_trait]
pub trait Agent: Send + Sync {
    /// Called once per incarnation before any message is handled.
    ///
    /// # Errors
    /// An error here fails the start; the supervisor applies restart policy.
    async fn initialize(&self, _ctx: &AgentContext) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Handles one message. Sequential per agent unless the agent's config
    /// opts into reentrancy.
    ///
    /// # Errors
    /// The error's category drives ack outcome and retry behavior.
    async fn handle(&self, ctx: &AgentContext, message: Message) -> Result<(), HandlerError>;

    /// Audit category of the handler for `kind`; drives action recording
    /// and the destructive-action policy gate.
    fn handler_category(&self, kind: MessageKind) -> ActionCategory {
        match kind {
            MessageKind::Control => ActionCategory::Control,
            _ => ActionCategory::ToolCall,
        }
    }

    /// Self-reported health, consulted by the supervisor poll.
    async fn health_report(&self) -> HealthReport {
        HealthReport::healthy()
    }

    /// Called once when the agent's runner exits.
    async fn shutdown(&self) {}
}

/// Boxed future returned by registered handlers.
pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

/// A registered handler function.
pub type HandlerFn = Arc<dyn Fn(AgentContext, Message) -> HandlerFuture + Send + Sync>;

struct Registration {
    category: ActionCategory,
    handler: HandlerFn,
}

/// Per-agent handler table keyed by message kind
///
/// The default way to build an agent: register one handler per kind at
/// construction; dispatch is by tag. A kind with no registration is rejected
/// permanently.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<MessageKind, Registration>,
}

impl HandlerTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `kind` with its audit category.
    #[must_use]
    pub fn on<F, Fut>(mut self, kind: MessageKind, category: ActionCategory, handler: F) -> Self
    where
        F: Fn(AgentContext, Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: HandlerFn =
            Arc::new(move |ctx, message| -> HandlerFuture { Box::pin(handler(ctx, message)) });
        self.handlers
            .insert(kind, Registration { category, handler });
        self
    }

    /// The kinds this table handles.
    #[must_use]
    pub fn kinds(&self) -> Vec<MessageKind> {
        self.handlers.keys().copied().collect()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[async_trait]
impl Agent for HandlerTable {
    async fn handle(&self, ctx: &AgentContext, message: Message) -> Result<(), HandlerError> {
        match self.handlers.get(&message.kind) {
            Some(registration) => (registration.handler)(ctx.clone(), message).await,
            None => Err(HandlerError::permanent(format!(
                "no handler registered for kind {}",
                message.kind
            ))),
        }
    }

    fn handler_category(&self, kind: MessageKind) -> ActionCategory {
        self.handlers
            .get(&kind)
            .map_or_else(
                || match kind {
                    MessageKind::Control => ActionCategory::Control,
                    _ => ActionCategory::ToolCall,
                },
                |registration| registration.category,
            )
    }
}

/// Constructs an agent instance from its per-agent configuration
///
/// Blueprints let the control surface register agents by name and let a warm
/// restart re-instantiate persisted descriptors.
pub trait AgentBlueprint: Send + Sync {
    /// Builds a fresh agent instance.
    fn instantiate(&self, config: &AgentConfig) -> Arc<dyn Agent>;
}

impl<F> AgentBlueprint for F
where
    F: Fn(&AgentConfig) -> Arc<dyn Agent> + Send + Sync,
{
    fn instantiate(&self, config: &AgentConfig) -> Arc<dyn Agent> {
        self(config)
    }
}

/// Named catalog of installed blueprints
#[derive(Default)]
pub struct BlueprintCatalog {
    blueprints: dashmap::DashMap<String, Arc<dyn AgentBlueprint>>,
}

impl BlueprintCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a blueprint under `name`, replacing any previous one.
    pub fn install(&self, name: impl Into<String>, blueprint: Arc<dyn AgentBlueprint>) {
        self.blueprints.insert(name.into(), blueprint);
    }

    /// Instantiates the named blueprint, if installed.
    #[must_use]
    pub fn instantiate(&self, name: &str, config: &AgentConfig) -> Option<Arc<dyn Agent>> {
        self.blueprints
            .get(name)
            .map(|blueprint| blueprint.instantiate(config))
    }

    /// Installed blueprint names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .blueprints
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

impl fmt::Debug for BlueprintCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlueprintCatalog")
            .field("names", &self.names())
            .finish()
    }
}

/// Built-in agent that answers capability requests with their own payload
///
/// Installed as the `echo` blueprint by default; handy for wiring checks and
/// demos.
#[derive(Debug, Clone, Default)]
pub struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    async fn handle(&self, ctx: &AgentContext, message: Message) -> Result<(), HandlerError> {
        if message.kind == MessageKind::CapabilityRequest {
            let payload = message.payload.clone();
            ctx.reply(&message, MessageKind::CapabilityResponse, payload)
                .await
                .map_err(|error| HandlerError::transient(error.to_string()))?;
        }
        Ok(())
    }
}
