//! Control API
//!
//! The typed operations the core exposes to any external front-end. Every
//! operation returns a tagged result (no panics or exceptions cross this
//! boundary) and lifecycle commands leave an audit trail keyed by the
//! returned action id, which doubles as the pollable receipt for
//! long-running commands.

use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

use crate::agent::{Agent, BlueprintCatalog};
use crate::audit::{
    ActionCategory, ActionRecord, ActionStatus, Actor, AuditError, AuditFilter, AuditLog,
};
use crate::config::{AgentConfig, RuntimeConfig};
use crate::domain_types::{ActionId, AgentId, AgentName, CapabilityName, CorrelationId};
use crate::lifecycle::AgentState;
use crate::messaging::bus::{BusError, MessageBus, SendReceipt};
use crate::messaging::dead_letter::{DeadLetter, DeadLetterStats};
use crate::messaging::message::MessageDraft;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::registry::{AgentDescriptor, ListFilter, Registry, RegistryError};
use crate::supervisor::{Supervisor, SupervisorError};
use crate::time::Clock;

/// Error kinds callers of the control API must distinguish
#[derive(Debug, Error)]
pub enum ApiError {
    /// No agent with that id is registered.
    #[error("no such agent: {agent_id}")]
    NoSuchAgent {
        /// The unknown id.
        agent_id: AgentId,
    },

    /// The destination resolved to nobody able to receive.
    #[error("no recipient for {to}")]
    NoSuchRecipient {
        /// The address as submitted.
        to: String,
    },

    /// Registration name collision.
    #[error("agent name already registered: {name}")]
    DuplicateName {
        /// The colliding name.
        name: AgentName,
    },

    /// The operation is not legal in the agent's current state.
    #[error("agent {agent_id} is {state}")]
    IllegalState {
        /// The agent.
        agent_id: AgentId,
        /// Its state.
        state: AgentState,
    },

    /// The requested lifecycle change is outside the state machine.
    #[error("illegal transition for {agent_id}: {from} -> {to}")]
    IllegalTransition {
        /// The agent.
        agent_id: AgentId,
        /// Current state.
        from: AgentState,
        /// Requested state.
        to: AgentState,
    },

    /// A full inbox stayed full past the enqueue timeout.
    #[error("inbox full for {agent_id} past the enqueue timeout")]
    BackpressureTimeout {
        /// The congested recipient.
        agent_id: AgentId,
    },

    /// The operation exceeded its deadline.
    #[error("deadline exceeded: {detail}")]
    DeadlineExceeded {
        /// What timed out.
        detail: String,
    },

    /// A policy guard refused the operation.
    #[error("denied by policy: {detail}")]
    DeniedByPolicy {
        /// What was refused.
        detail: String,
    },

    /// An internal fault not attributable to the caller.
    #[error("internal error: {detail}")]
    Internal {
        /// Description.
        detail: String,
    },
}

impl From<RegistryError> for ApiError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::DuplicateName { name } => Self::DuplicateName { name },
            RegistryError::NoSuchAgent { agent_id } => Self::NoSuchAgent { agent_id },
            RegistryError::IllegalState { agent_id, state } => {
                Self::IllegalState { agent_id, state }
            }
            RegistryError::IllegalTransition(transition) => Self::IllegalTransition {
                agent_id: transition.agent_id,
                from: transition.from,
                to: transition.to,
            },
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(error: SupervisorError) -> Self {
        match error {
            SupervisorError::Registry(registry_error) => registry_error.into(),
            SupervisorError::StopTimeout { agent_id } => Self::DeadlineExceeded {
                detail: format!("agent {agent_id} did not stop in time"),
            },
            other @ (SupervisorError::NotAdopted { .. } | SupervisorError::NoInbox { .. }) => {
                Self::Internal {
                    detail: other.to_string(),
                }
            }
        }
    }
}

impl From<BusError> for ApiError {
    fn from(error: BusError) -> Self {
        match error {
            BusError::NoSuchRecipient { to } => Self::NoSuchRecipient { to },
            BusError::BackpressureTimeout { agent_id } => Self::BackpressureTimeout { agent_id },
            BusError::ShutDown => Self::Internal {
                detail: "runtime is shutting down".to_string(),
            },
        }
    }
}

impl From<AuditError> for ApiError {
    fn from(error: AuditError) -> Self {
        Self::Internal {
            detail: error.to_string(),
        }
    }
}

/// How a registration supplies the agent's behavior.
pub enum AgentBehavior {
    /// A ready-made instance, for programmatic registration.
    Instance(Arc<dyn Agent>),
    /// The name of an installed blueprint; recorded in the agent's config so
    /// a warm restart can re-instantiate it.
    Blueprint(String),
}

impl std::fmt::Debug for AgentBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instance(_) => f.write_str("Instance(..)"),
            Self::Blueprint(name) => write!(f, "Blueprint({name})"),
        }
    }
}

/// Everything needed to register an agent.
#[derive(Debug)]
pub struct AgentRegistration {
    /// Human-readable name.
    pub name: AgentName,
    /// Capability tags.
    pub capabilities: BTreeSet<CapabilityName>,
    /// Advisory affinities.
    pub relationships: BTreeSet<AgentId>,
    /// Per-agent configuration.
    pub config: AgentConfig,
    /// The behavior to host.
    pub behavior: AgentBehavior,
}

impl AgentRegistration {
    /// A registration with default config and no relationships.
    #[must_use]
    pub fn new(
        name: AgentName,
        capabilities: BTreeSet<CapabilityName>,
        behavior: AgentBehavior,
    ) -> Self {
        Self {
            name,
            capabilities,
            relationships: BTreeSet::new(),
            config: AgentConfig::default(),
            behavior,
        }
    }
}

/// Typed control surface over the runtime
#[derive(Clone)]
pub struct ControlApi {
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    bus: Arc<MessageBus>,
    metrics: Arc<MetricsRegistry>,
    audit: Arc<AuditLog>,
    catalog: Arc<BlueprintCatalog>,
    clock: Arc<Clock>,
    config: RuntimeConfig,
}

impl ControlApi {
    pub(crate) fn new(
        registry: Arc<Registry>,
        supervisor: Arc<Supervisor>,
        bus: Arc<MessageBus>,
        metrics: Arc<MetricsRegistry>,
        audit: Arc<AuditLog>,
        catalog: Arc<BlueprintCatalog>,
        clock: Arc<Clock>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            supervisor,
            bus,
            metrics,
            audit,
            catalog,
            clock,
            config,
        }
    }

    /// Registers an agent and returns its id.
    ///
    /// # Errors
    /// [`ApiError::DuplicateName`] on a name collision, [`ApiError::Internal`]
    /// for an unknown blueprint.
    pub async fn register(&self, registration: AgentRegistration) -> Result<AgentId, ApiError> {
        let mut config = registration.config;
        let agent: Arc<dyn Agent> = match registration.behavior {
            AgentBehavior::Instance(agent) => agent,
            AgentBehavior::Blueprint(blueprint) => {
                let agent = self
                    .catalog
                    .instantiate(&blueprint, &config)
                    .ok_or_else(|| ApiError::Internal {
                        detail: format!("unknown blueprint: {blueprint}"),
                    })?;
                config.blueprint = Some(blueprint);
                agent
            }
        };

        let agent_id = self.registry.register(
            registration.name.clone(),
            registration.capabilities,
            registration.relationships,
            config.clone(),
        )?;
        self.bus
            .attach_inbox(agent_id, config.effective_inbox_capacity(&self.config));
        self.supervisor.adopt(agent_id, agent);

        self.audit
            .record_terminal(
                Actor::Operator,
                ActionCategory::StateChange,
                CorrelationId::generate(),
                ActionStatus::Completed,
                json!({
                    "op": "register",
                    "agent_id": agent_id.to_string(),
                    "name": registration.name.to_string(),
                }),
            )
            .await?;
        Ok(agent_id)
    }

    /// Deregisters a stopped or dead agent.
    ///
    /// # Errors
    /// [`ApiError::IllegalState`] unless the agent is `Stopped` or `Dead`.
    pub async fn deregister(&self, agent_id: AgentId) -> Result<(), ApiError> {
        let descriptor = self.registry.deregister(agent_id)?;
        self.bus.detach_inbox(agent_id);
        self.supervisor.forget(agent_id);
        self.metrics.forget_agent(agent_id);

        self.audit
            .record_terminal(
                Actor::Operator,
                ActionCategory::StateChange,
                CorrelationId::generate(),
                ActionStatus::Completed,
                json!({
                    "op": "deregister",
                    "agent_id": agent_id.to_string(),
                    "name": descriptor.name.to_string(),
                }),
            )
            .await?;
        Ok(())
    }

    /// Descriptor snapshot for one agent.
    ///
    /// # Errors
    /// [`ApiError::NoSuchAgent`] for unknown ids.
    pub fn get(&self, agent_id: AgentId) -> Result<AgentDescriptor, ApiError> {
        Ok(self.registry.get(agent_id)?)
    }

    /// Descriptor snapshots matching the filter.
    #[must_use]
    pub fn list(&self, filter: &ListFilter) -> Vec<AgentDescriptor> {
        self.registry.list(filter)
    }

    /// Starts an agent; the returned action id is the pollable receipt.
    ///
    /// # Errors
    /// Propagates lifecycle and audit failures.
    pub async fn start(&self, agent_id: AgentId) -> Result<ActionId, ApiError> {
        self.lifecycle_command(agent_id, "start", |api, id| async move {
            api.supervisor.start(id).map_err(ApiError::from)
        })
        .await
    }

    /// Stops an agent; drain progress is visible through `get`.
    ///
    /// # Errors
    /// Propagates lifecycle and audit failures.
    pub async fn stop(&self, agent_id: AgentId) -> Result<ActionId, ApiError> {
        self.lifecycle_command(agent_id, "stop", |api, id| async move {
            api.supervisor.stop(id).await.map_err(ApiError::from)
        })
        .await
    }

    /// Restarts an agent: stop-drain, then start.
    ///
    /// # Errors
    /// Propagates lifecycle and audit failures.
    pub async fn restart(&self, agent_id: AgentId) -> Result<ActionId, ApiError> {
        self.lifecycle_command(agent_id, "restart", |api, id| async move {
            api.supervisor.restart(id).await.map_err(ApiError::from)
        })
        .await
    }

    async fn lifecycle_command<F, Fut>(
        &self,
        agent_id: AgentId,
        op: &str,
        command: F,
    ) -> Result<ActionId, ApiError>
    where
        F: FnOnce(ControlApi, AgentId) -> Fut,
        Fut: std::future::Future<Output = Result<(), ApiError>>,
    {
        let action_id = self
            .audit
            .start_action(
                Actor::Operator,
                ActionCategory::StateChange,
                CorrelationId::generate(),
                json!({"op": op, "agent_id": agent_id.to_string()}),
            )
            .await?;

        match command(self.clone(), agent_id).await {
            Ok(()) => {
                self.audit
                    .update_action(action_id, ActionStatus::Completed, Value::Null)
                    .await?;
                Ok(action_id)
            }
            Err(error) => {
                self.audit
                    .update_action(
                        action_id,
                        ActionStatus::Failed,
                        json!({"error": error.to_string()}),
                    )
                    .await?;
                Err(error)
            }
        }
    }

    /// Sends a message through the bus.
    ///
    /// # Errors
    /// See [`MessageBus::send`].
    pub async fn send(&self, draft: MessageDraft) -> Result<SendReceipt, ApiError> {
        Ok(self.bus.send(draft).await?)
    }

    /// Consistent point-in-time metrics view.
    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Retained audit records matching the filter.
    #[must_use]
    pub fn audit_query(&self, filter: &AuditFilter) -> Vec<ActionRecord> {
        self.audit.query(filter)
    }

    /// Aggregate dead letter statistics.
    #[must_use]
    pub fn dead_letter_stats(&self) -> DeadLetterStats {
        self.bus.dead_letters().stats(self.clock.now())
    }

    /// The most recent dead letters, newest last.
    #[must_use]
    pub fn recent_dead_letters(&self, limit: usize) -> Vec<DeadLetter> {
        self.bus.dead_letters().recent(limit)
    }

    /// Current inbox depth for an agent, zero when it has no inbox.
    #[must_use]
    pub fn queue_depth(&self, agent_id: AgentId) -> usize {
        self.bus.inbox_depth(agent_id)
    }

    /// Served capabilities with candidate counts.
    #[must_use]
    pub fn capabilities(&self) -> Vec<(CapabilityName, usize)> {
        self.registry.capability_index().capabilities()
    }

    /// Installed blueprint names.
    #[must_use]
    pub fn blueprints(&self) -> Vec<String> {
        self.catalog.names()
    }
}

impl std::fmt::Debug for ControlApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlApi").finish_non_exhaustive()
    }
}
