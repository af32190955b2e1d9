//! Runtime assembly
//!
//! One `Runtime` value wires every subsystem together (clock, registry,
//! bus, supervisor, audit, metrics) and is handed to whoever needs it.
//! There are no ambient globals: tests build their own runtime with a test
//! time provider and an in-memory store.

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::agent::{BlueprintCatalog, EchoAgent};
use crate::alert::{AlertSink, TracingAlertSink};
use crate::api::ControlApi;
use crate::audit::{ActionPolicy, AllowAllPolicy, AuditLog};
use crate::capability::CapabilityIndex;
use crate::config::{ConfigError, RuntimeConfig};
use crate::messaging::bus::MessageBus;
use crate::messaging::dead_letter::DeadLetterQueue;
use crate::metrics::MetricsRegistry;
use crate::registry::{ListFilter, Registry};
use crate::storage::{self, KeyValueStore, StorageError};
use crate::supervisor::Supervisor;
use crate::time::{Clock, IdMinter, SharedTimeProvider, production_time_provider};

/// Errors raised while assembling, restoring, or persisting a runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A persistence operation failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// No store was configured for the requested operation.
    #[error("no key-value store configured")]
    NoStore,
}

/// What a warm restart brought back.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreReport {
    /// Descriptors re-registered.
    pub agents: usize,
    /// Descriptors skipped (no blueprint to re-instantiate).
    pub skipped: usize,
    /// Inbox messages rehydrated.
    pub messages: usize,
}

/// Builder for a [`Runtime`]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    time_provider: SharedTimeProvider,
    alerts: Arc<dyn AlertSink>,
    policy: Arc<dyn ActionPolicy>,
    store: Option<Arc<dyn KeyValueStore>>,
    catalog: Arc<BlueprintCatalog>,
}

impl RuntimeBuilder {
    fn new(config: RuntimeConfig) -> Self {
        let catalog = Arc::new(BlueprintCatalog::new());
        catalog.install(
            "echo",
            Arc::new(|_config: &crate::config::AgentConfig| {
                Arc::new(EchoAgent) as Arc<dyn crate::agent::Agent>
            }),
        );
        Self {
            config,
            time_provider: production_time_provider(),
            alerts: Arc::new(TracingAlertSink),
            policy: Arc::new(AllowAllPolicy),
            store: None,
            catalog,
        }
    }

    /// Substitutes the time provider (tests use the delay-skipping one).
    #[must_use]
    pub fn time_provider(mut self, provider: SharedTimeProvider) -> Self {
        self.time_provider = provider;
        self
    }

    /// Substitutes the alert sink.
    #[must_use]
    pub fn alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Substitutes the destructive-action policy.
    #[must_use]
    pub fn action_policy(mut self, policy: Arc<dyn ActionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Attaches a key-value store for persistence and warm restart.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Installs an agent blueprint under `name`.
    #[must_use]
    pub fn blueprint(
        self,
        name: impl Into<String>,
        blueprint: Arc<dyn crate::agent::AgentBlueprint>,
    ) -> Self {
        self.catalog.install(name, blueprint);
        self
    }

    /// Validates the configuration and wires the runtime.
    ///
    /// # Errors
    /// Returns the configuration error when validation fails.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        self.config.validate()?;

        let clock = Arc::new(Clock::new(Arc::clone(&self.time_provider)));
        let minter = Arc::new(IdMinter::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let audit = Arc::new(AuditLog::new(
            Arc::clone(&clock),
            Arc::clone(&minter),
            Arc::clone(&self.alerts),
            self.config.audit_channel_capacity,
            self.config.audit_max_records,
            self.config.audit_max_age_ms,
            self.config.audit_redact_fields.clone(),
        ));
        let index = Arc::new(CapabilityIndex::new());
        let registry = Arc::new(Registry::new(
            index,
            Arc::clone(&minter),
            Arc::clone(&clock),
            self.config.unique_names,
        ));
        let dead_letters = Arc::new(DeadLetterQueue::new(
            self.config.dead_letter_capacity.as_usize(),
        ));
        let bus = MessageBus::new(
            Arc::clone(&registry),
            dead_letters,
            Arc::clone(&metrics),
            Arc::clone(&audit),
            Arc::clone(&clock),
            Arc::clone(&minter),
            &self.config,
        );
        let supervisor = Supervisor::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            Arc::clone(&metrics),
            Arc::clone(&audit),
            Arc::clone(&self.alerts),
            Arc::clone(&self.policy),
            Arc::clone(&clock),
            self.config.clone(),
        );

        Ok(Runtime {
            config: self.config,
            clock,
            minter,
            registry,
            bus,
            supervisor,
            metrics,
            audit,
            catalog: self.catalog,
            store: self.store,
        })
    }
}

/// The assembled multi-agent runtime
pub struct Runtime {
    config: RuntimeConfig,
    clock: Arc<Clock>,
    minter: Arc<IdMinter>,
    registry: Arc<Registry>,
    bus: Arc<MessageBus>,
    supervisor: Arc<Supervisor>,
    metrics: Arc<MetricsRegistry>,
    audit: Arc<AuditLog>,
    catalog: Arc<BlueprintCatalog>,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl Runtime {
    /// Starts building a runtime over `config`.
    #[must_use]
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    /// Starts background work: the supervisor's health poll.
    pub fn start(&self) {
        self.supervisor.start_polling();
        info!("runtime started");
    }

    /// The typed control surface.
    #[must_use]
    pub fn control(&self) -> ControlApi {
        ControlApi::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.supervisor),
            Arc::clone(&self.bus),
            Arc::clone(&self.metrics),
            Arc::clone(&self.audit),
            Arc::clone(&self.catalog),
            Arc::clone(&self.clock),
            self.config.clone(),
        )
    }

    /// Rehydrates persisted descriptors and (durable mode) inbox contents.
    ///
    /// Call before accepting any sends: descriptors land in `Registered` and
    /// queued messages are requeued under their original identifiers. Agents
    /// whose config names no installed blueprint are skipped with a warning.
    ///
    /// # Errors
    /// [`RuntimeError::NoStore`] without a configured store; storage errors
    /// otherwise.
    pub async fn restore(&self) -> Result<RestoreReport, RuntimeError> {
        let store = self.store.as_ref().ok_or(RuntimeError::NoStore)?;
        let mut report = RestoreReport::default();

        // Keep freshly minted ids above anything the previous life recorded.
        for key in store.list("audit/").await? {
            if let Some(action_id) = key
                .rsplit('/')
                .next()
                .and_then(|text| text.parse::<crate::domain_types::ActionId>().ok())
            {
                self.minter.ensure_above(action_id.as_u64());
            }
        }

        for persisted in storage::load_agents(store.as_ref()).await? {
            let agent_id = persisted.id;
            self.minter.ensure_above(agent_id.as_u64());

            let Some(blueprint) = persisted.config.blueprint.clone() else {
                warn!(%agent_id, "persisted agent has no blueprint; skipped");
                report.skipped += 1;
                continue;
            };
            let Some(agent) = self.catalog.instantiate(&blueprint, &persisted.config) else {
                warn!(%agent_id, %blueprint, "blueprint not installed; agent skipped");
                report.skipped += 1;
                continue;
            };

            let capacity = persisted
                .config
                .effective_inbox_capacity(&self.config);
            let descriptor = persisted.into_descriptor();
            if let Err(error) = self.registry.adopt(descriptor) {
                warn!(%agent_id, %error, "persisted agent not adopted");
                report.skipped += 1;
                continue;
            }
            self.bus.attach_inbox(agent_id, capacity);
            self.supervisor.adopt(agent_id, agent);
            report.agents += 1;

            if self.config.durable_inboxes {
                for message in storage::load_inbox(store.as_ref(), agent_id).await? {
                    self.minter.ensure_above(message.message_id.as_u64());
                    self.bus.rehydrate(message).await;
                    report.messages += 1;
                }
                storage::clear_inbox(store.as_ref(), agent_id).await?;
            }
        }

        info!(
            agents = report.agents,
            skipped = report.skipped,
            messages = report.messages,
            "warm restart complete"
        );
        Ok(report)
    }

    /// Graceful shutdown: persist durable inboxes, stop and drain every
    /// agent up to the global deadline, persist descriptors and audit, then
    /// tear down the bus and audit writer.
    pub async fn shutdown(&self) {
        info!("runtime shutting down");

        // Durable inboxes snapshot before the drain dead-letters anything;
        // redelivery after restart is covered by at-least-once semantics.
        if self.config.durable_inboxes {
            if let Some(store) = &self.store {
                for agent_id in self.registry.ids() {
                    if let Some(inbox) = self.bus.inbox(agent_id) {
                        let snapshot = inbox.snapshot();
                        if let Err(error) =
                            storage::save_inbox(store.as_ref(), agent_id, &snapshot).await
                        {
                            warn!(%agent_id, %error, "inbox snapshot not persisted");
                        }
                    }
                }
            }
        }

        self.supervisor.shutdown_all().await;

        if let Some(store) = &self.store {
            for descriptor in self.registry.list(&ListFilter::default()) {
                if let Err(error) = storage::save_agent(store.as_ref(), &descriptor).await {
                    warn!(agent_id = %descriptor.id, %error, "descriptor not persisted");
                }
            }
            let records = self.audit.query(&crate::audit::AuditFilter::default());
            if let Err(error) = storage::save_audit(store.as_ref(), &records).await {
                warn!(%error, "audit records not persisted");
            }
        }

        self.bus.shutdown();
        self.audit.shutdown().await;
        info!("runtime shut down");
    }

    /// The runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The runtime clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// The agent registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The message bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// The metrics registry.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// The audit log.
    #[must_use]
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// The supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("agents", &self.registry.len())
            .finish_non_exhaustive()
    }
}
