//! Runtime configuration for development and production environments
//!
//! Provides pre-configured settings optimized for different deployment
//! scenarios with validation and builder pattern support, plus the per-agent
//! configuration record carried by each descriptor.

#[allow(clippy::wildcard_imports)]
use crate::domain_types::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed a cross-field consistency check.
    #[error("invalid configuration: {field} - {reason}")]
    ValidationError {
        /// Field name.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Reading or writing the configuration file failed.
    #[error("I/O error: {source}")]
    IoError {
        /// Underlying I/O failure.
        #[from]
        source: std::io::Error,
    },

    /// The configuration file was not valid JSON for this schema.
    #[error("serialization error: {source}")]
    SerializationError {
        /// Underlying serde failure.
        #[from]
        source: serde_json::Error,
    },
}

/// Complete runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // Messaging
    /// Default inbox capacity for agents that do not override it.
    pub inbox_capacity: InboxCapacity,
    /// How long a producer may block on a full inbox.
    pub enqueue_timeout_ms: EnqueueTimeoutMs,
    /// Maximum delivery attempts per message.
    pub max_attempts: MaxAttempts,
    /// Base delay for redelivery backoff.
    pub retry_base_ms: RetryBaseMs,
    /// Cap on redelivery backoff.
    pub max_backoff_ms: MaxBackoffMs,
    /// Dead letter queue retention bound.
    pub dead_letter_capacity: ChannelCapacity,

    // Handlers
    /// Default handler time budget.
    pub handler_timeout_ms: HandlerTimeoutMs,
    /// Quiet period before a running agent is marked idle.
    pub idle_after_ms: IdleAfterMs,

    // Supervision
    /// Health poll cadence.
    pub health_interval_ms: HealthIntervalMs,
    /// Heartbeat age that fails a health sample.
    pub heartbeat_staleness_ms: HeartbeatStalenessMs,
    /// Inbox depth that fails a health sample.
    pub inbox_soft_limit: InboxSoftLimit,
    /// Handler error rate that fails a health sample.
    pub error_rate_ceiling: ErrorRateCeiling,
    /// Healthy samples required to leave Degraded.
    pub recovery_samples: RecoverySamples,
    /// Consecutive failures that tip Degraded into Failing.
    pub failure_threshold: FailureThreshold,
    /// Restart attempts before an agent is declared dead.
    pub max_restarts: MaxRestarts,
    /// Base delay for restart backoff.
    pub restart_base_ms: RestartBaseMs,
    /// Drain budget for a stopping agent.
    pub drain_deadline_ms: DrainDeadlineMs,
    /// Global deadline for `shutdown_all`.
    pub shutdown_deadline_ms: ShutdownDeadlineMs,

    // Registry
    /// Reject registrations whose name collides with a live agent.
    pub unique_names: bool,

    // Audit
    /// Capacity of the channel feeding the audit writer task.
    pub audit_channel_capacity: ChannelCapacity,
    /// Ring retention bound by record count.
    pub audit_max_records: AuditMaxRecords,
    /// Ring retention bound by record age.
    pub audit_max_age_ms: AuditMaxAgeMs,
    /// Payload fields replaced by a stable hash before persistence.
    pub audit_redact_fields: Vec<String>,

    // Scheduling
    /// Worker threads for the runtime scheduler.
    pub worker_thread_count: WorkerThreadCount,

    // Persistence
    /// Persist inbox contents across graceful shutdown.
    pub durable_inboxes: bool,
}

impl RuntimeConfig {
    /// Creates a development configuration optimized for debugging
    ///
    /// Small queues, short timeouts, aggressive polling: faults surface fast.
    ///
    /// # Panics
    /// Panics if any of the hardcoded values are out of range for their
    /// domain types.
    #[must_use]
    pub fn development() -> Self {
        Self {
            inbox_capacity: InboxCapacity::try_new(64).unwrap(),
            enqueue_timeout_ms: EnqueueTimeoutMs::try_new(500).unwrap(),
            max_attempts: MaxAttempts::try_new(2).unwrap(),
            retry_base_ms: RetryBaseMs::try_new(50).unwrap(),
            max_backoff_ms: MaxBackoffMs::try_new(2_000).unwrap(),
            dead_letter_capacity: ChannelCapacity::try_new(1_000).unwrap(),

            handler_timeout_ms: HandlerTimeoutMs::try_new(10_000).unwrap(),
            idle_after_ms: IdleAfterMs::try_new(5_000).unwrap(),

            health_interval_ms: HealthIntervalMs::try_new(1_000).unwrap(),
            heartbeat_staleness_ms: HeartbeatStalenessMs::try_new(10_000).unwrap(),
            inbox_soft_limit: InboxSoftLimit::try_new(32).unwrap(),
            error_rate_ceiling: ErrorRateCeiling::try_new(0.5).unwrap(),
            recovery_samples: RecoverySamples::try_new(2).unwrap(),
            failure_threshold: FailureThreshold::try_new(3).unwrap(),
            max_restarts: MaxRestarts::try_new(3).unwrap(),
            restart_base_ms: RestartBaseMs::try_new(100).unwrap(),
            drain_deadline_ms: DrainDeadlineMs::try_new(2_000).unwrap(),
            shutdown_deadline_ms: ShutdownDeadlineMs::try_new(5_000).unwrap(),

            unique_names: true,

            audit_channel_capacity: ChannelCapacity::try_new(256).unwrap(),
            audit_max_records: AuditMaxRecords::try_new(1_000).unwrap(),
            audit_max_age_ms: AuditMaxAgeMs::try_new(3_600_000).unwrap(),
            audit_redact_fields: vec!["secret".to_string(), "token".to_string()],

            worker_thread_count: WorkerThreadCount::try_new(2).unwrap(),

            durable_inboxes: false,
        }
    }

    /// Creates a production configuration optimized for throughput
    ///
    /// # Panics
    /// Panics if any of the hardcoded values are out of range for their
    /// domain types.
    #[must_use]
    pub fn production() -> Self {
        Self {
            inbox_capacity: InboxCapacity::try_new(4_096).unwrap(),
            enqueue_timeout_ms: EnqueueTimeoutMs::try_new(5_000).unwrap(),
            max_attempts: MaxAttempts::try_new(3).unwrap(),
            retry_base_ms: RetryBaseMs::try_new(250).unwrap(),
            max_backoff_ms: MaxBackoffMs::try_new(30_000).unwrap(),
            dead_letter_capacity: ChannelCapacity::try_new(100_000).unwrap(),

            handler_timeout_ms: HandlerTimeoutMs::try_new(30_000).unwrap(),
            idle_after_ms: IdleAfterMs::try_new(60_000).unwrap(),

            health_interval_ms: HealthIntervalMs::try_new(15_000).unwrap(),
            heartbeat_staleness_ms: HeartbeatStalenessMs::try_new(120_000).unwrap(),
            inbox_soft_limit: InboxSoftLimit::try_new(2_048).unwrap(),
            error_rate_ceiling: ErrorRateCeiling::try_new(0.25).unwrap(),
            recovery_samples: RecoverySamples::try_new(2).unwrap(),
            failure_threshold: FailureThreshold::try_new(5).unwrap(),
            max_restarts: MaxRestarts::try_new(5).unwrap(),
            restart_base_ms: RestartBaseMs::try_new(1_000).unwrap(),
            drain_deadline_ms: DrainDeadlineMs::try_new(30_000).unwrap(),
            shutdown_deadline_ms: ShutdownDeadlineMs::try_new(60_000).unwrap(),

            unique_names: true,

            audit_channel_capacity: ChannelCapacity::try_new(4_096).unwrap(),
            audit_max_records: AuditMaxRecords::try_new(100_000).unwrap(),
            audit_max_age_ms: AuditMaxAgeMs::default(), // 24 hours
            audit_redact_fields: vec![
                "secret".to_string(),
                "token".to_string(),
                "password".to_string(),
                "api_key".to_string(),
            ],

            worker_thread_count: WorkerThreadCount::try_new(8).unwrap(),

            durable_inboxes: true,
        }
    }

    /// Creates a configuration suitable for tests: tiny bounds, fast cadences
    ///
    /// # Panics
    /// Panics if any of the hardcoded values are out of range for their
    /// domain types.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            inbox_capacity: InboxCapacity::try_new(16).unwrap(),
            enqueue_timeout_ms: EnqueueTimeoutMs::try_new(200).unwrap(),
            max_attempts: MaxAttempts::try_new(3).unwrap(),
            retry_base_ms: RetryBaseMs::try_new(10).unwrap(),
            max_backoff_ms: MaxBackoffMs::try_new(100).unwrap(),
            dead_letter_capacity: ChannelCapacity::try_new(100).unwrap(),

            handler_timeout_ms: HandlerTimeoutMs::try_new(1_000).unwrap(),
            idle_after_ms: IdleAfterMs::try_new(200).unwrap(),

            health_interval_ms: HealthIntervalMs::try_new(20).unwrap(),
            heartbeat_staleness_ms: HeartbeatStalenessMs::try_new(5_000).unwrap(),
            inbox_soft_limit: InboxSoftLimit::try_new(12).unwrap(),
            error_rate_ceiling: ErrorRateCeiling::try_new(0.9).unwrap(),
            recovery_samples: RecoverySamples::try_new(2).unwrap(),
            failure_threshold: FailureThreshold::try_new(2).unwrap(),
            max_restarts: MaxRestarts::try_new(3).unwrap(),
            restart_base_ms: RestartBaseMs::try_new(100).unwrap(),
            drain_deadline_ms: DrainDeadlineMs::try_new(2_000).unwrap(),
            shutdown_deadline_ms: ShutdownDeadlineMs::try_new(2_000).unwrap(),

            unique_names: true,

            audit_channel_capacity: ChannelCapacity::try_new(64).unwrap(),
            audit_max_records: AuditMaxRecords::try_new(500).unwrap(),
            audit_max_age_ms: AuditMaxAgeMs::try_new(60_000).unwrap(),
            audit_redact_fields: vec!["secret".to_string()],

            worker_thread_count: WorkerThreadCount::try_new(2).unwrap(),

            durable_inboxes: false,
        }
    }

    /// Creates a configuration builder starting from development defaults.
    #[must_use]
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Validates the configuration for consistency
    ///
    /// # Errors
    /// Returns `ConfigError` if any configuration values are inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_base_ms.as_u64() > self.max_backoff_ms.as_u64() {
            return Err(ConfigError::ValidationError {
                field: "retry_base_ms".to_string(),
                reason: "must not exceed max_backoff_ms".to_string(),
            });
        }

        if self.inbox_soft_limit.as_usize() > self.inbox_capacity.as_usize() {
            return Err(ConfigError::ValidationError {
                field: "inbox_soft_limit".to_string(),
                reason: "must not exceed inbox_capacity".to_string(),
            });
        }

        if self.heartbeat_staleness_ms.as_u64() <= self.health_interval_ms.as_u64() {
            return Err(ConfigError::ValidationError {
                field: "heartbeat_staleness_ms".to_string(),
                reason: "must exceed the health poll interval".to_string(),
            });
        }

        if self.drain_deadline_ms.as_u64() < self.handler_timeout_ms.as_u64() {
            return Err(ConfigError::ValidationError {
                field: "drain_deadline_ms".to_string(),
                reason: "must allow at least one handler timeout".to_string(),
            });
        }

        if self.worker_thread_count.as_usize() > num_cpus::get() * 2 {
            return Err(ConfigError::ValidationError {
                field: "worker_thread_count".to_string(),
                reason: format!("should not exceed 2x CPU cores ({})", num_cpus::get() * 2),
            });
        }

        Ok(())
    }

    /// Saves configuration to a JSON file
    ///
    /// # Errors
    /// Returns `ConfigError` if serialization or the write fails.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Loads and validates configuration from a JSON file
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::development()
    }
}

/// Builder for custom runtime configurations
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Creates a new builder starting with development defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::development(),
        }
    }

    /// Sets the default inbox capacity.
    #[must_use]
    pub fn inbox_capacity(mut self, capacity: InboxCapacity) -> Self {
        self.config.inbox_capacity = capacity;
        self
    }

    /// Sets the enqueue timeout.
    #[must_use]
    pub fn enqueue_timeout_ms(mut self, timeout: EnqueueTimeoutMs) -> Self {
        self.config.enqueue_timeout_ms = timeout;
        self
    }

    /// Sets the maximum delivery attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: MaxAttempts) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Sets the redelivery backoff base.
    #[must_use]
    pub fn retry_base_ms(mut self, base: RetryBaseMs) -> Self {
        self.config.retry_base_ms = base;
        self
    }

    /// Sets the default handler time budget.
    #[must_use]
    pub fn handler_timeout_ms(mut self, timeout: HandlerTimeoutMs) -> Self {
        self.config.handler_timeout_ms = timeout;
        self
    }

    /// Sets the idle threshold.
    #[must_use]
    pub fn idle_after_ms(mut self, idle_after: IdleAfterMs) -> Self {
        self.config.idle_after_ms = idle_after;
        self
    }

    /// Sets the health poll cadence.
    #[must_use]
    pub fn health_interval_ms(mut self, interval: HealthIntervalMs) -> Self {
        self.config.health_interval_ms = interval;
        self
    }

    /// Sets the restart budget.
    #[must_use]
    pub fn max_restarts(mut self, restarts: MaxRestarts) -> Self {
        self.config.max_restarts = restarts;
        self
    }

    /// Sets the restart backoff base.
    #[must_use]
    pub fn restart_base_ms(mut self, base: RestartBaseMs) -> Self {
        self.config.restart_base_ms = base;
        self
    }

    /// Sets the drain budget for stopping agents.
    #[must_use]
    pub fn drain_deadline_ms(mut self, deadline: DrainDeadlineMs) -> Self {
        self.config.drain_deadline_ms = deadline;
        self
    }

    /// Enables or disables name uniqueness enforcement.
    #[must_use]
    pub fn unique_names(mut self, unique: bool) -> Self {
        self.config.unique_names = unique;
        self
    }

    /// Sets the audit retention bounds.
    #[must_use]
    pub fn audit_retention(mut self, records: AuditMaxRecords, age: AuditMaxAgeMs) -> Self {
        self.config.audit_max_records = records;
        self.config.audit_max_age_ms = age;
        self
    }

    /// Sets the payload fields redacted from audit records.
    #[must_use]
    pub fn audit_redact_fields(mut self, fields: Vec<String>) -> Self {
        self.config.audit_redact_fields = fields;
        self
    }

    /// Enables or disables durable inboxes.
    #[must_use]
    pub fn durable_inboxes(mut self, durable: bool) -> Self {
        self.config.durable_inboxes = durable;
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    /// Returns `ConfigError` if the assembled configuration is inconsistent.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for RuntimeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-agent configuration record carried by the descriptor
///
/// Everything here is optional; unset fields fall back to the runtime
/// defaults. `params` is opaque to the runtime and handed to the agent's
/// `initialize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Overrides the runtime inbox capacity for this agent.
    pub inbox_capacity: Option<InboxCapacity>,
    /// Overrides the runtime handler time budget for this agent.
    pub handler_timeout_ms: Option<HandlerTimeoutMs>,
    /// Allow overlapping handler invocations for this agent.
    pub reentrant: bool,
    /// Blueprint this agent was instantiated from, if any; used on warm restart.
    pub blueprint: Option<String>,
    /// Opaque agent parameters, not interpreted by the runtime.
    #[serde(default)]
    pub params: Value,
}

impl AgentConfig {
    /// Effective inbox capacity given the runtime default.
    #[must_use]
    pub fn effective_inbox_capacity(&self, runtime: &RuntimeConfig) -> InboxCapacity {
        self.inbox_capacity.unwrap_or(runtime.inbox_capacity)
    }

    /// Effective handler time budget given the runtime default.
    #[must_use]
    pub fn effective_handler_timeout(&self, runtime: &RuntimeConfig) -> HandlerTimeoutMs {
        self.handler_timeout_ms.unwrap_or(runtime.handler_timeout_ms)
    }
}
