//! Supervisor
//!
//! Drives the lifecycle state machine for every agent and runs the health
//! control loop: on a fixed cadence it samples heartbeat staleness, inbox
//! depth, handler error rate, and the agent's own health report; failing
//! samples degrade the agent, repeated failures tip it into the failing
//! path, and restarts run under exponential backoff until the budget is
//! spent and the agent is declared dead with a critical alert.

use serde_json::json;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::alert::{Alert, AlertCategory, AlertSeverity, AlertSink};
use crate::audit::{ActionCategory, ActionPolicy, ActionStatus, Actor, AuditLog};
use crate::config::RuntimeConfig;
use crate::domain_types::{AgentId, CorrelationId};
use crate::lifecycle::AgentState;
use crate::messaging::bus::MessageBus;
use crate::messaging::message::{
    AckOutcome, AckPolicy, Address, DeadLetterReason, MessageDraft, MessageKind, MessagePriority,
    Payload, RejectReason, Sender,
};
use crate::metrics::MetricsRegistry;
use crate::registry::{ListFilter, Registry, RegistryError};
use crate::runner::{AgentVitals, Runner, RunnerHandle, RunnerParams};
use crate::time::Clock;

/// Budget for an agent's self-reported health check.
const HEALTH_REPORT_TIMEOUT: Duration = Duration::from_secs(1);

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The agent has no behavior adopted; it cannot be started.
    #[error("agent {agent_id} has no adopted behavior")]
    NotAdopted {
        /// The agent.
        agent_id: AgentId,
    },

    /// The agent has no inbox; registration did not complete.
    #[error("agent {agent_id} has no inbox")]
    NoInbox {
        /// The agent.
        agent_id: AgentId,
    },

    /// A registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The agent did not reach `Stopped` within the wait budget.
    #[error("agent {agent_id} did not stop in time")]
    StopTimeout {
        /// The agent.
        agent_id: AgentId,
    },
}

struct Supervised {
    agent: Arc<dyn Agent>,
    handle: Option<RunnerHandle>,
    restart_attempts: u32,
    restart_pending: bool,
    healthy_streak: u32,
}

enum FailingAction {
    DeclareDead,
    ScheduleRestart { attempt: u32 },
    Wait,
}

/// Lifecycle orchestrator and health control loop
pub struct Supervisor {
    registry: Arc<Registry>,
    bus: Arc<MessageBus>,
    metrics: Arc<MetricsRegistry>,
    audit: Arc<AuditLog>,
    alerts: Arc<dyn AlertSink>,
    policy: Arc<dyn ActionPolicy>,
    clock: Arc<Clock>,
    config: RuntimeConfig,
    supervised: dashmap::DashMap<AgentId, Supervised>,
    cancel: CancellationToken,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    // Handed to the poll loop and restart tasks; breaks the Arc cycle.
    weak_self: Weak<Supervisor>,
}

impl Supervisor {
    /// Creates a supervisor wired to the given subsystems.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        bus: Arc<MessageBus>,
        metrics: Arc<MetricsRegistry>,
        audit: Arc<AuditLog>,
        alerts: Arc<dyn AlertSink>,
        policy: Arc<dyn ActionPolicy>,
        clock: Arc<Clock>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            registry,
            bus,
            metrics,
            audit,
            alerts,
            policy,
            clock,
            config,
            supervised: dashmap::DashMap::new(),
            cancel: CancellationToken::new(),
            poll_task: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Associates a registered agent with its behavior.
    pub fn adopt(&self, agent_id: AgentId, agent: Arc<dyn Agent>) {
        self.supervised.insert(
            agent_id,
            Supervised {
                agent,
                handle: None,
                restart_attempts: 0,
                restart_pending: false,
                healthy_streak: 0,
            },
        );
    }

    /// Drops a deregistered agent's supervision state.
    pub fn forget(&self, agent_id: AgentId) {
        self.supervised.remove(&agent_id);
    }

    /// Starts the periodic health poll.
    pub fn start_polling(&self) {
        let Some(supervisor) = self.weak_self.upgrade() else {
            return;
        };
        let task = tokio::spawn(async move {
            let interval = supervisor.config.health_interval_ms.as_duration();
            loop {
                tokio::select! {
                    () = supervisor.cancel.cancelled() => break,
                    () = supervisor.clock.sleep(interval) => supervisor.poll_once().await,
                }
            }
        });
        *self.poll_task.lock().expect("poll task lock poisoned") = Some(task);
    }

    /// Starts an agent: `Registered`/`Stopped` -> `Starting`, then spawns its
    /// runner, which drives `init_ok`/`init_fail`.
    ///
    /// # Errors
    /// [`SupervisorError::NotAdopted`] when no behavior was adopted,
    /// [`SupervisorError::Registry`] when the transition is illegal.
    pub fn start(&self, agent_id: AgentId) -> Result<(), SupervisorError> {
        if !self.supervised.contains_key(&agent_id) {
            return Err(SupervisorError::NotAdopted { agent_id });
        }
        self.registry.update_state(agent_id, AgentState::Starting)?;
        if let Some(mut entry) = self.supervised.get_mut(&agent_id) {
            entry.restart_attempts = 0;
            entry.restart_pending = false;
            entry.healthy_streak = 0;
        }
        self.spawn_runner(agent_id)
    }

    fn spawn_runner(&self, agent_id: AgentId) -> Result<(), SupervisorError> {
        let descriptor = self.registry.get(agent_id)?;
        let inbox = self
            .bus
            .inbox(agent_id)
            .ok_or(SupervisorError::NoInbox { agent_id })?;
        let mut entry = self
            .supervised
            .get_mut(&agent_id)
            .ok_or(SupervisorError::NotAdopted { agent_id })?;

        let handle = Runner::spawn(RunnerParams {
            agent_id,
            agent: Arc::clone(&entry.agent),
            registry: Arc::clone(&self.registry),
            bus: Arc::clone(&self.bus),
            inbox,
            audit: Arc::clone(&self.audit),
            metrics: Arc::clone(&self.metrics),
            clock: Arc::clone(&self.clock),
            alerts: Arc::clone(&self.alerts),
            policy: Arc::clone(&self.policy),
            handler_timeout: descriptor
                .config
                .effective_handler_timeout(&self.config)
                .as_duration(),
            idle_after: self.config.idle_after_ms.as_duration(),
            drain_deadline: self.config.drain_deadline_ms.as_duration(),
            reentrant: descriptor.config.reentrant,
            failure_threshold: self.config.failure_threshold.as_u32(),
        });
        entry.handle = Some(handle);
        Ok(())
    }

    /// Requests a cooperative stop: refuse new messages, drain, `Stopped`.
    ///
    /// Returns once the stop is initiated; poll `get` or use
    /// [`Supervisor::wait_stopped`] for completion.
    ///
    /// # Errors
    /// [`SupervisorError::Registry`] when the agent cannot stop from its
    /// current state.
    pub async fn stop(&self, agent_id: AgentId) -> Result<(), SupervisorError> {
        self.registry.update_state(agent_id, AgentState::Stopping)?;
        self.bus.close_inbox(agent_id);

        let handle_present = self
            .supervised
            .get(&agent_id)
            .is_some_and(|entry| entry.handle.is_some());
        if handle_present {
            if let Some(entry) = self.supervised.get(&agent_id) {
                if let Some(handle) = &entry.handle {
                    handle.request_stop();
                }
            }
        } else {
            // Never started: nothing will drain the inbox for us.
            if let Some(inbox) = self.bus.inbox(agent_id) {
                for message in inbox.drain_remaining() {
                    self.bus
                        .dead_letter(message.message_id, DeadLetterReason::Undrained)
                        .await;
                }
            }
            self.registry.update_state(agent_id, AgentState::Stopped)?;
        }
        Ok(())
    }

    /// Waits until the agent reaches `Stopped`, bounded by `budget`.
    ///
    /// # Errors
    /// [`SupervisorError::StopTimeout`] when the budget elapses first.
    pub async fn wait_stopped(
        &self,
        agent_id: AgentId,
        budget: Duration,
    ) -> Result<(), SupervisorError> {
        let deadline = self.clock.instant() + budget;
        loop {
            if self.registry.get(agent_id)?.state == AgentState::Stopped {
                return Ok(());
            }
            if self.clock.instant() >= deadline {
                return Err(SupervisorError::StopTimeout { agent_id });
            }
            self.clock.sleep(Duration::from_millis(10)).await;
        }
    }

    /// Operator restart: stop-drain (when running), then start again. A
    /// `Failing` agent restarts immediately, bypassing the backoff schedule.
    ///
    /// # Errors
    /// Propagates the underlying stop/start failure.
    pub async fn restart(&self, agent_id: AgentId) -> Result<(), SupervisorError> {
        let state = self.registry.get(agent_id)?.state;
        match state {
            state if state.can_stop() => {
                self.stop(agent_id).await?;
                let budget = self.config.drain_deadline_ms.as_duration()
                    + self.config.handler_timeout_ms.as_duration();
                self.wait_stopped(agent_id, budget).await?;
                self.metrics.record_restart(agent_id);
                self.start(agent_id)
            }
            AgentState::Stopped | AgentState::Registered => {
                self.metrics.record_restart(agent_id);
                self.start(agent_id)
            }
            AgentState::Failing => {
                self.registry.update_state(agent_id, AgentState::Starting)?;
                if let Some(mut entry) = self.supervised.get_mut(&agent_id) {
                    entry.restart_pending = false;
                }
                self.metrics.record_restart(agent_id);
                self.spawn_runner(agent_id)
            }
            other => Err(SupervisorError::Registry(RegistryError::IllegalState {
                agent_id,
                state: other,
            })),
        }
    }

    /// One pass of the health control loop.
    pub async fn poll_once(&self) {
        self.metrics
            .set_agents_total(&self.registry.count_by_state());

        for descriptor in self.registry.list(&ListFilter::default()) {
            let agent_id = descriptor.id;
            self.metrics
                .set_inbox_depth(agent_id, self.bus.inbox_depth(agent_id));

            match descriptor.state {
                AgentState::Running | AgentState::Idle | AgentState::Degraded => {
                    self.sample_health(agent_id, descriptor.state).await;
                }
                AgentState::Failing => self.drive_failing(agent_id).await,
                AgentState::Registered
                | AgentState::Starting
                | AgentState::Stopping
                | AgentState::Stopped
                | AgentState::Dead => {}
            }
        }
    }

    async fn sample_health(&self, agent_id: AgentId, state: AgentState) {
        let healthy = self.health_predicates(agent_id).await;

        if healthy {
            let _ = self.registry.reset_failures(agent_id);
            if state == AgentState::Degraded {
                let recovered = {
                    let Some(mut entry) = self.supervised.get_mut(&agent_id) else {
                        return;
                    };
                    entry.healthy_streak += 1;
                    entry.healthy_streak >= self.config.recovery_samples.as_u32()
                };
                if recovered {
                    if self
                        .registry
                        .update_state(agent_id, AgentState::Running)
                        .is_ok()
                    {
                        info!(%agent_id, "agent recovered from degraded");
                    }
                    if let Some(mut entry) = self.supervised.get_mut(&agent_id) {
                        entry.healthy_streak = 0;
                    }
                }
            } else if let Some(mut entry) = self.supervised.get_mut(&agent_id) {
                entry.healthy_streak = 0;
                entry.restart_attempts = 0;
            }
            return;
        }

        // One failed predicate is one health_fail.
        let failures = self.registry.record_failure(agent_id).unwrap_or(0);
        if let Some(mut entry) = self.supervised.get_mut(&agent_id) {
            entry.healthy_streak = 0;
        }

        match state {
            AgentState::Running | AgentState::Idle => {
                if self
                    .registry
                    .update_state(agent_id, AgentState::Degraded)
                    .is_ok()
                {
                    self.alerts
                        .emit(Alert {
                            severity: AlertSeverity::Warning,
                            category: AlertCategory::Health,
                            message: format!("agent {agent_id} degraded"),
                            correlation_id: None,
                        })
                        .await;
                }
            }
            AgentState::Degraded => {
                if failures >= self.config.failure_threshold.as_u32() {
                    self.enter_failing(agent_id).await;
                }
            }
            _ => {}
        }
    }

    async fn health_predicates(&self, agent_id: AgentId) -> bool {
        let Ok(descriptor) = self.registry.get(agent_id) else {
            return false;
        };

        let staleness = self
            .clock
            .now()
            .saturating_duration_since(descriptor.last_heartbeat_at);
        if staleness > self.config.heartbeat_staleness_ms.as_duration() {
            debug!(%agent_id, ?staleness, "heartbeat stale");
            return false;
        }

        let depth = self.bus.inbox_depth(agent_id);
        if depth > self.config.inbox_soft_limit.as_usize() {
            debug!(%agent_id, depth, "inbox above soft limit");
            return false;
        }

        let vitals: Option<Arc<AgentVitals>> = self.supervised.get(&agent_id).and_then(|entry| {
            entry
                .handle
                .as_ref()
                .map(|handle| Arc::clone(handle.vitals()))
        });
        if let Some(vitals) = vitals {
            let (ok, err) = vitals.drain_window();
            let total = ok + err;
            if total > 0 {
                #[allow(clippy::cast_precision_loss)]
                let rate = err as f64 / total as f64;
                if rate > self.config.error_rate_ceiling.as_f64() {
                    debug!(%agent_id, rate, "handler error rate above ceiling");
                    return false;
                }
            }
        }

        let agent = self
            .supervised
            .get(&agent_id)
            .map(|entry| Arc::clone(&entry.agent));
        if let Some(agent) = agent {
            match tokio::time::timeout(HEALTH_REPORT_TIMEOUT, agent.health_report()).await {
                Ok(report) if !report.healthy => {
                    debug!(%agent_id, detail = ?report.detail, "agent reports unhealthy");
                    return false;
                }
                Err(_elapsed) => {
                    debug!(%agent_id, "health report timed out");
                    return false;
                }
                Ok(_) => {}
            }
        }

        true
    }

    async fn enter_failing(&self, agent_id: AgentId) {
        if self
            .registry
            .update_state(agent_id, AgentState::Failing)
            .is_err()
        {
            return;
        }
        // Give up on this incarnation without draining; the inbox survives
        // for the next one.
        let aborted = {
            let mut entry = match self.supervised.get_mut(&agent_id) {
                Some(entry) => entry,
                None => return,
            };
            entry.handle.take()
        };
        if let Some(handle) = aborted {
            handle.abort();
            // Anything mid-handler when the task died re-enters the retry
            // path so at-least-once holds across incarnations.
            for message_id in handle.vitals().take_in_hand() {
                self.bus
                    .ack(message_id, AckOutcome::Rejected(RejectReason::Transient))
                    .await;
            }
        }
        self.alerts
            .emit(Alert {
                severity: AlertSeverity::Warning,
                category: AlertCategory::Lifecycle,
                message: format!("agent {agent_id} failing; restart policy engaged"),
                correlation_id: None,
            })
            .await;
    }

    async fn drive_failing(&self, agent_id: AgentId) {
        let action = {
            let Some(mut entry) = self.supervised.get_mut(&agent_id) else {
                return;
            };
            if entry.restart_pending {
                FailingAction::Wait
            } else if entry.restart_attempts >= self.config.max_restarts.as_u32() {
                FailingAction::DeclareDead
            } else {
                entry.restart_pending = true;
                FailingAction::ScheduleRestart {
                    attempt: entry.restart_attempts,
                }
            }
        };

        match action {
            FailingAction::Wait => {}
            FailingAction::DeclareDead => self.declare_dead(agent_id).await,
            FailingAction::ScheduleRestart { attempt } => {
                let Some(supervisor) = self.weak_self.upgrade() else {
                    return;
                };
                let delay = restart_backoff(
                    self.config.restart_base_ms.as_duration(),
                    attempt,
                    self.config.max_backoff_ms.as_duration(),
                );
                debug!(%agent_id, attempt, ?delay, "scheduling restart");
                tokio::spawn(async move {
                    supervisor.clock.sleep(delay).await;
                    supervisor.execute_restart(agent_id, attempt).await;
                });
            }
        }
    }

    async fn execute_restart(&self, agent_id: AgentId, attempt: u32) {
        let still_failing = self
            .registry
            .get(agent_id)
            .is_ok_and(|descriptor| descriptor.state == AgentState::Failing);
        if !still_failing {
            if let Some(mut entry) = self.supervised.get_mut(&agent_id) {
                entry.restart_pending = false;
            }
            return;
        }

        if self
            .registry
            .update_state(agent_id, AgentState::Starting)
            .is_err()
        {
            return;
        }
        if let Some(mut entry) = self.supervised.get_mut(&agent_id) {
            entry.restart_attempts = attempt + 1;
            entry.restart_pending = false;
        }
        self.metrics.record_restart(agent_id);
        info!(%agent_id, attempt = attempt + 1, "restarting agent");
        if let Err(error) = self.spawn_runner(agent_id) {
            warn!(%agent_id, %error, "restart spawn failed");
            let _ = self.registry.update_state(agent_id, AgentState::Failing);
        }
    }

    async fn declare_dead(&self, agent_id: AgentId) {
        if self
            .registry
            .update_state(agent_id, AgentState::Dead)
            .is_err()
        {
            return;
        }
        self.bus.close_inbox(agent_id);
        // Nothing will ever consume this queue again; give every entry its
        // terminal outcome.
        if let Some(inbox) = self.bus.inbox(agent_id) {
            for message in inbox.drain_remaining() {
                self.bus
                    .dead_letter(message.message_id, DeadLetterReason::Undrained)
                    .await;
            }
        }
        warn!(%agent_id, "restart budget exhausted; agent is dead");

        let correlation_id = CorrelationId::generate();
        self.alerts
            .emit(Alert {
                severity: AlertSeverity::Critical,
                category: AlertCategory::Lifecycle,
                message: format!("agent {agent_id} exhausted its restart budget and is dead"),
                correlation_id: Some(correlation_id),
            })
            .await;

        // Tell the fleet through the bus as well.
        if let Ok(payload) = Payload::json(&json!({
            "event": "agent_dead",
            "agent_id": agent_id.to_string(),
        })) {
            let draft = MessageDraft::new(
                Sender::External,
                Address::Broadcast,
                MessageKind::StatusUpdate,
                payload,
            )
            .with_priority(MessagePriority::Critical)
            .with_ack_policy(AckPolicy::FireAndForget)
            .with_correlation_id(correlation_id);
            if let Err(error) = self.bus.send(draft).await {
                debug!(%error, "dead-agent broadcast not delivered");
            }
        }

        if let Err(error) = self
            .audit
            .record_terminal(
                Actor::Operator,
                ActionCategory::StateChange,
                correlation_id,
                ActionStatus::Completed,
                json!({
                    "event": "agent_dead",
                    "agent_id": agent_id.to_string(),
                }),
            )
            .await
        {
            warn!(%error, "dead-agent audit record lost");
        }
    }

    /// Stops every stoppable agent, waits up to the global shutdown deadline,
    /// and abandons (aborts) stragglers with a log record.
    pub async fn shutdown_all(&self) {
        self.cancel.cancel();
        if let Some(task) = self
            .poll_task
            .lock()
            .expect("poll task lock poisoned")
            .take()
        {
            task.abort();
        }

        for descriptor in self.registry.list(&ListFilter::default()) {
            if descriptor.state.can_stop() {
                if let Err(error) = self.stop(descriptor.id).await {
                    debug!(agent_id = %descriptor.id, %error, "stop during shutdown");
                }
            }
        }

        let mut handles: Vec<(AgentId, RunnerHandle)> = Vec::new();
        for mut entry in self.supervised.iter_mut() {
            let agent_id = *entry.key();
            if let Some(handle) = entry.value_mut().handle.take() {
                handles.push((agent_id, handle));
            }
        }

        let deadline = self.clock.instant() + self.config.shutdown_deadline_ms.as_duration();
        for (agent_id, mut handle) in handles {
            let remaining = deadline.saturating_duration_since(self.clock.instant());
            if tokio::time::timeout(remaining, handle.wait()).await.is_err() {
                warn!(%agent_id, "agent still running past the shutdown deadline; abandoned");
                handle.abort();
            }
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("supervised", &self.supervised.len())
            .finish_non_exhaustive()
    }
}

/// Exponential restart backoff: `base * 2^attempt`, capped.
fn restart_backoff(base: Duration, attempt: u32, cap: Duration) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(attempt.min(16))).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_backoff_doubles_then_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(5);
        assert_eq!(restart_backoff(base, 0, cap), Duration::from_millis(100));
        assert_eq!(restart_backoff(base, 1, cap), Duration::from_millis(200));
        assert_eq!(restart_backoff(base, 2, cap), Duration::from_millis(400));
        assert_eq!(restart_backoff(base, 10, cap), cap);
    }
}
