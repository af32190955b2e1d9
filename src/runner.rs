//! Agent runner
//!
//! One long-running task per started agent: consume the inbox, invoke the
//! agent's handler under its time budget, acknowledge, heartbeat. Handling is
//! strictly sequential per agent unless the agent's config opts into
//! reentrancy; across agents everything is concurrent. The runner observes
//! its cancellation token at every dequeue point, so a stop request turns
//! into a bounded drain, never an interrupted handler.

use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, AgentContext, HandlerError};
use crate::alert::{Alert, AlertCategory, AlertSeverity, AlertSink};
use crate::audit::{ActionCategory, ActionPolicy, ActionStatus, Actor, AuditLog};
use crate::domain_types::{ActionId, AgentId, MessageId};
use crate::lifecycle::AgentState;
use crate::messaging::bus::MessageBus;
use crate::messaging::inbox::AgentInbox;
use crate::messaging::message::{
    AckOutcome, DeadLetterReason, Message, MessageKind, RejectReason,
};
use crate::metrics::MetricsRegistry;
use crate::registry::Registry;
use crate::time::Clock;

/// Concurrency cap for agents that opt into reentrant handling.
const REENTRANT_LIMIT: usize = 32;

/// Per-window handler outcome counters plus the messages currently being
/// handled, sampled and recovered by the supervisor.
#[derive(Debug, Default)]
pub struct AgentVitals {
    window_ok: AtomicU64,
    window_err: AtomicU64,
    in_hand: Mutex<Vec<MessageId>>,
}

impl AgentVitals {
    fn record_ok(&self) {
        self.window_ok.fetch_add(1, Ordering::Relaxed);
    }

    fn record_err(&self) {
        self.window_err.fetch_add(1, Ordering::Relaxed);
    }

    fn begin_handling(&self, message_id: MessageId) {
        self.in_hand
            .lock()
            .expect("vitals lock poisoned")
            .push(message_id);
    }

    fn finish_handling(&self, message_id: MessageId) {
        self.in_hand
            .lock()
            .expect("vitals lock poisoned")
            .retain(|held| *held != message_id);
    }

    /// Takes and resets the `(ok, err)` counters for the closing window.
    #[must_use]
    pub fn drain_window(&self) -> (u64, u64) {
        (
            self.window_ok.swap(0, Ordering::Relaxed),
            self.window_err.swap(0, Ordering::Relaxed),
        )
    }

    /// Messages the runner held when it was aborted; the supervisor
    /// re-injects them as transient rejections so at-least-once holds.
    #[must_use]
    pub fn take_in_hand(&self) -> Vec<MessageId> {
        std::mem::take(&mut *self.in_hand.lock().expect("vitals lock poisoned"))
    }
}

/// Handle the supervisor keeps for a spawned runner.
#[derive(Debug)]
pub struct RunnerHandle {
    /// The agent this runner serves.
    pub agent_id: AgentId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    vitals: Arc<AgentVitals>,
}

impl RunnerHandle {
    /// Signals a cooperative stop; the runner drains and exits.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Hard-kills the task without draining; the inbox is retained.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Whether the runner task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the runner task to exit.
    pub async fn wait(&mut self) {
        let _ = (&mut self.task).await;
    }

    /// The runner's outcome counters.
    #[must_use]
    pub fn vitals(&self) -> &Arc<AgentVitals> {
        &self.vitals
    }
}

/// Everything a runner needs, assembled by the supervisor.
pub struct RunnerParams {
    /// The agent to serve.
    pub agent_id: AgentId,
    /// Its behavior.
    pub agent: Arc<dyn Agent>,
    /// Descriptor owner.
    pub registry: Arc<Registry>,
    /// Message transport.
    pub bus: Arc<MessageBus>,
    /// The agent's inbox.
    pub inbox: Arc<AgentInbox>,
    /// Action recording.
    pub audit: Arc<AuditLog>,
    /// Observability counters.
    pub metrics: Arc<MetricsRegistry>,
    /// Runtime clock.
    pub clock: Arc<Clock>,
    /// Operator-facing events.
    pub alerts: Arc<dyn AlertSink>,
    /// Destructive-action gate.
    pub policy: Arc<dyn ActionPolicy>,
    /// Handler time budget.
    pub handler_timeout: Duration,
    /// Quiet period before the agent is marked idle.
    pub idle_after: Duration,
    /// Drain budget on stop.
    pub drain_deadline: Duration,
    /// Whether handlers may overlap.
    pub reentrant: bool,
    /// Failure count that moves a degraded agent to failing; used to
    /// saturate the counter on a fatal handler error.
    pub failure_threshold: u32,
}

struct RunnerCore {
    agent_id: AgentId,
    agent: Arc<dyn Agent>,
    registry: Arc<Registry>,
    bus: Arc<MessageBus>,
    audit: Arc<AuditLog>,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<Clock>,
    alerts: Arc<dyn AlertSink>,
    policy: Arc<dyn ActionPolicy>,
    handler_timeout: Duration,
    failure_threshold: u32,
    vitals: Arc<AgentVitals>,
    fatal: AtomicBool,
}

impl RunnerCore {
    fn heartbeat(&self) {
        let _ = self.registry.record_heartbeat(self.agent_id, self.clock.now());
    }

    fn message_summary(message: &Message) -> Value {
        json!({
            "message_id": message.message_id.to_string(),
            "kind": message.kind.label(),
            "from": message.from.to_string(),
            "priority": message.priority.label(),
            "content_type": message.payload.content_type.to_string(),
            "payload_bytes": message.payload.len(),
        })
    }

    /// Handles one message end to end: policy gate, audit, invoke under the
    /// time budget, ack, heartbeat.
    async fn handle_one(&self, ctx: &AgentContext, message: Message) {
        let message_id = message.message_id;
        self.vitals.begin_handling(message_id);
        self.handle_inner(ctx, message).await;
        self.vitals.finish_handling(message_id);
    }

    async fn handle_inner(&self, ctx: &AgentContext, message: Message) {
        let message_id = message.message_id;
        let correlation_id = message.correlation_id;
        let category = self.agent.handler_category(message.kind);
        let needs_audit = message.kind == MessageKind::Control
            || matches!(
                category,
                ActionCategory::ExternalWrite
                    | ActionCategory::StateChange
                    | ActionCategory::Destructive
            );
        let summary = Self::message_summary(&message);
        let actor = Actor::Agent(self.agent_id);

        if category == ActionCategory::Destructive
            && !self.policy.allow(&actor, category, &summary)
        {
            debug!(agent_id = %self.agent_id, %message_id, "destructive action denied by policy");
            if let Err(audit_error) = self
                .audit
                .record_terminal(
                    actor,
                    category,
                    correlation_id,
                    ActionStatus::DeniedByPolicy,
                    summary,
                )
                .await
            {
                warn!(%audit_error, "policy denial audit record lost");
            }
            self.bus
                .ack(message_id, AckOutcome::Rejected(RejectReason::PolicyDenied))
                .await;
            return;
        }

        let action_id = if needs_audit {
            match self
                .audit
                .start_action(actor, category, correlation_id, summary)
                .await
            {
                Ok(action_id) => Some(action_id),
                Err(audit_error) => {
                    warn!(%audit_error, "action record lost; handling continues");
                    None
                }
            }
        } else {
            None
        };

        let started = self.clock.instant();
        let result = tokio::time::timeout(
            self.handler_timeout,
            self.agent.handle(ctx, message),
        )
        .await;
        self.metrics
            .observe_handler_duration(self.agent_id, started.elapsed());

        match result {
            Err(_elapsed) => {
                self.vitals.record_err();
                // A timed-out handler still proves the runner loop is alive.
                self.heartbeat();
                self.finish_action(action_id, ActionStatus::Failed, json!({"error": "handler timeout"}))
                    .await;
                self.bus
                    .ack(
                        message_id,
                        AckOutcome::Rejected(RejectReason::HandlerTimeout),
                    )
                    .await;
            }
            Ok(Ok(())) => {
                self.vitals.record_ok();
                self.heartbeat();
                self.finish_action(action_id, ActionStatus::Completed, Value::Null)
                    .await;
                self.bus.ack(message_id, AckOutcome::Handled).await;
            }
            Ok(Err(handler_error)) => {
                self.vitals.record_err();
                self.settle_failure(message_id, action_id, handler_error)
                    .await;
            }
        }
    }

    async fn settle_failure(
        &self,
        message_id: MessageId,
        action_id: Option<ActionId>,
        handler_error: HandlerError,
    ) {
        let detail = json!({"error": handler_error.to_string()});
        match handler_error {
            HandlerError::Transient { .. } => {
                self.finish_action(action_id, ActionStatus::Failed, detail).await;
                self.bus
                    .ack(message_id, AckOutcome::Rejected(RejectReason::Transient))
                    .await;
            }
            HandlerError::Permanent { .. } => {
                self.finish_action(action_id, ActionStatus::Failed, detail).await;
                self.bus
                    .ack(message_id, AckOutcome::Rejected(RejectReason::Permanent))
                    .await;
            }
            HandlerError::Policy { .. } => {
                self.finish_action(action_id, ActionStatus::DeniedByPolicy, detail)
                    .await;
                self.bus
                    .ack(message_id, AckOutcome::Rejected(RejectReason::PolicyDenied))
                    .await;
            }
            HandlerError::Fatal { ref reason } => {
                error!(agent_id = %self.agent_id, %reason, "fatal handler error; aborting agent task");
                self.finish_action(action_id, ActionStatus::Failed, detail).await;
                // Keep the message for the next incarnation.
                self.bus
                    .ack(message_id, AckOutcome::Rejected(RejectReason::Transient))
                    .await;
                self.alerts
                    .emit(Alert {
                        severity: AlertSeverity::Critical,
                        category: AlertCategory::Health,
                        message: format!(
                            "agent {} hit a fatal invariant violation: {reason}",
                            self.agent_id
                        ),
                        correlation_id: None,
                    })
                    .await;
                // Contain the fault: degrade, saturate the failure counter,
                // and hand the incarnation to the supervisor's restart path.
                let _ = self.registry.update_state(self.agent_id, AgentState::Degraded);
                let _ = self
                    .registry
                    .force_failures(self.agent_id, self.failure_threshold);
                let _ = self.registry.update_state(self.agent_id, AgentState::Failing);
                self.fatal.store(true, Ordering::SeqCst);
            }
        }
    }

    async fn finish_action(
        &self,
        action_id: Option<ActionId>,
        status: ActionStatus,
        outputs: Value,
    ) {
        if let Some(action_id) = action_id {
            if let Err(audit_error) = self.audit.update_action(action_id, status, outputs).await {
                warn!(%audit_error, "action update lost");
            }
        }
    }
}

/// Per-agent event loop
pub struct Runner {
    core: Arc<RunnerCore>,
    inbox: Arc<AgentInbox>,
    cancel: CancellationToken,
    idle_after: Duration,
    drain_deadline: Duration,
    reentrant: bool,
}

impl Runner {
    /// Spawns the runner task and returns its handle.
    #[must_use]
    pub fn spawn(params: RunnerParams) -> RunnerHandle {
        let vitals = Arc::new(AgentVitals::default());
        let cancel = CancellationToken::new();
        let core = Arc::new(RunnerCore {
            agent_id: params.agent_id,
            agent: params.agent,
            registry: params.registry,
            bus: params.bus,
            audit: params.audit,
            metrics: params.metrics,
            clock: params.clock,
            alerts: params.alerts,
            policy: params.policy,
            handler_timeout: params.handler_timeout,
            failure_threshold: params.failure_threshold,
            vitals: Arc::clone(&vitals),
            fatal: AtomicBool::new(false),
        });
        let runner = Runner {
            core,
            inbox: params.inbox,
            cancel: cancel.clone(),
            idle_after: params.idle_after,
            drain_deadline: params.drain_deadline,
            reentrant: params.reentrant,
        };
        let agent_id = params.agent_id;
        let task = tokio::spawn(runner.run());

        RunnerHandle {
            agent_id,
            cancel,
            task,
            vitals,
        }
    }

    async fn run(self) {
        let core = &self.core;
        let agent_id = core.agent_id;
        let ctx = AgentContext::new(agent_id, Arc::clone(&core.bus), Arc::clone(&core.clock));

        // Initialization runs under the same budget as a handler.
        let init = tokio::time::timeout(core.handler_timeout, core.agent.initialize(&ctx)).await;
        match init {
            Ok(Ok(())) => {
                if core
                    .registry
                    .update_state(agent_id, AgentState::Running)
                    .is_err()
                {
                    // Raced with a stop; fall through to the drain path.
                    debug!(%agent_id, "start raced with stop");
                } else {
                    core.heartbeat();
                    info!(%agent_id, "agent running");
                }
            }
            Ok(Err(init_error)) => {
                warn!(%agent_id, %init_error, "agent initialization failed");
                let _ = core.registry.update_state(agent_id, AgentState::Failing);
                core.agent.shutdown().await;
                return;
            }
            Err(_elapsed) => {
                warn!(%agent_id, "agent initialization timed out");
                let _ = core.registry.update_state(agent_id, AgentState::Failing);
                core.agent.shutdown().await;
                return;
            }
        }

        let reentrant_slots = Arc::new(Semaphore::new(REENTRANT_LIMIT));
        loop {
            if self.cancel.is_cancelled() || core.fatal.load(Ordering::SeqCst) {
                break;
            }

            let next =
                tokio::time::timeout(self.idle_after, core.bus.next_deliverable(&self.inbox, &self.cancel))
                    .await;
            match next {
                Ok(Some(message)) => {
                    self.wake_if_idle();
                    if self.reentrant {
                        let permit = Arc::clone(&reentrant_slots)
                            .acquire_owned()
                            .await
                            .expect("reentrant semaphore closed");
                        let core = Arc::clone(core);
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            core.handle_one(&ctx, message).await;
                            drop(permit);
                        });
                    } else {
                        core.handle_one(&ctx, message).await;
                    }
                }
                // Cancelled, or the inbox closed and drained dry.
                Ok(None) => break,
                Err(_quiet) => self.mark_idle(),
            }
        }

        if core.fatal.load(Ordering::SeqCst) {
            // Fatal containment: leave the inbox for the next incarnation.
            core.agent.shutdown().await;
            return;
        }

        self.drain(&ctx).await;
        let _ = core.registry.update_state(agent_id, AgentState::Stopped);
        core.agent.shutdown().await;
        info!(%agent_id, "agent stopped");
    }

    fn wake_if_idle(&self) {
        let core = &self.core;
        if let Ok(descriptor) = core.registry.get(core.agent_id) {
            if descriptor.state == AgentState::Idle {
                let _ = core
                    .registry
                    .update_state(core.agent_id, AgentState::Running);
            }
        }
    }

    fn mark_idle(&self) {
        let core = &self.core;
        // The loop is alive even with no traffic; refresh the heartbeat so
        // quiet agents do not read as stale.
        core.heartbeat();
        if let Ok(descriptor) = core.registry.get(core.agent_id) {
            if descriptor.state == AgentState::Running {
                let _ = core.registry.update_state(core.agent_id, AgentState::Idle);
            }
        }
    }

    /// Drains the inbox after a stop: Critical first, each message under the
    /// handler budget, all bounded by the drain deadline. Whatever remains is
    /// dead-lettered.
    async fn drain(&self, ctx: &AgentContext) {
        let core = &self.core;
        let deadline = core.clock.instant() + self.drain_deadline;

        while core.clock.instant() < deadline {
            let Some(message) = self.inbox.try_pop() else {
                break;
            };
            if message.is_expired(core.clock.now()) {
                core.bus
                    .dead_letter(message.message_id, DeadLetterReason::Deadline)
                    .await;
                continue;
            }
            core.handle_one(ctx, message).await;
        }

        for message in self.inbox.drain_remaining() {
            core.bus
                .dead_letter(message.message_id, DeadLetterReason::Undrained)
                .await;
        }
    }
}
