//! Audit log
//!
//! Append-only record of consequential actions: lifecycle commands, control
//! messages, and any handler work declared state-changing or destructive.
//! Records flow through a bounded channel into a single writer task; a full
//! channel applies backpressure to callers rather than dropping. Retention is
//! a ring bounded by record count and age, whichever bound hits first.
//! Configured payload fields are replaced by a stable hash before a record
//! ever reaches the ring.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::alert::{Alert, AlertCategory, AlertSeverity, AlertSink};
use crate::domain_types::{
    ActionId, AgentId, AuditMaxAgeMs, AuditMaxRecords, ChannelCapacity, CorrelationId, Timestamp,
};
use crate::time::{Clock, IdMinter};

/// Category of an audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    /// Invocation of an external tool.
    ToolCall,
    /// Read against an external system.
    ExternalRead,
    /// Write against an external system.
    ExternalWrite,
    /// Mutation of runtime or domain state.
    StateChange,
    /// Irreversible effect; gated by the action policy.
    Destructive,
    /// Runtime control traffic.
    Control,
}

impl fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ToolCall => "tool_call",
            Self::ExternalRead => "external_read",
            Self::ExternalWrite => "external_write",
            Self::StateChange => "state_change",
            Self::Destructive => "destructive",
            Self::Control => "control",
        };
        f.write_str(label)
    }
}

/// Terminal or pending status of an audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Started, not yet finished.
    Pending,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Refused by the action policy before execution.
    DeniedByPolicy,
}

/// Who performed an audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// A registered agent.
    Agent(AgentId),
    /// A human or external system driving the control API.
    Operator,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "{id}"),
            Self::Operator => f.write_str("operator"),
        }
    }
}

/// One audited action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Unique, mint-ordered identifier.
    pub action_id: ActionId,
    /// Causal chain this action belongs to.
    pub correlation_id: CorrelationId,
    /// Who acted.
    pub actor: Actor,
    /// What category of action.
    pub kind: ActionCategory,
    /// Inputs with configured fields replaced by stable hashes.
    pub inputs_redacted: Value,
    /// Outputs with configured fields replaced by stable hashes.
    pub outputs_redacted: Value,
    /// Current status.
    pub status: ActionStatus,
    /// When the action started.
    pub started_at: Timestamp,
    /// When the action reached a terminal status.
    pub ended_at: Option<Timestamp>,
}

/// Filter for `query`
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Only records in this causal chain.
    pub correlation_id: Option<CorrelationId>,
    /// Only records by this actor.
    pub actor: Option<Actor>,
    /// Only records of this category.
    pub kind: Option<ActionCategory>,
    /// Only records in this status.
    pub status: Option<ActionStatus>,
    /// At most this many records, newest last.
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, record: &ActionRecord) -> bool {
        if let Some(correlation_id) = self.correlation_id {
            if record.correlation_id != correlation_id {
                return false;
            }
        }
        if let Some(actor) = self.actor {
            if record.actor != actor {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if record.kind != kind {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        true
    }
}

/// Audit errors
#[derive(Debug, Error)]
pub enum AuditError {
    /// The writer task is gone; the runtime is shutting down.
    #[error("audit writer is no longer accepting records")]
    WriterClosed,
}

/// Policy predicate gating destructive actions
///
/// Failing the predicate yields an audit record with status
/// `DeniedByPolicy` and the action is never executed.
pub trait ActionPolicy: Send + Sync + fmt::Debug {
    /// Whether `actor` may perform a `kind` action with these inputs.
    fn allow(&self, actor: &Actor, kind: ActionCategory, inputs: &Value) -> bool;
}

/// Policy that permits everything; the default.
#[derive(Debug, Clone, Default)]
pub struct AllowAllPolicy;

impl ActionPolicy for AllowAllPolicy {
    fn allow(&self, _actor: &Actor, _kind: ActionCategory, _inputs: &Value) -> bool {
        true
    }
}

/// Policy that refuses every destructive action; useful in tests.
#[derive(Debug, Clone, Default)]
pub struct DenyDestructivePolicy;

impl ActionPolicy for DenyDestructivePolicy {
    fn allow(&self, _actor: &Actor, kind: ActionCategory, _inputs: &Value) -> bool {
        kind != ActionCategory::Destructive
    }
}

enum AuditCommand {
    Append(ActionRecord),
    Update {
        action_id: ActionId,
        status: ActionStatus,
        outputs: Value,
        ended_at: Timestamp,
    },
    Flush(oneshot::Sender<()>),
}

/// Append-only audit log with a single writer task
#[derive(Debug)]
pub struct AuditLog {
    tx: mpsc::Sender<AuditCommand>,
    ring: Arc<RwLock<VecDeque<ActionRecord>>>,
    redact_fields: HashSet<String>,
    clock: Arc<Clock>,
    minter: Arc<IdMinter>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLog {
    /// Creates the log and spawns its writer task.
    #[must_use]
    pub fn new(
        clock: Arc<Clock>,
        minter: Arc<IdMinter>,
        alerts: Arc<dyn AlertSink>,
        channel_capacity: ChannelCapacity,
        max_records: AuditMaxRecords,
        max_age: AuditMaxAgeMs,
        redact_fields: Vec<String>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(channel_capacity.as_usize());
        let ring = Arc::new(RwLock::new(VecDeque::new()));
        let writer = spawn_writer(
            rx,
            Arc::clone(&ring),
            max_records.as_usize(),
            max_age.as_duration(),
            Arc::clone(&clock),
            alerts,
        );

        Self {
            tx,
            ring,
            redact_fields: redact_fields.into_iter().collect(),
            clock,
            minter,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Opens a `Pending` action record and returns its id.
    ///
    /// # Errors
    /// Returns [`AuditError::WriterClosed`] after shutdown.
    pub async fn start_action(
        &self,
        actor: Actor,
        kind: ActionCategory,
        correlation_id: CorrelationId,
        inputs: Value,
    ) -> Result<ActionId, AuditError> {
        let action_id = self.minter.action_id();
        let record = ActionRecord {
            action_id,
            correlation_id,
            actor,
            kind,
            inputs_redacted: self.redact(inputs),
            outputs_redacted: Value::Null,
            status: ActionStatus::Pending,
            started_at: self.clock.now(),
            ended_at: None,
        };
        self.tx
            .send(AuditCommand::Append(record))
            .await
            .map_err(|_| AuditError::WriterClosed)?;
        Ok(action_id)
    }

    /// Moves an action to a terminal status.
    ///
    /// # Errors
    /// Returns [`AuditError::WriterClosed`] after shutdown.
    pub async fn update_action(
        &self,
        action_id: ActionId,
        status: ActionStatus,
        outputs: Value,
    ) -> Result<(), AuditError> {
        self.tx
            .send(AuditCommand::Update {
                action_id,
                status,
                outputs: self.redact(outputs),
                ended_at: self.clock.now(),
            })
            .await
            .map_err(|_| AuditError::WriterClosed)
    }

    /// Appends an already-terminal record in one step.
    ///
    /// # Errors
    /// Returns [`AuditError::WriterClosed`] after shutdown.
    pub async fn record_terminal(
        &self,
        actor: Actor,
        kind: ActionCategory,
        correlation_id: CorrelationId,
        status: ActionStatus,
        inputs: Value,
    ) -> Result<ActionId, AuditError> {
        let action_id = self.minter.action_id();
        let now = self.clock.now();
        let record = ActionRecord {
            action_id,
            correlation_id,
            actor,
            kind,
            inputs_redacted: self.redact(inputs),
            outputs_redacted: Value::Null,
            status,
            started_at: now,
            ended_at: Some(now),
        };
        self.tx
            .send(AuditCommand::Append(record))
            .await
            .map_err(|_| AuditError::WriterClosed)?;
        Ok(action_id)
    }

    /// Waits until every record sent so far has been applied to the ring.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(AuditCommand::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Queries retained records, oldest first.
    #[must_use]
    pub fn query(&self, filter: &AuditFilter) -> Vec<ActionRecord> {
        let ring = self.ring.read().expect("audit ring lock poisoned");
        let matched: Vec<ActionRecord> = ring
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        match filter.limit {
            Some(limit) => {
                let skip = matched.len().saturating_sub(limit);
                matched.into_iter().skip(skip).collect()
            }
            None => matched,
        }
    }

    /// Replaces configured fields anywhere in `value` with a stable hash.
    #[must_use]
    pub fn redact(&self, value: Value) -> Value {
        if self.redact_fields.is_empty() {
            return value;
        }
        redact_value(value, &self.redact_fields)
    }

    /// Stops the writer after draining queued records.
    pub async fn shutdown(&self) {
        self.flush().await;
        let handle = self
            .writer
            .lock()
            .expect("audit writer lock poisoned")
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

fn spawn_writer(
    mut rx: mpsc::Receiver<AuditCommand>,
    ring: Arc<RwLock<VecDeque<ActionRecord>>>,
    max_records: usize,
    max_age: Duration,
    clock: Arc<Clock>,
    alerts: Arc<dyn AlertSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                AuditCommand::Append(record) => {
                    let mut ring = ring.write().expect("audit ring lock poisoned");
                    ring.push_back(record);
                    let horizon = clock.now();
                    while ring.len() > max_records
                        || ring.front().is_some_and(|oldest| {
                            horizon.saturating_duration_since(oldest.started_at) > max_age
                        })
                    {
                        ring.pop_front();
                    }
                }
                AuditCommand::Update {
                    action_id,
                    status,
                    outputs,
                    ended_at,
                } => {
                    let missed = {
                        let mut ring = ring.write().expect("audit ring lock poisoned");
                        match ring.iter_mut().rev().find(|r| r.action_id == action_id) {
                            Some(record) => {
                                record.status = status;
                                record.outputs_redacted = outputs;
                                record.ended_at = Some(ended_at);
                                false
                            }
                            None => true,
                        }
                    };
                    if missed {
                        // An action finished after retention evicted its
                        // record; the trail has a hole the operator should
                        // know about.
                        warn!(%action_id, "audit update for evicted or unknown action");
                        alerts
                            .emit(Alert {
                                severity: AlertSeverity::Warning,
                                category: AlertCategory::Audit,
                                message: format!(
                                    "action {action_id} finished after its record was evicted"
                                ),
                                correlation_id: None,
                            })
                            .await;
                    }
                }
                AuditCommand::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    })
}

fn redact_value(value: Value, fields: &HashSet<String>) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, nested)| {
                    if fields.contains(&key) {
                        let digest = stable_hash(&nested);
                        (key, Value::String(format!("redacted:{digest:016x}")))
                    } else {
                        (key, redact_value(nested, fields))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| redact_value(item, fields))
                .collect(),
        ),
        other => other,
    }
}

/// FNV-1a over the canonical JSON encoding; stable across processes.
fn stable_hash(value: &Value) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let encoded = value.to_string();
    let mut hash = OFFSET;
    for byte in encoded.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
