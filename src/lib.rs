//! # Hypha - Multi-Agent Orchestration Runtime
//!
//! Hypha is a long-lived process that hosts a fleet of cooperating agents,
//! routes typed messages between them, tracks their health, and exposes a
//! typed control API (with a thin HTTP shell) for inspection and lifecycle
//! commands. The runtime is domain-agnostic substrate: agents carry the
//! business logic, hypha supplies registration, capability-based dispatch,
//! supervised lifecycles, at-least-once messaging, audit, and metrics.
//!
//! ## Architecture
//!
//! ```text
//! Caller -> ControlApi -> Registry / Supervisor   (lifecycle)
//!                      -> MessageBus              (send)
//!                             |
//!                             v
//!                     AgentInbox -> Runner -> Agent handler
//!                             |                  |
//!                             v                  v
//!                       DeadLetterQueue    AuditLog / Metrics
//! ```
//!
//! The supervisor runs on its own cadence, sampling heartbeats, queue
//! depths, and handler error rates; it degrades, restarts, and eventually
//! declares agents dead under an exponential-backoff budget.
//!
//! ## Example
//!
//! ```rust,no_run
//! use hypha::{
//!     AgentBehavior, AgentRegistration, Runtime, RuntimeConfig,
//! };
//! use hypha::domain_types::{AgentName, CapabilityName};
//! use std::collections::BTreeSet;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = Runtime::builder(RuntimeConfig::development()).build()?;
//! runtime.start();
//!
//! let control = runtime.control();
//! let mut caps = BTreeSet::new();
//! caps.insert(CapabilityName::try_new("echo".to_string())?);
//! let id = control
//!     .register(AgentRegistration::new(
//!         AgentName::try_new("echo-1".to_string())?,
//!         caps,
//!         AgentBehavior::Blueprint("echo".to_string()),
//!     ))
//!     .await?;
//! control.start(id).await?;
//!
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod alert;
pub mod api;
pub mod audit;
pub mod capability;
pub mod config;
pub mod domain_types;
pub mod http_api;
pub mod lifecycle;
pub mod messaging;
pub mod metrics;
pub mod registry;
pub mod runner;
pub mod runtime;
pub mod storage;
pub mod supervisor;
pub mod time;

pub use crate::agent::{
    Agent, AgentBlueprint, AgentContext, BlueprintCatalog, EchoAgent, HandlerError, HandlerTable,
    HealthReport,
};
pub use crate::alert::{Alert, AlertCategory, AlertSeverity, AlertSink, CapturingAlertSink};
pub use crate::api::{AgentBehavior, AgentRegistration, ApiError, ControlApi};
pub use crate::audit::{
    ActionCategory, ActionPolicy, ActionRecord, ActionStatus, Actor, AuditFilter, AuditLog,
};
pub use crate::capability::{CapabilityIndex, RoutingPolicy};
pub use crate::config::{AgentConfig, ConfigError, RuntimeConfig};
pub use crate::lifecycle::{AgentState, StateTransition, TransitionError};
pub use crate::messaging::{
    AckOutcome, AckPolicy, Address, BusError, DeadLetterReason, DeliveryStatus, Message,
    MessageBus, MessageDraft, MessageKind, MessagePriority, Payload, RejectReason, SendReceipt,
    Sender,
};
pub use crate::metrics::{MetricsRegistry, MetricsSnapshot};
pub use crate::registry::{AgentDescriptor, ListFilter, Registry, RegistryError};
pub use crate::runtime::{RestoreReport, Runtime, RuntimeBuilder, RuntimeError};
pub use crate::storage::{KeyValueStore, MemoryStore};
pub use crate::supervisor::{Supervisor, SupervisorError};
pub use crate::time::{
    Clock, IdMinter, RealTimeProvider, TestTimeProvider, TimeProvider, production_time_provider,
    test_time_provider,
};
