//! Alert sink
//!
//! The channel for events an operator should *see*, as opposed to the
//! metrics they *monitor*. The supervisor and audit subsystems emit through
//! this trait; production wires it to structured logging, tests capture.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::domain_types::CorrelationId;

/// How urgently an operator should look.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Informational; routine lifecycle noise.
    Info,
    /// Something degraded but self-healing may resolve it.
    Warning,
    /// Operator intervention is likely required.
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Which subsystem raised the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    /// Agent lifecycle events (restarts, deaths).
    Lifecycle,
    /// Message delivery events (dead letters, sustained backpressure).
    Delivery,
    /// Health polling observations.
    Health,
    /// Audit subsystem events.
    Audit,
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Lifecycle => "lifecycle",
            Self::Delivery => "delivery",
            Self::Health => "health",
            Self::Audit => "audit",
        };
        f.write_str(label)
    }
}

/// A single operator-facing event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Urgency.
    pub severity: AlertSeverity,
    /// Originating subsystem.
    pub category: AlertCategory,
    /// Human-readable description.
    pub message: String,
    /// Link to the causal chain, when one exists.
    pub correlation_id: Option<CorrelationId>,
}

/// Destination for operator-facing events
#[async_trait]
pub trait AlertSink: Send + Sync + fmt::Debug {
    /// Emits one alert. Implementations must not block for long; the
    /// supervisor calls this from its poll loop.
    async fn emit(&self, alert: Alert);
}

/// Default sink: structured log records at a level matching severity.
#[derive(Debug, Clone, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn emit(&self, alert: Alert) {
        let correlation = alert
            .correlation_id
            .map_or_else(String::new, |id| id.to_string());
        match alert.severity {
            AlertSeverity::Info => {
                info!(category = %alert.category, correlation_id = %correlation, "{}", alert.message);
            }
            AlertSeverity::Warning => {
                warn!(category = %alert.category, correlation_id = %correlation, "{}", alert.message);
            }
            AlertSeverity::Critical => {
                error!(category = %alert.category, correlation_id = %correlation, "{}", alert.message);
            }
        }
    }
}

/// Test sink that retains every alert for assertions.
#[derive(Debug, Default)]
pub struct CapturingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl CapturingAlertSink {
    /// Creates an empty capturing sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far.
    #[must_use]
    pub fn captured(&self) -> Vec<Alert> {
        self.alerts.lock().expect("alert lock poisoned").clone()
    }

    /// Captured alerts at the given severity.
    #[must_use]
    pub fn with_severity(&self, severity: AlertSeverity) -> Vec<Alert> {
        self.captured()
            .into_iter()
            .filter(|alert| alert.severity == severity)
            .collect()
    }
}

#[async_trait]
impl AlertSink for CapturingAlertSink {
    async fn emit(&self, alert: Alert) {
        self.alerts.lock().expect("alert lock poisoned").push(alert);
    }
}
