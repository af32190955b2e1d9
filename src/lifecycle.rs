//! Agent lifecycle state machine
//!
//! Defines the states an agent moves through from registration to removal and
//! the closed set of legal transitions between them. Every state change in
//! the runtime funnels through [`AgentState::can_transition_to`], so the
//! registry can reject anything outside this machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain_types::AgentId;

/// Lifecycle state of a registered agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Registered but never started
    Registered,
    /// Initialization in progress
    Starting,
    /// Actively handling messages
    Running,
    /// Alive, no recent traffic
    Idle,
    /// Failing health checks but still serving
    Degraded,
    /// Given up on the current incarnation; awaiting restart or death
    Failing,
    /// Refusing new messages, draining the inbox
    Stopping,
    /// Drained and halted; only deregistration remains
    Stopped,
    /// Exhausted its restart budget
    Dead,
}

impl AgentState {
    /// All states that accept work and therefore appear in the capability index.
    pub const DELIVERABLE: [AgentState; 3] = [Self::Running, Self::Idle, Self::Degraded];

    /// Gets all valid next states from the current state.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [AgentState] {
        match self {
            Self::Registered => &[Self::Starting],
            Self::Starting => &[Self::Running, Self::Failing, Self::Stopping],
            Self::Running => &[Self::Idle, Self::Degraded, Self::Stopping],
            Self::Idle => &[Self::Running, Self::Degraded, Self::Stopping],
            Self::Degraded => &[Self::Running, Self::Failing, Self::Stopping],
            Self::Failing => &[Self::Starting, Self::Dead],
            Self::Stopping => &[Self::Stopped],
            // Operator restart brings a stopped agent back through Starting.
            Self::Stopped => &[Self::Starting],
            Self::Dead => &[],
        }
    }

    /// Validates whether a transition to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Whether the agent may receive new messages in this state.
    ///
    /// Stopping and the terminal states refuse; everything else queues, so
    /// traffic sent before `start` or during a restart window is retained.
    #[must_use]
    pub fn accepts_messages(&self) -> bool {
        !matches!(self, Self::Stopping | Self::Stopped | Self::Dead)
    }

    /// Whether the agent is eligible for capability-based dispatch.
    #[must_use]
    pub fn is_deliverable(&self) -> bool {
        Self::DELIVERABLE.contains(self)
    }

    /// Whether an operator `stop` is legal from this state.
    #[must_use]
    pub fn can_stop(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Idle | Self::Degraded
        )
    }

    /// Whether the state is terminal for supervision purposes.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Dead)
    }

    /// Whether deregistration is legal from this state.
    #[must_use]
    pub fn can_deregister(&self) -> bool {
        self.is_terminal()
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state_str = match self {
            Self::Registered => "registered",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Degraded => "degraded",
            Self::Failing => "failing",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Dead => "dead",
        };
        write!(f, "{state_str}")
    }
}

/// A state change applied to a descriptor, reported to callers and audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    /// The agent whose state changed.
    pub agent_id: AgentId,
    /// State before the change.
    pub from: AgentState,
    /// State after the change.
    pub to: AgentState,
}

/// Error raised when a requested transition is outside the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition for {agent_id}: {from} -> {to}")]
pub struct TransitionError {
    /// The agent the transition was requested for.
    pub agent_id: AgentId,
    /// Current state.
    pub from: AgentState,
    /// Requested state.
    pub to: AgentState,
}
