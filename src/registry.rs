//! Agent registry
//!
//! Authoritative owner of agent descriptors. The table sits behind one
//! reader-preferring lock with short critical sections; every state change is
//! gated by the lifecycle state machine and reconciles the capability index
//! before the lock is released, so the index can never disagree with the
//! descriptor set.
//!
//! Lock hierarchy: Registry > Capability Index > individual inbox. The
//! registry calls downward into the index while holding its own lock; nothing
//! below ever calls back up.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};

use crate::capability::CapabilityIndex;
use crate::config::AgentConfig;
use crate::domain_types::{AgentId, AgentName, CapabilityName, Timestamp};
use crate::lifecycle::{AgentState, StateTransition, TransitionError};
use crate::time::{Clock, IdMinter};

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Name uniqueness is configured and the name is taken.
    #[error("agent name already registered: {name}")]
    DuplicateName {
        /// The colliding name.
        name: AgentName,
    },

    /// No descriptor exists for the id.
    #[error("no such agent: {agent_id}")]
    NoSuchAgent {
        /// The unknown id.
        agent_id: AgentId,
    },

    /// The operation is not legal in the agent's current state.
    #[error("agent {agent_id} is {state}; operation requires a terminal state")]
    IllegalState {
        /// The agent.
        agent_id: AgentId,
        /// Its current state.
        state: AgentState,
    },

    /// The requested state change is outside the lifecycle machine.
    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),
}

/// The runtime's record of an agent
///
/// `get` and `list` return immutable clones of this; mutation goes through
/// the registry's dedicated setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique, immutable for the life of the runtime.
    pub id: AgentId,
    /// Human-readable name.
    pub name: AgentName,
    /// Capability tags this agent serves.
    pub capabilities: BTreeSet<CapabilityName>,
    /// Advisory affinities; dispatch hints only, never access control.
    /// May form cycles; these are ids, resolved through the registry at
    /// use time.
    pub relationships: BTreeSet<AgentId>,
    /// Lifecycle state.
    pub state: AgentState,
    /// Last time a handler (or the runner's idle tick) reported liveness.
    pub last_heartbeat_at: Timestamp,
    /// Consecutive failed health samples.
    pub consecutive_failures: u32,
    /// Per-agent configuration record.
    pub config: AgentConfig,
}

/// Filter for `list`
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Only agents in this state.
    pub state: Option<AgentState>,
    /// Only agents declaring this capability.
    pub capability: Option<CapabilityName>,
    /// Only agents whose name starts with this prefix.
    pub name_prefix: Option<String>,
}

impl ListFilter {
    fn matches(&self, descriptor: &AgentDescriptor) -> bool {
        if let Some(state) = self.state {
            if descriptor.state != state {
                return false;
            }
        }
        if let Some(capability) = &self.capability {
            if !descriptor.capabilities.contains(capability) {
                return false;
            }
        }
        if let Some(prefix) = &self.name_prefix {
            if !descriptor.name.to_string().starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    by_id: HashMap<AgentId, AgentDescriptor>,
    by_name: HashMap<AgentName, AgentId>,
}

/// Authoritative mapping of agent id to descriptor
#[derive(Debug)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
    index: Arc<CapabilityIndex>,
    unique_names: bool,
    minter: Arc<IdMinter>,
    clock: Arc<Clock>,
}

impl Registry {
    /// Creates an empty registry over the given capability index.
    #[must_use]
    pub fn new(
        index: Arc<CapabilityIndex>,
        minter: Arc<IdMinter>,
        clock: Arc<Clock>,
        unique_names: bool,
    ) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            index,
            unique_names,
            minter,
            clock,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().expect("registry lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().expect("registry lock poisoned")
    }

    /// Registers a new agent in state `Registered` and returns its id.
    ///
    /// # Errors
    /// Returns [`RegistryError::DuplicateName`] when name uniqueness is
    /// configured and another live agent holds the name.
    pub fn register(
        &self,
        name: AgentName,
        capabilities: BTreeSet<CapabilityName>,
        relationships: BTreeSet<AgentId>,
        config: AgentConfig,
    ) -> Result<AgentId, RegistryError> {
        let mut inner = self.write();
        if self.unique_names && inner.by_name.contains_key(&name) {
            return Err(RegistryError::DuplicateName { name });
        }

        let id = self.minter.agent_id();
        let descriptor = AgentDescriptor {
            id,
            name: name.clone(),
            capabilities,
            relationships,
            state: AgentState::Registered,
            last_heartbeat_at: self.clock.now(),
            consecutive_failures: 0,
            config,
        };
        inner.by_name.insert(name.clone(), id);
        inner.by_id.insert(id, descriptor);
        drop(inner);

        info!(agent_id = %id, name = %name, "agent registered");
        Ok(id)
    }

    /// Re-inserts a persisted descriptor under its original id.
    ///
    /// The state is forced to `Registered`; a warm restart never resumes an
    /// agent directly into a running state.
    ///
    /// # Errors
    /// Returns [`RegistryError::DuplicateName`] on a name collision when
    /// uniqueness is configured.
    pub fn adopt(&self, mut descriptor: AgentDescriptor) -> Result<AgentId, RegistryError> {
        let mut inner = self.write();
        if self.unique_names && inner.by_name.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateName {
                name: descriptor.name,
            });
        }
        descriptor.state = AgentState::Registered;
        descriptor.consecutive_failures = 0;
        let id = descriptor.id;
        inner.by_name.insert(descriptor.name.clone(), id);
        inner.by_id.insert(id, descriptor);
        drop(inner);

        debug!(agent_id = %id, "descriptor adopted from persisted state");
        Ok(id)
    }

    /// Removes an agent's descriptor.
    ///
    /// # Errors
    /// Returns [`RegistryError::NoSuchAgent`] for unknown ids and
    /// [`RegistryError::IllegalState`] unless the agent is `Stopped` or
    /// `Dead`.
    pub fn deregister(&self, agent_id: AgentId) -> Result<AgentDescriptor, RegistryError> {
        let mut inner = self.write();
        let descriptor = inner
            .by_id
            .get(&agent_id)
            .ok_or(RegistryError::NoSuchAgent { agent_id })?;
        if !descriptor.state.can_deregister() {
            return Err(RegistryError::IllegalState {
                agent_id,
                state: descriptor.state,
            });
        }

        let descriptor = inner
            .by_id
            .remove(&agent_id)
            .ok_or(RegistryError::NoSuchAgent { agent_id })?;
        inner.by_name.remove(&descriptor.name);
        // Terminal states hold no index entries; the removal here only
        // matters if that invariant is ever broken upstream.
        self.index.remove_agent(agent_id);
        drop(inner);

        info!(agent_id = %agent_id, "agent deregistered");
        Ok(descriptor)
    }

    /// Returns an immutable snapshot of an agent's descriptor.
    ///
    /// # Errors
    /// Returns [`RegistryError::NoSuchAgent`] for unknown ids.
    pub fn get(&self, agent_id: AgentId) -> Result<AgentDescriptor, RegistryError> {
        self.read()
            .by_id
            .get(&agent_id)
            .cloned()
            .ok_or(RegistryError::NoSuchAgent { agent_id })
    }

    /// Applies a lifecycle transition, keeping the capability index in step.
    ///
    /// # Errors
    /// Returns [`RegistryError::NoSuchAgent`] for unknown ids and
    /// [`RegistryError::IllegalTransition`] when the change is outside the
    /// state machine.
    pub fn update_state(
        &self,
        agent_id: AgentId,
        new_state: AgentState,
    ) -> Result<StateTransition, RegistryError> {
        let mut inner = self.write();
        let descriptor = inner
            .by_id
            .get_mut(&agent_id)
            .ok_or(RegistryError::NoSuchAgent { agent_id })?;

        let from = descriptor.state;
        if !from.can_transition_to(new_state) {
            return Err(TransitionError {
                agent_id,
                from,
                to: new_state,
            }
            .into());
        }
        descriptor.state = new_state;
        self.index
            .set_agent(agent_id, descriptor.capabilities.iter(), new_state);
        drop(inner);

        debug!(agent_id = %agent_id, %from, to = %new_state, "state transition");
        Ok(StateTransition {
            agent_id,
            from,
            to: new_state,
        })
    }

    /// Records handler liveness.
    ///
    /// # Errors
    /// Returns [`RegistryError::NoSuchAgent`] for unknown ids.
    pub fn record_heartbeat(&self, agent_id: AgentId, at: Timestamp) -> Result<(), RegistryError> {
        let mut inner = self.write();
        let descriptor = inner
            .by_id
            .get_mut(&agent_id)
            .ok_or(RegistryError::NoSuchAgent { agent_id })?;
        descriptor.last_heartbeat_at = at;
        Ok(())
    }

    /// Increments the consecutive failure counter and returns the new value.
    ///
    /// # Errors
    /// Returns [`RegistryError::NoSuchAgent`] for unknown ids.
    pub fn record_failure(&self, agent_id: AgentId) -> Result<u32, RegistryError> {
        let mut inner = self.write();
        let descriptor = inner
            .by_id
            .get_mut(&agent_id)
            .ok_or(RegistryError::NoSuchAgent { agent_id })?;
        descriptor.consecutive_failures = descriptor.consecutive_failures.saturating_add(1);
        Ok(descriptor.consecutive_failures)
    }

    /// Raises the consecutive failure counter to at least `floor`.
    ///
    /// Used for fatal handler errors, which must tip the agent into the
    /// failing path on the next supervisor pass regardless of its history.
    ///
    /// # Errors
    /// Returns [`RegistryError::NoSuchAgent`] for unknown ids.
    pub fn force_failures(&self, agent_id: AgentId, floor: u32) -> Result<(), RegistryError> {
        let mut inner = self.write();
        let descriptor = inner
            .by_id
            .get_mut(&agent_id)
            .ok_or(RegistryError::NoSuchAgent { agent_id })?;
        descriptor.consecutive_failures = descriptor.consecutive_failures.max(floor);
        Ok(())
    }

    /// Clears the consecutive failure counter.
    ///
    /// # Errors
    /// Returns [`RegistryError::NoSuchAgent`] for unknown ids.
    pub fn reset_failures(&self, agent_id: AgentId) -> Result<(), RegistryError> {
        let mut inner = self.write();
        let descriptor = inner
            .by_id
            .get_mut(&agent_id)
            .ok_or(RegistryError::NoSuchAgent { agent_id })?;
        descriptor.consecutive_failures = 0;
        Ok(())
    }

    /// Lists descriptor snapshots matching `filter`, in id order.
    #[must_use]
    pub fn list(&self, filter: &ListFilter) -> Vec<AgentDescriptor> {
        let inner = self.read();
        let mut matched: Vec<AgentDescriptor> = inner
            .by_id
            .values()
            .filter(|descriptor| filter.matches(descriptor))
            .cloned()
            .collect();
        matched.sort_by_key(|descriptor| descriptor.id);
        matched
    }

    /// Every registered id, in id order.
    #[must_use]
    pub fn ids(&self) -> Vec<AgentId> {
        let inner = self.read();
        let mut ids: Vec<AgentId> = inner.by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    /// Whether no agents are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().by_id.is_empty()
    }

    /// Agent count per lifecycle state, for the `agents_total` gauge.
    #[must_use]
    pub fn count_by_state(&self) -> HashMap<AgentState, usize> {
        let inner = self.read();
        let mut counts = HashMap::new();
        for descriptor in inner.by_id.values() {
            *counts.entry(descriptor.state).or_insert(0) += 1;
        }
        counts
    }

    /// The capability index this registry maintains.
    #[must_use]
    pub fn capability_index(&self) -> &Arc<CapabilityIndex> {
        &self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::production_time_provider;

    fn registry(unique_names: bool) -> Registry {
        Registry::new(
            Arc::new(CapabilityIndex::new()),
            Arc::new(IdMinter::new()),
            Arc::new(Clock::new(production_time_provider())),
            unique_names,
        )
    }

    fn name(value: &str) -> AgentName {
        AgentName::try_new(value.to_string()).unwrap()
    }

    fn cap(tag: &str) -> CapabilityName {
        CapabilityName::try_new(tag.to_string()).unwrap()
    }

    fn register(registry: &Registry, agent_name: &str, caps: &[&str]) -> AgentId {
        registry
            .register(
                name(agent_name),
                caps.iter().map(|tag| cap(tag)).collect(),
                BTreeSet::new(),
                AgentConfig::default(),
            )
            .unwrap()
    }

    #[test]
    fn register_assigns_distinct_ordered_ids() {
        let registry = registry(true);
        let first = register(&registry, "alpha", &[]);
        let second = register(&registry, "beta", &[]);
        assert!(first < second);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_names_rejected_when_configured() {
        let registry = registry(true);
        register(&registry, "alpha", &[]);
        let result = registry.register(
            name("alpha"),
            BTreeSet::new(),
            BTreeSet::new(),
            AgentConfig::default(),
        );
        assert!(matches!(result, Err(RegistryError::DuplicateName { .. })));
    }

    #[test]
    fn duplicate_names_allowed_when_not_configured() {
        let registry = registry(false);
        register(&registry, "alpha", &[]);
        register(&registry, "alpha", &[]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn new_agents_start_registered_and_unindexed() {
        let registry = registry(true);
        let id = register(&registry, "alpha", &["pay"]);
        let descriptor = registry.get(id).unwrap();
        assert_eq!(descriptor.state, AgentState::Registered);
        assert!(registry.capability_index().candidates(&cap("pay")).is_empty());
    }

    #[test]
    fn index_follows_state_transitions() {
        let registry = registry(true);
        let id = register(&registry, "alpha", &["pay"]);

        registry.update_state(id, AgentState::Starting).unwrap();
        assert!(registry.capability_index().candidates(&cap("pay")).is_empty());

        registry.update_state(id, AgentState::Running).unwrap();
        assert_eq!(
            registry.capability_index().candidates(&cap("pay")),
            vec![id]
        );

        registry.update_state(id, AgentState::Stopping).unwrap();
        assert!(registry.capability_index().candidates(&cap("pay")).is_empty());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let registry = registry(true);
        let id = register(&registry, "alpha", &[]);
        let result = registry.update_state(id, AgentState::Running);
        assert!(matches!(
            result,
            Err(RegistryError::IllegalTransition(_))
        ));
        // Descriptor untouched.
        assert_eq!(registry.get(id).unwrap().state, AgentState::Registered);
    }

    #[test]
    fn deregister_requires_terminal_state() {
        let registry = registry(true);
        let id = register(&registry, "alpha", &[]);

        assert!(matches!(
            registry.deregister(id),
            Err(RegistryError::IllegalState { .. })
        ));

        registry.update_state(id, AgentState::Starting).unwrap();
        registry.update_state(id, AgentState::Stopping).unwrap();
        registry.update_state(id, AgentState::Stopped).unwrap();
        registry.deregister(id).unwrap();
        assert!(matches!(
            registry.get(id),
            Err(RegistryError::NoSuchAgent { .. })
        ));
    }

    #[test]
    fn deregister_frees_the_name() {
        let registry = registry(true);
        let id = register(&registry, "alpha", &[]);
        registry.update_state(id, AgentState::Starting).unwrap();
        registry.update_state(id, AgentState::Stopping).unwrap();
        registry.update_state(id, AgentState::Stopped).unwrap();
        registry.deregister(id).unwrap();

        register(&registry, "alpha", &[]);
    }

    #[test]
    fn failure_counters_round_trip() {
        let registry = registry(true);
        let id = register(&registry, "alpha", &[]);
        assert_eq!(registry.record_failure(id).unwrap(), 1);
        assert_eq!(registry.record_failure(id).unwrap(), 2);
        registry.reset_failures(id).unwrap();
        assert_eq!(registry.get(id).unwrap().consecutive_failures, 0);
    }

    #[test]
    fn list_filters_by_state_capability_and_prefix() {
        let registry = registry(true);
        let pay = register(&registry, "billing-pay", &["pay"]);
        let _search = register(&registry, "research", &["search"]);

        registry.update_state(pay, AgentState::Starting).unwrap();
        registry.update_state(pay, AgentState::Running).unwrap();

        let by_state = registry.list(&ListFilter {
            state: Some(AgentState::Running),
            ..ListFilter::default()
        });
        assert_eq!(by_state.len(), 1);
        assert_eq!(by_state[0].id, pay);

        let by_cap = registry.list(&ListFilter {
            capability: Some(cap("search")),
            ..ListFilter::default()
        });
        assert_eq!(by_cap.len(), 1);

        let by_prefix = registry.list(&ListFilter {
            name_prefix: Some("billing".to_string()),
            ..ListFilter::default()
        });
        assert_eq!(by_prefix.len(), 1);
        assert_eq!(by_prefix[0].id, pay);
    }

    #[test]
    fn adopt_forces_registered_state() {
        let reg = registry(true);
        let id = register(&reg, "alpha", &["pay"]);
        reg.update_state(id, AgentState::Starting).unwrap();
        reg.update_state(id, AgentState::Running).unwrap();
        let mut descriptor = reg.get(id).unwrap();
        descriptor.consecutive_failures = 4;

        let fresh = registry(false);
        let adopted = fresh.adopt(descriptor).unwrap();
        let restored = fresh.get(adopted).unwrap();
        assert_eq!(restored.state, AgentState::Registered);
        assert_eq!(restored.consecutive_failures, 0);
        assert_eq!(adopted, id);
    }
}
