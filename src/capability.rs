//! Capability index
//!
//! Inverted index from capability tag to the agents currently able to serve
//! it. Reads take a copy-on-write snapshot so dispatch never contends with
//! registration; writers rebuild and swap the snapshot under a short
//! exclusive lock. Only agents in a deliverable lifecycle state appear here;
//! the registry updates this index inside the same critical section as every
//! state change.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::domain_types::{AgentId, CapabilityName};
use crate::lifecycle::AgentState;

/// Recipient selection policy for capability-addressed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RoutingPolicy {
    /// First candidate in stable (id) order.
    #[default]
    Any,
    /// Candidate with the shallowest inbox; ties break on id order.
    LeastLoaded,
    /// Per-capability rotating cursor over stably-ordered candidates.
    RoundRobin,
    /// That agent when it holds the capability and is settled
    /// (Running or Idle); otherwise falls back to `LeastLoaded`.
    Preferred(AgentId),
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    id: AgentId,
    state: AgentState,
}

type Snapshot = HashMap<CapabilityName, Vec<Entry>>;

/// Inverted index capability -> deliverable agents
#[derive(Debug, Default)]
pub struct CapabilityIndex {
    table: RwLock<Arc<Snapshot>>,
    cursors: DashMap<CapabilityName, AtomicUsize>,
}

impl CapabilityIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.table.read().expect("capability index lock poisoned"))
    }

    fn swap<F: FnOnce(&mut Snapshot)>(&self, mutate: F) {
        let mut guard = self.table.write().expect("capability index lock poisoned");
        let mut next: Snapshot = (**guard).clone();
        mutate(&mut next);
        *guard = Arc::new(next);
    }

    /// Reconciles the index with an agent's capabilities and state.
    ///
    /// Deliverable states upsert one entry per capability; every other state
    /// removes the agent entirely. Called by the registry inside its own
    /// critical section, which is what keeps the index consistent with the
    /// descriptor set.
    pub fn set_agent<'a, I>(&self, id: AgentId, capabilities: I, state: AgentState)
    where
        I: IntoIterator<Item = &'a CapabilityName>,
    {
        if state.is_deliverable() {
            let capabilities: Vec<CapabilityName> = capabilities.into_iter().cloned().collect();
            self.swap(|table| {
                for capability in &capabilities {
                    let entries = table.entry(capability.clone()).or_default();
                    match entries.iter_mut().find(|entry| entry.id == id) {
                        Some(entry) => entry.state = state,
                        None => {
                            entries.push(Entry { id, state });
                            entries.sort_by_key(|entry| entry.id);
                        }
                    }
                }
            });
        } else {
            self.remove_agent(id);
        }
    }

    /// Removes every entry for `id`.
    pub fn remove_agent(&self, id: AgentId) {
        self.swap(|table| {
            table.retain(|_, entries| {
                entries.retain(|entry| entry.id != id);
                !entries.is_empty()
            });
        });
    }

    /// Agents currently able to serve `capability`, in stable id order.
    #[must_use]
    pub fn candidates(&self, capability: &CapabilityName) -> Vec<AgentId> {
        self.snapshot()
            .get(capability)
            .map(|entries| entries.iter().map(|entry| entry.id).collect())
            .unwrap_or_default()
    }

    /// Every capability currently served, with its candidate count.
    #[must_use]
    pub fn capabilities(&self) -> Vec<(CapabilityName, usize)> {
        let mut listed: Vec<(CapabilityName, usize)> = self
            .snapshot()
            .iter()
            .map(|(capability, entries)| (capability.clone(), entries.len()))
            .collect();
        listed.sort_by(|a, b| a.0.cmp(&b.0));
        listed
    }

    /// Selects a recipient for `capability` under `policy`.
    ///
    /// `inbox_depth` supplies the current queue depth per candidate for
    /// `LeastLoaded` ranking. Selection is deterministic given equal inputs:
    /// depth ties break on id order and the round-robin cursor walks a
    /// stably-ordered candidate list.
    pub fn resolve(
        &self,
        capability: &CapabilityName,
        policy: RoutingPolicy,
        inbox_depth: impl Fn(AgentId) -> usize,
    ) -> Option<AgentId> {
        let snapshot = self.snapshot();
        let entries = snapshot.get(capability)?;
        if entries.is_empty() {
            return None;
        }

        match policy {
            RoutingPolicy::Any => entries.first().map(|entry| entry.id),
            RoutingPolicy::LeastLoaded => least_loaded(entries, &inbox_depth),
            RoutingPolicy::RoundRobin => {
                let cursor = self
                    .cursors
                    .entry(capability.clone())
                    .or_insert_with(|| AtomicUsize::new(0));
                let position = cursor.fetch_add(1, Ordering::Relaxed) % entries.len();
                Some(entries[position].id)
            }
            RoutingPolicy::Preferred(preferred) => {
                let settled = entries.iter().any(|entry| {
                    entry.id == preferred
                        && matches!(entry.state, AgentState::Running | AgentState::Idle)
                });
                if settled {
                    Some(preferred)
                } else {
                    least_loaded(entries, &inbox_depth)
                }
            }
        }
    }
}

fn least_loaded(entries: &[Entry], inbox_depth: &impl Fn(AgentId) -> usize) -> Option<AgentId> {
    entries
        .iter()
        .map(|entry| (inbox_depth(entry.id), entry.id))
        .min()
        .map(|(_, id)| id)
}
