//! Storage boundary
//!
//! The runtime consumes a key-value store for descriptor persistence on
//! graceful shutdown and warm restart; durable engines live outside the
//! core. The in-memory implementation here backs tests and the default
//! deployment.
//!
//! Persisted layout:
//! - `agents/<id>`: descriptor snapshot
//! - `inbox/<id>/<message_id>`: queued message (durable configuration only)
//! - `audit/<bucket>/<action_id>`: action record, bucketed by epoch day

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::audit::ActionRecord;
use crate::config::AgentConfig;
use crate::domain_types::{AgentId, AgentName, CapabilityName, Timestamp};
use crate::lifecycle::AgentState;
use crate::messaging::message::Message;
use crate::registry::AgentDescriptor;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing store failed.
    #[error("storage backend error: {message}")]
    Backend {
        /// Backend-specific description.
        message: String,
    },

    /// A stored value did not decode.
    #[error("stored value did not decode: {source}")]
    Codec {
        /// Underlying serde failure.
        #[from]
        source: serde_json::Error,
    },
}

/// Key-value store consumed by the runtime
#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    /// Reads a key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Writes a key.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Deletes a key; absent keys are fine.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Lists keys under a prefix, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// In-memory store for tests and non-durable deployments
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Descriptor snapshot as persisted under `agents/<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedAgent {
    /// The agent's id, reused on warm restart.
    pub id: AgentId,
    /// Name.
    pub name: AgentName,
    /// Declared capabilities.
    pub capabilities: BTreeSet<CapabilityName>,
    /// Declared relationships.
    pub relationships: BTreeSet<AgentId>,
    /// State at shutdown; informational only, since restore always lands in
    /// `Registered`.
    pub last_state: AgentState,
    /// Heartbeat at shutdown.
    pub last_heartbeat_at: Timestamp,
    /// Per-agent configuration, including the blueprint to re-instantiate.
    pub config: AgentConfig,
}

impl From<&AgentDescriptor> for PersistedAgent {
    fn from(descriptor: &AgentDescriptor) -> Self {
        Self {
            id: descriptor.id,
            name: descriptor.name.clone(),
            capabilities: descriptor.capabilities.clone(),
            relationships: descriptor.relationships.clone(),
            last_state: descriptor.state,
            last_heartbeat_at: descriptor.last_heartbeat_at,
            config: descriptor.config.clone(),
        }
    }
}

impl PersistedAgent {
    /// Rebuilds a descriptor; the registry forces it to `Registered`.
    #[must_use]
    pub fn into_descriptor(self) -> AgentDescriptor {
        AgentDescriptor {
            id: self.id,
            name: self.name,
            capabilities: self.capabilities,
            relationships: self.relationships,
            state: AgentState::Registered,
            last_heartbeat_at: self.last_heartbeat_at,
            consecutive_failures: 0,
            config: self.config,
        }
    }
}

fn agent_key(id: AgentId) -> String {
    format!("agents/{id}")
}

fn inbox_key(agent_id: AgentId, message: &Message) -> String {
    format!("inbox/{agent_id}/{}", message.message_id)
}

fn audit_key(record: &ActionRecord) -> String {
    let bucket = record.started_at.as_epoch_nanos() / 86_400_000_000_000;
    format!("audit/{bucket}/{}", record.action_id)
}

/// Writes one descriptor snapshot.
///
/// # Errors
/// Propagates backend and encoding failures.
pub async fn save_agent(
    store: &dyn KeyValueStore,
    descriptor: &AgentDescriptor,
) -> Result<(), StorageError> {
    let snapshot = PersistedAgent::from(descriptor);
    store
        .put(&agent_key(snapshot.id), serde_json::to_vec(&snapshot)?)
        .await
}

/// Writes an agent's queued messages under `inbox/<id>/`.
///
/// # Errors
/// Propagates backend and encoding failures.
pub async fn save_inbox(
    store: &dyn KeyValueStore,
    agent_id: AgentId,
    messages: &[Message],
) -> Result<(), StorageError> {
    for message in messages {
        store
            .put(&inbox_key(agent_id, message), serde_json::to_vec(message)?)
            .await?;
    }
    Ok(())
}

/// Writes audit records bucketed by epoch day.
///
/// # Errors
/// Propagates backend and encoding failures.
pub async fn save_audit(
    store: &dyn KeyValueStore,
    records: &[ActionRecord],
) -> Result<(), StorageError> {
    for record in records {
        store
            .put(&audit_key(record), serde_json::to_vec(record)?)
            .await?;
    }
    Ok(())
}

/// Loads every persisted descriptor, id order.
///
/// # Errors
/// Propagates backend and decoding failures.
pub async fn load_agents(store: &dyn KeyValueStore) -> Result<Vec<PersistedAgent>, StorageError> {
    let mut agents = Vec::new();
    for key in store.list("agents/").await? {
        if let Some(bytes) = store.get(&key).await? {
            agents.push(serde_json::from_slice::<PersistedAgent>(&bytes)?);
        }
    }
    agents.sort_by_key(|agent| agent.id);
    Ok(agents)
}

/// Loads an agent's persisted inbox in mint (send) order.
///
/// # Errors
/// Propagates backend and decoding failures.
pub async fn load_inbox(
    store: &dyn KeyValueStore,
    agent_id: AgentId,
) -> Result<Vec<Message>, StorageError> {
    let mut messages = Vec::new();
    for key in store.list(&format!("inbox/{agent_id}/")).await? {
        if let Some(bytes) = store.get(&key).await? {
            messages.push(serde_json::from_slice::<Message>(&bytes)?);
        }
    }
    messages.sort_by_key(|message| message.message_id);
    Ok(messages)
}

/// Deletes an agent's persisted inbox entries.
///
/// # Errors
/// Propagates backend failures.
pub async fn clear_inbox(
    store: &dyn KeyValueStore,
    agent_id: AgentId,
) -> Result<(), StorageError> {
    for key in store.list(&format!("inbox/{agent_id}/")).await? {
        store.delete(&key).await?;
    }
    Ok(())
}
