mod episodic;
mod procedural;
mod semantic;
mod working;

pub use episodic::{EpisodicMemory, EpisodicOptions};
pub use procedural::{ProceduralMemory, ProceduralOptions};
pub use semantic::{SemanticMemory, SemanticOptions};
pub use working::{WorkingMemory, WorkingOptions};

pub(crate) use semantic::stored_confidence;

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::ConnectionManager;
use crate::error::{MemoryError, Result};
use crate::storage::{RecallOptions, StorageGateway};
use crate::{Memory, MemoryType};

/// Shared store/recall plumbing behind the four typed façades. The store
/// path is strict: a storage failure propagates. Discovery is scheduled only
/// after the write succeeded and never delays the returned id.
pub(crate) struct TypeStoreCore {
    storage: Arc<dyn StorageGateway>,
    connections: Option<Arc<ConnectionManager>>,
}

impl TypeStoreCore {
    pub(crate) fn new(
        storage: Arc<dyn StorageGateway>,
        connections: Option<Arc<ConnectionManager>>,
    ) -> Self {
        Self {
            storage,
            connections,
        }
    }

    pub(crate) fn storage(&self) -> &Arc<dyn StorageGateway> {
        &self.storage
    }

    /// Persist and schedule discovery. The enqueue is synchronous and its
    /// handle is dropped, so the caller observes only the storage latency.
    pub(crate) async fn persist(&self, memory: &Memory) -> Result<()> {
        self.storage
            .store(&memory.user_id, &memory.agent_id, memory)
            .await?;
        if let Some(manager) = &self.connections {
            let _ = manager.enqueue_discovery(&memory.user_id, &memory.agent_id, &memory.id);
        }
        Ok(())
    }

    pub(crate) async fn recall_typed(
        &self,
        user_id: &str,
        agent_id: &str,
        query: &str,
        memory_type: MemoryType,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        validate_scope(user_id, agent_id)?;
        let options = RecallOptions {
            memory_type: Some(memory_type),
            limit,
            ..Default::default()
        };
        Ok(self
            .storage
            .recall(user_id, agent_id, query, &options)
            .await?)
    }
}

pub(crate) fn validate_scope(user_id: &str, agent_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(MemoryError::InvalidUser);
    }
    if agent_id.trim().is_empty() {
        return Err(MemoryError::InvalidInput(
            "agent id must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Rough token estimate: 1 token per 4 characters.
pub(crate) fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() / 4) as u32
}

/// Cheap keyword extraction when the caller supplies none: distinct words
/// longer than 3 characters, first occurrences, capped.
pub(crate) fn extract_keywords(content: &str, cap: usize) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for word in content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(|w| w.to_lowercase())
    {
        if !keywords.contains(&word) {
            keywords.push(word);
            if keywords.len() >= cap {
                break;
            }
        }
    }
    keywords
}

/// Merge caller metadata under system metadata: system keys always win.
pub(crate) fn finalize_metadata(
    memory: &mut Memory,
    user_metadata: HashMap<String, serde_json::Value>,
    system_metadata: Vec<(&str, serde_json::Value)>,
) {
    memory.metadata = user_metadata;
    for (key, value) in system_metadata {
        memory.metadata.insert(key.to_string(), value);
    }
}
