use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use super::{estimate_tokens, extract_keywords, finalize_metadata, validate_scope, TypeStoreCore};
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::storage::StorageGateway;
use crate::{Memory, MemoryType};

/// Options for storing a semantic memory
#[derive(Debug, Clone)]
pub struct SemanticOptions {
    /// How certain the extractor was about this fact.
    pub confidence: f32,
    /// Where the fact came from ("conversation", "consolidation", ...).
    pub source: String,
    pub keywords: Vec<String>,
    pub importance: Option<f32>,
    pub session_id: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Default for SemanticOptions {
    fn default() -> Self {
        Self {
            confidence: 0.7,
            source: "conversation".to_string(),
            keywords: Vec::new(),
            importance: None,
            session_id: None,
            metadata: HashMap::new(),
        }
    }
}

/// Factual knowledge. Does not decay; confidence boosts recall ranking.
pub struct SemanticMemory {
    core: TypeStoreCore,
}

impl SemanticMemory {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        connections: Option<Arc<ConnectionManager>>,
    ) -> Self {
        Self {
            core: TypeStoreCore::new(storage, connections),
        }
    }

    pub async fn store(
        &self,
        user_id: &str,
        agent_id: &str,
        content: &str,
        options: SemanticOptions,
    ) -> Result<String> {
        validate_scope(user_id, agent_id)?;

        let mut memory = Memory::new(user_id, agent_id, MemoryType::Semantic, content.to_string());
        memory.session_id = options.session_id.clone();
        if let Some(importance) = options.importance {
            memory.importance = importance.clamp(0.0, 1.0);
        }
        memory.token_count = estimate_tokens(content);
        let keywords = if options.keywords.is_empty() {
            extract_keywords(content, 8)
        } else {
            options.keywords.clone()
        };
        memory.keywords = keywords.clone();

        finalize_metadata(
            &mut memory,
            options.metadata,
            vec![
                ("confidence", json!(options.confidence.clamp(0.0, 1.0))),
                ("source", json!(options.source)),
                ("keywords", json!(keywords)),
            ],
        );

        self.core.persist(&memory).await?;
        Ok(memory.id)
    }

    pub async fn recall(
        &self,
        user_id: &str,
        agent_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        self.core
            .recall_typed(user_id, agent_id, query, MemoryType::Semantic, limit)
            .await
    }

    /// Recall with stored confidence folded into the ordering.
    pub async fn search(
        &self,
        user_id: &str,
        agent_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let mut memories = self.recall(user_id, agent_id, query, limit).await?;
        memories.sort_by(|a, b| {
            let conf_a = stored_confidence(a);
            let conf_b = stored_confidence(b);
            conf_b
                .partial_cmp(&conf_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(memories)
    }
}

pub(crate) fn stored_confidence(memory: &Memory) -> f32 {
    memory
        .metadata
        .get("confidence")
        .and_then(|v| v.as_f64())
        .map(|v| v as f32)
        .unwrap_or(0.5)
}
