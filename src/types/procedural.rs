use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use super::{estimate_tokens, extract_keywords, finalize_metadata, validate_scope, TypeStoreCore};
use crate::connection::ConnectionManager;
use crate::error::{MemoryError, Result};
use crate::storage::{text_relevance, StorageGateway, TypeFilter};
use crate::{Memory, MemoryType};

/// Options for storing a procedural memory
#[derive(Debug, Clone, Default)]
pub struct ProceduralOptions {
    /// Situation this procedure applies to.
    pub trigger: String,
    /// What was done.
    pub action: String,
    /// What happened, if known.
    pub outcome: Option<String>,
    pub success: bool,
    pub importance: Option<f32>,
    pub session_id: Option<String>,
    pub keywords: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Trigger/action knowledge. Matches are pre-ranked against the trigger text.
pub struct ProceduralMemory {
    core: TypeStoreCore,
}

impl ProceduralMemory {
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
        options: ProceduralOptions,
    ) -> Result<String> {
        validate_scope(user_id, agent_id)?;
        if options.trigger.trim().is_empty() || options.action.trim().is_empty() {
            return Err(MemoryError::InvalidInput(
                "procedural memory requires trigger and action".to_string(),
            ));
        }

        let mut memory = Memory::new(
            user_id,
            agent_id,
            MemoryType::Procedural,
            content.to_string(),
        );
        memory.session_id = options.session_id.clone();
        if let Some(importance) = options.importance {
            memory.importance = importance.clamp(0.0, 1.0);
        }
        memory.token_count = estimate_tokens(content);
        memory.keywords = if options.keywords.is_empty() {
            extract_keywords(content, 8)
        } else {
            options.keywords.clone()
        };

        finalize_metadata(
            &mut memory,
            options.metadata,
            vec![
                ("trigger", json!(options.trigger)),
                ("action", json!(options.action)),
                ("outcome", json!(options.outcome)),
                ("success", json!(options.success)),
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
            .recall_typed(user_id, agent_id, query, MemoryType::Procedural, limit)
            .await
    }

    /// Procedures whose trigger (weighted) or content matches the situation,
    /// best match first.
    pub async fn find_matching(
        &self,
        user_id: &str,
        agent_id: &str,
        situation: &str,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        validate_scope(user_id, agent_id)?;
        let all = self
            .core
            .storage()
            .get_by_type(
                user_id,
                agent_id,
                MemoryType::Procedural,
                &TypeFilter::default(),
            )
            .await?;

        let mut scored: Vec<(f32, Memory)> = all
            .into_iter()
            .filter_map(|memory| {
                let trigger = memory
                    .metadata
                    .get("trigger")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let score = 0.7 * text_relevance(situation, &trigger)
                    + 0.3 * text_relevance(situation, &memory.content);
                (score > 0.0).then_some((score, memory))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        Ok(scored.into_iter().take(limit).map(|(_, m)| m).collect())
    }
}
