use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use super::{estimate_tokens, extract_keywords, finalize_metadata, validate_scope, TypeStoreCore};
use crate::connection::ConnectionManager;
use crate::error::{MemoryError, Result};
use crate::storage::{RecallOptions, StorageGateway};
use crate::{Memory, MemoryType};

/// Options for storing an episodic memory. A session id is mandatory.
#[derive(Debug, Clone, Default)]
pub struct EpisodicOptions {
    pub session_id: String,
    pub tags: Vec<String>,
    /// Days until the episode becomes a compression candidate; overrides the
    /// configured default.
    pub compression_age_days: Option<u32>,
    pub importance: Option<f32>,
    pub keywords: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Past experiences and interactions. The only type whose resonance decays.
pub struct EpisodicMemory {
    core: TypeStoreCore,
    default_compression_age_days: u32,
}

impl EpisodicMemory {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        connections: Option<Arc<ConnectionManager>>,
        default_compression_age_days: u32,
    ) -> Self {
        Self {
            core: TypeStoreCore::new(storage, connections),
            default_compression_age_days,
        }
    }

    pub async fn store(
        &self,
        user_id: &str,
        agent_id: &str,
        content: &str,
        options: EpisodicOptions,
    ) -> Result<String> {
        validate_scope(user_id, agent_id)?;
        if options.session_id.trim().is_empty() {
            return Err(MemoryError::InvalidInput(
                "episodic memory requires a session id".to_string(),
            ));
        }

        let mut memory = Memory::new(user_id, agent_id, MemoryType::Episodic, content.to_string());
        memory.session_id = Some(options.session_id.clone());
        if let Some(importance) = options.importance {
            memory.importance = importance.clamp(0.0, 1.0);
        }
        memory.token_count = estimate_tokens(content);
        memory.keywords = if options.keywords.is_empty() {
            extract_keywords(content, 8)
        } else {
            options.keywords.clone()
        };

        let age_days = options
            .compression_age_days
            .unwrap_or(self.default_compression_age_days);
        let expires_at = memory.created_at + Duration::days(age_days as i64);
        finalize_metadata(
            &mut memory,
            options.metadata,
            vec![
                ("tags", json!(options.tags)),
                ("expires_at", json!(expires_at.timestamp_millis())),
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
            .recall_typed(user_id, agent_id, query, MemoryType::Episodic, limit)
            .await
    }

    /// Episodes within a time window, newest first.
    pub async fn get_timeline(
        &self,
        user_id: &str,
        agent_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        validate_scope(user_id, agent_id)?;
        let options = RecallOptions {
            memory_type: Some(MemoryType::Episodic),
            limit,
            time_range: Some((start, end)),
            ..Default::default()
        };
        Ok(self
            .core
            .storage()
            .recall(user_id, agent_id, "", &options)
            .await?)
    }
}
