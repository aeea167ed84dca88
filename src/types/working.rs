use chrono::{Duration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use super::{estimate_tokens, extract_keywords, finalize_metadata, validate_scope, TypeStoreCore};
use crate::connection::ConnectionManager;
use crate::error::{MemoryError, Result};
use crate::storage::{StorageGateway, TypeFilter};
use crate::{Memory, MemoryType};

/// Options for storing a working memory. A session id is mandatory.
#[derive(Debug, Clone, Default)]
pub struct WorkingOptions {
    pub session_id: String,
    pub context_window: Option<u32>,
    /// Overrides the configured default TTL.
    pub ttl_seconds: Option<u64>,
    pub importance: Option<f32>,
    pub keywords: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Short-term conversation context. Entries expire after their TTL and are
/// filtered out of `get_active`.
pub struct WorkingMemory {
    core: TypeStoreCore,
    default_ttl_seconds: u64,
}

impl WorkingMemory {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        connections: Option<Arc<ConnectionManager>>,
        default_ttl_seconds: u64,
    ) -> Self {
        Self {
            core: TypeStoreCore::new(storage, connections),
            default_ttl_seconds,
        }
    }

    pub async fn store(
        &self,
        user_id: &str,
        agent_id: &str,
        content: &str,
        options: WorkingOptions,
    ) -> Result<String> {
        validate_scope(user_id, agent_id)?;
        if options.session_id.trim().is_empty() {
            return Err(MemoryError::InvalidInput(
                "working memory requires a session id".to_string(),
            ));
        }

        let mut memory = Memory::new(user_id, agent_id, MemoryType::Working, content.to_string());
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

        let ttl = options.ttl_seconds.unwrap_or(self.default_ttl_seconds);
        let expires_at = memory.created_at + Duration::milliseconds((ttl * 1000) as i64);
        let mut system = vec![("expires_at", json!(expires_at.timestamp_millis()))];
        if let Some(window) = options.context_window {
            system.push(("context_window", json!(window)));
        }
        finalize_metadata(&mut memory, options.metadata, system);

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
            .recall_typed(user_id, agent_id, query, MemoryType::Working, limit)
            .await
    }

    /// Working memories whose TTL has not yet passed, newest first.
    pub async fn get_active(&self, user_id: &str, agent_id: &str) -> Result<Vec<Memory>> {
        validate_scope(user_id, agent_id)?;
        let now_ms = Utc::now().timestamp_millis();
        let all = self
            .core
            .storage()
            .get_by_type(user_id, agent_id, MemoryType::Working, &TypeFilter::default())
            .await?;
        Ok(all
            .into_iter()
            .filter(|m| {
                m.metadata
                    .get("expires_at")
                    .and_then(|v| v.as_i64())
                    .map_or(true, |expiry| expiry > now_ms)
            })
            .collect())
    }
}
