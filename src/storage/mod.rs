mod memory;
mod sqlite;

pub use memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::config::HybridWeights;
use crate::{Memory, MemoryConnection, MemoryType};

/// Storage backend error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid scope: {0}")]
    InvalidScope(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Filters for [`StorageGateway::recall`]
#[derive(Debug, Clone)]
pub struct RecallOptions {
    pub memory_type: Option<MemoryType>,
    pub limit: usize,
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub include_metadata: bool,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            memory_type: None,
            limit: 10,
            time_range: None,
            include_metadata: true,
        }
    }
}

/// Filters for [`StorageGateway::get_by_type`]
#[derive(Debug, Clone, Default)]
pub struct TypeFilter {
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub by_type: HashMap<MemoryType, usize>,
    pub total: usize,
    pub avg_importance: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecayReport {
    pub processed: usize,
    pub decayed: usize,
    pub removed: usize,
}

/// Narrow storage contract the intelligence layer consumes. Implementations
/// own storage-level isolation (key prefixing, row scoping); every operation
/// here is already scoped by user id and must reject a blank one.
///
/// Optional capabilities are typed accessors rather than probed methods:
/// a `None` return permanently disables the dependent feature.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn store(&self, user_id: &str, agent_id: &str, memory: &Memory) -> StorageResult<()>;

    /// Text recall ordered by storage-side relevance, bounded by
    /// `options.limit`.
    async fn recall(
        &self,
        user_id: &str,
        agent_id: &str,
        query: &str,
        options: &RecallOptions,
    ) -> StorageResult<Vec<Memory>>;

    async fn get_by_id(&self, user_id: &str, id: &str) -> StorageResult<Option<Memory>>;

    async fn get_by_type(
        &self,
        user_id: &str,
        agent_id: &str,
        memory_type: MemoryType,
        filter: &TypeFilter,
    ) -> StorageResult<Vec<Memory>>;

    /// Most recent memories across all types, newest first.
    async fn get_recent(
        &self,
        user_id: &str,
        agent_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<Memory>>;

    async fn delete(&self, user_id: &str, agent_id: &str, id: &str) -> StorageResult<()>;

    async fn get_stats(&self, user_id: &str, agent_id: Option<&str>)
        -> StorageResult<MemoryStats>;

    /// Bump access_count and last_accessed_at for recall hits.
    async fn mark_accessed(&self, user_id: &str, ids: &[String]) -> StorageResult<()>;

    fn connections(&self) -> Option<&dyn ConnectionStore> {
        None
    }

    fn hybrid(&self) -> Option<&dyn HybridSearch> {
        None
    }

    fn decay(&self) -> Option<&dyn DecaySupport> {
        None
    }

    fn key_value(&self) -> Option<&dyn KeyValueStore> {
        None
    }
}

/// Edge persistence. `create_connections` must be atomic per call and upsert
/// on the (user_id, source, target, connection_type) key.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn create_connections(
        &self,
        user_id: &str,
        edges: &[MemoryConnection],
    ) -> StorageResult<()>;

    /// All edges touching any of the given memory ids, either direction.
    async fn connections_for_memories(
        &self,
        user_id: &str,
        ids: &[String],
    ) -> StorageResult<Vec<MemoryConnection>>;
}

/// Vector-capable adapters can fuse scores storage-side.
#[async_trait]
pub trait HybridSearch: Send + Sync {
    async fn hybrid_search(
        &self,
        user_id: &str,
        agent_id: &str,
        query: &str,
        embedding: &[f32],
        weights: &HybridWeights,
        limit: usize,
        min_relevance: f32,
    ) -> StorageResult<Vec<(Memory, f32)>>;
}

#[async_trait]
pub trait DecaySupport: Send + Sync {
    async fn apply_decay(
        &self,
        user_id: &str,
        agent_id: &str,
        decay_rate: f32,
    ) -> StorageResult<DecayReport>;
}

/// Raw user-scoped writes; the fallback path for edge persistence when
/// [`ConnectionStore`] is absent.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn put(&self, key: &str, value: serde_json::Value) -> StorageResult<()>;
    async fn get(&self, key: &str) -> StorageResult<Option<serde_json::Value>>;
}

/// Every gateway operation starts here.
pub(crate) fn ensure_scope(user_id: &str) -> StorageResult<()> {
    if user_id.trim().is_empty() {
        return Err(StorageError::InvalidScope(
            "user id must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Token-overlap relevance used by the reference adapters: the fraction of
/// query tokens found in the content, with a small bonus for a whole-phrase
/// match. An empty query matches everything.
pub(crate) fn text_relevance(query: &str, content: &str) -> f32 {
    let content_lower = content.to_lowercase();
    let query_lower = query.to_lowercase();
    let tokens: Vec<&str> = query_lower.split_whitespace().collect();
    if tokens.is_empty() {
        return 1.0;
    }
    let matched = tokens
        .iter()
        .filter(|t| content_lower.contains(*t))
        .count();
    let mut score = matched as f32 / tokens.len() as f32;
    if tokens.len() > 1 && content_lower.contains(&query_lower) {
        score = (score + 0.2).min(1.0);
    }
    score
}
