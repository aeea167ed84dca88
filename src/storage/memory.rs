use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{
    ensure_scope, text_relevance, ConnectionStore, DecayReport, DecaySupport, KeyValueStore,
    MemoryStats, RecallOptions, StorageError, StorageGateway, StorageResult, TypeFilter,
};
use crate::{ConnectionType, Memory, MemoryConnection, MemoryType};

type EdgeKey = (String, String, ConnectionType);

#[derive(Default)]
struct UserSpace {
    memories: HashMap<String, Memory>,
    edges: HashMap<EdgeKey, MemoryConnection>,
    kv: HashMap<String, serde_json::Value>,
}

/// In-memory storage gateway for development and testing. Implements the
/// full capability surface except hybrid search, which needs a vector
/// column only a real backend provides.
#[derive(Default)]
pub struct InMemoryStorage {
    users: RwLock<HashMap<String, UserSpace>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of memories stored for a user, across agents. Test helper.
    pub async fn memory_count(&self, user_id: &str) -> usize {
        self.users
            .read()
            .await
            .get(user_id)
            .map(|u| u.memories.len())
            .unwrap_or(0)
    }

    /// All edges stored for a user. Test helper.
    pub async fn all_connections(&self, user_id: &str) -> Vec<MemoryConnection> {
        self.users
            .read()
            .await
            .get(user_id)
            .map(|u| u.edges.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StorageGateway for InMemoryStorage {
    async fn store(&self, user_id: &str, _agent_id: &str, memory: &Memory) -> StorageResult<()> {
        ensure_scope(user_id)?;
        let mut users = self.users.write().await;
        let space = users.entry(user_id.to_string()).or_default();
        space.memories.insert(memory.id.clone(), memory.clone());
        Ok(())
    }

    async fn recall(
        &self,
        user_id: &str,
        agent_id: &str,
        query: &str,
        options: &RecallOptions,
    ) -> StorageResult<Vec<Memory>> {
        ensure_scope(user_id)?;
        let users = self.users.read().await;
        let Some(space) = users.get(user_id) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<(f32, &Memory)> = space
            .memories
            .values()
            .filter(|m| m.agent_id == agent_id)
            .filter(|m| options.memory_type.map_or(true, |t| m.memory_type == t))
            .filter(|m| {
                options
                    .time_range
                    .map_or(true, |(start, end)| m.created_at >= start && m.created_at <= end)
            })
            .filter_map(|m| {
                let score = text_relevance(query, &m.content);
                (score > 0.0).then_some((score, m))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.created_at.cmp(&a.1.created_at))
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        Ok(scored
            .into_iter()
            .take(options.limit)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn get_by_id(&self, user_id: &str, id: &str) -> StorageResult<Option<Memory>> {
        ensure_scope(user_id)?;
        Ok(self
            .users
            .read()
            .await
            .get(user_id)
            .and_then(|u| u.memories.get(id))
            .cloned())
    }

    async fn get_by_type(
        &self,
        user_id: &str,
        agent_id: &str,
        memory_type: MemoryType,
        filter: &TypeFilter,
    ) -> StorageResult<Vec<Memory>> {
        ensure_scope(user_id)?;
        let users = self.users.read().await;
        let Some(space) = users.get(user_id) else {
            return Ok(Vec::new());
        };
        let mut matches: Vec<Memory> = space
            .memories
            .values()
            .filter(|m| m.agent_id == agent_id && m.memory_type == memory_type)
            .filter(|m| filter.created_before.map_or(true, |t| m.created_at < t))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn get_recent(
        &self,
        user_id: &str,
        agent_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<Memory>> {
        ensure_scope(user_id)?;
        let users = self.users.read().await;
        let Some(space) = users.get(user_id) else {
            return Ok(Vec::new());
        };
        let mut all: Vec<Memory> = space
            .memories
            .values()
            .filter(|m| m.agent_id == agent_id)
            .cloned()
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        all.truncate(limit);
        Ok(all)
    }

    async fn delete(&self, user_id: &str, _agent_id: &str, id: &str) -> StorageResult<()> {
        ensure_scope(user_id)?;
        let mut users = self.users.write().await;
        if let Some(space) = users.get_mut(user_id) {
            space.memories.remove(id);
            // Edges die with either endpoint.
            space
                .edges
                .retain(|(src, tgt, _), _| src.as_str() != id && tgt.as_str() != id);
        }
        Ok(())
    }

    async fn get_stats(
        &self,
        user_id: &str,
        agent_id: Option<&str>,
    ) -> StorageResult<MemoryStats> {
        ensure_scope(user_id)?;
        let users = self.users.read().await;
        let mut stats = MemoryStats::default();
        let Some(space) = users.get(user_id) else {
            return Ok(stats);
        };
        let mut importance_sum = 0.0f32;
        for memory in space.memories.values() {
            if agent_id.map_or(false, |a| memory.agent_id != a) {
                continue;
            }
            *stats.by_type.entry(memory.memory_type).or_insert(0) += 1;
            stats.total += 1;
            importance_sum += memory.importance;
        }
        if stats.total > 0 {
            stats.avg_importance = importance_sum / stats.total as f32;
        }
        Ok(stats)
    }

    async fn mark_accessed(&self, user_id: &str, ids: &[String]) -> StorageResult<()> {
        ensure_scope(user_id)?;
        let now = chrono::Utc::now();
        let mut users = self.users.write().await;
        if let Some(space) = users.get_mut(user_id) {
            for id in ids {
                if let Some(memory) = space.memories.get_mut(id) {
                    memory.access_count += 1;
                    memory.last_accessed_at = now;
                }
            }
        }
        Ok(())
    }

    fn connections(&self) -> Option<&dyn ConnectionStore> {
        Some(self)
    }

    fn decay(&self) -> Option<&dyn DecaySupport> {
        Some(self)
    }

    fn key_value(&self) -> Option<&dyn KeyValueStore> {
        Some(self)
    }
}

#[async_trait]
impl ConnectionStore for InMemoryStorage {
    async fn create_connections(
        &self,
        user_id: &str,
        edges: &[MemoryConnection],
    ) -> StorageResult<()> {
        ensure_scope(user_id)?;
        let mut users = self.users.write().await;
        let space = users.entry(user_id.to_string()).or_default();
        for edge in edges {
            if edge.user_id != user_id {
                return Err(StorageError::InvalidScope(format!(
                    "edge {} belongs to a different user",
                    edge.id
                )));
            }
            let key = (
                edge.source_memory_id.clone(),
                edge.target_memory_id.clone(),
                edge.connection_type,
            );
            space.edges.insert(key, edge.clone());
        }
        Ok(())
    }

    async fn connections_for_memories(
        &self,
        user_id: &str,
        ids: &[String],
    ) -> StorageResult<Vec<MemoryConnection>> {
        ensure_scope(user_id)?;
        let users = self.users.read().await;
        let Some(space) = users.get(user_id) else {
            return Ok(Vec::new());
        };
        Ok(space
            .edges
            .values()
            .filter(|e| {
                ids.iter()
                    .any(|id| e.source_memory_id == *id || e.target_memory_id == *id)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DecaySupport for InMemoryStorage {
    async fn apply_decay(
        &self,
        user_id: &str,
        agent_id: &str,
        decay_rate: f32,
    ) -> StorageResult<DecayReport> {
        ensure_scope(user_id)?;
        const REMOVAL_THRESHOLD: f32 = 0.1;
        let mut report = DecayReport::default();
        let mut users = self.users.write().await;
        let Some(space) = users.get_mut(user_id) else {
            return Ok(report);
        };
        let mut doomed = Vec::new();
        for memory in space.memories.values_mut() {
            if memory.agent_id != agent_id || !memory.memory_type.decays() {
                continue;
            }
            report.processed += 1;
            memory.resonance = (memory.resonance * (1.0 - decay_rate)).max(0.0);
            report.decayed += 1;
            if memory.resonance < REMOVAL_THRESHOLD {
                doomed.push(memory.id.clone());
            }
        }
        for id in doomed {
            space.memories.remove(&id);
            space
                .edges
                .retain(|(src, tgt, _), _| src != &id && tgt != &id);
            report.removed += 1;
        }
        Ok(report)
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStorage {
    async fn put(&self, key: &str, value: serde_json::Value) -> StorageResult<()> {
        let user_id = key.split(':').nth(1).unwrap_or_default().to_string();
        ensure_scope(&user_id)?;
        let mut users = self.users.write().await;
        users
            .entry(user_id)
            .or_default()
            .kv
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<serde_json::Value>> {
        let user_id = key.split(':').nth(1).unwrap_or_default().to_string();
        ensure_scope(&user_id)?;
        Ok(self
            .users
            .read()
            .await
            .get(&user_id)
            .and_then(|u| u.kv.get(key))
            .cloned())
    }
}
