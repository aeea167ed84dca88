use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;

use super::{
    ensure_scope, text_relevance, ConnectionStore, DecayReport, DecaySupport, MemoryStats,
    RecallOptions, StorageError, StorageGateway, StorageResult, TypeFilter,
};
use crate::{ConnectionMetadata, ConnectionType, Memory, MemoryConnection, MemoryType};

/// Resonance below which decayed memories are garbage-collected.
const REMOVAL_THRESHOLD: f32 = 0.1;

/// SQLite-backed storage gateway. Persistent reference adapter: memory CRUD,
/// text recall, connection storage with upsert semantics, decay. No vector
/// column, so hybrid search is not offered.
pub struct SqliteStorage {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct MemoryRow {
    id: String,
    user_id: String,
    agent_id: String,
    memory_type: String,
    content: String,
    importance: f32,
    resonance: f32,
    access_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    session_id: Option<String>,
    token_count: i64,
    keywords: String,
    embedding_id: Option<String>,
    metadata: String,
}

impl TryFrom<MemoryRow> for Memory {
    type Error = StorageError;

    fn try_from(row: MemoryRow) -> Result<Self, Self::Error> {
        let memory_type = MemoryType::from_str(&row.memory_type)
            .map_err(StorageError::Database)?;
        Ok(Memory {
            id: row.id,
            user_id: row.user_id,
            agent_id: row.agent_id,
            memory_type,
            content: row.content,
            importance: row.importance,
            resonance: row.resonance,
            access_count: row.access_count.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_accessed_at: row.last_accessed_at,
            session_id: row.session_id,
            token_count: row.token_count.max(0) as u32,
            keywords: serde_json::from_str(&row.keywords)?,
            embedding_id: row.embedding_id,
            metadata: serde_json::from_str(&row.metadata)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConnectionRow {
    id: String,
    user_id: String,
    source_memory_id: String,
    target_memory_id: String,
    connection_type: String,
    strength: f32,
    reason: String,
    created_at: DateTime<Utc>,
    metadata: String,
}

impl TryFrom<ConnectionRow> for MemoryConnection {
    type Error = StorageError;

    fn try_from(row: ConnectionRow) -> Result<Self, Self::Error> {
        let connection_type: ConnectionType =
            serde_json::from_value(serde_json::Value::String(row.connection_type))?;
        let metadata: ConnectionMetadata = serde_json::from_str(&row.metadata)?;
        Ok(MemoryConnection {
            id: row.id,
            user_id: row.user_id,
            source_memory_id: row.source_memory_id,
            target_memory_id: row.target_memory_id,
            connection_type,
            strength: row.strength,
            reason: row.reason,
            created_at: row.created_at,
            metadata,
        })
    }
}

impl SqliteStorage {
    pub async fn new(database_path: &str) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", database_path))
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                memory_type TEXT NOT NULL,
                content TEXT NOT NULL,
                importance REAL NOT NULL,
                resonance REAL NOT NULL,
                access_count INTEGER NOT NULL,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                last_accessed_at DATETIME NOT NULL,
                session_id TEXT,
                token_count INTEGER NOT NULL,
                keywords TEXT NOT NULL,
                embedding_id TEXT,
                metadata TEXT NOT NULL,
                PRIMARY KEY (user_id, id)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memory_connections (
                id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                source_memory_id TEXT NOT NULL,
                target_memory_id TEXT NOT NULL,
                connection_type TEXT NOT NULL,
                strength REAL NOT NULL,
                reason TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                metadata TEXT NOT NULL,
                PRIMARY KEY (user_id, source_memory_id, target_memory_id, connection_type)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_memories_scope ON memories(user_id, agent_id, memory_type)",
            "CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(user_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_connections_source ON memory_connections(user_id, source_memory_id)",
            "CREATE INDEX IF NOT EXISTS idx_connections_target ON memory_connections(user_id, target_memory_id)",
        ] {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }

        Ok(Self { pool })
    }
}

#[async_trait]
impl StorageGateway for SqliteStorage {
    async fn store(&self, user_id: &str, _agent_id: &str, memory: &Memory) -> StorageResult<()> {
        ensure_scope(user_id)?;
        let keywords = serde_json::to_string(&memory.keywords)?;
        let metadata = serde_json::to_string(&memory.metadata)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO memories
            (id, user_id, agent_id, memory_type, content, importance, resonance,
             access_count, created_at, updated_at, last_accessed_at, session_id,
             token_count, keywords, embedding_id, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&memory.id)
        .bind(user_id)
        .bind(&memory.agent_id)
        .bind(memory.memory_type.as_str())
        .bind(&memory.content)
        .bind(memory.importance)
        .bind(memory.resonance)
        .bind(memory.access_count as i64)
        .bind(memory.created_at)
        .bind(memory.updated_at)
        .bind(memory.last_accessed_at)
        .bind(&memory.session_id)
        .bind(memory.token_count as i64)
        .bind(keywords)
        .bind(&memory.embedding_id)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

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

        // SQL narrows the scan to rows containing at least one query token;
        // the actual relevance ordering is computed in Rust with the same
        // scoring as the in-memory adapter, then trimmed to the limit.
        let query_lower = query.to_lowercase();
        let tokens: Vec<&str> = query_lower.split_whitespace().collect();
        let scan_limit = (options.limit.max(1) * 8).max(64);

        let mut sql = String::from("SELECT * FROM memories WHERE user_id = ? AND agent_id = ?");
        if !tokens.is_empty() {
            sql.push_str(" AND (");
            sql.push_str(&vec!["content LIKE ?"; tokens.len()].join(" OR "));
            sql.push(')');
        }
        if options.memory_type.is_some() {
            sql.push_str(" AND memory_type = ?");
        }
        if options.time_range.is_some() {
            sql.push_str(" AND created_at >= ? AND created_at <= ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id ASC LIMIT ?");

        let mut q = sqlx::query_as::<_, MemoryRow>(&sql)
            .bind(user_id)
            .bind(agent_id);
        for token in &tokens {
            q = q.bind(format!("%{}%", token));
        }
        if let Some(memory_type) = options.memory_type {
            q = q.bind(memory_type.as_str());
        }
        if let Some((start, end)) = options.time_range {
            q = q.bind(start).bind(end);
        }
        let rows = q
            .bind(scan_limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let memories: Vec<Memory> = rows
            .into_iter()
            .map(Memory::try_from)
            .collect::<StorageResult<_>>()?;

        let mut scored: Vec<(f32, Memory)> = memories
            .into_iter()
            .filter_map(|memory| {
                let score = text_relevance(query, &memory.content);
                (score > 0.0).then_some((score, memory))
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
            .map(|(_, memory)| memory)
            .collect())
    }

    async fn get_by_id(&self, user_id: &str, id: &str) -> StorageResult<Option<Memory>> {
        ensure_scope(user_id)?;
        let row = sqlx::query_as::<_, MemoryRow>(
            "SELECT * FROM memories WHERE user_id = ? AND id = ?",
        )
        .bind(user_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        row.map(Memory::try_from).transpose()
    }

    async fn get_by_type(
        &self,
        user_id: &str,
        agent_id: &str,
        memory_type: MemoryType,
        filter: &TypeFilter,
    ) -> StorageResult<Vec<Memory>> {
        ensure_scope(user_id)?;
        let mut sql = String::from(
            "SELECT * FROM memories WHERE user_id = ? AND agent_id = ? AND memory_type = ?",
        );
        if filter.created_before.is_some() {
            sql.push_str(" AND created_at < ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id ASC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query_as::<_, MemoryRow>(&sql)
            .bind(user_id)
            .bind(agent_id)
            .bind(memory_type.as_str());
        if let Some(created_before) = filter.created_before {
            q = q.bind(created_before);
        }
        if let Some(limit) = filter.limit {
            q = q.bind(limit as i64);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        rows.into_iter().map(Memory::try_from).collect()
    }

    async fn get_recent(
        &self,
        user_id: &str,
        agent_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<Memory>> {
        ensure_scope(user_id)?;
        let rows = sqlx::query_as::<_, MemoryRow>(
            "SELECT * FROM memories WHERE user_id = ? AND agent_id = ?
             ORDER BY created_at DESC, id ASC LIMIT ?",
        )
        .bind(user_id)
        .bind(agent_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        rows.into_iter().map(Memory::try_from).collect()
    }

    async fn delete(&self, user_id: &str, _agent_id: &str, id: &str) -> StorageResult<()> {
        ensure_scope(user_id)?;
        sqlx::query("DELETE FROM memories WHERE user_id = ? AND id = ?")
            .bind(user_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        // Edges die with either endpoint.
        sqlx::query(
            "DELETE FROM memory_connections
             WHERE user_id = ? AND (source_memory_id = ? OR target_memory_id = ?)",
        )
        .bind(user_id)
        .bind(id)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_stats(
        &self,
        user_id: &str,
        agent_id: Option<&str>,
    ) -> StorageResult<MemoryStats> {
        ensure_scope(user_id)?;
        let mut sql = String::from(
            "SELECT memory_type, COUNT(*) as count, AVG(importance) as avg_importance
             FROM memories WHERE user_id = ?",
        );
        if agent_id.is_some() {
            sql.push_str(" AND agent_id = ?");
        }
        sql.push_str(" GROUP BY memory_type");

        let mut q = sqlx::query_as::<_, (String, i64, f64)>(&sql).bind(user_id);
        if let Some(agent) = agent_id {
            q = q.bind(agent);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut stats = MemoryStats::default();
        let mut weighted_importance = 0.0f64;
        for (type_str, count, avg_importance) in rows {
            let memory_type = MemoryType::from_str(&type_str).map_err(StorageError::Database)?;
            stats.by_type.insert(memory_type, count as usize);
            stats.total += count as usize;
            weighted_importance += avg_importance * count as f64;
        }
        if stats.total > 0 {
            stats.avg_importance = (weighted_importance / stats.total as f64) as f32;
        }
        Ok(stats)
    }

    async fn mark_accessed(&self, user_id: &str, ids: &[String]) -> StorageResult<()> {
        ensure_scope(user_id)?;
        let now = Utc::now();
        for id in ids {
            sqlx::query(
                "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ?
                 WHERE user_id = ? AND id = ?",
            )
            .bind(now)
            .bind(user_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        }
        Ok(())
    }

    fn connections(&self) -> Option<&dyn ConnectionStore> {
        Some(self)
    }

    fn decay(&self) -> Option<&dyn DecaySupport> {
        Some(self)
    }
}

#[async_trait]
impl ConnectionStore for SqliteStorage {
    async fn create_connections(
        &self,
        user_id: &str,
        edges: &[MemoryConnection],
    ) -> StorageResult<()> {
        ensure_scope(user_id)?;
        if edges.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        for edge in edges {
            if edge.user_id != user_id {
                return Err(StorageError::InvalidScope(format!(
                    "edge {} belongs to a different user",
                    edge.id
                )));
            }
            let metadata = serde_json::to_string(&edge.metadata)?;
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO memory_connections
                (id, user_id, source_memory_id, target_memory_id, connection_type,
                 strength, reason, created_at, metadata)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&edge.id)
            .bind(user_id)
            .bind(&edge.source_memory_id)
            .bind(&edge.target_memory_id)
            .bind(edge.connection_type.as_str())
            .bind(edge.strength)
            .bind(&edge.reason)
            .bind(edge.created_at)
            .bind(metadata)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    async fn connections_for_memories(
        &self,
        user_id: &str,
        ids: &[String],
    ) -> StorageResult<Vec<MemoryConnection>> {
        ensure_scope(user_id)?;
        let mut edges: HashMap<String, MemoryConnection> = HashMap::new();
        for id in ids {
            let rows = sqlx::query_as::<_, ConnectionRow>(
                "SELECT * FROM memory_connections
                 WHERE user_id = ? AND (source_memory_id = ? OR target_memory_id = ?)",
            )
            .bind(user_id)
            .bind(id)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
            for row in rows {
                let edge = MemoryConnection::try_from(row)?;
                edges.insert(edge.id.clone(), edge);
            }
        }
        Ok(edges.into_values().collect())
    }
}

#[async_trait]
impl DecaySupport for SqliteStorage {
    async fn apply_decay(
        &self,
        user_id: &str,
        agent_id: &str,
        decay_rate: f32,
    ) -> StorageResult<DecayReport> {
        ensure_scope(user_id)?;
        let updated = sqlx::query(
            "UPDATE memories SET resonance = MAX(resonance * (1.0 - ?), 0.0)
             WHERE user_id = ? AND agent_id = ? AND memory_type = 'episodic'",
        )
        .bind(decay_rate)
        .bind(user_id)
        .bind(agent_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        let removed = sqlx::query(
            "DELETE FROM memories
             WHERE user_id = ? AND agent_id = ? AND memory_type = 'episodic' AND resonance < ?",
        )
        .bind(user_id)
        .bind(agent_id)
        .bind(REMOVAL_THRESHOLD)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(DecayReport {
            processed: updated.rows_affected() as usize,
            decayed: updated.rows_affected() as usize,
            removed: removed.rows_affected() as usize,
        })
    }
}
