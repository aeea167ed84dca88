use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::RecallSettings;
use crate::embedding::EmbeddingService;
use crate::error::{short_id, MemoryError, Result};
use crate::storage::{text_relevance, RecallOptions, StorageGateway};
use crate::types::stored_confidence;
use crate::{Memory, MemoryConnection, MemoryType};

const CACHE_CAPACITY: usize = 1000;
const POPULAR_QUERY_CAP: usize = 100;
const RELATED_EXPANSION_TOP: usize = 10;

/// A cross-type recall request
#[derive(Debug, Clone, Default)]
pub struct RecallQuery {
    pub user_id: String,
    pub agent_id: String,
    pub query: String,
    /// None searches all four types.
    pub memory_types: Option<Vec<MemoryType>>,
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub limit: Option<usize>,
    pub min_relevance: Option<f32>,
    pub include_related: bool,
    pub connection_hops: Option<usize>,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone)]
pub struct AttachedConnection {
    pub connection: MemoryConnection,
    pub direction: ConnectionDirection,
}

#[derive(Debug, Clone)]
pub struct RecalledMemory {
    pub memory: Memory,
    pub relevance: f32,
    pub connections: Vec<AttachedConnection>,
    /// Ids reachable through the connection graph, when expansion ran.
    pub related_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RecallResult {
    pub memories: Vec<RecalledMemory>,
    pub total_relevance: f32,
    /// Signals that actually contributed, e.g. "vector+text+temporal".
    pub search_strategy: String,
    pub execution_time_ms: u64,
    pub sources: HashMap<MemoryType, usize>,
    pub conversation_context: Option<String>,
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone, Default)]
pub struct RecallMetrics {
    pub total_queries: u64,
    pub cache_hits: u64,
    pub avg_response_ms: f64,
    pub type_distribution: HashMap<MemoryType, u64>,
    /// (normalized query, hit count), most popular first.
    pub popular_queries: Vec<(String, u64)>,
}

struct CacheEntry {
    stored_at: Instant,
    result: RecallResult,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

#[derive(Default)]
struct MetricsInner {
    total_queries: u64,
    cache_hits: u64,
    avg_response_ms: f64,
    type_distribution: HashMap<MemoryType, u64>,
    popular: HashMap<String, u64>,
}

/// Hybrid multi-type recall: parallel per-type searches, weighted score
/// fusion, connection enrichment, process-local result cache.
///
/// Best-effort by design: a failing memory type or a missing optional
/// capability narrows the result instead of failing the call.
pub struct RecallService {
    storage: Arc<dyn StorageGateway>,
    embeddings: Arc<EmbeddingService>,
    settings: RecallSettings,
    cache: Mutex<CacheInner>,
    metrics: Mutex<MetricsInner>,
}

impl RecallService {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        embeddings: Arc<EmbeddingService>,
        settings: RecallSettings,
    ) -> Self {
        Self {
            storage,
            embeddings,
            settings,
            cache: Mutex::new(CacheInner::default()),
            metrics: Mutex::new(MetricsInner::default()),
        }
    }

    pub fn metrics(&self) -> RecallMetrics {
        let inner = self.metrics.lock().unwrap();
        let mut popular: Vec<(String, u64)> = inner
            .popular
            .iter()
            .map(|(q, c)| (q.clone(), *c))
            .collect();
        popular.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        RecallMetrics {
            total_queries: inner.total_queries,
            cache_hits: inner.cache_hits,
            avg_response_ms: inner.avg_response_ms,
            type_distribution: inner.type_distribution.clone(),
            popular_queries: popular,
        }
    }

    pub async fn recall(&self, query: RecallQuery) -> Result<RecallResult> {
        if query.user_id.trim().is_empty() {
            return Err(MemoryError::InvalidUser);
        }
        if query.agent_id.trim().is_empty() {
            return Err(MemoryError::InvalidInput(
                "agent id must not be empty".to_string(),
            ));
        }
        let normalized = normalize_query(&query.query);
        if normalized.is_empty() {
            return Err(MemoryError::InvalidInput(
                "query must not be empty".to_string(),
            ));
        }

        let started = Instant::now();
        let limit = query.limit.unwrap_or(self.settings.default_limit).max(1);
        let min_relevance = query
            .min_relevance
            .unwrap_or(self.settings.min_relevance_threshold);
        let types = selected_types(&query);

        let cache_key = self.cache_key(&query, &normalized, &types, limit, min_relevance);
        if self.settings.enable_caching {
            if let Some(hit) = self.cache_lookup(&cache_key) {
                self.record_query(&normalized, &hit, started, true);
                return Ok(hit);
            }
        }

        // Fan out one search per selected type; failures narrow the result.
        let searches = types.iter().map(|&memory_type| {
            let storage = self.storage.clone();
            let user_id = query.user_id.clone();
            let agent_id = query.agent_id.clone();
            let normalized = normalized.clone();
            let time_range = query.time_range;
            let budget = type_budget(memory_type, limit);
            async move {
                let options = RecallOptions {
                    memory_type: Some(memory_type),
                    limit: budget,
                    time_range,
                    include_metadata: true,
                };
                match storage
                    .recall(&user_id, &agent_id, &normalized, &options)
                    .await
                {
                    Ok(memories) => (memory_type, memories),
                    Err(err) => {
                        warn!(
                            user = short_id(&user_id),
                            memory_type = %memory_type,
                            error = %err,
                            "per-type search failed, continuing without it"
                        );
                        (memory_type, Vec::new())
                    }
                }
            }
        });
        let per_type_results = join_all(searches).await;

        // Optional storage-side vector scores. Vector-ranked memories also
        // join the candidate pool, so a purely semantic match can surface
        // without a text hit.
        let mut vector_scores: HashMap<String, f32> = HashMap::new();
        let mut vector_candidates: Vec<(MemoryType, Memory)> = Vec::new();
        let mut vector_used = false;
        if let Some(hybrid) = self.storage.hybrid() {
            match self.embeddings.embed(&normalized).await {
                Ok(embedding) => {
                    match hybrid
                        .hybrid_search(
                            &query.user_id,
                            &query.agent_id,
                            &normalized,
                            &embedding,
                            &self.settings.hybrid_weights,
                            limit,
                            min_relevance,
                        )
                        .await
                    {
                        Ok(ranked) => {
                            vector_used = true;
                            for (memory, score) in ranked {
                                vector_scores.insert(memory.id.clone(), score);
                                if types.contains(&memory.memory_type) {
                                    vector_candidates.push((memory.memory_type, memory));
                                }
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "hybrid search failed, text-only fusion");
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "query embedding failed, text-only fusion");
                }
            }
        }

        // Score and fuse, deduplicating across types by id.
        let now = Utc::now();
        let weights = &self.settings.hybrid_weights;
        let mut candidates: HashMap<String, RecalledMemory> = HashMap::new();
        let mut temporal_used = false;
        for (memory_type, memories) in per_type_results
            .into_iter()
            .chain(vector_candidates.into_iter().map(|(t, m)| (t, vec![m])))
        {
            for memory in memories {
                let text_score = text_relevance(&normalized, &memory.content);
                let temporal_score = match memory_type {
                    MemoryType::Episodic => {
                        temporal_used = true;
                        recency_score(&memory, now)
                    }
                    _ => 0.0,
                };
                let per_type = match memory_type {
                    MemoryType::Working => text_score,
                    MemoryType::Episodic => 0.7 * text_score + 0.3 * temporal_score,
                    MemoryType::Semantic => {
                        (text_score * (1.0 + 0.2 * stored_confidence(&memory))).min(1.0)
                    }
                    MemoryType::Procedural => text_score,
                };
                let procedural_score = if memory_type == MemoryType::Procedural {
                    text_score
                } else {
                    0.0
                };
                let vector_score = vector_scores.get(&memory.id).copied().unwrap_or(0.0);
                let fused = weights.vector * vector_score
                    + weights.text * text_score
                    + weights.temporal * temporal_score
                    + weights.procedural * procedural_score;
                let relevance = per_type.max(fused);

                candidates
                    .entry(memory.id.clone())
                    .and_modify(|existing| {
                        if relevance > existing.relevance {
                            existing.relevance = relevance;
                        }
                    })
                    .or_insert(RecalledMemory {
                        memory,
                        relevance,
                        connections: Vec::new(),
                        related_ids: Vec::new(),
                    });
            }
        }

        let mut ranked: Vec<RecalledMemory> = candidates.into_values().collect();
        sort_ranked(&mut ranked);

        // Connection enrichment when the capability exists.
        if let Some(store) = self.storage.connections() {
            let ids: Vec<String> = ranked.iter().map(|r| r.memory.id.clone()).collect();
            if !ids.is_empty() {
                match store.connections_for_memories(&query.user_id, &ids).await {
                    Ok(edges) => {
                        for recalled in ranked.iter_mut() {
                            for edge in &edges {
                                if edge.source_memory_id == recalled.memory.id {
                                    recalled.connections.push(AttachedConnection {
                                        connection: edge.clone(),
                                        direction: ConnectionDirection::Outgoing,
                                    });
                                } else if edge.target_memory_id == recalled.memory.id {
                                    recalled.connections.push(AttachedConnection {
                                        connection: edge.clone(),
                                        direction: ConnectionDirection::Incoming,
                                    });
                                }
                            }
                            let boost = (0.1 * recalled.connections.len() as f32).min(0.3);
                            recalled.relevance += boost;
                        }
                        sort_ranked(&mut ranked);
                    }
                    Err(err) => {
                        warn!(error = %err, "connection enrichment failed, continuing");
                    }
                }
            }
        }

        if query.include_related && self.settings.enable_related_memories {
            let depth = query
                .connection_hops
                .unwrap_or(self.settings.max_related_depth)
                .min(self.settings.max_related_depth);
            expand_related(&mut ranked, depth);
        }

        ranked.retain(|r| r.relevance >= min_relevance);
        ranked.truncate(limit);

        let returned_ids: Vec<String> = ranked.iter().map(|r| r.memory.id.clone()).collect();
        if !returned_ids.is_empty() {
            if let Err(err) = self.storage.mark_accessed(&query.user_id, &returned_ids).await {
                debug!(error = %err, "access bump failed");
            }
        }

        let mut sources: HashMap<MemoryType, usize> = HashMap::new();
        for recalled in &ranked {
            *sources.entry(recalled.memory.memory_type).or_insert(0) += 1;
        }

        let mut strategy_parts = Vec::new();
        if vector_used {
            strategy_parts.push("vector");
        }
        strategy_parts.push("text");
        if temporal_used {
            strategy_parts.push("temporal");
        }

        let result = RecallResult {
            total_relevance: ranked.iter().map(|r| r.relevance).sum(),
            conversation_context: conversation_context(&ranked),
            memories: ranked,
            search_strategy: strategy_parts.join("+"),
            execution_time_ms: started.elapsed().as_millis() as u64,
            sources,
        };

        if self.settings.enable_caching {
            self.cache_insert(cache_key, result.clone());
        }
        self.record_query(&normalized, &result, started, false);
        Ok(result)
    }

    fn cache_key(
        &self,
        query: &RecallQuery,
        normalized: &str,
        types: &[MemoryType],
        limit: usize,
        min_relevance: f32,
    ) -> String {
        let mut type_names: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        type_names.sort_unstable();
        let range = query
            .time_range
            .map(|(s, e)| format!("{}-{}", s.timestamp_millis(), e.timestamp_millis()))
            .unwrap_or_default();
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            query.user_id,
            query.agent_id,
            normalized,
            type_names.join(","),
            range,
            limit,
            min_relevance
        )
    }

    fn cache_lookup(&self, key: &str) -> Option<RecallResult> {
        let ttl = std::time::Duration::from_millis(self.settings.cache_ttl_ms);
        let mut cache = self.cache.lock().unwrap();
        let expired = match cache.entries.get(key) {
            Some(entry) => {
                if entry.stored_at.elapsed() < ttl {
                    return Some(entry.result.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            cache.entries.remove(key);
            cache.order.retain(|k| k != key);
        }
        None
    }

    fn cache_insert(&self, key: String, result: RecallResult) {
        let mut cache = self.cache.lock().unwrap();
        if !cache.entries.contains_key(&key) {
            cache.order.push_back(key.clone());
        }
        cache.entries.insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                result,
            },
        );
        while cache.entries.len() > CACHE_CAPACITY {
            let Some(oldest) = cache.order.pop_front() else {
                break;
            };
            cache.entries.remove(&oldest);
        }
    }

    fn record_query(
        &self,
        normalized: &str,
        result: &RecallResult,
        started: Instant,
        cache_hit: bool,
    ) {
        let elapsed_ms = started.elapsed().as_millis() as f64;
        let mut metrics = self.metrics.lock().unwrap();
        metrics.total_queries += 1;
        if cache_hit {
            metrics.cache_hits += 1;
        }
        let n = metrics.total_queries as f64;
        metrics.avg_response_ms += (elapsed_ms - metrics.avg_response_ms) / n;
        for (memory_type, count) in &result.sources {
            *metrics.type_distribution.entry(*memory_type).or_insert(0) += *count as u64;
        }
        *metrics.popular.entry(normalized.to_string()).or_insert(0) += 1;
        if metrics.popular.len() > POPULAR_QUERY_CAP {
            if let Some(least) = metrics
                .popular
                .iter()
                .min_by_key(|(q, c)| (*c, (*q).clone()))
                .map(|(q, _)| q.clone())
            {
                metrics.popular.remove(&least);
            }
        }
    }
}

/// Lowercase, trimmed, inner whitespace collapsed.
fn normalize_query(query: &str) -> String {
    query
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn selected_types(query: &RecallQuery) -> Vec<MemoryType> {
    match &query.memory_types {
        Some(types) if !types.is_empty() => {
            let mut seen = HashSet::new();
            types
                .iter()
                .copied()
                .filter(|t| seen.insert(*t))
                .collect()
        }
        _ => MemoryType::ALL.to_vec(),
    }
}

/// Per-type result budgets: a quarter of the limit for working context, half
/// for episodes, the native result set for semantic and procedural.
fn type_budget(memory_type: MemoryType, limit: usize) -> usize {
    match memory_type {
        MemoryType::Working => (limit / 4).max(1),
        MemoryType::Episodic => (limit / 2).max(1),
        MemoryType::Semantic | MemoryType::Procedural => limit,
    }
}

/// Weekly-decay recency bias for episodic results.
fn recency_score(memory: &Memory, now: DateTime<Utc>) -> f32 {
    let hours_ago = now
        .signed_duration_since(memory.created_at)
        .num_minutes() as f32
        / 60.0;
    (-hours_ago.max(0.0) / 168.0).exp()
}

fn sort_ranked(ranked: &mut [RecalledMemory]) {
    ranked.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.memory.id.cmp(&b.memory.id))
    });
}

/// BFS over the attached edges for the strongest results.
fn expand_related(ranked: &mut [RecalledMemory], max_depth: usize) {
    if max_depth == 0 {
        return;
    }
    // Adjacency over every edge attached anywhere in the result set.
    let mut adjacency: HashMap<String, HashSet<String>> = HashMap::new();
    for recalled in ranked.iter() {
        for attached in &recalled.connections {
            let edge = &attached.connection;
            adjacency
                .entry(edge.source_memory_id.clone())
                .or_default()
                .insert(edge.target_memory_id.clone());
            adjacency
                .entry(edge.target_memory_id.clone())
                .or_default()
                .insert(edge.source_memory_id.clone());
        }
    }

    for recalled in ranked.iter_mut().take(RELATED_EXPANSION_TOP) {
        let origin = recalled.memory.id.clone();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(origin.clone());
        let mut frontier = vec![origin.clone()];
        for _ in 0..max_depth {
            let mut next = Vec::new();
            for node in &frontier {
                if let Some(neighbors) = adjacency.get(node) {
                    for neighbor in neighbors {
                        if visited.insert(neighbor.clone()) {
                            next.push(neighbor.clone());
                        }
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        visited.remove(&origin);
        let mut related: Vec<String> = visited.into_iter().collect();
        related.sort_unstable();
        recalled.related_ids = related;
    }
}

/// One natural-language line naming the earliest referenced conversation
/// date, when any returned memory carries one.
fn conversation_context(ranked: &[RecalledMemory]) -> Option<String> {
    let mut earliest: Option<DateTime<Utc>> = None;
    for recalled in ranked {
        let Some(value) = recalled.memory.metadata.get("original_conversation_date") else {
            continue;
        };
        let parsed = match value {
            serde_json::Value::String(s) => s.parse::<DateTime<Utc>>().ok(),
            serde_json::Value::Number(n) => n
                .as_i64()
                .and_then(DateTime::<Utc>::from_timestamp_millis),
            _ => None,
        };
        if let Some(date) = parsed {
            earliest = Some(match earliest {
                Some(current) if current <= date => current,
                _ => date,
            });
        }
    }
    earliest.map(|date| {
        format!(
            "These memories reference conversations dating back to {}.",
            date.format("%Y-%m-%d")
        )
    })
}
