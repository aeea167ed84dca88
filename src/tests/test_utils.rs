use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{HybridWeights, IntelligenceConfig};
use crate::embedding::{Embedder, EmbeddingError};
use crate::llm::{ChatMessage, LlmError, StructuredLlm, StructuredOutput, TokenUsage};
use crate::storage::{
    ConnectionStore, DecaySupport, HybridSearch, InMemoryStorage, KeyValueStore, MemoryStats,
    RecallOptions, StorageGateway, StorageResult, TypeFilter,
};
use crate::{generate_memory_id, Memory, MemoryType};

pub const DIM: usize = 4;

/// Embedder returning preset unit vectors per exact content; unknown texts
/// get a vector orthogonal to everything preset.
pub struct FixedEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    calls: AtomicUsize,
}

impl FixedEmbedder {
    pub fn new(pairs: &[(&str, Vec<f32>)]) -> Self {
        Self {
            vectors: pairs
                .iter()
                .map(|(text, vector)| (text.to_string(), vector.clone()))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|text| {
                self.vectors
                    .get(text)
                    .cloned()
                    .unwrap_or_else(|| vec![0.0, 0.0, 0.0, 1.0])
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

/// Deterministic byte-hash embedder for tests that only need stability.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut embedding = vec![0.0f32; self.dimension];
                for (i, &byte) in text.as_bytes().iter().enumerate() {
                    let idx = (i + byte as usize) % self.dimension;
                    embedding[idx] += byte as f32 / 255.0;
                }
                let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for value in &mut embedding {
                        *value /= norm;
                    }
                }
                embedding
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Wraps another embedder and adds latency to every call.
pub struct SlowEmbedder {
    inner: Box<dyn Embedder>,
    delay: std::time::Duration,
}

impl SlowEmbedder {
    pub fn new(inner: Box<dyn Embedder>, delay: std::time::Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl Embedder for SlowEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed_texts(texts).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed_texts(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Provider {
            status: 503,
            message: "provider down".to_string(),
        })
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

/// LLM double: counts calls, optionally always errors, otherwise returns the
/// scripted object.
pub struct ScriptedLlm {
    response: Option<serde_json::Value>,
    usage: Option<TokenUsage>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn returning(response: serde_json::Value) -> Self {
        Self {
            response: Some(response),
            usage: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_usage(mut self, total_tokens: u32) -> Self {
        self.usage = Some(TokenUsage {
            prompt_tokens: total_tokens / 2,
            completion_tokens: total_tokens / 2,
            total_tokens,
        });
        self
    }

    pub fn failing() -> Self {
        Self {
            response: None,
            usage: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StructuredLlm for ScriptedLlm {
    async fn generate_object(
        &self,
        _schema: &serde_json::Value,
        _messages: &[ChatMessage],
        _temperature: f32,
    ) -> Result<StructuredOutput, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.response {
            Some(object) => Ok(StructuredOutput {
                object: object.clone(),
                usage: self.usage,
            }),
            None => Err(LlmError::Api {
                message: "provider down".to_string(),
            }),
        }
    }
}

/// Delegating storage wrapper that counts candidate fetches, so tests can
/// observe how many discovery passes actually ran.
pub struct SpyStorage {
    pub inner: Arc<InMemoryStorage>,
    pub get_recent_calls: AtomicUsize,
}

impl SpyStorage {
    pub fn new(inner: Arc<InMemoryStorage>) -> Self {
        Self {
            inner,
            get_recent_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl StorageGateway for SpyStorage {
    async fn store(&self, user_id: &str, agent_id: &str, memory: &Memory) -> StorageResult<()> {
        self.inner.store(user_id, agent_id, memory).await
    }

    async fn recall(
        &self,
        user_id: &str,
        agent_id: &str,
        query: &str,
        options: &RecallOptions,
    ) -> StorageResult<Vec<Memory>> {
        self.inner.recall(user_id, agent_id, query, options).await
    }

    async fn get_by_id(&self, user_id: &str, id: &str) -> StorageResult<Option<Memory>> {
        self.inner.get_by_id(user_id, id).await
    }

    async fn get_by_type(
        &self,
        user_id: &str,
        agent_id: &str,
        memory_type: MemoryType,
        filter: &TypeFilter,
    ) -> StorageResult<Vec<Memory>> {
        self.inner
            .get_by_type(user_id, agent_id, memory_type, filter)
            .await
    }

    async fn get_recent(
        &self,
        user_id: &str,
        agent_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<Memory>> {
        self.get_recent_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_recent(user_id, agent_id, limit).await
    }

    async fn delete(&self, user_id: &str, agent_id: &str, id: &str) -> StorageResult<()> {
        self.inner.delete(user_id, agent_id, id).await
    }

    async fn get_stats(
        &self,
        user_id: &str,
        agent_id: Option<&str>,
    ) -> StorageResult<MemoryStats> {
        self.inner.get_stats(user_id, agent_id).await
    }

    async fn mark_accessed(&self, user_id: &str, ids: &[String]) -> StorageResult<()> {
        self.inner.mark_accessed(user_id, ids).await
    }

    fn connections(&self) -> Option<&dyn ConnectionStore> {
        self.inner.connections()
    }

    fn decay(&self) -> Option<&dyn DecaySupport> {
        self.inner.decay()
    }

    fn key_value(&self) -> Option<&dyn KeyValueStore> {
        self.inner.key_value()
    }
}

/// In-memory storage plus a canned hybrid-search capability keyed by id.
pub struct HybridFakeStorage {
    pub inner: Arc<InMemoryStorage>,
    scores: Mutex<HashMap<String, f32>>,
}

impl HybridFakeStorage {
    pub fn new(inner: Arc<InMemoryStorage>) -> Self {
        Self {
            inner,
            scores: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_score(&self, memory_id: &str, score: f32) {
        self.scores
            .lock()
            .unwrap()
            .insert(memory_id.to_string(), score);
    }
}

#[async_trait]
impl StorageGateway for HybridFakeStorage {
    async fn store(&self, user_id: &str, agent_id: &str, memory: &Memory) -> StorageResult<()> {
        self.inner.store(user_id, agent_id, memory).await
    }

    async fn recall(
        &self,
        user_id: &str,
        agent_id: &str,
        query: &str,
        options: &RecallOptions,
    ) -> StorageResult<Vec<Memory>> {
        self.inner.recall(user_id, agent_id, query, options).await
    }

    async fn get_by_id(&self, user_id: &str, id: &str) -> StorageResult<Option<Memory>> {
        self.inner.get_by_id(user_id, id).await
    }

    async fn get_by_type(
        &self,
        user_id: &str,
        agent_id: &str,
        memory_type: MemoryType,
        filter: &TypeFilter,
    ) -> StorageResult<Vec<Memory>> {
        self.inner
            .get_by_type(user_id, agent_id, memory_type, filter)
            .await
    }

    async fn get_recent(
        &self,
        user_id: &str,
        agent_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<Memory>> {
        self.inner.get_recent(user_id, agent_id, limit).await
    }

    async fn delete(&self, user_id: &str, agent_id: &str, id: &str) -> StorageResult<()> {
        self.inner.delete(user_id, agent_id, id).await
    }

    async fn get_stats(
        &self,
        user_id: &str,
        agent_id: Option<&str>,
    ) -> StorageResult<MemoryStats> {
        self.inner.get_stats(user_id, agent_id).await
    }

    async fn mark_accessed(&self, user_id: &str, ids: &[String]) -> StorageResult<()> {
        self.inner.mark_accessed(user_id, ids).await
    }

    fn connections(&self) -> Option<&dyn ConnectionStore> {
        self.inner.connections()
    }

    fn hybrid(&self) -> Option<&dyn HybridSearch> {
        Some(self)
    }
}

#[async_trait]
impl HybridSearch for HybridFakeStorage {
    async fn hybrid_search(
        &self,
        user_id: &str,
        agent_id: &str,
        _query: &str,
        _embedding: &[f32],
        _weights: &HybridWeights,
        limit: usize,
        _min_relevance: f32,
    ) -> StorageResult<Vec<(Memory, f32)>> {
        let scores = self.scores.lock().unwrap().clone();
        let all = self.inner.get_recent(user_id, agent_id, limit * 4).await?;
        let mut ranked: Vec<(Memory, f32)> = all
            .into_iter()
            .filter_map(|memory| {
                scores
                    .get(&memory.id)
                    .map(|score| (memory, *score))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit);
        Ok(ranked)
    }
}

/// A memory with an explicit creation time, stored through the raw gateway.
pub fn memory_at(
    user_id: &str,
    agent_id: &str,
    memory_type: MemoryType,
    content: &str,
    created_at: DateTime<Utc>,
) -> Memory {
    let mut memory = Memory::new(user_id, agent_id, memory_type, content.to_string());
    memory.id = generate_memory_id(memory_type, created_at);
    memory.created_at = created_at;
    memory.updated_at = created_at;
    memory.last_accessed_at = created_at;
    if memory_type.requires_session() {
        memory.session_id = Some("session-1".to_string());
    }
    memory
}

pub fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    Utc::now() - Duration::minutes(minutes)
}

/// Config tuned for tests: deterministic, no caching surprises.
pub fn test_config() -> IntelligenceConfig {
    let mut config = IntelligenceConfig::default();
    config.embedding.dimension = DIM;
    config.embedding.cache_size = 100;
    config.embedding.batch_size = 4;
    config.recall.enable_caching = false;
    config
}

/// Unit vector at the given angle (degrees) in the first two dimensions.
pub fn unit_vector(angle_degrees: f32) -> Vec<f32> {
    let radians = angle_degrees.to_radians();
    vec![radians.cos(), radians.sin(), 0.0, 0.0]
}

/// Opt-in log output for debugging a test run (`RUST_LOG=memograph=debug`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
