mod queue;
mod rules;

pub use queue::{DiscoveryHandle, DiscoveryQueue};

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::config::{
    ConnectionDetectionSettings, CostControlSettings, DetectionMethod, IntelligenceConfig,
};
use crate::cost::{CostTracker, ExtractionRecord};
use crate::embedding::{cosine_similarity, EmbeddingService};
use crate::error::{short_id, MemoryError, Result};
use crate::llm::{parse_validated, ChatMessage, StructuredLlm};
use crate::storage::StorageGateway;
use crate::{
    generate_connection_id, ConnectionMetadata, ConnectionType, Memory, MemoryConnection,
};

/// Outcome of one ladder traversal for a memory pair
pub(crate) struct ConnectionAnalysis {
    pub connection_type: ConnectionType,
    pub confidence: f32,
    pub reasoning: String,
    pub method: &'static str,
    pub llm_used: bool,
}

#[derive(Deserialize)]
struct LlmConnectionAnalysis {
    connection_type: ConnectionType,
    confidence: f32,
    reasoning: Option<String>,
}

/// Progressive-enhancement connection discovery: fast embedding path, user
/// rules, budgeted LLM classification, heuristic fallback. Cheapest
/// sufficient signal wins; a lower level failing never takes the pass down
/// with it.
pub struct ConnectionManager {
    storage: Arc<dyn StorageGateway>,
    embeddings: Arc<EmbeddingService>,
    llm: Option<Arc<dyn StructuredLlm>>,
    cost: Arc<CostTracker>,
    detection: ConnectionDetectionSettings,
    cost_control: CostControlSettings,
    similarity_threshold: f32,
    rules: tokio::sync::Mutex<Vec<crate::config::ConnectionRule>>,
    queue: OnceLock<Arc<DiscoveryQueue>>,
    budget_skips: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        embeddings: Arc<EmbeddingService>,
        llm: Option<Arc<dyn StructuredLlm>>,
        cost: Arc<CostTracker>,
        config: &IntelligenceConfig,
    ) -> Self {
        Self {
            storage,
            embeddings,
            llm,
            cost,
            detection: config.connection_detection.clone(),
            cost_control: config.cost_control.clone(),
            similarity_threshold: config.embedding.similarity_threshold,
            rules: tokio::sync::Mutex::new(config.connection_detection.user_rules.patterns.clone()),
            queue: OnceLock::new(),
            budget_skips: AtomicU64::new(0),
        }
    }

    /// Wire the background queue after construction (the queue's worker needs
    /// an Arc of this manager).
    pub fn attach_queue(&self, queue: Arc<DiscoveryQueue>) {
        let _ = self.queue.set(queue);
    }

    /// Schedule background discovery for a stored memory. Without an attached
    /// queue this resolves immediately empty.
    pub fn enqueue_discovery(
        &self,
        user_id: &str,
        agent_id: &str,
        memory_id: &str,
    ) -> DiscoveryHandle {
        match self.queue.get() {
            Some(queue) => queue.enqueue(user_id, agent_id, memory_id),
            None => DiscoveryHandle::resolved_empty(),
        }
    }

    pub async fn get_memory_by_id(&self, user_id: &str, id: &str) -> Result<Option<Memory>> {
        Ok(self.storage.get_by_id(user_id, id).await?)
    }

    /// Times the LLM level was skipped because the agent's budget ran out.
    pub fn budget_skips(&self) -> u64 {
        self.budget_skips.load(Ordering::Relaxed)
    }

    /// Compare a new memory against the most recent memories of its owner
    /// and emit candidate edges, strongest first, capped by
    /// `cost_control.max_llm_calls_per_batch`.
    ///
    /// Storage and embedding failures degrade to an empty result; only a
    /// blank user id or a misconfigured rule surface as errors.
    pub async fn discover_connections(
        &self,
        user_id: &str,
        agent_id: &str,
        new_memory: &Memory,
    ) -> Result<Vec<MemoryConnection>> {
        if user_id.trim().is_empty() {
            return Err(MemoryError::InvalidUser);
        }

        let candidates = match self
            .storage
            .get_recent(user_id, agent_id, self.detection.max_recent_memories)
            .await
        {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(
                    user = short_id(user_id),
                    error = %err,
                    "candidate fetch failed, skipping discovery"
                );
                return Ok(Vec::new());
            }
        };

        let new_embedding = match self.embeddings.embed(&new_memory.content).await {
            Ok(vector) => vector,
            Err(err) => {
                warn!(
                    user = short_id(user_id),
                    memory = new_memory.id.as_str(),
                    error = %err,
                    "embedding failed, skipping discovery"
                );
                return Ok(Vec::new());
            }
        };

        let mut edges = Vec::new();
        for candidate in candidates.iter().filter(|c| c.id != new_memory.id) {
            let candidate_embedding = match self.embeddings.embed(&candidate.content).await {
                Ok(vector) => vector,
                Err(err) => {
                    debug!(memory = candidate.id.as_str(), error = %err, "candidate skipped");
                    continue;
                }
            };
            let similarity = cosine_similarity(&new_embedding, &candidate_embedding);
            if similarity < self.similarity_threshold {
                continue;
            }

            // Ladder order: (older, newer) so the temporal heuristic sees a
            // positive delta for a memory following its candidate.
            let analysis = self
                .analyze_connection_type(agent_id, candidate, new_memory, similarity)
                .await?;

            if analysis.connection_type != ConnectionType::Similar
                || similarity > self.similarity_threshold
            {
                edges.push(MemoryConnection {
                    id: generate_connection_id(),
                    user_id: user_id.to_string(),
                    source_memory_id: new_memory.id.clone(),
                    target_memory_id: candidate.id.clone(),
                    connection_type: analysis.connection_type,
                    strength: similarity.max(analysis.confidence).clamp(0.0, 1.0),
                    reason: analysis.reasoning,
                    created_at: Utc::now(),
                    metadata: ConnectionMetadata {
                        method: analysis.method.to_string(),
                        confidence: analysis.confidence,
                        embedding_similarity: similarity,
                        llm_used: analysis.llm_used,
                        algorithm: None,
                    },
                });
            }
        }

        edges.sort_by(|a, b| {
            b.strength
                .partial_cmp(&a.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.target_memory_id.cmp(&b.target_memory_id))
        });
        edges.truncate(self.cost_control.max_llm_calls_per_batch);
        Ok(edges)
    }

    /// Four-level classification ladder for a pair that already passed the
    /// similarity threshold. `m2` is the newer memory of the pair.
    pub(crate) async fn analyze_connection_type(
        &self,
        agent_id: &str,
        m1: &Memory,
        m2: &Memory,
        similarity: f32,
    ) -> Result<ConnectionAnalysis> {
        // L0: similarity alone is conclusive, skip everything costlier.
        if self.cost_control.prefer_embedding_when_similar && similarity > 0.9 {
            return Ok(ConnectionAnalysis {
                connection_type: ConnectionType::Similar,
                confidence: similarity,
                reasoning: "High embedding similarity".to_string(),
                method: "embedding",
                llm_used: false,
            });
        }

        // L1: user rules, free of external calls beyond cached embeddings.
        if matches!(
            self.detection.method,
            DetectionMethod::UserRules | DetectionMethod::Hybrid
        ) && self.detection.user_rules.enabled
        {
            let mut rules = self.rules.lock().await;
            if let Some(analysis) =
                rules::evaluate_rules(&mut rules, &self.embeddings, m1, m2).await?
            {
                return Ok(analysis);
            }
        }

        // L2: budgeted LLM classification.
        if matches!(
            self.detection.method,
            DetectionMethod::SmallLlm | DetectionMethod::Hybrid
        ) && self.detection.llm_enhancement.enabled
        {
            if let Some(llm) = self.llm.clone() {
                if self
                    .cost
                    .check_budget(agent_id, self.cost_control.monthly_budget)
                {
                    if let Some(analysis) =
                        self.analyze_with_llm(llm.as_ref(), agent_id, m1, m2).await
                    {
                        return Ok(analysis);
                    }
                } else {
                    self.budget_skips.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        agent = short_id(agent_id),
                        "budget exhausted, llm level skipped"
                    );
                }
            }
        }

        // L3: heuristic fallback, always answers.
        Ok(Self::heuristic_analysis(m1, m2, similarity))
    }

    async fn analyze_with_llm(
        &self,
        llm: &dyn StructuredLlm,
        agent_id: &str,
        m1: &Memory,
        m2: &Memory,
    ) -> Option<ConnectionAnalysis> {
        let settings = &self.detection.llm_enhancement;
        let schema = json!({
            "type": "object",
            "properties": {
                "connection_type": {
                    "type": "string",
                    "enum": ["similar", "related", "causes", "part_of", "opposite"]
                },
                "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
                "reasoning": { "type": "string" }
            },
            "required": ["connection_type", "confidence"]
        });
        let messages = [ChatMessage::user(format!(
            "Classify the relationship between these two memories.\n\n\
             Memory A: {}\n\nMemory B: {}\n\n\
             Choose the connection type that fits best and estimate your confidence.",
            m1.content, m2.content
        ))];

        let output = match llm
            .generate_object(&schema, &messages, settings.temperature)
            .await
        {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, "llm classification failed, falling back");
                return None;
            }
        };

        let parsed: LlmConnectionAnalysis = match parse_validated(&output) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "llm response failed schema validation, falling back");
                return None;
            }
        };
        if !(0.0..=1.0).contains(&parsed.confidence) {
            warn!(
                confidence = parsed.confidence,
                "llm confidence out of range, falling back"
            );
            return None;
        }
        if parsed.confidence < settings.min_confidence {
            return None;
        }

        let cost = if let (Some(per_token), Some(usage)) = (settings.cost_per_token, output.usage)
        {
            per_token * usage.total_tokens as f64
        } else if let Some(per_operation) = settings.cost_per_operation {
            per_operation
        } else {
            warn!("no cost configured for llm enhancement, tracking zero spend");
            0.0
        };
        if self.cost_control.track_token_usage {
            self.cost.track_extraction(
                agent_id,
                &ExtractionRecord {
                    extractor_type: "connection-llm".to_string(),
                    cost,
                    memories_extracted: 0,
                    messages_processed: 2,
                    metadata: Default::default(),
                },
            );
        }

        Some(ConnectionAnalysis {
            connection_type: parsed.connection_type,
            confidence: parsed.confidence,
            reasoning: parsed
                .reasoning
                .unwrap_or_else(|| "LLM classification".to_string()),
            method: "llm",
            llm_used: true,
        })
    }

    fn heuristic_analysis(m1: &Memory, m2: &Memory, similarity: f32) -> ConnectionAnalysis {
        let delta_ms = m2.created_at_ms() - m1.created_at_ms();
        let hours = delta_ms as f64 / 3_600_000.0;

        if similarity > 0.85 && hours.abs() < 24.0 {
            ConnectionAnalysis {
                connection_type: ConnectionType::Related,
                confidence: similarity * 0.8,
                reasoning: "High similarity + temporal proximity".to_string(),
                method: "heuristic",
                llm_used: false,
            }
        } else if similarity > 0.75 && hours > 0.0 && hours < 1.0 {
            ConnectionAnalysis {
                connection_type: ConnectionType::Related,
                confidence: similarity * 0.7,
                reasoning: "Sequential content".to_string(),
                method: "heuristic",
                llm_used: false,
            }
        } else {
            ConnectionAnalysis {
                connection_type: ConnectionType::Similar,
                confidence: similarity,
                reasoning: "Embedding similarity above threshold".to_string(),
                method: "heuristic",
                llm_used: false,
            }
        }
    }

    /// Persist edges. Prefers the batch connection capability; falls back to
    /// user-scoped key-value writes; fails with `StoragePersistence` when the
    /// gateway offers neither.
    pub async fn create_connections(
        &self,
        user_id: &str,
        edges: &[MemoryConnection],
    ) -> Result<()> {
        if edges.is_empty() {
            return Ok(());
        }
        if user_id.trim().is_empty() {
            return Err(MemoryError::InvalidUser);
        }
        for edge in edges {
            if edge.source_memory_id == edge.target_memory_id {
                return Err(MemoryError::InvalidInput(format!(
                    "edge {} is a self-loop",
                    edge.id
                )));
            }
            if edge.user_id != user_id {
                return Err(MemoryError::InvalidInput(format!(
                    "edge {} is scoped to a different user",
                    edge.id
                )));
            }
            if !(0.0..=1.0).contains(&edge.strength) {
                return Err(MemoryError::InvalidInput(format!(
                    "edge {} has strength outside [0,1]",
                    edge.id
                )));
            }
        }

        if let Some(store) = self.storage.connections() {
            store
                .create_connections(user_id, edges)
                .await
                .map_err(|e| MemoryError::StoragePersistence(e.to_string()))?;
        } else if let Some(kv) = self.storage.key_value() {
            for edge in edges {
                let key = format!(
                    "user:{}:connection:{}:{}",
                    user_id, edge.source_memory_id, edge.target_memory_id
                );
                let value = serde_json::to_value(edge)
                    .map_err(|e| MemoryError::StoragePersistence(e.to_string()))?;
                kv.put(&key, value)
                    .await
                    .map_err(|e| MemoryError::StoragePersistence(e.to_string()))?;
            }
        } else {
            return Err(MemoryError::StoragePersistence(
                "storage offers neither connection nor key-value capability".to_string(),
            ));
        }
        Ok(())
    }
}
