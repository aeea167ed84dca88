use std::sync::Arc;

use crate::config::IntelligenceConfig;
use crate::connection::{ConnectionManager, DiscoveryQueue};
use crate::consolidation::Consolidator;
use crate::cost::CostTracker;
use crate::embedding::{create_embedder, Embedder, EmbeddingService};
use crate::error::Result;
use crate::llm::StructuredLlm;
use crate::recall::{RecallQuery, RecallResult, RecallService};
use crate::storage::{DecayReport, MemoryStats, StorageGateway};
use crate::temporal::TemporalAnalyzer;
use crate::types::{EpisodicMemory, ProceduralMemory, SemanticMemory, WorkingMemory};

/// Wires a storage gateway and provider capabilities into the full
/// intelligence layer: typed façades, background discovery, recall,
/// temporal analysis and consolidation.
///
/// Construct inside a tokio runtime; the discovery worker is spawned here.
pub struct MemorySystem {
    storage: Arc<dyn StorageGateway>,
    embeddings: Arc<EmbeddingService>,
    cost: Arc<CostTracker>,
    connections: Arc<ConnectionManager>,
    queue: Arc<DiscoveryQueue>,
    working: WorkingMemory,
    episodic: EpisodicMemory,
    semantic: SemanticMemory,
    procedural: ProceduralMemory,
    recall: RecallService,
    temporal: TemporalAnalyzer,
    consolidator: Consolidator,
}

impl MemorySystem {
    /// Build from externally constructed capabilities.
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        embedder: Arc<dyn Embedder>,
        llm: Option<Arc<dyn StructuredLlm>>,
        config: IntelligenceConfig,
    ) -> Result<Self> {
        config.validate()?;

        let embeddings = Arc::new(EmbeddingService::new(
            embedder,
            config.embedding.cache_size,
            config.embedding.batch_size,
        ));
        let cost = Arc::new(CostTracker::new());

        let connections = Arc::new(ConnectionManager::new(
            storage.clone(),
            embeddings.clone(),
            llm.clone(),
            cost.clone(),
            &config,
        ));
        let queue = Arc::new(DiscoveryQueue::start(
            connections.clone(),
            DiscoveryQueue::DEFAULT_CAPACITY,
        ));
        connections.attach_queue(queue.clone());

        let working = WorkingMemory::new(
            storage.clone(),
            Some(connections.clone()),
            config.working_ttl_seconds,
        );
        let episodic = EpisodicMemory::new(
            storage.clone(),
            Some(connections.clone()),
            config.episodic_compression_age_days,
        );
        let semantic = SemanticMemory::new(storage.clone(), Some(connections.clone()));
        let procedural = ProceduralMemory::new(storage.clone(), Some(connections.clone()));

        let recall = RecallService::new(
            storage.clone(),
            embeddings.clone(),
            config.recall.clone(),
        );
        let temporal = TemporalAnalyzer::new(
            llm.clone(),
            cost.clone(),
            config.cost_control.clone(),
            config.connection_detection.llm_enhancement.clone(),
        );
        let consolidator = Consolidator::new(
            storage.clone(),
            embeddings.clone(),
            llm,
            config.consolidation.clone(),
            config.connection_detection.llm_enhancement.clone(),
        );

        Ok(Self {
            storage,
            embeddings,
            cost,
            connections,
            queue,
            working,
            episodic,
            semantic,
            procedural,
            recall,
            temporal,
            consolidator,
        })
    }

    /// Build the embedder from config (env-var key fallback applies).
    pub fn with_default_embedder(
        storage: Arc<dyn StorageGateway>,
        llm: Option<Arc<dyn StructuredLlm>>,
        config: IntelligenceConfig,
    ) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        Self::new(storage, embedder, llm, config)
    }

    pub fn working(&self) -> &WorkingMemory {
        &self.working
    }

    pub fn episodic(&self) -> &EpisodicMemory {
        &self.episodic
    }

    pub fn semantic(&self) -> &SemanticMemory {
        &self.semantic
    }

    pub fn procedural(&self) -> &ProceduralMemory {
        &self.procedural
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingService> {
        &self.embeddings
    }

    pub fn cost_tracker(&self) -> &Arc<CostTracker> {
        &self.cost
    }

    pub fn recall_service(&self) -> &RecallService {
        &self.recall
    }

    pub fn temporal(&self) -> &TemporalAnalyzer {
        &self.temporal
    }

    pub fn consolidator(&self) -> &Consolidator {
        &self.consolidator
    }

    pub async fn recall(&self, query: RecallQuery) -> Result<RecallResult> {
        self.recall.recall(query).await
    }

    pub async fn stats(&self, user_id: &str, agent_id: Option<&str>) -> Result<MemoryStats> {
        Ok(self.storage.get_stats(user_id, agent_id).await?)
    }

    /// Delegate to the decay capability; a gateway without it reports zeros.
    pub async fn apply_decay(
        &self,
        user_id: &str,
        agent_id: &str,
        decay_rate: f32,
    ) -> Result<DecayReport> {
        match self.storage.decay() {
            Some(decay) => Ok(decay.apply_decay(user_id, agent_id, decay_rate).await?),
            None => Ok(DecayReport::default()),
        }
    }

    /// Discovery jobs dropped under backpressure since startup.
    pub fn dropped_discovery_jobs(&self) -> u64 {
        self.queue.dropped_jobs()
    }
}
