use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::ConnectionType;

/// Top-level configuration for the intelligence layer. Every level rejects
/// unknown fields so a typo in a config file fails loudly instead of being
/// ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntelligenceConfig {
    pub embedding: EmbeddingSettings,
    pub connection_detection: ConnectionDetectionSettings,
    pub cost_control: CostControlSettings,
    pub recall: RecallSettings,
    pub consolidation: ConsolidationSettings,
    /// TTL stamped into working-memory `expires_at`, overridable per store.
    pub working_ttl_seconds: u64,
    /// Age stamped into episodic-memory `expires_at`, overridable per store.
    pub episodic_compression_age_days: u32,
}

impl Default for IntelligenceConfig {
    fn default() -> Self {
        Self {
            embedding: EmbeddingSettings::default(),
            connection_detection: ConnectionDetectionSettings::default(),
            cost_control: CostControlSettings::default(),
            recall: RecallSettings::default(),
            consolidation: ConsolidationSettings::default(),
            working_ttl_seconds: 3600,
            episodic_compression_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingSettings {
    pub enabled: bool,
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    /// Minimum cosine similarity for a candidate to be considered at all.
    pub similarity_threshold: f32,
    /// Explicit key; falls back to `{PROVIDER}_API_KEY` at construction.
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout_ms: u64,
    pub cache_size: usize,
    pub batch_size: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimension: 1536,
            similarity_threshold: 0.7,
            api_key: None,
            base_url: None,
            timeout_ms: 10_000,
            cache_size: 1000,
            batch_size: 16,
        }
    }
}

/// Which parts of the discovery ladder are active
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMethod {
    EmbeddingOnly,
    UserRules,
    SmallLlm,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionDetectionSettings {
    pub method: DetectionMethod,
    /// How many recent memories are fetched as discovery candidates.
    /// Valid range 10..=500.
    pub max_recent_memories: usize,
    pub user_rules: UserRulesSettings,
    pub llm_enhancement: LlmEnhancementSettings,
}

impl Default for ConnectionDetectionSettings {
    fn default() -> Self {
        Self {
            method: DetectionMethod::Hybrid,
            max_recent_memories: 50,
            user_rules: UserRulesSettings::default(),
            llm_enhancement: LlmEnhancementSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UserRulesSettings {
    pub enabled: bool,
    pub patterns: Vec<ConnectionRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmEnhancementSettings {
    pub enabled: bool,
    pub provider: String,
    pub model: String,
    /// Enforced range 0.1..=0.3.
    pub temperature: f32,
    pub min_confidence: f32,
    pub cost_per_token: Option<f64>,
    pub cost_per_operation: Option<f64>,
    pub fallback_to_embedding: bool,
    pub timeout_ms: u64,
}

impl Default for LlmEnhancementSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            min_confidence: 0.5,
            cost_per_token: None,
            cost_per_operation: None,
            fallback_to_embedding: true,
            timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CostControlSettings {
    /// Cap on edges emitted per discovery pass (and thus LLM calls).
    pub max_llm_calls_per_batch: usize,
    /// None disables budget checks entirely.
    pub monthly_budget: Option<f64>,
    /// Skip the LLM when embedding similarity already exceeds 0.9.
    pub prefer_embedding_when_similar: bool,
    pub track_token_usage: bool,
}

impl Default for CostControlSettings {
    fn default() -> Self {
        Self {
            max_llm_calls_per_batch: 10,
            monthly_budget: None,
            prefer_embedding_when_similar: true,
            track_token_usage: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecallSettings {
    pub default_limit: usize,
    pub min_relevance_threshold: f32,
    pub enable_caching: bool,
    pub cache_ttl_ms: u64,
    pub enable_related_memories: bool,
    pub max_related_depth: usize,
    pub hybrid_weights: HybridWeights,
}

impl Default for RecallSettings {
    fn default() -> Self {
        Self {
            default_limit: 10,
            min_relevance_threshold: 0.1,
            enable_caching: true,
            cache_ttl_ms: 60_000,
            enable_related_memories: true,
            max_related_depth: 2,
            hybrid_weights: HybridWeights::default(),
        }
    }
}

/// Weights for recall score fusion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HybridWeights {
    pub vector: f32,
    pub text: f32,
    pub temporal: f32,
    pub procedural: f32,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            vector: 0.4,
            text: 0.3,
            temporal: 0.2,
            procedural: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsolidationSettings {
    /// Episodic memories older than this are conversion candidates.
    pub max_age_days: u32,
    pub batch_size: usize,
    /// When true, consolidation never deletes its inputs.
    pub preserve_originals: bool,
    /// Cosine similarity above which semantic memories merge.
    pub similarity_threshold: f32,
    pub llm_summarization: bool,
    pub min_importance: f32,
}

impl Default for ConsolidationSettings {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            batch_size: 20,
            preserve_originals: true,
            similarity_threshold: 0.85,
            llm_summarization: false,
            min_importance: 0.5,
        }
    }
}

/// A user-defined semantic matching rule for connection classification.
/// The description is embedded once and cached; a rule without a description
/// is a configuration error, not a silent no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionRule {
    pub id: String,
    pub name: String,
    pub semantic_description: String,
    #[serde(skip)]
    pub semantic_embedding: Option<Vec<f32>>,
    pub connection_type: ConnectionType,
    pub confidence: f32,
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f32,
    #[serde(default = "default_true")]
    pub requires_both_memories: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_semantic_threshold() -> f32 {
    0.75
}

fn default_true() -> bool {
    true
}

impl IntelligenceConfig {
    /// Validate ranges the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        let det = &self.connection_detection;
        if !(10..=500).contains(&det.max_recent_memories) {
            return Err(MemoryError::InvalidInput(format!(
                "connection_detection.max_recent_memories must be in 10..=500, got {}",
                det.max_recent_memories
            )));
        }
        let temp = det.llm_enhancement.temperature;
        if !(0.1..=0.3).contains(&temp) {
            return Err(MemoryError::InvalidInput(format!(
                "llm_enhancement.temperature must be in 0.1..=0.3, got {}",
                temp
            )));
        }
        for (name, value) in [
            (
                "embedding.similarity_threshold",
                self.embedding.similarity_threshold,
            ),
            (
                "recall.min_relevance_threshold",
                self.recall.min_relevance_threshold,
            ),
            (
                "consolidation.similarity_threshold",
                self.consolidation.similarity_threshold,
            ),
            (
                "llm_enhancement.min_confidence",
                det.llm_enhancement.min_confidence,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MemoryError::InvalidInput(format!(
                    "{} must be in 0.0..=1.0, got {}",
                    name, value
                )));
            }
        }
        for rule in &det.user_rules.patterns {
            rule.validate()?;
        }
        Ok(())
    }

    /// Build a config from the process environment. Loads `.env` first so a
    /// checked-out workspace works out of the box.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let mut config = Self::default();
        if let Ok(provider) = std::env::var("EMBEDDING_PROVIDER") {
            config.embedding.provider = provider;
        }
        config
    }

    /// Load from a TOML/JSON/YAML file, layered under `MEMOGRAPH_*`
    /// environment overrides (`MEMOGRAPH_RECALL__DEFAULT_LIMIT=20`).
    pub fn from_file(path: &str) -> Result<Self> {
        let loaded: Self = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MEMOGRAPH").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| MemoryError::InvalidInput(format!("config load failed: {}", e)))?;
        loaded.validate()?;
        Ok(loaded)
    }
}

impl ConnectionRule {
    pub fn validate(&self) -> Result<()> {
        if self.semantic_description.trim().is_empty() {
            return Err(MemoryError::RuleMisconfigured(self.name.clone()));
        }
        if !(0.0..=1.0).contains(&self.confidence) || !(0.0..=1.0).contains(&self.semantic_threshold)
        {
            return Err(MemoryError::InvalidInput(format!(
                "rule '{}' has out-of-range confidence or threshold",
                self.name
            )));
        }
        Ok(())
    }
}
