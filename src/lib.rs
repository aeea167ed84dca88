// Agent memory intelligence layer: typed memory store per (user, agent) pair
// with background connection discovery, hybrid recall and consolidation.
pub mod config;
pub mod connection;
pub mod consolidation;
pub mod cost;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod manager;
pub mod recall;
pub mod storage;
pub mod temporal;
pub mod types;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Core memory kinds supported by the system
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Working,    // Short-term conversation context
    Episodic,   // Past experiences and interactions
    Semantic,   // Factual knowledge and information
    Procedural, // Trigger/action knowledge
}

impl MemoryType {
    pub const ALL: [MemoryType; 4] = [
        MemoryType::Working,
        MemoryType::Episodic,
        MemoryType::Semantic,
        MemoryType::Procedural,
    ];

    /// Prefix encoded into memory ids of this type.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            MemoryType::Working => "wm",
            MemoryType::Episodic => "ep",
            MemoryType::Semantic => "sm",
            MemoryType::Procedural => "pm",
        }
    }

    /// Importance assigned at creation when the caller does not override it.
    pub fn default_importance(&self) -> f32 {
        match self {
            MemoryType::Working => 0.8,
            MemoryType::Episodic => 0.5,
            MemoryType::Semantic => 0.7,
            MemoryType::Procedural => 0.8,
        }
    }

    /// Whether resonance decays over time for this type.
    pub fn decays(&self) -> bool {
        matches!(self, MemoryType::Episodic)
    }

    /// A session id is mandatory for conversation-scoped types.
    pub fn requires_session(&self) -> bool {
        matches!(self, MemoryType::Working | MemoryType::Episodic)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Working => "working",
            MemoryType::Episodic => "episodic",
            MemoryType::Semantic => "semantic",
            MemoryType::Procedural => "procedural",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "working" => Ok(MemoryType::Working),
            "episodic" => Ok(MemoryType::Episodic),
            "semantic" => Ok(MemoryType::Semantic),
            "procedural" => Ok(MemoryType::Procedural),
            other => Err(format!("unknown memory type: {}", other)),
        }
    }
}

/// A typed memory record owned by a (user, agent) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub memory_type: MemoryType,
    pub content: String,
    /// Salience assigned at write time, [0,1].
    pub importance: f32,
    /// Decayable visibility score, starts at 1.0. Only episodic memories decay.
    pub resonance: f32,
    pub access_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub session_id: Option<String>,
    pub token_count: u32,
    pub keywords: Vec<String>,
    pub embedding_id: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Memory {
    /// Create a memory with type defaults. Façades adjust fields afterwards.
    pub fn new(user_id: &str, agent_id: &str, memory_type: MemoryType, content: String) -> Self {
        let now = Utc::now();
        Self {
            id: generate_memory_id(memory_type, now),
            user_id: user_id.to_string(),
            agent_id: agent_id.to_string(),
            memory_type,
            content,
            importance: memory_type.default_importance(),
            resonance: 1.0,
            access_count: 0,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            session_id: None,
            token_count: 0,
            keywords: Vec::new(),
            embedding_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at.timestamp_millis()
    }
}

/// Kinds of semantic connections between two memories
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Similar,
    Related,
    Causes,
    PartOf,
    Opposite,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Similar => "similar",
            ConnectionType::Related => "related",
            ConnectionType::Causes => "causes",
            ConnectionType::PartOf => "part_of",
            ConnectionType::Opposite => "opposite",
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a connection classification was produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    /// Detection path that classified the edge: "embedding", "user-rule",
    /// "llm" or "heuristic".
    pub method: String,
    pub confidence: f32,
    pub embedding_similarity: f32,
    pub llm_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
}

/// A directed, typed edge between two memories of the same user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConnection {
    pub id: String,
    pub user_id: String,
    pub source_memory_id: String,
    pub target_memory_id: String,
    pub connection_type: ConnectionType,
    /// Edge strength in [0,1]; never below the embedding similarity it was
    /// derived from.
    pub strength: f32,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub metadata: ConnectionMetadata,
}

/// `{prefix}_{timestamp_ms}_{9-char base36 suffix}`
pub fn generate_memory_id(memory_type: MemoryType, at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        memory_type.id_prefix(),
        at.timestamp_millis(),
        base36_suffix(9)
    )
}

pub fn generate_connection_id() -> String {
    format!("conn_{}_{}", Utc::now().timestamp_millis(), base36_suffix(9))
}

fn base36_suffix(len: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut n = u128::from_be_bytes(*Uuid::new_v4().as_bytes());
    let mut out = String::with_capacity(len);
    for _ in 0..len {
        out.push(ALPHABET[(n % 36) as usize] as char);
        n /= 36;
    }
    out
}

// Re-export key types for easy access
pub use config::{ConnectionRule, DetectionMethod, IntelligenceConfig};
pub use connection::{ConnectionManager, DiscoveryQueue};
pub use consolidation::{ConsolidationResult, Consolidator};
pub use cost::CostTracker;
pub use embedding::{cosine_similarity, Embedder, EmbeddingService};
pub use error::{MemoryError, Result};
pub use llm::StructuredLlm;
pub use manager::MemorySystem;
pub use recall::{RecallQuery, RecallResult, RecallService};
pub use storage::StorageGateway;
pub use temporal::TemporalAnalyzer;
pub use types::{EpisodicMemory, ProceduralMemory, SemanticMemory, WorkingMemory};
