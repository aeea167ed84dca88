use crate::embedding::EmbeddingError;
use crate::llm::LlmError;
use crate::storage::StorageError;

/// Failure taxonomy for the memory layer. Writes are strict, background work
/// is forgiving: store paths propagate these, discovery and analysis paths
/// log and continue.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("user id must not be empty")]
    InvalidUser,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("connection rule '{0}' has no semantic description")]
    RuleMisconfigured(String),
    #[error("transient storage failure: {0}")]
    StorageTransient(String),
    #[error("storage persistence failure: {0}")]
    StoragePersistence(String),
    #[error("embedding failure: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("llm failure: {0}")]
    Llm(String),
    #[error("monthly budget exhausted for agent")]
    BudgetExceeded,
}

impl From<StorageError> for MemoryError {
    fn from(err: StorageError) -> Self {
        MemoryError::StorageTransient(err.to_string())
    }
}

impl From<LlmError> for MemoryError {
    fn from(err: LlmError) -> Self {
        MemoryError::Llm(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;

/// First 8 characters of a user/agent id. All log lines go through this so
/// full ids never reach the log stream.
pub fn short_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}
