use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::{ConsolidationSettings, LlmEnhancementSettings};
use crate::embedding::{cosine_similarity, EmbeddingService};
use crate::error::{short_id, MemoryError, Result};
use crate::llm::{parse_validated, ChatMessage, StructuredLlm};
use crate::storage::{StorageGateway, TypeFilter};
use crate::{Memory, MemoryType};

/// Outcome of one consolidation strategy
#[derive(Debug, Clone)]
pub struct ConsolidationResult {
    pub strategy: String,
    pub processed: usize,
    pub created: usize,
    pub deleted: usize,
    pub errors: usize,
    pub duration_ms: u64,
}

impl ConsolidationResult {
    fn new(strategy: &str) -> Self {
        Self {
            strategy: strategy.to_string(),
            processed: 0,
            created: 0,
            deleted: 0,
            errors: 0,
            duration_ms: 0,
        }
    }
}

#[derive(Deserialize)]
struct SummarizedContent {
    content: String,
}

/// Periodic compression: promotes old episodic memories to semantic facts
/// and merges near-duplicate semantic memories. Per-memory failures are
/// counted, logged and skipped; the run keeps going.
pub struct Consolidator {
    storage: Arc<dyn StorageGateway>,
    embeddings: Arc<EmbeddingService>,
    llm: Option<Arc<dyn StructuredLlm>>,
    settings: ConsolidationSettings,
    llm_settings: LlmEnhancementSettings,
}

impl Consolidator {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        embeddings: Arc<EmbeddingService>,
        llm: Option<Arc<dyn StructuredLlm>>,
        settings: ConsolidationSettings,
        llm_settings: LlmEnhancementSettings,
    ) -> Self {
        Self {
            storage,
            embeddings,
            llm,
            settings,
            llm_settings,
        }
    }

    /// Run both strategies for a (user, agent) pair. `overrides` replaces the
    /// configured settings for this run only.
    pub async fn consolidate_memories(
        &self,
        user_id: &str,
        agent_id: &str,
        overrides: Option<ConsolidationSettings>,
    ) -> Result<Vec<ConsolidationResult>> {
        if user_id.trim().is_empty() {
            return Err(MemoryError::InvalidUser);
        }
        let settings = overrides.as_ref().unwrap_or(&self.settings);

        let results = vec![
            self.convert_episodic(user_id, agent_id, settings).await,
            self.merge_similar(user_id, agent_id, settings).await,
        ];
        info!(
            user = short_id(user_id),
            agent = short_id(agent_id),
            "consolidation pass finished"
        );
        Ok(results)
    }

    /// Episodic memories older than `max_age_days` and important enough
    /// become semantic facts.
    async fn convert_episodic(
        &self,
        user_id: &str,
        agent_id: &str,
        settings: &ConsolidationSettings,
    ) -> ConsolidationResult {
        let started = Instant::now();
        let mut result = ConsolidationResult::new("convert_episodic");

        let cutoff = Utc::now() - Duration::days(settings.max_age_days as i64);
        let filter = TypeFilter {
            created_before: Some(cutoff),
            limit: None,
        };
        let candidates = match self
            .storage
            .get_by_type(user_id, agent_id, MemoryType::Episodic, &filter)
            .await
        {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(user = short_id(user_id), error = %err, "episodic fetch failed");
                result.errors += 1;
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };

        for batch in candidates.chunks(settings.batch_size.max(1)) {
            for original in batch {
                result.processed += 1;
                if original.importance < settings.min_importance {
                    continue;
                }
                let (content, extraction_method) =
                    self.generalized_content(original, settings).await;

                let mut converted =
                    Memory::new(user_id, agent_id, MemoryType::Semantic, content);
                converted.importance = (original.importance + 0.1).min(1.0);
                converted.session_id = original.session_id.clone();
                converted.keywords = original.keywords.clone();
                converted.token_count = original.token_count;
                converted.metadata = original.metadata.clone();
                converted
                    .metadata
                    .insert("converted_from".to_string(), json!(original.id));
                converted
                    .metadata
                    .insert("original_type".to_string(), json!("episodic"));
                converted.metadata.insert(
                    "conversion_date".to_string(),
                    json!(Utc::now().timestamp_millis()),
                );
                converted
                    .metadata
                    .insert("extraction_method".to_string(), json!(extraction_method));

                if let Err(err) = self.storage.store(user_id, agent_id, &converted).await {
                    warn!(memory = original.id.as_str(), error = %err, "conversion store failed");
                    result.errors += 1;
                    continue;
                }
                result.created += 1;

                if !settings.preserve_originals {
                    match self.storage.delete(user_id, agent_id, &original.id).await {
                        Ok(()) => result.deleted += 1,
                        Err(err) => {
                            warn!(memory = original.id.as_str(), error = %err, "original delete failed");
                            result.errors += 1;
                        }
                    }
                }
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    /// Cluster semantic memories by embedding similarity and merge each
    /// cluster into one consolidated memory.
    async fn merge_similar(
        &self,
        user_id: &str,
        agent_id: &str,
        settings: &ConsolidationSettings,
    ) -> ConsolidationResult {
        let started = Instant::now();
        let mut result = ConsolidationResult::new("merge_similar");

        let memories = match self
            .storage
            .get_by_type(user_id, agent_id, MemoryType::Semantic, &TypeFilter::default())
            .await
        {
            Ok(memories) => memories,
            Err(err) => {
                warn!(user = short_id(user_id), error = %err, "semantic fetch failed");
                result.errors += 1;
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };
        if memories.len() < 2 {
            result.processed = memories.len();
            result.duration_ms = started.elapsed().as_millis() as u64;
            return result;
        }

        let contents: Vec<String> = memories.iter().map(|m| m.content.clone()).collect();
        let embeddings = match self.embeddings.embed_batch(&contents).await {
            Ok(embeddings) => embeddings,
            Err(err) => {
                warn!(user = short_id(user_id), error = %err, "embedding failed, merge skipped");
                result.errors += 1;
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };

        let mut merged_ids: HashSet<String> = HashSet::new();
        for i in 0..memories.len() {
            if merged_ids.contains(&memories[i].id) {
                continue;
            }
            result.processed += 1;

            // The seed belongs to its own similarity set.
            let mut group: Vec<&Memory> = vec![&memories[i]];
            for j in (i + 1)..memories.len() {
                if merged_ids.contains(&memories[j].id) {
                    continue;
                }
                let similarity = cosine_similarity(&embeddings[i], &embeddings[j]);
                if similarity > settings.similarity_threshold {
                    group.push(&memories[j]);
                }
            }
            if group.len() < 2 {
                continue;
            }

            group.sort_by(|a, b| {
                b.importance
                    .partial_cmp(&a.importance)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.last_accessed_at.cmp(&a.last_accessed_at))
                    .then_with(|| a.id.cmp(&b.id))
            });

            match self.merge_group(user_id, agent_id, &group, settings).await {
                Ok(()) => {
                    result.created += 1;
                    for member in &group {
                        merged_ids.insert(member.id.clone());
                    }
                    if !settings.preserve_originals {
                        for member in &group {
                            match self.storage.delete(user_id, agent_id, &member.id).await {
                                Ok(()) => result.deleted += 1,
                                Err(err) => {
                                    warn!(memory = member.id.as_str(), error = %err, "merge input delete failed");
                                    result.errors += 1;
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(user = short_id(user_id), error = %err, "merge failed");
                    result.errors += 1;
                }
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn merge_group(
        &self,
        user_id: &str,
        agent_id: &str,
        group: &[&Memory],
        settings: &ConsolidationSettings,
    ) -> Result<()> {
        let primary = group[0];
        let n = group.len();
        let avg_importance: f32 =
            group.iter().map(|m| m.importance).sum::<f32>() / n as f32;
        let merge_confidence =
            (0.7 * avg_importance + 0.3 * (n as f32 / 5.0).min(1.0)).min(0.95);

        let content = if settings.llm_summarization && self.llm.is_some() {
            self.synthesized_content(group).await
        } else {
            None
        }
        .unwrap_or_else(|| {
            let mut unique: Vec<&str> = Vec::new();
            for member in group {
                if !unique.contains(&member.content.as_str()) {
                    unique.push(&member.content);
                }
            }
            unique.join("\n")
        });

        let mut merged = Memory::new(user_id, agent_id, MemoryType::Semantic, content);
        merged.importance = group
            .iter()
            .map(|m| m.importance)
            .fold(0.0f32, f32::max);
        merged.access_count = group.iter().map(|m| m.access_count).sum();
        merged.created_at = group
            .iter()
            .map(|m| m.created_at)
            .min()
            .unwrap_or(merged.created_at);
        merged.last_accessed_at = group
            .iter()
            .map(|m| m.last_accessed_at)
            .max()
            .unwrap_or(merged.last_accessed_at);
        merged.session_id = primary.session_id.clone();

        let mut keywords: Vec<String> = Vec::new();
        for member in group {
            for keyword in &member.keywords {
                if !keywords.contains(keyword) {
                    keywords.push(keyword.clone());
                    if keywords.len() >= 20 {
                        break;
                    }
                }
            }
        }
        merged.keywords = keywords;

        merged.metadata = primary.metadata.clone();
        merged.metadata.insert(
            "merged_from".to_string(),
            json!(group.iter().map(|m| m.id.as_str()).collect::<Vec<_>>()),
        );
        merged
            .metadata
            .insert("merge_confidence".to_string(), json!(merge_confidence));

        self.storage
            .store(user_id, agent_id, &merged)
            .await
            .map_err(|e| MemoryError::StoragePersistence(e.to_string()))?;
        Ok(())
    }

    /// Tense-free generalization of an episode, or the original content
    /// verbatim when LLM summarisation is off or fails.
    async fn generalized_content(
        &self,
        original: &Memory,
        settings: &ConsolidationSettings,
    ) -> (String, &'static str) {
        if !settings.llm_summarization {
            return (original.content.clone(), "verbatim");
        }
        let Some(llm) = self.llm.clone() else {
            return (original.content.clone(), "verbatim");
        };

        let schema = json!({
            "type": "object",
            "properties": { "content": { "type": "string" } },
            "required": ["content"]
        });
        let messages = [ChatMessage::user(format!(
            "Rewrite this episode as a general, tense-free fact that stays \
             true outside its original moment:\n\n{}",
            original.content
        ))];
        match llm
            .generate_object(&schema, &messages, self.llm_settings.temperature)
            .await
            .map_err(|e| e.to_string())
            .and_then(|output| {
                parse_validated::<SummarizedContent>(&output).map_err(|e| e.to_string())
            }) {
            Ok(summary) if !summary.content.trim().is_empty() => (summary.content, "llm"),
            Ok(_) => (original.content.clone(), "verbatim"),
            Err(err) => {
                warn!(memory = original.id.as_str(), error = err.as_str(), "summarisation failed");
                (original.content.clone(), "verbatim")
            }
        }
    }

    async fn synthesized_content(&self, group: &[&Memory]) -> Option<String> {
        let llm = self.llm.clone()?;
        let schema = json!({
            "type": "object",
            "properties": { "content": { "type": "string" } },
            "required": ["content"]
        });
        let combined = group
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n");
        let messages = [ChatMessage::user(format!(
            "Synthesize these overlapping facts into one consolidated \
             statement:\n\n{}",
            combined
        ))];
        match llm
            .generate_object(&schema, &messages, self.llm_settings.temperature)
            .await
        {
            Ok(output) => match parse_validated::<SummarizedContent>(&output) {
                Ok(summary) if !summary.content.trim().is_empty() => Some(summary.content),
                _ => None,
            },
            Err(err) => {
                warn!(error = %err, "synthesis failed, concatenating contents");
                None
            }
        }
    }
}
