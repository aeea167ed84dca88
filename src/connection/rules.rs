use tracing::warn;

use super::ConnectionAnalysis;
use crate::config::ConnectionRule;
use crate::embedding::{cosine_similarity, EmbeddingService};
use crate::error::{MemoryError, Result};
use crate::Memory;

/// Evaluate user rules against a memory pair. Returns the first match.
///
/// A rule without a semantic description is a hard configuration error.
/// Embedding failures during evaluation are logged and count as non-matches
/// for that rule only.
pub(super) async fn evaluate_rules(
    rules: &mut [ConnectionRule],
    embeddings: &EmbeddingService,
    m1: &Memory,
    m2: &Memory,
) -> Result<Option<ConnectionAnalysis>> {
    for rule in rules.iter_mut().filter(|r| r.enabled) {
        if rule.semantic_description.trim().is_empty() {
            return Err(MemoryError::RuleMisconfigured(rule.name.clone()));
        }

        match evaluate_rule(rule, embeddings, m1, m2).await {
            Ok(true) => {
                return Ok(Some(ConnectionAnalysis {
                    connection_type: rule.connection_type,
                    confidence: rule.confidence,
                    reasoning: format!(
                        "Semantic match: {} - {}",
                        rule.name, rule.semantic_description
                    ),
                    method: "user-rule",
                    llm_used: false,
                }));
            }
            Ok(false) => {}
            Err(err) => {
                warn!(rule = rule.name.as_str(), error = %err, "rule evaluation failed");
            }
        }
    }
    Ok(None)
}

async fn evaluate_rule(
    rule: &mut ConnectionRule,
    embeddings: &EmbeddingService,
    m1: &Memory,
    m2: &Memory,
) -> std::result::Result<bool, crate::embedding::EmbeddingError> {
    if rule.semantic_embedding.is_none() {
        let vector = embeddings.embed(&rule.semantic_description).await?;
        rule.semantic_embedding = Some(vector.as_ref().clone());
    }
    let rule_embedding = rule
        .semantic_embedding
        .as_ref()
        .expect("cached on the line above");

    let em1 = embeddings.embed(&m1.content).await?;
    let em2 = embeddings.embed(&m2.content).await?;

    let threshold = rule.semantic_threshold;
    let sim1 = cosine_similarity(rule_embedding, &em1);
    let sim2 = cosine_similarity(rule_embedding, &em2);

    Ok(if rule.requires_both_memories {
        sim1 >= threshold && sim2 >= threshold
    } else {
        sim1 >= threshold || sim2 >= threshold
    })
}
