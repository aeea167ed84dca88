use std::sync::Arc;

use super::test_utils::*;
use crate::config::{ConsolidationSettings, LlmEnhancementSettings};
use crate::consolidation::Consolidator;
use crate::embedding::EmbeddingService;
use crate::storage::{InMemoryStorage, StorageGateway, TypeFilter};
use crate::MemoryType;

const USER: &str = "user-1";
const AGENT: &str = "agent-1";

fn consolidator(
    storage: Arc<InMemoryStorage>,
    settings: ConsolidationSettings,
) -> Consolidator {
    let embeddings = Arc::new(EmbeddingService::new(
        Arc::new(HashEmbedder::new(16)),
        100,
        4,
    ));
    Consolidator::new(
        storage,
        embeddings,
        None,
        settings,
        LlmEnhancementSettings::default(),
    )
}

#[tokio::test]
async fn identical_semantic_memories_merge_into_one() {
    // S5: two identical facts collapse; originals are deleted.
    let storage = Arc::new(InMemoryStorage::new());
    let mut first = memory_at(
        USER,
        AGENT,
        MemoryType::Semantic,
        "User prefers dark mode",
        minutes_ago(120),
    );
    first.importance = 0.6;
    let mut second = memory_at(
        USER,
        AGENT,
        MemoryType::Semantic,
        "User prefers dark mode",
        minutes_ago(60),
    );
    second.importance = 0.6;
    storage.store(USER, AGENT, &first).await.unwrap();
    storage.store(USER, AGENT, &second).await.unwrap();

    let settings = ConsolidationSettings {
        preserve_originals: false,
        similarity_threshold: 0.85,
        ..Default::default()
    };
    let results = consolidator(storage.clone(), settings)
        .consolidate_memories(USER, AGENT, None)
        .await
        .unwrap();

    let merge = results
        .iter()
        .find(|r| r.strategy == "merge_similar")
        .unwrap();
    assert_eq!(merge.created, 1);
    assert_eq!(merge.deleted, 2);
    assert_eq!(merge.errors, 0);

    let remaining = storage
        .get_by_type(USER, AGENT, MemoryType::Semantic, &TypeFilter::default())
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    let merged = &remaining[0];
    assert_eq!(merged.access_count, 0);
    assert_eq!(merged.content, "User prefers dark mode");
    let merged_from: Vec<String> =
        serde_json::from_value(merged.metadata["merged_from"].clone()).unwrap();
    assert_eq!(merged_from.len(), 2);
    assert!(merged_from.contains(&first.id));
    assert!(merged_from.contains(&second.id));
    assert!(storage.get_by_id(USER, &first.id).await.unwrap().is_none());
    assert!(storage.get_by_id(USER, &second.id).await.unwrap().is_none());

    // created_at/last_accessed_at span the inputs; importance is the max.
    assert_eq!(merged.created_at, first.created_at);
    assert!((merged.importance - 0.6).abs() < f32::EPSILON);
    let confidence = merged.metadata["merge_confidence"].as_f64().unwrap();
    assert!((confidence - (0.7 * 0.6 + 0.3 * (2.0 / 5.0))).abs() < 1e-6);
}

#[tokio::test]
async fn preserve_originals_keeps_every_input_retrievable() {
    let storage = Arc::new(InMemoryStorage::new());
    let first = memory_at(
        USER,
        AGENT,
        MemoryType::Semantic,
        "Standup happens at nine",
        minutes_ago(90),
    );
    let second = memory_at(
        USER,
        AGENT,
        MemoryType::Semantic,
        "Standup happens at nine",
        minutes_ago(45),
    );
    storage.store(USER, AGENT, &first).await.unwrap();
    storage.store(USER, AGENT, &second).await.unwrap();

    let settings = ConsolidationSettings {
        preserve_originals: true,
        ..Default::default()
    };
    consolidator(storage.clone(), settings)
        .consolidate_memories(USER, AGENT, None)
        .await
        .unwrap();

    // Every pre-consolidation id is still there, plus the merged memory.
    assert!(storage.get_by_id(USER, &first.id).await.unwrap().is_some());
    assert!(storage.get_by_id(USER, &second.id).await.unwrap().is_some());
    let all = storage
        .get_by_type(USER, AGENT, MemoryType::Semantic, &TypeFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn old_important_episodes_become_semantic_facts() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut old_important = memory_at(
        USER,
        AGENT,
        MemoryType::Episodic,
        "Learned the user works night shifts",
        minutes_ago(60 * 24 * 40),
    );
    old_important.importance = 0.6;
    let mut old_trivial = memory_at(
        USER,
        AGENT,
        MemoryType::Episodic,
        "Small talk about weather",
        minutes_ago(60 * 24 * 40),
    );
    old_trivial.importance = 0.3;
    let recent = memory_at(
        USER,
        AGENT,
        MemoryType::Episodic,
        "Yesterday's chat",
        minutes_ago(60),
    );
    for memory in [&old_important, &old_trivial, &recent] {
        storage.store(USER, AGENT, memory).await.unwrap();
    }

    let results = consolidator(storage.clone(), ConsolidationSettings::default())
        .consolidate_memories(USER, AGENT, None)
        .await
        .unwrap();
    let convert = results
        .iter()
        .find(|r| r.strategy == "convert_episodic")
        .unwrap();
    assert_eq!(convert.processed, 2);
    assert_eq!(convert.created, 1);
    assert_eq!(convert.deleted, 0);

    let semantics = storage
        .get_by_type(USER, AGENT, MemoryType::Semantic, &TypeFilter::default())
        .await
        .unwrap();
    assert_eq!(semantics.len(), 1);
    let converted = &semantics[0];
    assert!(converted.id.starts_with("sm_"));
    assert_eq!(converted.content, "Learned the user works night shifts");
    assert!((converted.importance - 0.7).abs() < 1e-6);
    assert_eq!(
        converted.metadata["converted_from"],
        serde_json::json!(old_important.id)
    );
    assert_eq!(
        converted.metadata["original_type"],
        serde_json::json!("episodic")
    );
    assert_eq!(
        converted.metadata["extraction_method"],
        serde_json::json!("verbatim")
    );
    // preserve_originals defaults to true.
    assert!(storage
        .get_by_id(USER, &old_important.id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn llm_summarisation_failure_falls_back_to_verbatim() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut old = memory_at(
        USER,
        AGENT,
        MemoryType::Episodic,
        "Discovered the user prefers async communication",
        minutes_ago(60 * 24 * 40),
    );
    old.importance = 0.8;
    storage.store(USER, AGENT, &old).await.unwrap();

    let embeddings = Arc::new(EmbeddingService::new(
        Arc::new(HashEmbedder::new(16)),
        100,
        4,
    ));
    let settings = ConsolidationSettings {
        llm_summarization: true,
        ..Default::default()
    };
    let consolidator = Consolidator::new(
        storage.clone(),
        embeddings,
        Some(Arc::new(ScriptedLlm::failing())),
        settings,
        LlmEnhancementSettings::default(),
    );
    consolidator
        .consolidate_memories(USER, AGENT, None)
        .await
        .unwrap();

    let semantics = storage
        .get_by_type(USER, AGENT, MemoryType::Semantic, &TypeFilter::default())
        .await
        .unwrap();
    assert_eq!(semantics.len(), 1);
    assert_eq!(
        semantics[0].metadata["extraction_method"],
        serde_json::json!("verbatim")
    );
    assert_eq!(semantics[0].content, old.content);
}

#[tokio::test]
async fn distinct_facts_do_not_merge() {
    let storage = Arc::new(InMemoryStorage::new());
    let coffee = memory_at(
        USER,
        AGENT,
        MemoryType::Semantic,
        "prefers espresso over filter coffee",
        minutes_ago(60),
    );
    let timezone = memory_at(
        USER,
        AGENT,
        MemoryType::Semantic,
        "works from the Lisbon timezone",
        minutes_ago(30),
    );
    storage.store(USER, AGENT, &coffee).await.unwrap();
    storage.store(USER, AGENT, &timezone).await.unwrap();

    let embeddings = Arc::new(EmbeddingService::new(
        Arc::new(FixedEmbedder::new(&[
            ("prefers espresso over filter coffee", unit_vector(0.0)),
            ("works from the Lisbon timezone", unit_vector(90.0)),
        ])),
        100,
        4,
    ));
    let settings = ConsolidationSettings {
        preserve_originals: false,
        similarity_threshold: 0.85,
        ..Default::default()
    };
    let results = Consolidator::new(
        storage.clone(),
        embeddings,
        None,
        settings,
        LlmEnhancementSettings::default(),
    )
    .consolidate_memories(USER, AGENT, None)
    .await
    .unwrap();
    let merge = results
        .iter()
        .find(|r| r.strategy == "merge_similar")
        .unwrap();
    assert_eq!(merge.created, 0);
    assert_eq!(merge.deleted, 0);

    let all = storage
        .get_by_type(USER, AGENT, MemoryType::Semantic, &TypeFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn blank_user_is_rejected() {
    let storage = Arc::new(InMemoryStorage::new());
    let result = consolidator(storage, ConsolidationSettings::default())
        .consolidate_memories("", AGENT, None)
        .await;
    assert!(matches!(result, Err(crate::MemoryError::InvalidUser)));
}
