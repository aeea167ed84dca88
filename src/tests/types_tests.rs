use std::sync::Arc;
use std::time::{Duration, Instant};

use super::test_utils::*;
use crate::error::MemoryError;
use crate::storage::{InMemoryStorage, StorageGateway};
use crate::types::{
    EpisodicOptions, ProceduralMemory, ProceduralOptions, SemanticMemory, SemanticOptions,
    WorkingMemory, WorkingOptions,
};
use crate::{MemorySystem, MemoryType};

const USER: &str = "user-1";
const AGENT: &str = "agent-1";

fn in_memory_system(storage: Arc<InMemoryStorage>) -> MemorySystem {
    MemorySystem::new(
        storage,
        Arc::new(HashEmbedder::new(DIM)),
        None,
        test_config(),
    )
    .unwrap()
}

#[tokio::test]
async fn ids_carry_type_prefixes_and_type_defaults_apply() {
    let storage = Arc::new(InMemoryStorage::new());
    let system = in_memory_system(storage.clone());

    let wm = system
        .working()
        .store(
            USER,
            AGENT,
            "current topic is billing",
            WorkingOptions {
                session_id: "s-1".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let ep = system
        .episodic()
        .store(
            USER,
            AGENT,
            "user asked about invoices",
            EpisodicOptions {
                session_id: "s-1".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let sm = system
        .semantic()
        .store(USER, AGENT, "billing runs monthly", SemanticOptions::default())
        .await
        .unwrap();
    let pm = system
        .procedural()
        .store(
            USER,
            AGENT,
            "to refund, open the billing console",
            ProceduralOptions {
                trigger: "refund request".to_string(),
                action: "open billing console".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(wm.starts_with("wm_"));
    assert!(ep.starts_with("ep_"));
    assert!(sm.starts_with("sm_"));
    assert!(pm.starts_with("pm_"));

    let expectations = [(wm, 0.8f32), (ep, 0.5), (sm, 0.7), (pm, 0.8)];
    for (id, importance) in &expectations {
        let memory = storage.get_by_id(USER, id).await.unwrap().unwrap();
        assert!((memory.importance - importance).abs() < f32::EPSILON);
        assert!((memory.resonance - 1.0).abs() < f32::EPSILON);
        assert_eq!(memory.access_count, 0);
        assert!(memory.token_count > 0);
        assert!(!memory.keywords.is_empty());
    }
}

#[tokio::test]
async fn blank_user_or_missing_session_is_rejected() {
    let storage = Arc::new(InMemoryStorage::new());
    let system = in_memory_system(storage);

    let result = system
        .semantic()
        .store("", AGENT, "fact", SemanticOptions::default())
        .await;
    assert!(matches!(result, Err(MemoryError::InvalidUser)));

    let result = system
        .working()
        .store(USER, AGENT, "context", WorkingOptions::default())
        .await;
    assert!(matches!(result, Err(MemoryError::InvalidInput(_))));

    let result = system
        .episodic()
        .store(USER, AGENT, "episode", EpisodicOptions::default())
        .await;
    assert!(matches!(result, Err(MemoryError::InvalidInput(_))));
}

#[tokio::test]
async fn system_metadata_keys_override_caller_values() {
    let storage = Arc::new(InMemoryStorage::new());
    let system = in_memory_system(storage.clone());

    let mut metadata = std::collections::HashMap::new();
    metadata.insert("expires_at".to_string(), serde_json::json!(1));
    metadata.insert("note".to_string(), serde_json::json!("kept"));

    let id = system
        .working()
        .store(
            USER,
            AGENT,
            "short lived context",
            WorkingOptions {
                session_id: "s-1".to_string(),
                ttl_seconds: Some(3600),
                metadata,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let memory = storage.get_by_id(USER, &id).await.unwrap().unwrap();
    let expires = memory.metadata["expires_at"].as_i64().unwrap();
    assert!(expires > chrono::Utc::now().timestamp_millis());
    assert_eq!(memory.metadata["note"], serde_json::json!("kept"));
}

#[tokio::test]
async fn store_latency_is_independent_of_embedding_latency() {
    let storage = Arc::new(InMemoryStorage::new());
    let slow = Arc::new(SlowEmbedder::new(
        Box::new(HashEmbedder::new(DIM)),
        Duration::from_millis(500),
    ));
    let system = MemorySystem::new(storage, slow, None, test_config()).unwrap();

    let started = Instant::now();
    system
        .semantic()
        .store(USER, AGENT, "latency probe", SemanticOptions::default())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn expired_working_memories_drop_out_of_get_active() {
    let storage = Arc::new(InMemoryStorage::new());
    let working = WorkingMemory::new(storage.clone(), None, 3600);

    working
        .store(
            USER,
            AGENT,
            "already expired",
            WorkingOptions {
                session_id: "s-1".to_string(),
                ttl_seconds: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    working
        .store(
            USER,
            AGENT,
            "still active",
            WorkingOptions {
                session_id: "s-1".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let active = working.get_active(USER, AGENT).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].content, "still active");
}

#[tokio::test]
async fn semantic_search_prefers_high_confidence_facts() {
    let storage = Arc::new(InMemoryStorage::new());
    let semantic = SemanticMemory::new(storage.clone(), None);

    semantic
        .store(
            USER,
            AGENT,
            "the deploy pipeline uses blue green",
            SemanticOptions {
                confidence: 0.4,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    semantic
        .store(
            USER,
            AGENT,
            "the deploy pipeline runs on merge",
            SemanticOptions {
                confidence: 0.95,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let results = semantic.search(USER, AGENT, "deploy pipeline", 10).await.unwrap();
    assert_eq!(results.len(), 2);
    let first_confidence = results[0].metadata["confidence"].as_f64().unwrap();
    assert!(first_confidence > 0.9);
}

#[tokio::test]
async fn procedural_matches_rank_by_trigger_overlap() {
    let storage = Arc::new(InMemoryStorage::new());
    let procedural = ProceduralMemory::new(storage.clone(), None);

    procedural
        .store(
            USER,
            AGENT,
            "restart the worker pool",
            ProceduralOptions {
                trigger: "queue backlog growing".to_string(),
                action: "restart workers".to_string(),
                success: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    procedural
        .store(
            USER,
            AGENT,
            "rotate the api keys",
            ProceduralOptions {
                trigger: "credentials leaked".to_string(),
                action: "rotate keys".to_string(),
                success: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let matches = procedural
        .find_matching(USER, AGENT, "queue backlog growing fast", 5)
        .await
        .unwrap();
    assert!(!matches.is_empty());
    assert_eq!(matches[0].content, "restart the worker pool");

    let missing_trigger = procedural
        .store(
            USER,
            AGENT,
            "bad procedure",
            ProceduralOptions::default(),
        )
        .await;
    assert!(matches!(missing_trigger, Err(MemoryError::InvalidInput(_))));
}

#[tokio::test]
async fn episodic_timeline_respects_the_window() {
    let storage = Arc::new(InMemoryStorage::new());

    let old = memory_at(USER, AGENT, MemoryType::Episodic, "ancient event", minutes_ago(60 * 24 * 10));
    let recent = memory_at(USER, AGENT, MemoryType::Episodic, "recent event", minutes_ago(30));
    storage.store(USER, AGENT, &old).await.unwrap();
    storage.store(USER, AGENT, &recent).await.unwrap();

    let episodic = crate::types::EpisodicMemory::new(storage, None, 30);
    let timeline = episodic
        .get_timeline(USER, AGENT, minutes_ago(120), chrono::Utc::now(), 10)
        .await
        .unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].content, "recent event");
}
