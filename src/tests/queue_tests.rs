use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::test_utils::*;
use crate::config::IntelligenceConfig;
use crate::connection::{ConnectionManager, DiscoveryQueue};
use crate::cost::CostTracker;
use crate::embedding::EmbeddingService;
use crate::storage::{InMemoryStorage, StorageGateway};
use crate::types::SemanticOptions;
use crate::{ConnectionType, MemorySystem, MemoryType};

const USER: &str = "user-1";
const AGENT: &str = "agent-1";

fn queue_fixture(
    storage: Arc<dyn StorageGateway>,
    embedder: Arc<FixedEmbedder>,
    config: &IntelligenceConfig,
    capacity: usize,
) -> (Arc<ConnectionManager>, DiscoveryQueue) {
    let embeddings = Arc::new(EmbeddingService::new(embedder, 100, 4));
    let manager = Arc::new(ConnectionManager::new(
        storage,
        embeddings,
        None,
        Arc::new(CostTracker::new()),
        config,
    ));
    let queue = DiscoveryQueue::start(manager.clone(), capacity);
    (manager, queue)
}

#[tokio::test]
async fn duplicate_enqueues_resolve_empty_and_run_once() {
    let inner = Arc::new(InMemoryStorage::new());
    let spy = Arc::new(SpyStorage::new(inner.clone()));
    let embedder = Arc::new(FixedEmbedder::new(&[
        ("water the plants", unit_vector(0.0)),
        ("watered the garden", unit_vector(18.0)),
    ]));
    let config = test_config();
    let (_manager, queue) = queue_fixture(spy.clone(), embedder, &config, 8);

    let older = memory_at(USER, AGENT, MemoryType::Semantic, "water the plants", minutes_ago(5));
    let newer = memory_at(USER, AGENT, MemoryType::Semantic, "watered the garden", minutes_ago(0));
    spy.store(USER, AGENT, &older).await.unwrap();
    spy.store(USER, AGENT, &newer).await.unwrap();

    // All three issued before the worker gets a chance to run.
    let first = queue.enqueue(USER, AGENT, &newer.id);
    let second = queue.enqueue(USER, AGENT, &newer.id);
    let third = queue.enqueue(USER, AGENT, &newer.id);

    assert!(second.wait().await.is_empty());
    assert!(third.wait().await.is_empty());

    let edges = first.wait().await;
    assert_eq!(edges.len(), 1);
    assert_eq!(spy.get_recent_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn key_is_released_after_completion() {
    let inner = Arc::new(InMemoryStorage::new());
    let spy = Arc::new(SpyStorage::new(inner.clone()));
    let embedder = Arc::new(FixedEmbedder::new(&[]));
    let config = test_config();
    let (_manager, queue) = queue_fixture(spy.clone(), embedder, &config, 8);

    let memory = memory_at(USER, AGENT, MemoryType::Semantic, "solo memory", minutes_ago(0));
    spy.store(USER, AGENT, &memory).await.unwrap();

    queue.enqueue(USER, AGENT, &memory.id).wait().await;
    // A fresh enqueue for the same key runs again once the first finished.
    queue.enqueue(USER, AGENT, &memory.id).wait().await;
    assert_eq!(spy.get_recent_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn full_channel_drops_with_metric_instead_of_blocking() {
    let storage = Arc::new(InMemoryStorage::new());
    let embedder = Arc::new(FixedEmbedder::new(&[]));
    let config = test_config();
    let (_manager, queue) = queue_fixture(storage.clone(), embedder, &config, 1);

    for i in 0..3 {
        let memory = memory_at(
            USER,
            AGENT,
            MemoryType::Semantic,
            &format!("filler {}", i),
            minutes_ago(0),
        );
        storage.store(USER, AGENT, &memory).await.unwrap();
        let started = Instant::now();
        let _ = queue.enqueue(USER, AGENT, &memory.id);
        assert!(started.elapsed() < Duration::from_millis(20));
    }
    assert!(queue.dropped_jobs() >= 1);
}

#[tokio::test]
async fn worker_survives_a_missing_memory() {
    let storage = Arc::new(InMemoryStorage::new());
    let embedder = Arc::new(FixedEmbedder::new(&[
        ("real one", unit_vector(0.0)),
        ("real two", unit_vector(18.0)),
    ]));
    let config = test_config();
    let (_manager, queue) = queue_fixture(storage.clone(), embedder, &config, 8);

    let gone = queue.enqueue(USER, AGENT, "sm_0_nonexistent");
    assert!(gone.wait().await.is_empty());

    let older = memory_at(USER, AGENT, MemoryType::Semantic, "real one", minutes_ago(5));
    let newer = memory_at(USER, AGENT, MemoryType::Semantic, "real two", minutes_ago(0));
    storage.store(USER, AGENT, &older).await.unwrap();
    storage.store(USER, AGENT, &newer).await.unwrap();

    let edges = queue.enqueue(USER, AGENT, &newer.id).wait().await;
    assert_eq!(edges.len(), 1);
}

#[tokio::test]
async fn embedding_failure_resolves_empty_without_killing_the_worker() {
    let storage = Arc::new(InMemoryStorage::new());
    let embeddings = Arc::new(EmbeddingService::new(Arc::new(FailingEmbedder), 100, 4));
    let manager = Arc::new(ConnectionManager::new(
        storage.clone(),
        embeddings,
        None,
        Arc::new(CostTracker::new()),
        &test_config(),
    ));
    let queue = DiscoveryQueue::start(manager, 8);

    let memory = memory_at(USER, AGENT, MemoryType::Semantic, "unembeddable", minutes_ago(0));
    storage.store(USER, AGENT, &memory).await.unwrap();

    assert!(queue.enqueue(USER, AGENT, &memory.id).wait().await.is_empty());
    // Worker still alive for the next job.
    assert!(queue.enqueue(USER, AGENT, &memory.id).wait().await.is_empty());
}

#[tokio::test]
async fn store_returns_fast_and_connections_appear_later() {
    init_tracing();
    let storage = Arc::new(InMemoryStorage::new());
    let slow_embedder = Arc::new(SlowEmbedder::new(
        Box::new(FixedEmbedder::new(&[
            ("I prefer dark mode UIs for productivity", unit_vector(0.0)),
            ("Dark-mode interfaces help me focus", unit_vector(15.0)),
        ])),
        Duration::from_millis(500),
    ));
    let system = MemorySystem::new(
        storage.clone(),
        slow_embedder,
        None,
        test_config(),
    )
    .unwrap();

    let started = Instant::now();
    let first_id = system
        .semantic()
        .store(
            USER,
            AGENT,
            "I prefer dark mode UIs for productivity",
            SemanticOptions::default(),
        )
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(50));

    // Let the first discovery pass run against an empty candidate set.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let started = Instant::now();
    let second_id = system
        .semantic()
        .store(
            USER,
            AGENT,
            "Dark-mode interfaces help me focus",
            SemanticOptions::default(),
        )
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(50));

    // The id is immediately readable even though discovery is pending.
    assert!(storage.get_by_id(USER, &second_id).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let edges = storage.all_connections(USER).await;
    assert_eq!(edges.len(), 1);
    let edge = &edges[0];
    assert_eq!(edge.connection_type, ConnectionType::Similar);
    assert_eq!(edge.source_memory_id, second_id);
    assert_eq!(edge.target_memory_id, first_id);
    assert!(edge.strength >= 0.95);
}
