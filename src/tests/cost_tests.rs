use std::collections::HashMap;
use std::sync::Arc;

use crate::cost::{CostTracker, ExtractionRecord};

const AGENT: &str = "agent-1";

fn record(cost: f64) -> ExtractionRecord {
    ExtractionRecord {
        extractor_type: "connection-llm".to_string(),
        cost,
        memories_extracted: 1,
        messages_processed: 2,
        metadata: HashMap::new(),
    }
}

#[test]
fn no_budget_means_no_limit() {
    let tracker = CostTracker::new();
    assert!(tracker.check_budget(AGENT, None));
    assert!(tracker.check_budget(AGENT, Some(f64::INFINITY)));
}

#[test]
fn zero_budget_always_fails() {
    let tracker = CostTracker::new();
    assert!(!tracker.check_budget(AGENT, Some(0.0)));
}

#[test]
fn spend_accumulates_until_the_budget_is_hit() {
    let tracker = CostTracker::new();
    assert!(tracker.check_budget(AGENT, Some(10.0)));

    tracker.track_extraction(AGENT, &record(5.0));
    assert!(tracker.check_budget(AGENT, Some(10.0)));
    assert!((tracker.month_spend(AGENT) - 5.0).abs() < 1e-9);

    tracker.track_extraction(AGENT, &record(6.0));
    assert!(!tracker.check_budget(AGENT, Some(10.0)));
    assert_eq!(tracker.extraction_count(AGENT), 2);
}

#[test]
fn agents_are_accounted_separately() {
    let tracker = CostTracker::new();
    tracker.track_extraction("agent-a", &record(9.0));
    assert!(!tracker.check_budget("agent-a", Some(5.0)));
    assert!(tracker.check_budget("agent-b", Some(5.0)));
    assert_eq!(tracker.extraction_count("agent-b"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tracking_loses_nothing() {
    let tracker = Arc::new(CostTracker::new());
    let mut handles = Vec::new();
    for _ in 0..100 {
        let tracker = tracker.clone();
        handles.push(tokio::spawn(async move {
            tracker.track_extraction(AGENT, &record(1.0));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert!((tracker.month_spend(AGENT) - 100.0).abs() < 1e-9);
    assert_eq!(tracker.extraction_count(AGENT), 100);
}
