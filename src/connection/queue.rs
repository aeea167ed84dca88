use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::ConnectionManager;
use crate::error::short_id;
use crate::MemoryConnection;

/// Pause between jobs so a hot queue does not spin.
const DRAIN_PAUSE: Duration = Duration::from_millis(10);

struct DiscoveryJob {
    key: String,
    user_id: String,
    agent_id: String,
    memory_id: String,
    done: oneshot::Sender<Vec<MemoryConnection>>,
}

/// Resolves to the discovered edges, or to an empty list when the enqueue
/// was deduplicated, dropped under backpressure, or the task failed.
pub struct DiscoveryHandle {
    rx: Option<oneshot::Receiver<Vec<MemoryConnection>>>,
}

impl DiscoveryHandle {
    pub(crate) fn resolved_empty() -> Self {
        Self { rx: None }
    }

    pub async fn wait(self) -> Vec<MemoryConnection> {
        match self.rx {
            None => Vec::new(),
            Some(rx) => rx.await.unwrap_or_default(),
        }
    }
}

/// Single-flight discovery queue keyed by `{user}:{agent}:{memory}`.
///
/// `enqueue` never blocks the write path: a duplicate key or a full channel
/// resolves immediately with an empty result. One worker drains the channel,
/// so at most one discovery per key is ever in flight.
pub struct DiscoveryQueue {
    tx: mpsc::Sender<DiscoveryJob>,
    keys: Arc<Mutex<HashSet<String>>>,
    dropped: Arc<AtomicU64>,
}

impl DiscoveryQueue {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn start(manager: Arc<ConnectionManager>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<DiscoveryJob>(capacity.max(1));
        let keys: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let dropped = Arc::new(AtomicU64::new(0));

        let worker_keys = keys.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let edges = Self::run_job(&manager, &job).await;
                // Receiver may be gone; fire-and-forget callers drop theirs.
                let _ = job.done.send(edges);
                worker_keys.lock().unwrap().remove(&job.key);
                tokio::time::sleep(DRAIN_PAUSE).await;
            }
        });

        Self { tx, keys, dropped }
    }

    /// Schedule discovery for a memory. Synchronous so store paths can call
    /// it without awaiting anything.
    pub fn enqueue(&self, user_id: &str, agent_id: &str, memory_id: &str) -> DiscoveryHandle {
        let key = format!("{}:{}:{}", user_id, agent_id, memory_id);
        {
            let mut keys = self.keys.lock().unwrap();
            if keys.contains(&key) {
                // Duplicate work suppression, not an error.
                debug!(
                    user = short_id(user_id),
                    memory = memory_id,
                    "discovery already pending, deduplicated"
                );
                return DiscoveryHandle::resolved_empty();
            }
            keys.insert(key.clone());
        }

        let (done, rx) = oneshot::channel();
        let job = DiscoveryJob {
            key: key.clone(),
            user_id: user_id.to_string(),
            agent_id: agent_id.to_string(),
            memory_id: memory_id.to_string(),
            done,
        };
        match self.tx.try_send(job) {
            Ok(()) => DiscoveryHandle { rx: Some(rx) },
            Err(_) => {
                // Backpressure: drop rather than block the writer.
                self.keys.lock().unwrap().remove(&key);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    user = short_id(user_id),
                    memory = memory_id,
                    "discovery queue full, job dropped"
                );
                DiscoveryHandle::resolved_empty()
            }
        }
    }

    /// Jobs dropped under backpressure since startup.
    pub fn dropped_jobs(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn run_job(manager: &ConnectionManager, job: &DiscoveryJob) -> Vec<MemoryConnection> {
        let memory = match manager.get_memory_by_id(&job.user_id, &job.memory_id).await {
            Ok(Some(memory)) => memory,
            Ok(None) => {
                debug!(
                    user = short_id(&job.user_id),
                    memory = job.memory_id.as_str(),
                    "memory gone before discovery ran"
                );
                return Vec::new();
            }
            Err(err) => {
                warn!(
                    user = short_id(&job.user_id),
                    memory = job.memory_id.as_str(),
                    error = %err,
                    "discovery fetch failed"
                );
                return Vec::new();
            }
        };

        let edges = match manager
            .discover_connections(&job.user_id, &job.agent_id, &memory)
            .await
        {
            Ok(edges) => edges,
            Err(err) => {
                warn!(
                    user = short_id(&job.user_id),
                    memory = job.memory_id.as_str(),
                    error = %err,
                    "discovery failed"
                );
                return Vec::new();
            }
        };

        if edges.is_empty() {
            return edges;
        }
        if let Err(err) = manager.create_connections(&job.user_id, &edges).await {
            warn!(
                user = short_id(&job.user_id),
                memory = job.memory_id.as_str(),
                error = %err,
                "persisting discovered edges failed"
            );
            return Vec::new();
        }
        edges
    }
}
