use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use super::{Embedder, EmbeddingError};

/// Caching front for an [`Embedder`]: LRU keyed by exact text, provider
/// requests batched. Failures surface to the caller, who decides whether to
/// downgrade (discovery skips the candidate, recall falls back to text-only).
pub struct EmbeddingService {
    provider: Arc<dyn Embedder>,
    cache: Mutex<LruCache<String, Arc<Vec<f32>>>>,
    batch_size: usize,
}

impl EmbeddingService {
    pub fn new(provider: Arc<dyn Embedder>, cache_size: usize, batch_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).expect("max(1) is non-zero");
        Self {
            provider,
            cache: Mutex::new(LruCache::new(capacity)),
            batch_size: batch_size.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    pub async fn embed(&self, text: &str) -> Result<Arc<Vec<f32>>, EmbeddingError> {
        if let Some(cached) = self.cache.lock().unwrap().get(text).cloned() {
            return Ok(cached);
        }
        let vector = Arc::new(self.provider.embed_text(text).await?);
        self.cache
            .lock()
            .unwrap()
            .put(text.to_string(), vector.clone());
        Ok(vector)
    }

    /// Embed many texts, serving repeats and cached entries without provider
    /// calls and chunking the misses.
    pub async fn embed_batch(
        &self,
        texts: &[String],
    ) -> Result<Vec<Arc<Vec<f32>>>, EmbeddingError> {
        let mut misses: Vec<String> = Vec::new();
        {
            let mut cache = self.cache.lock().unwrap();
            for text in texts {
                if cache.get(text).is_none() && !misses.contains(text) {
                    misses.push(text.clone());
                }
            }
        }

        for chunk in misses.chunks(self.batch_size) {
            let vectors = self.provider.embed_texts(chunk).await?;
            if vectors.len() != chunk.len() {
                return Err(EmbeddingError::EmptyResponse);
            }
            let mut cache = self.cache.lock().unwrap();
            for (text, vector) in chunk.iter().zip(vectors) {
                cache.put(text.clone(), Arc::new(vector));
            }
        }

        let mut cache = self.cache.lock().unwrap();
        texts
            .iter()
            .map(|text| {
                cache
                    .get(text)
                    .cloned()
                    .ok_or(EmbeddingError::EmptyResponse)
            })
            .collect()
    }

    /// Number of cached vectors. Test hook.
    pub fn cached_entries(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}
