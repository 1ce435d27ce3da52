//! Embedding stage: `payload_text → vector`, cached by content hash.
//!
//! Defines the [`Embedder`] trait that all embedding backends implement,
//! the deterministic [`HashingEmbedder`] used offline and in tests, and
//! the [`EmbeddingStage`] that wraps any embedder with:
//!
//! - a payload size limit,
//! - dimension validation of whatever the backend returns,
//! - a bounded LRU cache keyed by `content_hash`, so re-submitting
//!   unchanged content after a transient failure costs no recomputation.
//!
//! Remote providers (OpenAI, Ollama) live in the `fintech-rag` app crate.
//!
//! Any failure surfaces as [`Error::EmbeddingFailed`]; the caller must
//! route the event back to the normalizer instead of sequencing it.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::models::ChangeEvent;

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Deterministic feature-hashing embedder.
///
/// Lower-cases and tokenizes on non-alphanumerics, hashes each token (and
/// each adjacent token pair) into one of `dims` buckets with a signed weight,
/// then L2-normalizes. Texts sharing vocabulary land close together in cosine
/// space, which is enough for ticker/entity-heavy financial text and needs no
/// model download.
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    /// Embed one text synchronously.
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        for t in &tokens {
            self.accumulate(&mut v, t.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let joined = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut v, joined.as_bytes(), 0.5);
        }
        l2_normalize(&mut v);
        v
    }

    fn accumulate(&self, v: &mut [f32], token: &[u8], weight: f32) {
        let digest = Sha256::digest(token);
        let bucket = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]) as usize
            % self.dims;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Embedding stage configuration.
#[derive(Debug, Clone)]
pub struct EmbeddingStageOptions {
    /// Payloads larger than this many bytes fail with `EmbeddingFailed`.
    pub max_payload_bytes: usize,
    /// Number of vectors kept in the content-hash cache.
    pub cache_capacity: usize,
}

impl Default for EmbeddingStageOptions {
    fn default() -> Self {
        Self {
            max_payload_bytes: 32 * 1024,
            cache_capacity: 10_000,
        }
    }
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EmbeddingCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

struct CacheState {
    lru: LruCache<String, Arc<[f32]>>,
    hits: u64,
    misses: u64,
}

/// Stateless transform plus a content-hash keyed cache.
pub struct EmbeddingStage {
    embedder: Arc<dyn Embedder>,
    options: EmbeddingStageOptions,
    cache: Mutex<CacheState>,
}

impl EmbeddingStage {
    pub fn new(embedder: Arc<dyn Embedder>, options: EmbeddingStageOptions) -> Self {
        let capacity = NonZeroUsize::new(options.cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            embedder,
            options,
            cache: Mutex::new(CacheState {
                lru: LruCache::new(capacity),
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn dims(&self) -> usize {
        self.embedder.dims()
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    /// Vector for an upsert event. Delete events have no payload and must
    /// not be passed here.
    pub async fn embed_event(&self, event: &ChangeEvent) -> Result<Arc<[f32]>> {
        let doc_id = event.doc_id();
        if event.payload_text.len() > self.options.max_payload_bytes {
            return Err(Error::EmbeddingFailed {
                doc_id,
                reason: format!(
                    "payload of {} bytes exceeds limit of {} bytes",
                    event.payload_text.len(),
                    self.options.max_payload_bytes
                ),
            });
        }

        if let Some(hit) = self.cached(&event.content_hash) {
            return Ok(hit);
        }

        let vector = self
            .compute(&event.payload_text)
            .await
            .map_err(|reason| Error::EmbeddingFailed { doc_id, reason })?;

        let mut cache = self.cache.lock();
        cache.lru.put(event.content_hash.clone(), vector.clone());
        Ok(vector)
    }

    /// Embed free query text. Not cached: queries rarely repeat verbatim.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(Error::InvalidQuery("query text is empty".to_string()));
        }
        if text.len() > self.options.max_payload_bytes {
            return Err(Error::InvalidQuery(format!(
                "query text exceeds {} bytes",
                self.options.max_payload_bytes
            )));
        }
        self.compute(text)
            .await
            .map(|v| v.to_vec())
            .map_err(Error::QueryEmbeddingFailed)
    }

    pub fn cache_stats(&self) -> EmbeddingCacheStats {
        let cache = self.cache.lock();
        EmbeddingCacheStats {
            hits: cache.hits,
            misses: cache.misses,
            entries: cache.lru.len(),
        }
    }

    fn cached(&self, content_hash: &str) -> Option<Arc<[f32]>> {
        let mut cache = self.cache.lock();
        match cache.lru.get(content_hash).cloned() {
            Some(v) => {
                cache.hits += 1;
                Some(v)
            }
            None => {
                cache.misses += 1;
                None
            }
        }
    }

    async fn compute(&self, text: &str) -> std::result::Result<Arc<[f32]>, String> {
        let mut out = self
            .embedder
            .embed(&[text.to_string()])
            .await
            .map_err(|e| e.to_string())?;
        let vector = out
            .pop()
            .ok_or_else(|| "embedder returned no vector".to_string())?;
        let dims = self.embedder.dims();
        if vector.len() != dims {
            return Err(format!(
                "embedder returned {} dims, expected {}",
                vector.len(),
                dims
            ));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err("embedder returned non-finite values".to_string());
        }
        Ok(Arc::from(vector))
    }
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty, mismatched or
/// zero-magnitude inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fields;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        inner: HashingEmbedder,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("provider unavailable");
            }
            self.inner.embed(texts).await
        }
    }

    fn event(text: &str) -> ChangeEvent {
        let now = Utc::now();
        ChangeEvent::upsert("news", "n-1", text, Fields::new(), now, now)
    }

    #[test]
    fn test_hashing_is_deterministic_and_normalized() {
        let e = HashingEmbedder::new(64);
        let a = e.embed_one("Apple beats earnings");
        let b = e.embed_one("Apple beats earnings");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_similarity_tracks_vocabulary() {
        let e = HashingEmbedder::new(256);
        let q = e.embed_one("AAPL earnings");
        let near = e.embed_one("AAPL quarterly earnings beat");
        let far = e.embed_one("OFAC adds vessel to SDN list");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_cache_avoids_recomputation() {
        let embedder = Arc::new(CountingEmbedder {
            inner: HashingEmbedder::new(16),
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let stage = EmbeddingStage::new(embedder.clone(), EmbeddingStageOptions::default());
        let ev = event("Fed minutes released");
        let v1 = stage.embed_event(&ev).await.unwrap();
        let v2 = stage.embed_event(&ev).await.unwrap();
        assert_eq!(v1, v2);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        let stats = stage.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_oversized_payload_fails() {
        let stage = EmbeddingStage::new(
            Arc::new(HashingEmbedder::new(8)),
            EmbeddingStageOptions {
                max_payload_bytes: 10,
                cache_capacity: 4,
            },
        );
        let err = stage.embed_event(&event("this payload is too long")).await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingFailed { .. }));
    }

    #[tokio::test]
    async fn test_provider_failure_is_embedding_failed_and_not_cached() {
        let embedder = Arc::new(CountingEmbedder {
            inner: HashingEmbedder::new(8),
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let stage = EmbeddingStage::new(embedder.clone(), EmbeddingStageOptions::default());
        let ev = event("anything");
        assert!(stage.embed_event(&ev).await.is_err());
        assert!(stage.embed_event(&ev).await.is_err());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(stage.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let stage = EmbeddingStage::new(
            Arc::new(HashingEmbedder::new(8)),
            EmbeddingStageOptions::default(),
        );
        assert!(matches!(
            stage.embed_query("   ").await,
            Err(Error::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_query_provider_outage_is_not_invalid_input() {
        let stage = EmbeddingStage::new(
            Arc::new(CountingEmbedder {
                inner: HashingEmbedder::new(8),
                calls: AtomicUsize::new(0),
                fail: true,
            }),
            EmbeddingStageOptions::default(),
        );
        match stage.embed_query("AAPL guidance").await {
            Err(Error::QueryEmbeddingFailed(reason)) => {
                assert!(reason.contains("provider unavailable"), "{reason}")
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
