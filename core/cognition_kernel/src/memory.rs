//! Memory store and embedding collaborator contracts.
//!
//! The kernel never owns the memory schema; it calls `retrieve` and `store`
//! through these traits. The in-process implementations back tests and
//! single-node deployments: a deterministic token-hash embedder and a
//! vector-scan store with the kernel's ranking tie-breaks.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ail_types::{MemoryFilters, MemoryRecord};
use futures_util::future::BoxFuture;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Embedding dimension used when none is configured. Store and embedder
/// must agree; the kernel does not validate it.
pub const DEFAULT_EMBEDDING_DIM: usize = 128;

pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> BoxFuture<'_, Result<Vec<f32>, String>>;

    fn embed_batch(&self, texts: Vec<String>) -> BoxFuture<'_, Result<Vec<Vec<f32>>, String>>;
}

pub trait MemoryStore: Send + Sync {
    /// Ranked retrieval: similarity descending, ties by `created_at`
    /// descending then record id ascending.
    fn retrieve(
        &self,
        query_embedding: Vec<f32>,
        filters: MemoryFilters,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<MemoryRecord>, String>>;

    fn store(&self, record: MemoryRecord) -> BoxFuture<'_, Result<Uuid, String>>;
}

/// Deterministic embedding from hashed whitespace tokens, L2-normalized.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        HashEmbedder {
            dimension: dimension.max(1),
        }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.to_lowercase().split_whitespace() {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let bucket = (hasher.finish() as usize) % self.dimension;
            vector[bucket] += 1.0;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        HashEmbedder::new(DEFAULT_EMBEDDING_DIM)
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> BoxFuture<'_, Result<Vec<f32>, String>> {
        let vector = self.embed_sync(text);
        Box::pin(async move { Ok(vector) })
    }

    fn embed_batch(&self, texts: Vec<String>) -> BoxFuture<'_, Result<Vec<Vec<f32>>, String>> {
        let vectors = texts.iter().map(|t| self.embed_sync(t)).collect();
        Box::pin(async move { Ok(vectors) })
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Vector-scan store over an in-memory record list.
pub struct InMemoryStore {
    embedder: Arc<dyn EmbeddingProvider>,
    records: RwLock<Vec<(MemoryRecord, Vec<f32>)>>,
}

impl InMemoryStore {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        InMemoryStore {
            embedder,
            records: RwLock::new(Vec::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

impl MemoryStore for InMemoryStore {
    fn retrieve(
        &self,
        query_embedding: Vec<f32>,
        filters: MemoryFilters,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<MemoryRecord>, String>> {
        Box::pin(async move {
            let records = self.records.read().await;

            let mut scored: Vec<MemoryRecord> = records
                .iter()
                .filter(|(record, _)| {
                    if !filters.memory_types.is_empty()
                        && !filters.memory_types.contains(&record.memory_type)
                    {
                        return false;
                    }
                    if let Some(after) = filters.after {
                        if record.created_at < after {
                            return false;
                        }
                    }
                    if let Some(before) = filters.before {
                        if record.created_at > before {
                            return false;
                        }
                    }
                    true
                })
                .map(|(record, embedding)| {
                    let mut hit = record.clone();
                    hit.similarity_score = Some(cosine_similarity(&query_embedding, embedding));
                    hit
                })
                .filter(|record| match (filters.min_similarity, record.similarity_score) {
                    (Some(min), Some(score)) => score >= min,
                    _ => true,
                })
                .collect();

            scored.sort_by(|a, b| {
                let score_a = a.similarity_score.unwrap_or(0.0);
                let score_b = b.similarity_score.unwrap_or(0.0);
                score_b
                    .partial_cmp(&score_a)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.created_at.cmp(&a.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            });
            scored.truncate(limit);
            Ok(scored)
        })
    }

    fn store(&self, record: MemoryRecord) -> BoxFuture<'_, Result<Uuid, String>> {
        Box::pin(async move {
            let embedding = self.embedder.embed(&record.content).await?;
            let id = record.id;
            self.records.write().await.push((record, embedding));
            Ok(id)
        })
    }
}
