//! HNSW approximate nearest neighbor index for the in-memory store

use instant_distance::{Builder, HnswMap, Search};

/// Minimum embedding count to justify building an ANN index.
/// Below this threshold, brute-force cosine is fast enough.
pub(crate) const ANN_THRESHOLD: usize = 1000;

/// Cosine similarity between two vectors of equal dimension.
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
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Wrapper for f32 vectors implementing instant_distance::Point
#[derive(Clone)]
struct EmbeddingPoint {
    values: Vec<f32>,
}

impl instant_distance::Point for EmbeddingPoint {
    fn distance(&self, other: &Self) -> f32 {
        // Cosine distance = 1.0 - cosine_similarity
        1.0 - cosine_similarity(&self.values, &other.values)
    }
}

/// HNSW-backed approximate nearest neighbor index over (id, embedding) pairs
pub struct AnnIndex {
    index: Option<HnswMap<EmbeddingPoint, String>>,
    embedding_count: usize,
}

impl AnnIndex {
    /// Build from embeddings. Skips the HNSW build below `ANN_THRESHOLD`.
    pub fn build(embeddings: Vec<(String, Vec<f32>)>) -> Self {
        let count = embeddings.len();

        if count < ANN_THRESHOLD {
            tracing::debug!(
                "Skipping ANN index build: {} embeddings < {} threshold",
                count,
                ANN_THRESHOLD
            );
            return Self {
                index: None,
                embedding_count: count,
            };
        }

        let (points, keys): (Vec<EmbeddingPoint>, Vec<String>) = embeddings
            .into_iter()
            .map(|(key, values)| (EmbeddingPoint { values }, key))
            .unzip();

        let index = Builder::default().build(points, keys);
        tracing::info!("Built ANN index with {} embeddings", count);

        Self {
            index: Some(index),
            embedding_count: count,
        }
    }

    /// Search for k nearest neighbors, returning (id, cosine_similarity)
    /// pairs. Empty when the HNSW index was not built.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        let map = match self.index.as_ref() {
            Some(m) => m,
            None => return vec![],
        };

        let query_point = EmbeddingPoint {
            values: query.to_vec(),
        };
        let mut search = Search::default();

        map.search(&query_point, &mut search)
            .take(k)
            .map(|item| (item.value.clone(), 1.0 - item.distance))
            .collect()
    }

    /// Whether the HNSW index has been built
    pub fn is_built(&self) -> bool {
        self.index.is_some()
    }

    /// Number of embeddings loaded (even if index wasn't built)
    pub fn len(&self) -> usize {
        self.embedding_count
    }

    pub fn is_empty(&self) -> bool {
        self.embedding_count == 0
    }
}
