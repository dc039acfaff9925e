//! Vector store contract and the bundled in-memory backend
//!
//! Provides:
//! - The `VectorStore` trait: semantic, vector and hybrid search plus
//!   insert/delete
//! - `InMemoryVectorStore`: BM25-style keyword arm, cosine/HNSW vector arm,
//!   RRF-fused hybrid arm

mod ann;
mod memory;

pub use ann::{cosine_similarity, AnnIndex};
pub use memory::InMemoryVectorStore;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A corpus document flowing through the pipeline.
///
/// Value-typed: stages emit new instances instead of mutating inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    /// Dense embedding, populated at insert time when an embedder is available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Open-ended metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Score assigned by the emitting stage
    #[serde(default)]
    pub similarity: Option<f64>,
    /// 1-based rank within the emitting result set
    #[serde(default)]
    pub rank: Option<usize>,
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            embedding: None,
            metadata: HashMap::new(),
            similarity: None,
            rank: None,
        }
    }

    /// Copy with a new score and rank, leaving the original untouched.
    pub fn scored(&self, similarity: f64, rank: usize) -> Self {
        let mut doc = self.clone();
        doc.similarity = Some(similarity);
        doc.rank = Some(rank);
        doc
    }
}

/// Search options
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Metadata equality filters (key must equal value)
    pub filters: HashMap<String, serde_json::Value>,
    /// Minimum score threshold
    pub min_score: f64,
}

/// Collection statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub document_count: usize,
    pub embedded_count: usize,
    pub dimensions: Option<usize>,
}

/// Semantic / vector / hybrid search over a document collection.
///
/// All searches assign 1-based ranks and a non-null similarity.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Semantic search by text. Falls back to keyword search when no
    /// embedding provider is configured.
    async fn similarity_search(
        &self,
        text: &str,
        k: usize,
        options: &SearchOptions,
    ) -> Result<Vec<Document>>;

    /// Direct vector lookup.
    async fn vector_search(
        &self,
        vector: &[f32],
        k: usize,
        options: &SearchOptions,
    ) -> Result<Vec<Document>>;

    /// Semantic + keyword search fused by RRF; `alpha` weights the semantic
    /// arm (0 = keyword only, 1 = semantic only).
    async fn hybrid_search(
        &self,
        text: &str,
        k: usize,
        alpha: f64,
        options: &SearchOptions,
    ) -> Result<Vec<Document>>;

    /// Insert documents, embedding them when a provider is configured.
    async fn insert(&self, documents: Vec<Document>) -> Result<()>;

    /// Delete by id, returning how many documents were removed.
    async fn delete(&self, ids: &[String]) -> Result<usize>;

    /// Collection statistics.
    async fn collection_info(&self) -> Result<CollectionInfo>;
}

/// Whether a document passes every metadata equality filter.
pub(crate) fn matches_filters(
    document: &Document,
    filters: &HashMap<String, serde_json::Value>,
) -> bool {
    filters
        .iter()
        .all(|(key, value)| document.metadata.get(key) == Some(value))
}
