//! In-memory vector store
//!
//! Reference backend for the `VectorStore` contract: a BM25-style keyword
//! arm, a cosine vector arm (HNSW-accelerated above a corpus threshold) and
//! an RRF-fused hybrid arm. Documents live in a `BTreeMap` so every scan is
//! id-ordered and results are deterministic.

use crate::error::{RaglineError, Result};
use crate::fusion;
use crate::llm::Embedder;
use crate::store::ann::{cosine_similarity, AnnIndex};
use crate::store::{matches_filters, CollectionInfo, Document, SearchOptions, VectorStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

struct StoreInner {
    documents: BTreeMap<String, Document>,
    ann: AnnIndex,
}

impl StoreInner {
    fn rebuild_ann(&mut self) {
        let embeddings: Vec<(String, Vec<f32>)> = self
            .documents
            .values()
            .filter_map(|d| d.embedding.as_ref().map(|e| (d.id.clone(), e.clone())))
            .collect();
        self.ann = AnnIndex::build(embeddings);
    }
}

/// In-memory `VectorStore` backend, optionally wired to an embedder
pub struct InMemoryVectorStore {
    embedder: Option<Arc<dyn Embedder>>,
    inner: RwLock<StoreInner>,
    fallback_warned: AtomicBool,
}

impl InMemoryVectorStore {
    /// Keyword-only store (no embedding provider)
    pub fn new() -> Self {
        Self {
            embedder: None,
            inner: RwLock::new(StoreInner {
                documents: BTreeMap::new(),
                ann: AnnIndex::build(vec![]),
            }),
            fallback_warned: AtomicBool::new(false),
        }
    }

    /// Store with an embedding provider for the semantic arm
    pub fn with_embedder(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder: Some(embedder),
            ..Self::new()
        }
    }

    fn read_inner(&self) -> Result<std::sync::RwLockReadGuard<'_, StoreInner>> {
        self.inner
            .read()
            .map_err(|e| RaglineError::Backend(format!("store lock poisoned: {}", e)))
    }

    fn write_inner(&self) -> Result<std::sync::RwLockWriteGuard<'_, StoreInner>> {
        self.inner
            .write()
            .map_err(|e| RaglineError::Backend(format!("store lock poisoned: {}", e)))
    }

    fn warn_fallback_once(&self) {
        if !self.fallback_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!("No embedding provider configured, using keyword search");
        }
    }

    /// BM25 ranking over documents passing the filters. Raw scores are
    /// squashed to [0, 1) via s/(1+s).
    fn keyword_ranking(
        inner: &StoreInner,
        query: &str,
        options: &SearchOptions,
    ) -> Vec<(String, f64)> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return vec![];
        }

        let candidates: Vec<&Document> = inner
            .documents
            .values()
            .filter(|d| matches_filters(d, &options.filters))
            .collect();
        if candidates.is_empty() {
            return vec![];
        }

        let doc_terms: Vec<Vec<String>> = candidates.iter().map(|d| terms(&d.content)).collect();
        let total_docs = candidates.len() as f64;
        let avg_len =
            doc_terms.iter().map(|t| t.len()).sum::<usize>() as f64 / total_docs.max(1.0);

        // Document frequency per query term
        let mut df: HashMap<&str, usize> = HashMap::new();
        for term in &query_terms {
            let count = doc_terms
                .iter()
                .filter(|doc| doc.iter().any(|t| t == term))
                .count();
            df.insert(term.as_str(), count);
        }

        let mut scored: Vec<(String, f64)> = candidates
            .iter()
            .zip(doc_terms.iter())
            .filter_map(|(doc, doc_term_list)| {
                let doc_len = doc_term_list.len() as f64;
                let mut raw = 0.0;
                for term in &query_terms {
                    let tf = doc_term_list.iter().filter(|t| *t == term).count() as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    let n = df[term.as_str()] as f64;
                    let idf = ((total_docs - n + 0.5) / (n + 0.5) + 1.0).ln();
                    let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * doc_len / avg_len.max(1.0));
                    raw += idf * tf * (BM25_K1 + 1.0) / denom;
                }
                if raw > 0.0 {
                    Some((doc.id.clone(), raw / (1.0 + raw)))
                } else {
                    None
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored
    }

    /// Cosine ranking over embedded documents passing the filters.
    /// Uses the HNSW index when built and no filters narrow the corpus.
    fn vector_ranking(
        inner: &StoreInner,
        vector: &[f32],
        k: usize,
        options: &SearchOptions,
    ) -> Vec<(String, f64)> {
        if options.filters.is_empty() && inner.ann.is_built() {
            return inner
                .ann
                .search(vector, k)
                .into_iter()
                .map(|(id, sim)| (id, sim as f64))
                .collect();
        }

        let mut scored: Vec<(String, f64)> = inner
            .documents
            .values()
            .filter(|d| matches_filters(d, &options.filters))
            .filter_map(|d| {
                d.embedding
                    .as_ref()
                    .map(|e| (d.id.clone(), cosine_similarity(e, vector) as f64))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }

    /// Materialize (id, score) pairs as ranked documents.
    fn materialize(
        inner: &StoreInner,
        ranking: Vec<(String, f64)>,
        k: usize,
        min_score: f64,
    ) -> Vec<Document> {
        ranking
            .into_iter()
            .filter(|(_, score)| *score >= min_score)
            .take(k)
            .enumerate()
            .filter_map(|(i, (id, score))| {
                inner.documents.get(&id).map(|d| d.scored(score, i + 1))
            })
            .collect()
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn similarity_search(
        &self,
        text: &str,
        k: usize,
        options: &SearchOptions,
    ) -> Result<Vec<Document>> {
        match &self.embedder {
            Some(embedder) => {
                let vector = embedder.embed(text).await?;
                self.vector_search(&vector, k, options).await
            }
            None => {
                self.warn_fallback_once();
                let inner = self.read_inner()?;
                let ranking = Self::keyword_ranking(&inner, text, options);
                Ok(Self::materialize(&inner, ranking, k, options.min_score))
            }
        }
    }

    async fn vector_search(
        &self,
        vector: &[f32],
        k: usize,
        options: &SearchOptions,
    ) -> Result<Vec<Document>> {
        let inner = self.read_inner()?;
        let ranking = Self::vector_ranking(&inner, vector, k, options);
        Ok(Self::materialize(&inner, ranking, k, options.min_score))
    }

    async fn hybrid_search(
        &self,
        text: &str,
        k: usize,
        alpha: f64,
        options: &SearchOptions,
    ) -> Result<Vec<Document>> {
        let alpha = alpha.clamp(0.0, 1.0);

        let semantic_ids: Vec<String> = if alpha > 0.0 {
            match &self.embedder {
                Some(embedder) => {
                    let vector = embedder.embed(text).await?;
                    let inner = self.read_inner()?;
                    Self::vector_ranking(&inner, &vector, k, options)
                        .into_iter()
                        .map(|(id, _)| id)
                        .collect()
                }
                None if alpha >= 1.0 => {
                    return Err(RaglineError::NotConfigured(
                        "semantic-only hybrid search requires an embedding provider".to_string(),
                    ));
                }
                None => {
                    self.warn_fallback_once();
                    vec![]
                }
            }
        } else {
            vec![]
        };

        let inner = self.read_inner()?;
        let keyword_ids: Vec<String> = if alpha < 1.0 {
            Self::keyword_ranking(&inner, text, options)
                .into_iter()
                .take(k)
                .map(|(id, _)| id)
                .collect()
        } else {
            vec![]
        };

        let fused = fusion::fuse(
            &[(alpha, semantic_ids), (1.0 - alpha, keyword_ids)],
            fusion::DEFAULT_RRF_K,
        );

        Ok(Self::materialize(&inner, fused, k, options.min_score))
    }

    async fn insert(&self, mut documents: Vec<Document>) -> Result<()> {
        if let Some(embedder) = &self.embedder {
            let missing: Vec<usize> = documents
                .iter()
                .enumerate()
                .filter(|(_, d)| d.embedding.is_none())
                .map(|(i, _)| i)
                .collect();
            if !missing.is_empty() {
                let texts: Vec<String> =
                    missing.iter().map(|&i| documents[i].content.clone()).collect();
                let embeddings = embedder.embed_batch(&texts).await?;
                for (slot, embedding) in missing.into_iter().zip(embeddings) {
                    documents[slot].embedding = Some(embedding);
                }
            }
        }

        let mut inner = self.write_inner()?;
        for document in documents {
            inner.documents.insert(document.id.clone(), document);
        }
        inner.rebuild_ann();
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<usize> {
        let mut inner = self.write_inner()?;
        let mut removed = 0;
        for id in ids {
            if inner.documents.remove(id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            inner.rebuild_ann();
        }
        Ok(removed)
    }

    async fn collection_info(&self) -> Result<CollectionInfo> {
        let inner = self.read_inner()?;
        let embedded_count = inner
            .documents
            .values()
            .filter(|d| d.embedding.is_some())
            .count();
        let dimensions = inner
            .documents
            .values()
            .find_map(|d| d.embedding.as_ref().map(|e| e.len()))
            .or_else(|| self.embedder.as_ref().map(|e| e.dimensions()));

        Ok(CollectionInfo {
            document_count: inner.documents.len(),
            embedded_count,
            dimensions,
        })
    }
}

/// Lowercased terms longer than 2 chars, duplicates preserved for tf counts.
fn terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<Document> {
        vec![
            Document::new("paris", "The capital of France is Paris."),
            Document::new("berlin", "Berlin is the capital of Germany."),
            Document::new("cake", "A chocolate cake recipe with dark cocoa."),
        ]
    }

    #[tokio::test]
    async fn test_keyword_search_ranks_by_relevance() {
        let store = InMemoryVectorStore::new();
        store.insert(corpus()).await.unwrap();

        let results = store
            .similarity_search("capital of France", 10, &SearchOptions::default())
            .await
            .unwrap();

        assert_eq!(results[0].id, "paris");
        assert_eq!(results[0].rank, Some(1));
        assert!(results[0].similarity.unwrap() > 0.0);
        assert!(!results.iter().any(|d| d.id == "cake"));
    }

    #[tokio::test]
    async fn test_hybrid_alpha_zero_is_keyword_only() {
        let store = InMemoryVectorStore::new();
        store.insert(corpus()).await.unwrap();

        let results = store
            .hybrid_search("chocolate cake", 5, 0.0, &SearchOptions::default())
            .await
            .unwrap();

        assert_eq!(results[0].id, "cake");
    }

    #[tokio::test]
    async fn test_semantic_only_without_embedder_is_not_configured() {
        let store = InMemoryVectorStore::new();
        store.insert(corpus()).await.unwrap();

        let err = store
            .hybrid_search("cake", 5, 1.0, &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RaglineError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn test_metadata_filters() {
        let store = InMemoryVectorStore::new();
        let mut doc = Document::new("tagged", "France travel guide for Paris");
        doc.metadata
            .insert("category".to_string(), serde_json::json!("travel"));
        let mut docs = corpus();
        docs.push(doc);
        store.insert(docs).await.unwrap();

        let mut options = SearchOptions::default();
        options
            .filters
            .insert("category".to_string(), serde_json::json!("travel"));

        let results = store
            .similarity_search("Paris France", 10, &options)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "tagged");
    }

    #[tokio::test]
    async fn test_vector_search_with_explicit_vector() {
        let store = InMemoryVectorStore::new();
        let mut doc = Document::new("v1", "embedded doc");
        doc.embedding = Some(vec![1.0, 0.0]);
        let mut other = Document::new("v2", "other doc");
        other.embedding = Some(vec![0.0, 1.0]);
        store.insert(vec![doc, other]).await.unwrap();

        let results = store
            .vector_search(&[1.0, 0.1], 1, &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "v1");
    }

    #[tokio::test]
    async fn test_insert_delete_info() {
        let store = InMemoryVectorStore::new();
        store.insert(corpus()).await.unwrap();

        let info = store.collection_info().await.unwrap();
        assert_eq!(info.document_count, 3);
        assert_eq!(info.embedded_count, 0);

        let removed = store
            .delete(&["paris".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.collection_info().await.unwrap().document_count, 2);
    }
}
