//! Multi-query hybrid retrieval
//!
//! Fans the working queries out over the vector store's hybrid search, fuses
//! the per-query rankings with weighted RRF, then applies similarity and
//! diversity filters. Aggregation is deterministic: fusion groups by id in
//! sorted order, so parallel and serial execution produce identical output.

use crate::cancel::{ensure_live, with_cancellation, CancellationToken};
use crate::config::{ReformulationConfig, RetrievalConfig};
use crate::error::Result;
use crate::fusion;
use crate::reformulate::{QueryReformulator, ReformulatedQuery};
use crate::store::{Document, SearchOptions, VectorStore};
use crate::text::{mean_pairwise_diversity, text_jaccard};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Concurrent store queries in parallel mode
const SEARCH_CONCURRENCY: usize = 4;

/// Output of one retrieval pass
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    /// Fused, filtered, freshly ranked documents (at most k)
    pub documents: Vec<Document>,
    /// Reformulations produced when the retriever ran its own reformulation
    pub reformulations: Option<Vec<ReformulatedQuery>>,
    /// Mean pairwise (1 - Jaccard) over the returned contents
    pub diversity: f64,
    pub avg_similarity: f64,
    pub latency_ms: u64,
    pub queries_used: usize,
}

/// Multi-query hybrid retriever over a `VectorStore`
pub struct DocumentRetriever {
    store: Arc<dyn VectorStore>,
    reformulator: Option<Arc<QueryReformulator>>,
}

impl DocumentRetriever {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self {
            store,
            reformulator: None,
        }
    }

    /// Attach a reformulator for standalone `use_reformulation` retrieval.
    pub fn with_reformulator(store: Arc<dyn VectorStore>, reformulator: Arc<QueryReformulator>) -> Self {
        Self {
            store,
            reformulator: Some(reformulator),
        }
    }

    /// Retrieve up to `config.k` documents for the query.
    ///
    /// `precomputed` reformulations (pipeline stage 1 output) take precedence
    /// over the retriever's own reformulation pass.
    pub async fn retrieve(
        &self,
        query: &str,
        config: &RetrievalConfig,
        precomputed: Option<&[ReformulatedQuery]>,
        cancel: &CancellationToken,
    ) -> Result<RetrievalResult> {
        let start = Instant::now();
        ensure_live(cancel)?;

        // 1. Working queries with weights
        let mut own_reformulations = None;
        let working_queries: Vec<(String, f64)> = match (precomputed, &self.reformulator) {
            (Some(reformulations), _) if !reformulations.is_empty() => reformulations
                .iter()
                .map(|r| (r.query.clone(), r.quality))
                .collect(),
            (_, Some(reformulator)) if config.use_reformulation => {
                let reformulation_config = ReformulationConfig {
                    num_reformulations: config.num_reformulations,
                    strategies: config.reformulation_strategies.clone(),
                    include_original: true,
                    ..Default::default()
                };
                let result = reformulator
                    .reformulate(query, &reformulation_config, cancel)
                    .await?;
                let queries = result
                    .reformulations
                    .iter()
                    .map(|r| (r.query.clone(), r.quality))
                    .collect();
                own_reformulations = Some(result.reformulations);
                queries
            }
            _ => vec![(query.to_string(), 1.0)],
        };

        // 2. Per-query hybrid search, tagged with the sourcing query
        let search_options = SearchOptions {
            filters: config.filters.clone(),
            min_score: 0.0,
        };
        let fetch = config.k.saturating_mul(2);

        let per_query = self
            .run_searches(&working_queries, fetch, config, &search_options, cancel)
            .await?;

        // 3. Group by id and fuse with weighted RRF
        let lists: Vec<(f64, Vec<String>)> = working_queries
            .iter()
            .zip(per_query.iter())
            .map(|((_, weight), docs)| {
                (*weight, docs.iter().map(|d| d.id.clone()).collect())
            })
            .collect();
        let fused = fusion::fuse(&lists, config.rrf_k);

        let mut canonical: HashMap<&str, &Document> = HashMap::new();
        let mut seen_counts: HashMap<&str, usize> = HashMap::new();
        for docs in per_query.iter() {
            for doc in docs {
                *seen_counts.entry(doc.id.as_str()).or_insert(0) += 1;
                canonical.entry(doc.id.as_str()).or_insert(doc);
            }
        }

        // 4. Similarity floor, then greedy diversity filter.
        // Raw RRF scores live near 1/rrf_k; scaling by (rrf_k + 1) puts a
        // rank-1 hit from a unit-weight query at 1.0 without disturbing the
        // ordering or the weight monotonicity.
        let scale = config.rrf_k + 1.0;
        let mut kept: Vec<Document> = Vec::new();
        for (id, raw_score) in fused {
            let rrf_score = raw_score * scale;
            if rrf_score < config.min_similarity {
                continue;
            }
            let source = match canonical.get(id.as_str()) {
                Some(doc) => *doc,
                None => continue,
            };
            let too_similar = kept
                .iter()
                .any(|d| text_jaccard(&source.content, &d.content) > 1.0 - config.max_diversity);
            if too_similar {
                continue;
            }

            let mut doc = source.scored(rrf_score, 0);
            doc.metadata.insert(
                "seen_in_queries".to_string(),
                serde_json::json!(seen_counts[id.as_str()]),
            );
            kept.push(doc);
            if kept.len() == config.k {
                break;
            }
        }

        // 5. Fresh 1-based ranks
        for (i, doc) in kept.iter_mut().enumerate() {
            doc.rank = Some(i + 1);
        }

        let contents: Vec<&str> = kept.iter().map(|d| d.content.as_str()).collect();
        let diversity = mean_pairwise_diversity(&contents);
        let avg_similarity = if kept.is_empty() {
            0.0
        } else {
            kept.iter().filter_map(|d| d.similarity).sum::<f64>() / kept.len() as f64
        };

        tracing::info!(
            "Retrieved {} documents from {} queries in {}ms",
            kept.len(),
            working_queries.len(),
            start.elapsed().as_millis()
        );

        Ok(RetrievalResult {
            documents: kept,
            reformulations: precomputed
                .map(|r| r.to_vec())
                .or(own_reformulations),
            diversity,
            avg_similarity,
            latency_ms: start.elapsed().as_millis() as u64,
            queries_used: working_queries.len(),
        })
    }

    /// Run the per-query searches, tagging each result with its sourcing
    /// query. Fan-out order is restored by index, so parallel completion
    /// order never leaks into the output.
    async fn run_searches(
        &self,
        working_queries: &[(String, f64)],
        fetch: usize,
        config: &RetrievalConfig,
        search_options: &SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<Document>>> {
        let tag = |mut docs: Vec<Document>, query_text: &str, weight: f64| {
            for doc in docs.iter_mut() {
                doc.metadata
                    .insert("source_query".to_string(), serde_json::json!(query_text));
                doc.metadata
                    .insert("query_weight".to_string(), serde_json::json!(weight));
            }
            docs
        };

        if config.parallel {
            let store = &self.store;
            let fan_out = stream::iter(working_queries.iter().enumerate())
                .map(|(idx, (query_text, weight))| async move {
                    let result = store
                        .hybrid_search(query_text, fetch, config.hybrid_alpha, search_options)
                        .await;
                    (idx, query_text.as_str(), *weight, result)
                })
                .buffer_unordered(SEARCH_CONCURRENCY)
                .collect::<Vec<_>>();

            let mut results = with_cancellation(cancel, async { Ok(fan_out.await) }).await?;
            results.sort_by_key(|(idx, _, _, _)| *idx);

            results
                .into_iter()
                .map(|(_, query_text, weight, result)| result.map(|docs| tag(docs, query_text, weight)))
                .collect()
        } else {
            let mut results = Vec::with_capacity(working_queries.len());
            for (query_text, weight) in working_queries {
                ensure_live(cancel)?;
                let docs = with_cancellation(
                    cancel,
                    self.store
                        .hybrid_search(query_text, fetch, config.hybrid_alpha, search_options),
                )
                .await?;
                results.push(tag(docs, query_text, *weight));
            }
            Ok(results)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryVectorStore;

    fn corpus() -> Vec<Document> {
        vec![
            Document::new("paris", "The capital of France is Paris."),
            Document::new("berlin", "Berlin is the capital of Germany."),
            Document::new("cake", "A chocolate cake recipe with dark cocoa."),
            Document::new("paris2", "Paris is the capital city of France."),
        ]
    }

    async fn store() -> Arc<InMemoryVectorStore> {
        let store = Arc::new(InMemoryVectorStore::new());
        store.insert(corpus()).await.unwrap();
        store
    }

    fn config(k: usize) -> RetrievalConfig {
        RetrievalConfig {
            k,
            hybrid_alpha: 0.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_single_query_retrieval() {
        let retriever = DocumentRetriever::new(store().await);
        let result = retriever
            .retrieve(
                "capital of France",
                &config(3),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!result.documents.is_empty());
        assert_eq!(result.documents[0].rank, Some(1));
        assert_eq!(result.queries_used, 1);
        assert!(result.avg_similarity > 0.0);
    }

    #[tokio::test]
    async fn test_k_zero_returns_empty_without_error() {
        let retriever = DocumentRetriever::new(store().await);
        let result = retriever
            .retrieve("capital", &config(0), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.documents.is_empty());
        assert_eq!(result.avg_similarity, 0.0);
    }

    #[tokio::test]
    async fn test_min_similarity_can_empty_the_result() {
        let retriever = DocumentRetriever::new(store().await);
        let cfg = RetrievalConfig {
            min_similarity: 0.99,
            ..config(5)
        };
        let result = retriever
            .retrieve(
                "quantum chromodynamics",
                &cfg,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.documents.is_empty());
        assert_eq!(result.avg_similarity, 0.0);
    }

    #[tokio::test]
    async fn test_diversity_filter_drops_near_duplicates() {
        let retriever = DocumentRetriever::new(store().await);
        let cfg = RetrievalConfig {
            max_diversity: 0.7,
            ..config(5)
        };
        let result = retriever
            .retrieve(
                "capital of France Paris",
                &cfg,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // paris and paris2 are near-duplicates, only one survives
        let paris_variants = result
            .documents
            .iter()
            .filter(|d| d.id.starts_with("paris"))
            .count();
        assert_eq!(paris_variants, 1);
    }

    #[tokio::test]
    async fn test_parallel_and_serial_agree() {
        let store = store().await;
        let retriever = DocumentRetriever::new(store);
        let reformulations = vec![
            ReformulatedQuery {
                query: "capital of France".to_string(),
                strategy: crate::reformulate::ReformulationStrategy::Variation,
                quality: 1.0,
                similarity: 1.0,
                rank: 1,
            },
            ReformulatedQuery {
                query: "Paris capital city".to_string(),
                strategy: crate::reformulate::ReformulationStrategy::Expansion,
                quality: 0.8,
                similarity: 0.5,
                rank: 2,
            },
        ];

        let serial_cfg = RetrievalConfig {
            parallel: false,
            ..config(4)
        };
        let parallel_cfg = RetrievalConfig {
            parallel: true,
            ..config(4)
        };

        let serial = retriever
            .retrieve(
                "capital of France",
                &serial_cfg,
                Some(&reformulations),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let parallel = retriever
            .retrieve(
                "capital of France",
                &parallel_cfg,
                Some(&reformulations),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let serial_ids: Vec<_> = serial.documents.iter().map(|d| &d.id).collect();
        let parallel_ids: Vec<_> = parallel.documents.iter().map(|d| &d.id).collect();
        assert_eq!(serial_ids, parallel_ids);
        for (a, b) in serial.documents.iter().zip(parallel.documents.iter()) {
            assert_eq!(a.similarity, b.similarity);
        }
    }

    #[tokio::test]
    async fn test_seen_in_queries_counts_occurrences() {
        let retriever = DocumentRetriever::new(store().await);
        let reformulations = vec![
            ReformulatedQuery {
                query: "capital of France".to_string(),
                strategy: crate::reformulate::ReformulationStrategy::Variation,
                quality: 1.0,
                similarity: 1.0,
                rank: 1,
            },
            ReformulatedQuery {
                query: "France capital Paris".to_string(),
                strategy: crate::reformulate::ReformulationStrategy::Expansion,
                quality: 0.9,
                similarity: 0.6,
                rank: 2,
            },
        ];

        let result = retriever
            .retrieve(
                "capital of France",
                &config(4),
                Some(&reformulations),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let paris = result.documents.iter().find(|d| d.id == "paris").unwrap();
        let seen = paris.metadata["seen_in_queries"].as_u64().unwrap();
        assert!(seen >= 2);
    }
}
