//! Property tests for fusion, similarity and reranking invariants

use async_trait::async_trait;
use proptest::prelude::*;
use ragline_core::cancel::CancellationToken;
use ragline_core::config::RerankingConfig;
use ragline_core::error::Result;
use ragline_core::fusion;
use ragline_core::llm::{GenerateOptions, Generation, Generator};
use ragline_core::rerank::Reranker;
use ragline_core::store::Document;
use ragline_core::text::{hashed_embedding, text_jaccard};
use std::sync::Arc;

/// Replies with the same text for every prompt.
struct EchoGenerator(String);

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<Generation> {
        Ok(Generation {
            text: self.0.clone(),
            logprob: Some(-0.5),
        })
    }

    fn model_name(&self) -> &str {
        "echo"
    }
}

fn id_list() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-e]", 0..5).prop_map(|ids| {
        let mut seen = std::collections::HashSet::new();
        ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
    })
}

proptest! {
    /// Increasing a query's weight never decreases the fused score of a
    /// document that query retrieved.
    #[test]
    fn rrf_weight_monotonicity(
        lists in prop::collection::vec((0.1f64..1.0, id_list()), 1..4),
        bump_index in 0usize..4,
        bump in 0.01f64..1.0,
    ) {
        let bump_index = bump_index % lists.len();

        let before = fusion::fuse(&lists, fusion::DEFAULT_RRF_K);
        let mut bumped = lists.clone();
        bumped[bump_index].0 += bump;
        let after = fusion::fuse(&bumped, fusion::DEFAULT_RRF_K);

        for id in &lists[bump_index].1 {
            let score_before = before.iter().find(|(i, _)| i == id).unwrap().1;
            let score_after = after.iter().find(|(i, _)| i == id).unwrap().1;
            prop_assert!(score_after >= score_before);
        }
    }

    /// Jaccard similarity is symmetric and bounded.
    #[test]
    fn jaccard_symmetric_and_bounded(a in "[a-z ]{0,60}", b in "[a-z ]{0,60}") {
        let ab = text_jaccard(&a, &b);
        let ba = text_jaccard(&b, &a);
        prop_assert!((ab - ba).abs() < 1e-12);
        prop_assert!((0.0..=1.0).contains(&ab));
    }

    /// Hashed fallback embeddings are unit norm (or zero for empty text).
    #[test]
    fn hashed_embedding_norm(text in "[a-z ]{0,80}", dim in 1usize..128) {
        let embedding = hashed_embedding(&text, dim);
        prop_assert_eq!(embedding.len(), dim);
        let norm: f32 = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        prop_assert!(norm < 1e-6 || (norm - 1.0).abs() < 1e-4);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Whatever the generator replies, reranker output is a permutation of
    /// its input.
    #[test]
    fn rerank_output_is_permutation(
        reply in "[0-9, a-z]{0,24}",
        doc_count in 1usize..6,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let documents: Vec<Document> = (0..doc_count)
            .map(|i| Document::new(format!("doc{}", i), format!("content number {}", i)))
            .collect();
        let reranker = Reranker::new(Arc::new(EchoGenerator(reply)));

        let result = runtime
            .block_on(reranker.rerank(
                "query",
                &documents,
                &RerankingConfig::default(),
                &CancellationToken::new(),
            ))
            .unwrap();

        let mut input_ids: Vec<_> = documents.iter().map(|d| d.id.clone()).collect();
        let mut output_ids: Vec<_> = result.documents.iter().map(|d| d.id.clone()).collect();
        input_ids.sort();
        output_ids.sort();
        prop_assert_eq!(input_ids, output_ids);

        // Ranks are a fresh 1-based sequence
        for (i, doc) in result.documents.iter().enumerate() {
            prop_assert_eq!(doc.rank, Some(i + 1));
        }
    }
}
