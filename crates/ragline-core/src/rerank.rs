//! Listwise, pairwise and pointwise reranking
//!
//! The listwise path draws several candidate orderings through the sampling
//! engine and picks the one balancing sampling quality against rank-distance
//! diversity, optionally blended with a verifier score. Parse failures are
//! recovered locally by falling back to the identity ordering.

use crate::cancel::{ensure_live, with_cancellation, CancellationToken};
use crate::config::RerankingConfig;
use crate::error::Result;
use crate::llm::{GenerateOptions, Generator};
use crate::sampling::{SamplingEngine, SamplingOptions};
use crate::store::Document;
use crate::text::{mean_pairwise_diversity, truncate_chars};
use crate::verify::VerifierAdapter;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

lazy_static! {
    static ref INTEGER: Regex = Regex::new(r"\d+").unwrap();
}

/// Reranking method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RerankMethod {
    #[default]
    Listwise,
    Pairwise,
    Pointwise,
}

/// Output of one reranking pass
#[derive(Debug, Clone)]
pub struct RerankResult {
    /// Documents in their new order, ranks reassigned
    pub documents: Vec<Document>,
    /// 1-based input position of each output document
    pub original_ranks: Vec<usize>,
    /// 1-based output position (parallel to `original_ranks`)
    pub new_ranks: Vec<usize>,
    /// Mean pairwise (1 - Jaccard) over the reranked head contents
    pub diversity_score: f64,
    /// Rank-improvement proxy over the top five
    pub quality_score: f64,
    pub latency_ms: u64,
    /// Method label, e.g. "listwise+sampling"
    pub method: String,
}

/// Document reranker backed by the sampling engine and an optional verifier
pub struct Reranker {
    generator: Arc<dyn Generator>,
    engine: SamplingEngine,
    verifier: Option<Arc<dyn VerifierAdapter>>,
}

impl Reranker {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            engine: SamplingEngine::new(generator.clone()),
            generator,
            verifier: None,
        }
    }

    pub fn with_verifier(generator: Arc<dyn Generator>, verifier: Arc<dyn VerifierAdapter>) -> Self {
        Self {
            engine: SamplingEngine::new(generator.clone()),
            generator,
            verifier: Some(verifier),
        }
    }

    /// Rerank the first `config.max_documents` documents; the tail keeps its
    /// order. Ranks are reassigned across the whole output.
    pub async fn rerank(
        &self,
        query: &str,
        documents: &[Document],
        config: &RerankingConfig,
        cancel: &CancellationToken,
    ) -> Result<RerankResult> {
        let start = Instant::now();
        ensure_live(cancel)?;

        let method_label = match (config.method, config.use_inference_sampling) {
            (RerankMethod::Listwise, true) => "listwise+sampling",
            (RerankMethod::Listwise, false) => "listwise",
            (RerankMethod::Pairwise, _) => "pairwise",
            (RerankMethod::Pointwise, _) => "pointwise",
        };

        let m = config.max_documents.min(documents.len());
        if m < 2 {
            // Nothing to reorder
            return Ok(self.assemble(
                documents,
                (0..m).collect(),
                m,
                method_label,
                start,
            ));
        }

        let head = &documents[..m];
        let ordering = match config.method {
            RerankMethod::Listwise if config.use_inference_sampling => {
                self.listwise_sampled(query, head, config, cancel).await?
            }
            RerankMethod::Listwise => self.listwise_single(query, head, cancel).await?,
            RerankMethod::Pairwise => self.pairwise(query, head, cancel).await?,
            RerankMethod::Pointwise => self.pointwise(query, head, cancel).await?,
        };

        Ok(self.assemble(documents, ordering, m, method_label, start))
    }

    /// Draw 2H candidate orderings, keep the valid permutations, and select
    /// by quality, rank-distance diversity and the optional verifier blend.
    async fn listwise_sampled(
        &self,
        query: &str,
        head: &[Document],
        config: &RerankingConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<usize>> {
        let m = head.len();
        let prompt = build_listwise_prompt(query, head);
        let options = SamplingOptions {
            num_samples: config.num_hypotheses * 2,
            top_k: config.num_hypotheses,
            beta: config.beta,
            temperature: 0.7,
            max_tokens: 64,
        };

        let sampled = self.engine.sample(&prompt, &options, cancel).await?;

        let mut hypotheses: Vec<(Vec<usize>, f64)> = Vec::new();
        for (text, &quality) in sampled.samples.iter().zip(sampled.likelihoods.iter()) {
            match parse_ranking(text, m) {
                Some(ordering) => hypotheses.push((ordering, quality)),
                None => tracing::debug!("Discarding invalid ranking hypothesis: {:?}", text),
            }
        }

        if hypotheses.is_empty() {
            tracing::warn!("No valid ranking among {} hypotheses, keeping original order", sampled.samples.len());
            return Ok((0..m).collect());
        }

        let delta = config.diversity_weight.clamp(0.0, 1.0);
        let mut best_index = 0;
        let mut best_score = f64::NEG_INFINITY;

        for (i, (ordering, quality)) in hypotheses.iter().enumerate() {
            let diversity = if hypotheses.len() > 1 {
                hypotheses
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, (other, _))| kendall_tau_distance(ordering, other))
                    .sum::<f64>()
                    / (hypotheses.len() - 1) as f64
            } else {
                0.0
            };
            let mut score = (1.0 - delta) * quality + delta * diversity;

            if config.trm_enabled && config.trm_weight > 0.0 {
                if let Some(verifier) = &self.verifier {
                    let top: String = ordering
                        .iter()
                        .take(3)
                        .map(|&idx| head[idx].content.as_str())
                        .collect::<Vec<_>>()
                        .join("\n");
                    let first = &head[ordering[0]].content;
                    let verification = verifier.verify(query, &top, first, cancel).await?;
                    let w = config.trm_weight.clamp(0.0, 1.0);
                    score = (1.0 - w) * score + w * verification.score;
                }
            }

            if score > best_score {
                best_score = score;
                best_index = i;
            }
        }

        Ok(hypotheses.swap_remove(best_index).0)
    }

    /// Single listwise call; parse failure keeps the original order.
    async fn listwise_single(
        &self,
        query: &str,
        head: &[Document],
        cancel: &CancellationToken,
    ) -> Result<Vec<usize>> {
        let m = head.len();
        let prompt = build_listwise_prompt(query, head);
        let options = GenerateOptions {
            temperature: 0.3,
            max_tokens: 64,
        };
        let generation =
            with_cancellation(cancel, self.generator.generate(&prompt, &options)).await?;

        match parse_ranking(&generation.text, m) {
            Some(ordering) => Ok(ordering),
            None => {
                tracing::warn!("Listwise ranking did not parse, keeping original order");
                Ok((0..m).collect())
            }
        }
    }

    /// Bubble sort on A-vs-B judge calls.
    async fn pairwise(
        &self,
        query: &str,
        head: &[Document],
        cancel: &CancellationToken,
    ) -> Result<Vec<usize>> {
        let m = head.len();
        let mut ordering: Vec<usize> = (0..m).collect();
        let options = GenerateOptions {
            temperature: 0.0,
            max_tokens: 4,
        };

        for pass in 0..m {
            for i in 0..m - 1 - pass {
                ensure_live(cancel)?;
                let a = &head[ordering[i]];
                let b = &head[ordering[i + 1]];
                let prompt = format!(
                    "Which document answers the query better?\n\n\
                     Query: \"{}\"\n\n\
                     Document A: {}\n\n\
                     Document B: {}\n\n\
                     Reply with exactly one letter, A or B:",
                    query,
                    truncate_chars(&a.content, 500),
                    truncate_chars(&b.content, 500)
                );
                let generation =
                    with_cancellation(cancel, self.generator.generate(&prompt, &options)).await?;
                if generation
                    .text
                    .trim_start()
                    .to_uppercase()
                    .starts_with('B')
                {
                    ordering.swap(i, i + 1);
                }
            }
        }

        Ok(ordering)
    }

    /// Score each document independently on a 0-10 scale and sort desc.
    async fn pointwise(
        &self,
        query: &str,
        head: &[Document],
        cancel: &CancellationToken,
    ) -> Result<Vec<usize>> {
        let options = GenerateOptions {
            temperature: 0.0,
            max_tokens: 4,
        };

        let mut scored: Vec<(usize, f64)> = Vec::with_capacity(head.len());
        for (i, document) in head.iter().enumerate() {
            ensure_live(cancel)?;
            let prompt = format!(
                "Score this document's relevance to the query from 0 to 10.\n\n\
                 Query: \"{}\"\n\n\
                 Document: {}\n\n\
                 Reply with a single number:",
                query,
                truncate_chars(&document.content, 500)
            );
            let generation =
                with_cancellation(cancel, self.generator.generate(&prompt, &options)).await?;
            let score = INTEGER
                .find(&generation.text)
                .and_then(|hit| hit.as_str().parse::<f64>().ok())
                .unwrap_or(5.0);
            scored.push((i, score.clamp(0.0, 10.0)));
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(scored.into_iter().map(|(i, _)| i).collect())
    }

    /// Apply the head ordering, append the unchanged tail and compute the
    /// result metrics.
    fn assemble(
        &self,
        documents: &[Document],
        ordering: Vec<usize>,
        m: usize,
        method_label: &str,
        start: Instant,
    ) -> RerankResult {
        let mut output: Vec<Document> = ordering
            .iter()
            .map(|&i| documents[i].clone())
            .chain(documents[m..].iter().cloned())
            .collect();

        let original_ranks: Vec<usize> = ordering
            .iter()
            .map(|&i| i + 1)
            .chain((m..documents.len()).map(|i| i + 1))
            .collect();
        let new_ranks: Vec<usize> = (1..=output.len()).collect();

        for (document, &rank) in output.iter_mut().zip(new_ranks.iter()) {
            document.rank = Some(rank);
        }

        // Rank-improvement proxy over the top five
        let quality_score = if output.is_empty() {
            0.0
        } else {
            let top = original_ranks.len().min(5);
            original_ranks
                .iter()
                .zip(new_ranks.iter())
                .take(top)
                .map(|(&original, &new)| {
                    ((original as f64 - new as f64) / original as f64).max(0.0)
                })
                .sum::<f64>()
                / top as f64
        };

        let head_contents: Vec<&str> = output
            .iter()
            .take(m)
            .map(|d| d.content.as_str())
            .collect();
        let diversity_score = mean_pairwise_diversity(&head_contents);

        RerankResult {
            documents: output,
            original_ranks,
            new_ranks,
            diversity_score,
            quality_score,
            latency_ms: start.elapsed().as_millis() as u64,
            method: method_label.to_string(),
        }
    }
}

fn build_listwise_prompt(query: &str, head: &[Document]) -> String {
    let mut prompt = format!(
        "Order these documents from most to least relevant to the query.\n\n\
         Query: \"{}\"\n\nDocuments:\n",
        query
    );
    for (i, document) in head.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] {}\n",
            i + 1,
            truncate_chars(&document.content, 300)
        ));
    }
    prompt.push_str(&format!(
        "\nReply with the {} document numbers as a comma-separated list, \
         most relevant first:",
        head.len()
    ));
    prompt
}

/// Parse a comma-separated 1-based ordering into 0-based indices.
///
/// Returns `None` unless the text yields exactly `m` in-range indices with
/// no duplicates.
fn parse_ranking(text: &str, m: usize) -> Option<Vec<usize>> {
    let numbers: Vec<usize> = INTEGER
        .find_iter(text)
        .filter_map(|hit| hit.as_str().parse::<usize>().ok())
        .collect();

    if numbers.len() != m {
        return None;
    }

    let mut seen = HashSet::new();
    let mut ordering = Vec::with_capacity(m);
    for number in numbers {
        if number < 1 || number > m || !seen.insert(number) {
            return None;
        }
        ordering.push(number - 1);
    }
    Some(ordering)
}

/// Normalized Kendall tau distance between two orderings of equal length.
///
/// Fraction of discordant pairs, in [0, 1].
fn kendall_tau_distance(a: &[usize], b: &[usize]) -> f64 {
    let n = a.len();
    if n < 2 || b.len() != n {
        return 0.0;
    }

    // position of each item in b
    let mut position = vec![0usize; n];
    for (pos, &item) in b.iter().enumerate() {
        position[item] = pos;
    }

    let mut discordant = 0usize;
    for i in 0..n {
        for j in (i + 1)..n {
            if position[a[i]] > position[a[j]] {
                discordant += 1;
            }
        }
    }

    discordant as f64 / (n * (n - 1) / 2) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Generation;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedGenerator {
        outputs: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl ScriptedGenerator {
        fn new(outputs: Vec<&'static str>) -> Self {
            Self {
                outputs,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<Generation> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst) % self.outputs.len();
            Ok(Generation {
                text: self.outputs[idx].to_string(),
                logprob: Some(-0.1),
            })
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn documents(n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| {
                let mut doc = Document::new(
                    format!("d{}", i),
                    format!("document number {} about topic {}", i, i),
                );
                doc.rank = Some(i + 1);
                doc
            })
            .collect()
    }

    fn config() -> RerankingConfig {
        RerankingConfig {
            num_hypotheses: 2,
            max_documents: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_ranking() {
        assert_eq!(parse_ranking("3, 1, 2", 3), Some(vec![2, 0, 1]));
        assert_eq!(parse_ranking("Ranking: 2,1", 2), Some(vec![1, 0]));
        assert_eq!(parse_ranking("1, 1, 2", 3), None);
        assert_eq!(parse_ranking("1, 2, 4", 3), None);
        assert_eq!(parse_ranking("1, 2", 3), None);
        assert_eq!(parse_ranking("no numbers here", 3), None);
    }

    #[test]
    fn test_kendall_tau_distance() {
        assert_eq!(kendall_tau_distance(&[0, 1, 2], &[0, 1, 2]), 0.0);
        assert_eq!(kendall_tau_distance(&[0, 1, 2], &[2, 1, 0]), 1.0);
        let half = kendall_tau_distance(&[0, 1, 2], &[1, 0, 2]);
        assert!((half - 1.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_listwise_sampling_reorders() {
        let reranker = Reranker::new(Arc::new(ScriptedGenerator::new(vec![
            "3, 1, 2", "3, 2, 1", "2, 3, 1", "3, 1, 2",
        ])));
        let docs = documents(3);
        let result = reranker
            .rerank("query", &docs, &config(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.method, "listwise+sampling");
        // Output is a permutation of the input
        let mut ids: Vec<_> = result.documents.iter().map(|d| d.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["d0", "d1", "d2"]);
        // Ranks reassigned 1-based
        assert_eq!(result.documents[0].rank, Some(1));
        assert_eq!(result.new_ranks, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_listwise_fallback_keeps_order_and_label() {
        let reranker = Reranker::new(Arc::new(ScriptedGenerator::new(vec![
            "gibberish", "more gibberish", "still nothing", "words",
        ])));
        let docs = documents(3);
        let result = reranker
            .rerank("query", &docs, &config(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.method, "listwise+sampling");
        let ids: Vec<_> = result.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d0", "d1", "d2"]);
        assert_eq!(result.quality_score, 0.0);
    }

    #[tokio::test]
    async fn test_max_documents_zero_keeps_input_order() {
        let reranker = Reranker::new(Arc::new(ScriptedGenerator::new(vec!["2, 1"])));
        let docs = documents(3);
        let cfg = RerankingConfig {
            max_documents: 0,
            ..config()
        };
        let result = reranker
            .rerank("query", &docs, &cfg, &CancellationToken::new())
            .await
            .unwrap();

        let ids: Vec<_> = result.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d0", "d1", "d2"]);
    }

    #[tokio::test]
    async fn test_tail_beyond_max_documents_is_unchanged() {
        let reranker = Reranker::new(Arc::new(ScriptedGenerator::new(vec![
            "2, 1", "2, 1", "1, 2", "2, 1",
        ])));
        let docs = documents(4);
        let cfg = RerankingConfig {
            max_documents: 2,
            ..config()
        };
        let result = reranker
            .rerank("query", &docs, &cfg, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.documents[2].id, "d2");
        assert_eq!(result.documents[3].id, "d3");
        assert_eq!(result.documents[3].rank, Some(4));
    }

    #[tokio::test]
    async fn test_verifier_blend_still_yields_permutation() {
        let reranker = Reranker::with_verifier(
            Arc::new(ScriptedGenerator::new(vec!["2, 1, 3", "3, 2, 1", "1, 3, 2", "2, 3, 1"])),
            Arc::new(crate::verify::HeuristicVerifier),
        );
        let docs = documents(3);
        let cfg = RerankingConfig {
            trm_enabled: true,
            trm_weight: 0.5,
            ..config()
        };
        let result = reranker
            .rerank("topic 1", &docs, &cfg, &CancellationToken::new())
            .await
            .unwrap();

        let mut ids: Vec<_> = result.documents.iter().map(|d| d.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["d0", "d1", "d2"]);
    }

    #[tokio::test]
    async fn test_pointwise_sorts_by_score() {
        let reranker = Reranker::new(Arc::new(ScriptedGenerator::new(vec!["3", "9", "6"])));
        let docs = documents(3);
        let cfg = RerankingConfig {
            method: RerankMethod::Pointwise,
            ..config()
        };
        let result = reranker
            .rerank("query", &docs, &cfg, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.method, "pointwise");
        let ids: Vec<_> = result.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d2", "d0"]);
    }

    #[tokio::test]
    async fn test_pairwise_swaps_on_b() {
        // Every comparison prefers B, so the order fully reverses
        let reranker = Reranker::new(Arc::new(ScriptedGenerator::new(vec!["B"])));
        let docs = documents(3);
        let cfg = RerankingConfig {
            method: RerankMethod::Pairwise,
            ..config()
        };
        let result = reranker
            .rerank("query", &docs, &cfg, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.method, "pairwise");
        let ids: Vec<_> = result.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d2", "d1", "d0"]);
    }
}
