//! Query reformulation
//!
//! Generates strategy-tagged variants of a query through the sampling engine,
//! cleans the raw completions, and keeps only variants that are dissimilar
//! both from the original and from each other.

use crate::cancel::{ensure_live, CancellationToken};
use crate::config::ReformulationConfig;
use crate::error::Result;
use crate::llm::Generator;
use crate::sampling::{SamplingEngine, SamplingOptions};
use crate::text::{clean_candidate, mean_pairwise_diversity, text_jaccard};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Minimum length for a decomposition sub-query to survive
const MIN_SUBQUERY_CHARS: usize = 10;

/// How a reformulation relates to the original query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReformulationStrategy {
    /// Broaden with related terms and synonyms
    Expansion,
    /// Sharpen a vague query
    Clarification,
    /// Split into sub-questions
    Decomposition,
    /// Strip to essential keywords
    Simplification,
    /// Plain rephrasing
    Variation,
}

impl ReformulationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expansion => "expansion",
            Self::Clarification => "clarification",
            Self::Decomposition => "decomposition",
            Self::Simplification => "simplification",
            Self::Variation => "variation",
        }
    }
}

/// One surviving reformulation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReformulatedQuery {
    pub query: String,
    pub strategy: ReformulationStrategy,
    /// Sampling quality in [0, 1], higher is better
    pub quality: f64,
    /// Jaccard similarity to the original query
    pub similarity: f64,
    /// 1-based rank in the final ordering
    pub rank: usize,
}

/// Output of one reformulation pass
#[derive(Debug, Clone)]
pub struct ReformulationResult {
    pub reformulations: Vec<ReformulatedQuery>,
    /// Mean pairwise (1 - Jaccard) over the survivors
    pub diversity: f64,
    pub avg_quality: f64,
    pub strategies_used: Vec<ReformulationStrategy>,
    pub latency_ms: u64,
}

/// Strategy-tagged query reformulator backed by the sampling engine
pub struct QueryReformulator {
    engine: SamplingEngine,
}

impl QueryReformulator {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            engine: SamplingEngine::new(generator),
        }
    }

    /// Generate up to `num_reformulations` deduplicated reformulations.
    pub async fn reformulate(
        &self,
        query: &str,
        config: &ReformulationConfig,
        cancel: &CancellationToken,
    ) -> Result<ReformulationResult> {
        let start = Instant::now();
        ensure_live(cancel)?;

        if config.num_reformulations == 0 {
            return Ok(ReformulationResult {
                reformulations: vec![],
                diversity: 0.0,
                avg_quality: 0.0,
                strategies_used: vec![],
                latency_ms: start.elapsed().as_millis() as u64,
            });
        }

        // Raw (query, strategy, quality) candidates, strategy order preserved
        let mut candidates: Vec<(String, ReformulationStrategy, f64)> = Vec::new();

        for &strategy in &config.strategies {
            let prompt = build_strategy_prompt(strategy, query, config.num_reformulations);
            let options = SamplingOptions {
                num_samples: config.num_reformulations * 2,
                top_k: config.num_reformulations,
                beta: config.beta,
                temperature: 0.9,
                max_tokens: 128,
            };

            let sampled = self.engine.sample(&prompt, &options, cancel).await?;

            if strategy == ReformulationStrategy::Decomposition {
                // One candidate carries all sub-questions, one per line.
                if let (Some(text), Some(&quality)) =
                    (sampled.samples.first(), sampled.likelihoods.first())
                {
                    for line in text.lines() {
                        let sub = clean_candidate(line);
                        if sub.contains('?') && sub.len() >= MIN_SUBQUERY_CHARS {
                            candidates.push((sub, strategy, quality));
                        }
                    }
                }
            } else {
                for (text, &quality) in sampled.samples.iter().zip(sampled.likelihoods.iter()) {
                    let cleaned = clean_candidate(text);
                    if !cleaned.is_empty() {
                        candidates.push((cleaned, strategy, quality));
                    }
                }
            }
        }

        // Keep a candidate iff it is dissimilar from the original and from
        // every earlier survivor, and not a literal repeat.
        let mut kept: Vec<ReformulatedQuery> = Vec::new();
        let mut seen_lowercase: HashSet<String> = HashSet::new();
        seen_lowercase.insert(query.to_lowercase());

        for (text, strategy, quality) in candidates {
            let lowered = text.to_lowercase();
            if seen_lowercase.contains(&lowered) {
                continue;
            }

            let similarity = text_jaccard(&text, query);
            if similarity > config.dedup_threshold {
                continue;
            }
            if kept
                .iter()
                .any(|r| text_jaccard(&text, &r.query) > config.dedup_threshold)
            {
                continue;
            }

            seen_lowercase.insert(lowered);
            kept.push(ReformulatedQuery {
                query: text,
                strategy,
                quality,
                similarity,
                rank: 0,
            });
        }

        kept.sort_by(|a, b| {
            b.quality
                .partial_cmp(&a.quality)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        kept.truncate(config.num_reformulations);

        let survivor_texts: Vec<&str> = kept.iter().map(|r| r.query.as_str()).collect();
        let diversity = mean_pairwise_diversity(&survivor_texts);
        let avg_quality = if kept.is_empty() {
            0.0
        } else {
            kept.iter().map(|r| r.quality).sum::<f64>() / kept.len() as f64
        };

        let mut reformulations = kept;
        if config.include_original {
            reformulations.insert(
                0,
                ReformulatedQuery {
                    query: query.to_string(),
                    strategy: ReformulationStrategy::Variation,
                    quality: 1.0,
                    similarity: 1.0,
                    rank: 0,
                },
            );
        }

        for (i, reformulation) in reformulations.iter_mut().enumerate() {
            reformulation.rank = i + 1;
        }

        let mut strategies_used = Vec::new();
        for r in &reformulations {
            if !strategies_used.contains(&r.strategy) {
                strategies_used.push(r.strategy);
            }
        }

        tracing::debug!(
            "Reformulated query into {} variants (diversity {:.2})",
            reformulations.len(),
            diversity
        );

        Ok(ReformulationResult {
            reformulations,
            diversity,
            avg_quality,
            strategies_used,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

fn build_strategy_prompt(strategy: ReformulationStrategy, query: &str, count: usize) -> String {
    match strategy {
        ReformulationStrategy::Expansion => format!(
            "Rewrite this search query into a broader version that adds \
             closely related terms and synonyms. Output only the rewritten query.\n\n\
             Query: \"{}\"",
            query
        ),
        ReformulationStrategy::Clarification => format!(
            "Rewrite this search query to be more specific and unambiguous. \
             Output only the rewritten query.\n\n\
             Query: \"{}\"",
            query
        ),
        ReformulationStrategy::Decomposition => format!(
            "Break this question into at most {} simpler sub-questions, one \
             per line, each ending with a question mark. Output only the \
             sub-questions.\n\n\
             Question: \"{}\"",
            count, query
        ),
        ReformulationStrategy::Simplification => format!(
            "Reduce this search query to its essential keywords. Output only \
             the simplified query.\n\n\
             Query: \"{}\"",
            query
        ),
        ReformulationStrategy::Variation => format!(
            "Rephrase this search query using different wording but the same \
             meaning. Output only the rephrased query.\n\n\
             Query: \"{}\"",
            query
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerateOptions, Generation};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Cycles through scripted outputs regardless of prompt
    struct ScriptedGenerator {
        outputs: Vec<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<Generation> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst) % self.outputs.len();
            Ok(Generation {
                text: self.outputs[idx].to_string(),
                logprob: Some(-0.1 * (idx as f64 + 1.0)),
            })
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn reformulator(outputs: Vec<&'static str>) -> QueryReformulator {
        QueryReformulator::new(Arc::new(ScriptedGenerator {
            outputs,
            calls: AtomicUsize::new(0),
        }))
    }

    fn config() -> ReformulationConfig {
        ReformulationConfig {
            strategies: vec![ReformulationStrategy::Expansion],
            num_reformulations: 3,
            dedup_threshold: 0.8,
            include_original: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dedup_threshold_holds_pairwise() {
        let reformulator = reformulator(vec![
            "Expanded query: \"solar panel efficiency ratings\"",
            "best photovoltaic output comparison",
            "solar panel efficiency ratings review",
            "how well do solar cells convert sunlight",
        ]);

        let result = reformulator
            .reformulate("solar efficiency", &config(), &CancellationToken::new())
            .await
            .unwrap();

        for (i, a) in result.reformulations.iter().enumerate() {
            assert!(a.similarity <= 0.8);
            for b in result.reformulations.iter().skip(i + 1) {
                assert!(text_jaccard(&a.query, &b.query) <= 0.8);
            }
        }
    }

    #[tokio::test]
    async fn test_include_original_prepends_exact_query() {
        let reformulator = reformulator(vec![
            "renewable energy panel comparison",
            "photovoltaic cell benchmarks",
        ]);
        let cfg = ReformulationConfig {
            include_original: true,
            ..config()
        };

        let result = reformulator
            .reformulate("solar efficiency", &cfg, &CancellationToken::new())
            .await
            .unwrap();

        let originals: Vec<_> = result
            .reformulations
            .iter()
            .filter(|r| r.strategy == ReformulationStrategy::Variation && r.similarity == 1.0)
            .collect();
        assert_eq!(originals.len(), 1);
        assert_eq!(originals[0].query, "solar efficiency");
        assert_eq!(originals[0].rank, 1);
        assert_eq!(originals[0].quality, 1.0);
    }

    #[tokio::test]
    async fn test_zero_reformulations_is_empty() {
        let reformulator = reformulator(vec!["anything at all"]);
        let cfg = ReformulationConfig {
            num_reformulations: 0,
            include_original: true,
            ..config()
        };

        let result = reformulator
            .reformulate("solar efficiency", &cfg, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.reformulations.is_empty());
    }

    #[tokio::test]
    async fn test_decomposition_splits_on_lines() {
        let reformulator = reformulator(vec![
            "What raises panel temperature?\nshort?\nHow does shading reduce output levels?\nnot a question at all",
        ]);
        let cfg = ReformulationConfig {
            strategies: vec![ReformulationStrategy::Decomposition],
            ..config()
        };

        let result = reformulator
            .reformulate("solar efficiency", &cfg, &CancellationToken::new())
            .await
            .unwrap();

        // "short?" fails the length floor, the last line has no question mark
        assert_eq!(result.reformulations.len(), 2);
        assert!(result
            .reformulations
            .iter()
            .all(|r| r.strategy == ReformulationStrategy::Decomposition));
        assert!(result.reformulations.iter().all(|r| r.query.contains('?')));
    }

    #[tokio::test]
    async fn test_ranks_are_one_based_and_sequential() {
        let reformulator = reformulator(vec![
            "renewable module comparison",
            "photovoltaic benchmarks overview",
        ]);
        let result = reformulator
            .reformulate("solar efficiency", &config(), &CancellationToken::new())
            .await
            .unwrap();

        for (i, r) in result.reformulations.iter().enumerate() {
            assert_eq!(r.rank, i + 1);
        }
    }
}
