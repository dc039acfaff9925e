//! Answer generation with verification
//!
//! Draws answer candidates through the sampling engine until a confidence
//! threshold is met, then verifies faithfulness, self-consistency and
//! completeness. Faithfulness and completeness are real judge calls against
//! the generator; an empty context short-circuits to `complete = false`.

use crate::cancel::{ensure_live, with_cancellation, CancellationToken};
use crate::config::GenerationConfig;
use crate::error::Result;
use crate::llm::{GenerateOptions, Generator};
use crate::sampling::{SamplingEngine, SamplingOptions};
use crate::text::{text_jaccard, truncate_chars};
use crate::verify::VerifierAdapter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Rough characters-per-token for sizing the generator cap
const CHARS_PER_TOKEN: usize = 4;

/// Jaccard level above which two candidates count as agreeing
const AGREEMENT_THRESHOLD: f64 = 0.5;

/// Verification facets for a generated answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub faithful: bool,
    pub consistent: bool,
    pub complete: bool,
    /// Mean of the facet scores
    pub confidence: f64,
    pub faithfulness_score: f64,
    pub consistency_score: f64,
    pub completeness_score: f64,
}

/// Output of one generation pass
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub answer: String,
    /// Sampled candidates when inference sampling was on
    pub candidates: Option<Vec<String>>,
    /// Sampling confidence of the chosen answer
    pub confidence: f64,
    pub attempts: usize,
    pub verification: VerificationReport,
    pub latency_ms: u64,
}

/// Default sampling temperature for answer draws
const DEFAULT_ANSWER_TEMPERATURE: f32 = 0.7;

/// Adaptive answer generator with optional verifier gate
pub struct AnswerGenerator {
    generator: Arc<dyn Generator>,
    engine: SamplingEngine,
    verifier: Option<Arc<dyn VerifierAdapter>>,
    temperature: f32,
}

impl AnswerGenerator {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            engine: SamplingEngine::new(generator.clone()),
            generator,
            verifier: None,
            temperature: DEFAULT_ANSWER_TEMPERATURE,
        }
    }

    pub fn with_verifier(generator: Arc<dyn Generator>, verifier: Arc<dyn VerifierAdapter>) -> Self {
        Self {
            verifier: Some(verifier),
            ..Self::new(generator)
        }
    }

    /// Override the sampling temperature for answer draws.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Generate and verify an answer for (query, context).
    pub async fn generate(
        &self,
        query: &str,
        context: &str,
        config: &GenerationConfig,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        let start = Instant::now();
        ensure_live(cancel)?;

        let prompt = build_answer_prompt(query, context);
        let max_tokens = (config.max_answer_length / CHARS_PER_TOKEN).max(64) as u32;

        let mut best = String::new();
        let mut candidates: Option<Vec<String>> = None;
        let mut confidence = 0.0;
        let mut attempts = 0;

        while confidence < config.confidence_threshold && attempts < config.max_attempts {
            attempts += 1;

            if config.use_inference_sampling {
                let options = SamplingOptions {
                    num_samples: config.num_candidates * 2,
                    top_k: config.num_candidates,
                    beta: config.beta,
                    temperature: self.temperature,
                    max_tokens,
                };
                let sampled = self.engine.sample(&prompt, &options, cancel).await?;
                if let (Some(sample), Some(&likelihood)) =
                    (sampled.samples.first(), sampled.likelihoods.first())
                {
                    best = sample.clone();
                    confidence = likelihood;
                }
                candidates = Some(sampled.samples);
            } else {
                let options = GenerateOptions {
                    temperature: self.temperature,
                    max_tokens,
                };
                let generation =
                    with_cancellation(cancel, self.generator.generate(&prompt, &options)).await?;
                best = generation.text;
                // A single draw carries no sampling signal; assume a
                // serviceable answer.
                confidence = 0.8;
            }
        }

        // Faithfulness: is the answer entailed by the context?
        let (faithful, faithfulness_score) = if !config.verify_faithfulness {
            (true, 1.0)
        } else if context.trim().is_empty() || best.trim().is_empty() {
            (false, 0.0)
        } else {
            let supported = self
                .judge(
                    &format!(
                        "Context:\n{}\n\nAnswer: {}\n\nIs the answer fully supported \
                         by the context? Reply YES or NO:",
                        truncate_chars(context, 4000),
                        best
                    ),
                    cancel,
                )
                .await?;
            (supported, if supported { 1.0 } else { 0.0 })
        };

        // Self-consistency: agreement across sampled candidates
        let (consistent, consistency_score) = match (&candidates, config.use_self_consistency) {
            (Some(samples), true) if samples.len() >= 2 => {
                let score = pairwise_agreement(samples);
                (score >= 0.5, score)
            }
            _ => (true, 1.0),
        };

        // Completeness: does the answer fully address the query?
        let (complete, completeness_score) = if context.trim().is_empty()
            || best.trim().is_empty()
        {
            (false, 0.0)
        } else {
            let addressed = self
                .judge(
                    &format!(
                        "Question: {}\n\nAnswer: {}\n\nDoes the answer fully address \
                         the question? Reply YES or NO:",
                        query, best
                    ),
                    cancel,
                )
                .await?;
            (addressed, if addressed { 1.0 } else { 0.0 })
        };

        // Verifier gate: score the answer and push it through `improve`
        // while it stays below the floor.
        if config.use_trm_verification {
            if let Some(verifier) = &self.verifier {
                let mut verification = verifier.verify(query, context, &best, cancel).await?;
                let mut steps = 0;
                while verification.score < config.trm_min_score && steps < config.trm_max_steps {
                    steps += 1;
                    let improvement = verifier.improve(query, context, &best, cancel).await?;
                    best = improvement.answer;
                    verification.score = improvement.score;
                }
                if steps > 0 {
                    tracing::debug!(
                        "Verifier improved answer over {} steps to score {:.2}",
                        steps,
                        verification.score
                    );
                }
            }
        }

        let report_confidence =
            (faithfulness_score + consistency_score + completeness_score) / 3.0;

        Ok(GenerationResult {
            answer: best,
            candidates,
            confidence,
            attempts,
            verification: VerificationReport {
                faithful,
                consistent,
                complete,
                confidence: report_confidence,
                faithfulness_score,
                consistency_score,
                completeness_score,
            },
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// YES/NO judge call at temperature zero.
    async fn judge(&self, prompt: &str, cancel: &CancellationToken) -> Result<bool> {
        let options = GenerateOptions {
            temperature: 0.0,
            max_tokens: 4,
        };
        let generation =
            with_cancellation(cancel, self.generator.generate(prompt, &options)).await?;
        Ok(parse_yes(&generation.text))
    }
}

fn build_answer_prompt(query: &str, context: &str) -> String {
    if context.trim().is_empty() {
        format!(
            "No context documents were found. State briefly that the \
             question cannot be answered from the available documents.\n\n\
             Question: {}\n\nAnswer:",
            query
        )
    } else {
        format!(
            "Answer the question using only the context below.\n\n\
             Context:\n{}\n\nQuestion: {}\n\nAnswer:",
            context, query
        )
    }
}

/// Fraction of candidate pairs whose Jaccard similarity clears the
/// agreement threshold.
fn pairwise_agreement(samples: &[String]) -> f64 {
    let mut agreeing = 0usize;
    let mut pairs = 0usize;
    for i in 0..samples.len() {
        for j in (i + 1)..samples.len() {
            pairs += 1;
            if text_jaccard(&samples[i], &samples[j]) > AGREEMENT_THRESHOLD {
                agreeing += 1;
            }
        }
    }
    if pairs == 0 {
        0.0
    } else {
        agreeing as f64 / pairs as f64
    }
}

/// Whether the first word of a judge reply is an affirmative.
fn parse_yes(text: &str) -> bool {
    text.trim_start()
        .split(|c: char| !c.is_alphabetic())
        .find(|s| !s.is_empty())
        .map(|word| word.eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
}
