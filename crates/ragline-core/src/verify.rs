//! Answer verification adapters
//!
//! One `VerifierAdapter` capability with two concrete variants: a
//! deterministic term-coverage heuristic and a generator-backed judge.
//! `improve` re-verifies its rewrite and keeps whichever answer scores
//! higher, so it never returns a worse answer under its own `verify`.

use crate::cancel::{ensure_live, CancellationToken};
use crate::error::Result;
use crate::llm::{GenerateOptions, Generator};
use crate::text::{token_set, truncate_chars};
use async_trait::async_trait;
use std::sync::Arc;

/// Outcome of scoring an answer against (query, context)
#[derive(Debug, Clone)]
pub struct Verification {
    /// Score in [0, 1], higher is better
    pub score: f64,
}

/// Outcome of an improvement attempt
#[derive(Debug, Clone)]
pub struct Improvement {
    pub answer: String,
    pub score: f64,
}

/// Scores and optionally rewrites answers against (query, context)
#[async_trait]
pub trait VerifierAdapter: Send + Sync {
    /// Score how well `answer` addresses `query` given `context`.
    async fn verify(
        &self,
        query: &str,
        context: &str,
        answer: &str,
        cancel: &CancellationToken,
    ) -> Result<Verification>;

    /// Rewrite `answer` toward a higher score. May return the input
    /// unchanged.
    async fn improve(
        &self,
        query: &str,
        context: &str,
        answer: &str,
        cancel: &CancellationToken,
    ) -> Result<Improvement>;
}

/// Deterministic verifier: blends query-term coverage with context
/// groundedness. No I/O.
pub struct HeuristicVerifier;

impl HeuristicVerifier {
    fn score_answer(query: &str, context: &str, answer: &str) -> f64 {
        let answer_tokens = token_set(answer);
        if answer_tokens.is_empty() {
            return 0.0;
        }

        let query_tokens = token_set(query);
        let coverage = if query_tokens.is_empty() {
            0.5
        } else {
            query_tokens
                .iter()
                .filter(|t| answer_tokens.contains(*t))
                .count() as f64
                / query_tokens.len() as f64
        };

        let context_tokens = token_set(context);
        let groundedness = if context_tokens.is_empty() {
            0.0
        } else {
            answer_tokens
                .iter()
                .filter(|t| context_tokens.contains(*t))
                .count() as f64
                / answer_tokens.len() as f64
        };

        (0.4 * coverage + 0.6 * groundedness).clamp(0.0, 1.0)
    }
}

#[async_trait]
impl VerifierAdapter for HeuristicVerifier {
    async fn verify(
        &self,
        query: &str,
        context: &str,
        answer: &str,
        cancel: &CancellationToken,
    ) -> Result<Verification> {
        ensure_live(cancel)?;
        Ok(Verification {
            score: Self::score_answer(query, context, answer),
        })
    }

    async fn improve(
        &self,
        query: &str,
        context: &str,
        answer: &str,
        cancel: &CancellationToken,
    ) -> Result<Improvement> {
        ensure_live(cancel)?;
        // No rewriting capability; the input is its own best effort.
        Ok(Improvement {
            answer: answer.to_string(),
            score: Self::score_answer(query, context, answer),
        })
    }
}

/// Generator-backed verifier: numeric judge score with heuristic fallback
/// when the reply does not parse.
pub struct JudgeVerifier {
    generator: Arc<dyn Generator>,
}

impl JudgeVerifier {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl VerifierAdapter for JudgeVerifier {
    async fn verify(
        &self,
        query: &str,
        context: &str,
        answer: &str,
        cancel: &CancellationToken,
    ) -> Result<Verification> {
        ensure_live(cancel)?;

        let prompt = format!(
            "Rate how well the answer addresses the question using only the \
             context. Reply with a single number between 0.0 and 1.0.\n\n\
             Context:\n{}\n\nQuestion: {}\n\nAnswer: {}\n\nScore:",
            truncate_chars(context, 4000),
            query,
            answer
        );
        let options = GenerateOptions {
            temperature: 0.0,
            max_tokens: 8,
        };
        let generation = crate::cancel::with_cancellation(
            cancel,
            self.generator.generate(&prompt, &options),
        )
        .await?;

        let score = parse_score(&generation.text).unwrap_or_else(|| {
            tracing::warn!("Unparseable judge score, using heuristic fallback");
            HeuristicVerifier::score_answer(query, context, answer)
        });

        Ok(Verification { score })
    }

    async fn improve(
        &self,
        query: &str,
        context: &str,
        answer: &str,
        cancel: &CancellationToken,
    ) -> Result<Improvement> {
        let before = self.verify(query, context, answer, cancel).await?;

        let prompt = format!(
            "Improve the answer below so it addresses the question more \
             completely, using only facts from the context. Output only the \
             improved answer.\n\n\
             Context:\n{}\n\nQuestion: {}\n\nAnswer: {}",
            truncate_chars(context, 4000),
            query,
            answer
        );
        let options = GenerateOptions {
            temperature: 0.3,
            max_tokens: 512,
        };
        let generation = crate::cancel::with_cancellation(
            cancel,
            self.generator.generate(&prompt, &options),
        )
        .await?;
        let rewritten = generation.text.trim().to_string();

        if rewritten.is_empty() {
            return Ok(Improvement {
                answer: answer.to_string(),
                score: before.score,
            });
        }

        let after = self.verify(query, context, &rewritten, cancel).await?;
        if after.score >= before.score {
            Ok(Improvement {
                answer: rewritten,
                score: after.score,
            })
        } else {
            Ok(Improvement {
                answer: answer.to_string(),
                score: before.score,
            })
        }
    }
}

/// Extract the first float in [0, 1] from a judge reply.
fn parse_score(text: &str) -> Option<f64> {
    text.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter(|s| !s.is_empty())
        .find_map(|s| s.parse::<f64>().ok())
        .filter(|v| (0.0..=1.0).contains(v))
}
