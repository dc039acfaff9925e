//! Diverse sampling engine
//!
//! Draws a pool of stochastic completions for one prompt and greedily selects
//! a quality-ranked, deduplicated subset that balances likelihood against
//! intra-sample diversity. Reused by reformulation, reranking, synthesis and
//! answer generation.

use crate::cancel::{ensure_live, with_cancellation, CancellationToken};
use crate::error::{RaglineError, Result};
use crate::llm::{GenerateOptions, Generator};
use crate::text::{jaccard, token_set};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;

/// Concurrent generator calls per sampling pass
const DEFAULT_CONCURRENCY: usize = 4;

/// Options for one sampling pass
#[derive(Debug, Clone)]
pub struct SamplingOptions {
    /// Raw candidates to draw (bumped to 2·top_k when lower)
    pub num_samples: usize,
    /// Survivors to keep (K)
    pub top_k: usize,
    /// Quality-sharpening exponent: β>1 favors likelihood, β<1 flattens
    /// toward diversity
    pub beta: f64,
    /// Sampling temperature for the raw draws
    pub temperature: f32,
    /// Token cap per draw
    pub max_tokens: u32,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            num_samples: 6,
            top_k: 3,
            beta: 1.0,
            temperature: 0.8,
            max_tokens: 512,
        }
    }
}

/// Quality-ranked survivors of one sampling pass
#[derive(Debug, Clone, Default)]
pub struct SamplingResult {
    /// Selected samples, sorted by sharpened likelihood desc
    pub samples: Vec<String>,
    /// Sharpened likelihoods in [0, 1], parallel to `samples`
    pub likelihoods: Vec<f64>,
}

/// Quality-weighted diverse sampler over a stochastic generator
pub struct SamplingEngine {
    generator: Arc<dyn Generator>,
    concurrency: usize,
}

impl SamplingEngine {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            generator,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(generator: Arc<dyn Generator>, concurrency: usize) -> Self {
        Self {
            generator,
            concurrency: concurrency.max(1),
        }
    }

    /// Draw candidates and return at most `top_k` diverse survivors.
    ///
    /// Fails with `Generator` only when every draw failed; partial failures
    /// are logged and skipped, so fewer than `top_k` survivors is not an
    /// error.
    pub async fn sample(
        &self,
        prompt: &str,
        options: &SamplingOptions,
        cancel: &CancellationToken,
    ) -> Result<SamplingResult> {
        ensure_live(cancel)?;

        if options.top_k == 0 {
            return Ok(SamplingResult::default());
        }

        let draws = options.num_samples.max(options.top_k * 2).max(1);
        let generate_options = GenerateOptions {
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        // Fan out, then restore submission order so selection (and its
        // insertion-order tie-break) is deterministic.
        let generator = &self.generator;
        let fan_out = stream::iter(0..draws)
            .map(|idx| {
                let opts = generate_options.clone();
                async move { (idx, generator.generate(prompt, &opts).await) }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>();

        let mut drawn = with_cancellation(cancel, async { Ok(fan_out.await) }).await?;
        drawn.sort_by_key(|(idx, _)| *idx);

        let mut candidates: Vec<(String, f64)> = Vec::with_capacity(draws);
        let mut failures = 0usize;
        for (_, result) in drawn {
            match result {
                Ok(generation) => {
                    let likelihood = pseudo_likelihood(&generation.text, generation.logprob);
                    candidates.push((generation.text, likelihood));
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!("Sampling draw failed: {}", e);
                }
            }
        }

        if candidates.is_empty() {
            return Err(RaglineError::Generator(format!(
                "all {} sampling draws failed",
                failures
            )));
        }

        // Byte-identical duplicates collapse to their first occurrence.
        let mut seen = HashSet::new();
        candidates.retain(|(text, _)| seen.insert(text.clone()));

        // Sharpen: p_i = likelihood^β.
        for (_, likelihood) in candidates.iter_mut() {
            *likelihood = likelihood.max(0.0).powf(options.beta);
        }

        let selected = select_diverse(&candidates, options.top_k);

        let mut survivors: Vec<(String, f64)> = selected
            .into_iter()
            .map(|i| candidates[i].clone())
            .collect();
        survivors.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let (samples, likelihoods) = survivors.into_iter().unzip();
        Ok(SamplingResult {
            samples,
            likelihoods,
        })
    }
}

/// Greedy quality × diversity selection.
///
/// At each step picks the unselected candidate maximizing
/// `p_i · (1 − max Jaccard to selected)`; ties break toward insertion order.
fn select_diverse(candidates: &[(String, f64)], top_k: usize) -> Vec<usize> {
    let token_sets: Vec<HashSet<String>> =
        candidates.iter().map(|(text, _)| token_set(text)).collect();

    let mut selected: Vec<usize> = Vec::with_capacity(top_k.min(candidates.len()));
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();

    while selected.len() < top_k && !remaining.is_empty() {
        let mut best_pos = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (pos, &idx) in remaining.iter().enumerate() {
            let diversity = 1.0
                - selected
                    .iter()
                    .map(|&s| jaccard(&token_sets[idx], &token_sets[s]))
                    .fold(0.0f64, f64::max);
            let score = candidates[idx].1 * diversity;
            if score > best_score {
                best_score = score;
                best_pos = pos;
            }
        }
        selected.push(remaining.remove(best_pos));
    }

    selected
}

/// Pseudo-likelihood in [0, 1].
///
/// Uses the length-normalized logprob when the service reports one,
/// otherwise a deterministic heuristic from length and repetition.
fn pseudo_likelihood(text: &str, logprob: Option<f64>) -> f64 {
    if let Some(lp) = logprob {
        return lp.clamp(-20.0, 0.0).exp();
    }

    let chars = text.chars().count();
    if chars == 0 {
        return 0.0;
    }

    let tokens: Vec<&str> = text.split_whitespace().collect();
    let distinct: HashSet<&str> = tokens.iter().copied().collect();
    let repetition = if tokens.is_empty() {
        0.0
    } else {
        distinct.len() as f64 / tokens.len() as f64
    };

    let length_score = (chars as f64 / 400.0).min(1.0);
    (0.05 + 0.55 * length_score + 0.4 * repetition).clamp(0.0, 1.0)
}
