//! Context synthesis
//!
//! Compresses the reranked documents into a bounded context, advancing the
//! pipeline-owned delta memory for the session. The length target is soft:
//! it is enforced through the generator's token cap, not by truncation.

use crate::cancel::{ensure_live, with_cancellation, CancellationToken};
use crate::config::SynthesisConfig;
use crate::delta::{DeltaMemory, DeltaUpdate};
use crate::error::Result;
use crate::llm::{Embedder, GenerateOptions, Generator};
use crate::sampling::{SamplingEngine, SamplingOptions};
use crate::store::Document;
use crate::text::{hashed_embedding, mean_pairwise_diversity, normalize, truncate_chars};
use std::sync::Arc;
use std::time::Instant;

/// Characters of each document surfaced in the synthesis prompt
const EXCERPT_CHARS: usize = 300;

/// Rough characters-per-token for sizing the generator cap
const CHARS_PER_TOKEN: usize = 4;

/// Output of one synthesis pass
#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub context: String,
    /// The documents the context was synthesized from
    pub documents: Vec<Document>,
    /// Mean retention gate applied to the memory
    pub alpha: f64,
    pub beta: f64,
    pub topic_shift: f64,
    /// Mean pairwise (1 - Jaccard) over the input contents
    pub diversity_score: f64,
    /// Σ len(document) / len(context)
    pub compression_ratio: f64,
    pub latency_ms: u64,
}

/// Context synthesizer over the sampling engine and the session memory
pub struct ContextSynthesizer {
    generator: Arc<dyn Generator>,
    engine: SamplingEngine,
    embedder: Option<Arc<dyn Embedder>>,
}

impl ContextSynthesizer {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            engine: SamplingEngine::new(generator.clone()),
            generator,
            embedder: None,
        }
    }

    pub fn with_embedder(generator: Arc<dyn Generator>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            engine: SamplingEngine::new(generator.clone()),
            generator,
            embedder: Some(embedder),
        }
    }

    /// Synthesize a context from the documents, advancing `memory`.
    pub async fn synthesize(
        &self,
        query: &str,
        documents: &[Document],
        config: &SynthesisConfig,
        memory: &mut DeltaMemory,
        cancel: &CancellationToken,
    ) -> Result<SynthesisResult> {
        let start = Instant::now();
        ensure_live(cancel)?;

        let update = self.advance_memory(query, documents, config, memory, cancel).await?;

        let context = if documents.is_empty() {
            // Empty retrieval propagates an empty context downstream.
            String::new()
        } else {
            self.generate_context(query, documents, config, cancel).await?
        };

        let total_input: usize = documents.iter().map(|d| d.content.len()).sum();
        let compression_ratio = if context.is_empty() {
            0.0
        } else {
            total_input as f64 / context.len() as f64
        };

        let contents: Vec<&str> = documents.iter().map(|d| d.content.as_str()).collect();
        let diversity_score = mean_pairwise_diversity(&contents);

        tracing::info!(
            "Synthesized {} chars from {} documents (compression {:.1}x, shift {:.2})",
            context.len(),
            documents.len(),
            compression_ratio,
            update.topic_shift
        );

        Ok(SynthesisResult {
            context,
            documents: documents.to_vec(),
            alpha: update.alpha.mean(),
            beta: update.beta,
            topic_shift: update.topic_shift,
            diversity_score,
            compression_ratio,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Compute topic shift and gate, and advance the state when the Delta
    /// Rule is enabled.
    async fn advance_memory(
        &self,
        query: &str,
        documents: &[Document],
        config: &SynthesisConfig,
        memory: &mut DeltaMemory,
        cancel: &CancellationToken,
    ) -> Result<DeltaUpdate> {
        if !config.use_delta_rule {
            let topic_shift = memory.topic_shift(query);
            let alpha = memory.gate(config.gating_strategy, topic_shift, config.topic_shift_threshold);
            memory.note_query(query);
            return Ok(DeltaUpdate {
                topic_shift,
                alpha,
                beta: config.beta,
            });
        }

        let key = self.embed_for_memory(query, memory.dim(), cancel).await?;
        let mut values = Vec::with_capacity(documents.len());
        for document in documents {
            let value = match &document.embedding {
                Some(embedding) if embedding.len() == memory.dim() => {
                    let mut v = embedding.clone();
                    normalize(&mut v);
                    v
                }
                _ => hashed_embedding(&document.content, memory.dim()),
            };
            values.push(value);
        }

        memory.update(
            query,
            &key,
            &values,
            config.gating_strategy,
            config.topic_shift_threshold,
            config.beta,
        )
    }

    /// Unit-norm key embedding for the memory: the configured embedder when
    /// its dimensions match, else the deterministic hashed fallback.
    async fn embed_for_memory(
        &self,
        text: &str,
        dim: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>> {
        if let Some(embedder) = &self.embedder {
            if embedder.dimensions() == dim {
                let mut vector =
                    with_cancellation(cancel, embedder.embed(text)).await?;
                normalize(&mut vector);
                return Ok(vector);
            }
            tracing::debug!(
                "Embedder dimensions {} differ from memory dimension {}, using hashed fallback",
                embedder.dimensions(),
                dim
            );
        }
        Ok(hashed_embedding(text, dim))
    }

    async fn generate_context(
        &self,
        query: &str,
        documents: &[Document],
        config: &SynthesisConfig,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let prompt = build_synthesis_prompt(query, documents, config.max_context_length);
        let max_tokens = (config.max_context_length / CHARS_PER_TOKEN).max(64) as u32;

        if config.use_inference_sampling {
            let options = SamplingOptions {
                num_samples: config.num_candidates * 2,
                top_k: config.num_candidates,
                beta: 1.0,
                temperature: 0.8,
                max_tokens,
            };
            let sampled = self.engine.sample(&prompt, &options, cancel).await?;
            Ok(sampled.samples.into_iter().next().unwrap_or_default())
        } else {
            let options = GenerateOptions {
                temperature: 0.5,
                max_tokens,
            };
            let generation =
                with_cancellation(cancel, self.generator.generate(&prompt, &options)).await?;
            Ok(generation.text)
        }
    }
}

fn build_synthesis_prompt(query: &str, documents: &[Document], max_length: usize) -> String {
    let mut prompt = format!(
        "Condense these documents into a single context passage of at most \
         {} characters that answers the query. Keep every fact needed to \
         answer; drop everything else.\n\n\
         Query: \"{}\"\n\nDocuments:\n",
        max_length, query
    );
    for (i, document) in documents.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] {}\n",
            i + 1,
            truncate_chars(&document.content, EXCERPT_CHARS)
        ));
    }
    prompt.push_str("\nContext:");
    prompt
}
