//! Pipeline orchestration
//!
//! Threads the five stages together over one session: reformulation →
//! retrieval → reranking → synthesis (advancing the session memory) →
//! generation with verification. The pipeline owns the mutable memory state,
//! so one instance serves one session; concurrent sessions each get their
//! own pipeline.

use crate::cancel::CancellationToken;
use crate::config::PipelineConfig;
use crate::delta::DeltaMemory;
use crate::error::Result;
use crate::generate::{AnswerGenerator, VerificationReport};
use crate::llm::{Embedder, Generator};
use crate::reformulate::{QueryReformulator, ReformulatedQuery, ReformulationStrategy};
use crate::rerank::Reranker;
use crate::retrieve::DocumentRetriever;
use crate::store::{Document, VectorStore};
use crate::synthesize::ContextSynthesizer;
use crate::verify::VerifierAdapter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Rough characters-per-token for the cost model
const CHARS_PER_TOKEN: f64 = 4.0;

/// Cost per 1K prompt tokens, in USD
const COST_PER_1K_INPUT: f64 = 0.00015;

/// Cost per 1K completion tokens, in USD
const COST_PER_1K_OUTPUT: f64 = 0.0006;

/// Wall time per stage, in milliseconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub reformulation_ms: u64,
    pub retrieval_ms: u64,
    pub reranking_ms: u64,
    pub synthesis_ms: u64,
    pub generation_ms: u64,
    pub total_ms: u64,
}

/// Delta-memory artifacts of the synthesis stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaStateSummary {
    pub topic_shift: f64,
    /// Mean retention gate
    pub alpha: f64,
    pub beta: f64,
}

/// Everything one `execute` call produced
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub query: String,
    pub answer: String,
    pub reformulations: Vec<ReformulatedQuery>,
    pub retrieved_documents: Vec<Document>,
    pub reranked_documents: Vec<Document>,
    pub context: String,
    pub timings: StageTimings,
    /// Token-model cost estimate in USD
    pub estimated_cost: f64,
    pub verification: VerificationReport,
    pub delta_state: DeltaStateSummary,
}

/// Five-stage RAG pipeline over one session
pub struct Pipeline {
    config: PipelineConfig,
    reformulator: QueryReformulator,
    retriever: DocumentRetriever,
    reranker: Reranker,
    synthesizer: ContextSynthesizer,
    answer_generator: AnswerGenerator,
    memory: DeltaMemory,
}

impl Pipeline {
    /// Assemble a pipeline from a generator and a vector store.
    pub fn new(
        generator: Arc<dyn Generator>,
        store: Arc<dyn VectorStore>,
        config: PipelineConfig,
    ) -> Self {
        let memory = DeltaMemory::new(config.synthesis.embedding_dim);
        Self {
            reformulator: QueryReformulator::new(generator.clone()),
            retriever: DocumentRetriever::new(store),
            reranker: Reranker::new(generator.clone()),
            synthesizer: ContextSynthesizer::new(generator.clone()),
            answer_generator: AnswerGenerator::new(generator)
                .with_temperature(config.temperature),
            memory,
            config,
        }
    }

    /// Wire an embedding provider into the synthesis stage's memory keys.
    pub fn with_embedder(mut self, generator: Arc<dyn Generator>, embedder: Arc<dyn Embedder>) -> Self {
        self.synthesizer = ContextSynthesizer::with_embedder(generator, embedder);
        self
    }

    /// Wire a verifier adapter into reranking and generation.
    pub fn with_verifier(
        mut self,
        generator: Arc<dyn Generator>,
        verifier: Arc<dyn VerifierAdapter>,
    ) -> Self {
        self.reranker = Reranker::with_verifier(generator.clone(), verifier.clone());
        self.answer_generator = AnswerGenerator::with_verifier(generator, verifier)
            .with_temperature(self.config.temperature);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Current delta-memory state vector, if any synthesis has run.
    pub fn memory_state(&self) -> Option<&[f64]> {
        self.memory.state()
    }

    /// Clear the session memory. The next `execute` starts from a fresh
    /// state with topic shift zero.
    pub fn reset(&mut self) {
        self.memory.reset();
        tracing::debug!("Pipeline memory reset");
    }

    /// Run the full pipeline for a query.
    pub async fn execute(&mut self, query: &str) -> Result<PipelineResult> {
        self.execute_with(query, &CancellationToken::new()).await
    }

    /// Run the full pipeline, honoring a caller-provided cancellation token.
    ///
    /// Stages run sequentially and a stage failure propagates; there are no
    /// inter-stage retries.
    pub async fn execute_with(
        &mut self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        let total_start = Instant::now();
        let mut timings = StageTimings::default();

        // Stage 1: reformulation (or a synthetic single reformulation)
        let stage_start = Instant::now();
        let reformulations = if self.config.reformulation.enabled {
            self.reformulator
                .reformulate(query, &self.config.reformulation, cancel)
                .await?
                .reformulations
        } else {
            vec![ReformulatedQuery {
                query: query.to_string(),
                strategy: ReformulationStrategy::Variation,
                quality: 1.0,
                similarity: 1.0,
                rank: 1,
            }]
        };
        timings.reformulation_ms = stage_start.elapsed().as_millis() as u64;

        // Stage 2: retrieval (always runs)
        let stage_start = Instant::now();
        let retrieval = self
            .retriever
            .retrieve(query, &self.config.retrieval, Some(&reformulations), cancel)
            .await?;
        timings.retrieval_ms = stage_start.elapsed().as_millis() as u64;
        let retrieved_documents = retrieval.documents;

        // Stage 3: reranking
        let stage_start = Instant::now();
        let reranked_documents = if self.config.reranking.enabled && !retrieved_documents.is_empty()
        {
            self.reranker
                .rerank(query, &retrieved_documents, &self.config.reranking, cancel)
                .await?
                .documents
        } else {
            retrieved_documents.clone()
        };
        timings.reranking_ms = stage_start.elapsed().as_millis() as u64;

        // Stage 4: synthesis, advancing the session memory
        let stage_start = Instant::now();
        let synthesis = self
            .synthesizer
            .synthesize(
                query,
                &reranked_documents,
                &self.config.synthesis,
                &mut self.memory,
                cancel,
            )
            .await?;
        timings.synthesis_ms = stage_start.elapsed().as_millis() as u64;

        // Stage 5: generation and verification
        let stage_start = Instant::now();
        let generation = self
            .answer_generator
            .generate(query, &synthesis.context, &self.config.generation, cancel)
            .await?;
        timings.generation_ms = stage_start.elapsed().as_millis() as u64;
        timings.total_ms = total_start.elapsed().as_millis() as u64;

        let estimated_cost = estimate_cost(
            query,
            &reformulations,
            &retrieved_documents,
            &synthesis.context,
            &generation.answer,
        );

        tracing::info!(
            "Pipeline completed in {}ms (retrieved {}, cost ~${:.5})",
            timings.total_ms,
            retrieved_documents.len(),
            estimated_cost
        );

        Ok(PipelineResult {
            query: query.to_string(),
            answer: generation.answer,
            reformulations,
            retrieved_documents,
            reranked_documents,
            context: synthesis.context,
            timings,
            estimated_cost,
            verification: generation.verification,
            delta_state: DeltaStateSummary {
                topic_shift: synthesis.topic_shift,
                alpha: synthesis.alpha,
                beta: synthesis.beta,
            },
        })
    }
}

/// Token-count cost model: prompt side carries the query, reformulations,
/// retrieved contents and the context; completion side carries the
/// reformulations, context and answer.
fn estimate_cost(
    query: &str,
    reformulations: &[ReformulatedQuery],
    documents: &[Document],
    context: &str,
    answer: &str,
) -> f64 {
    let reformulation_chars: usize = reformulations.iter().map(|r| r.query.len()).sum();
    let document_chars: usize = documents.iter().map(|d| d.content.len()).sum();

    let input_chars = query.len() + reformulation_chars + document_chars + context.len();
    let output_chars = reformulation_chars + context.len() + answer.len();

    let input_tokens = input_chars as f64 / CHARS_PER_TOKEN;
    let output_tokens = output_chars as f64 / CHARS_PER_TOKEN;

    input_tokens / 1000.0 * COST_PER_1K_INPUT + output_tokens / 1000.0 * COST_PER_1K_OUTPUT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_cost_scales_with_volume() {
        let small = estimate_cost("q", &[], &[], "short context", "short answer");
        let docs = vec![Document::new("a", "long content ".repeat(100))];
        let large = estimate_cost("q", &[], &docs, "short context", "short answer");
        assert!(large > small);
        assert!(small > 0.0);
    }
}
