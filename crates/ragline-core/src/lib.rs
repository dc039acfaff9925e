//! Ragline Core Library
//!
//! Adaptive retrieval-augmented generation pipeline.
//!
//! # Features
//! - Diverse quality-weighted sampling over a stochastic generator
//! - Multi-query hybrid retrieval with weighted Reciprocal Rank Fusion
//! - Listwise, pairwise and pointwise reranking with diverse hypotheses
//! - Delta-Rule recurrent memory carrying semantic state across queries
//! - Answer generation with faithfulness, consistency and completeness
//!   verification
//!
//! The [`Pipeline`] is the primary entry point; every stage behind it is
//! individually replaceable through its component type.

pub mod cancel;
pub mod config;
pub mod delta;
pub mod error;
pub mod fusion;
pub mod generate;
pub mod llm;
pub mod pipeline;
pub mod reformulate;
pub mod rerank;
pub mod retrieve;
pub mod sampling;
pub mod store;
pub mod synthesize;
pub mod text;
pub mod verify;

pub use cancel::CancellationToken;
pub use config::{
    GenerationConfig, GeneratorServiceConfig, PipelineConfig, ReformulationConfig,
    RerankingConfig, RetrievalConfig, SynthesisConfig,
};
pub use delta::{DeltaMemory, DeltaUpdate, Gate, GatingStrategy};
pub use error::{Error, RaglineError, Result};
pub use generate::{AnswerGenerator, GenerationResult, VerificationReport};
pub use llm::{
    Embedder, GenerateOptions, Generation, Generator, HttpGenerator, MetricsSnapshot,
};
pub use pipeline::{DeltaStateSummary, Pipeline, PipelineResult, StageTimings};
pub use reformulate::{
    QueryReformulator, ReformulatedQuery, ReformulationResult, ReformulationStrategy,
};
pub use rerank::{RerankMethod, RerankResult, Reranker};
pub use retrieve::{DocumentRetriever, RetrievalResult};
pub use sampling::{SamplingEngine, SamplingOptions, SamplingResult};
pub use store::{
    CollectionInfo, Document, InMemoryVectorStore, SearchOptions, VectorStore,
};
pub use synthesize::{ContextSynthesizer, SynthesisResult};
pub use verify::{HeuristicVerifier, Improvement, JudgeVerifier, Verification, VerifierAdapter};
