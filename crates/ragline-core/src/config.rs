//! Configuration management
//!
//! One typed `PipelineConfig` record with per-stage sub-records. Every field
//! carries an explicit serde default so partial YAML configs deserialize.

use crate::delta::GatingStrategy;
use crate::error::Result;
use crate::reformulate::ReformulationStrategy;
use crate::rerank::RerankMethod;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Chat model passed to the sampling engine
    #[serde(default = "default_chat_model")]
    pub model: String,

    /// Base sampling temperature passed to the generator
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default)]
    pub reformulation: ReformulationConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub reranking: RerankingConfig,

    #[serde(default)]
    pub synthesis: SynthesisConfig,

    #[serde(default)]
    pub generation: GenerationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: default_chat_model(),
            temperature: default_temperature(),
            reformulation: ReformulationConfig::default(),
            retrieval: RetrievalConfig::default(),
            reranking: RerankingConfig::default(),
            synthesis: SynthesisConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}

/// Stage 1: query reformulation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReformulationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum reformulations to keep (R)
    #[serde(default = "default_num_reformulations")]
    pub num_reformulations: usize,

    /// Strategies to run; each issues its own sampling pass
    #[serde(default = "default_strategies")]
    pub strategies: Vec<ReformulationStrategy>,

    /// Quality-sharpening exponent forwarded to the sampling engine
    #[serde(default = "default_beta_one")]
    pub beta: f64,

    /// Maximum Jaccard similarity a survivor may have to the original
    /// query or to any earlier survivor
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,

    /// Prepend the original query as a synthetic variation
    #[serde(default = "default_true")]
    pub include_original: bool,
}

impl Default for ReformulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            num_reformulations: default_num_reformulations(),
            strategies: default_strategies(),
            beta: default_beta_one(),
            dedup_threshold: default_dedup_threshold(),
            include_original: true,
        }
    }
}

/// Stage 2: retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Documents to return
    #[serde(default = "default_retrieval_k")]
    pub k: usize,

    /// Run reformulation inside the retriever when the pipeline has not
    /// already produced reformulations
    #[serde(default)]
    pub use_reformulation: bool,

    #[serde(default = "default_num_reformulations")]
    pub num_reformulations: usize,

    #[serde(default = "default_strategies")]
    pub reformulation_strategies: Vec<ReformulationStrategy>,

    /// Weight of the semantic arm in hybrid search, in [0, 1]
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,

    /// Fan out per-query searches concurrently
    #[serde(default = "default_true")]
    pub parallel: bool,

    /// Metadata equality filters forwarded to the vector store
    #[serde(default)]
    pub filters: HashMap<String, serde_json::Value>,

    /// Drop documents scoring below this after fusion
    #[serde(default)]
    pub min_similarity: f64,

    /// Drop documents whose Jaccard similarity to an already-kept document
    /// exceeds `1 - max_diversity`
    #[serde(default = "default_max_diversity")]
    pub max_diversity: f64,

    /// RRF constant
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_retrieval_k(),
            use_reformulation: false,
            num_reformulations: default_num_reformulations(),
            reformulation_strategies: default_strategies(),
            hybrid_alpha: default_hybrid_alpha(),
            parallel: true,
            filters: HashMap::new(),
            min_similarity: 0.0,
            max_diversity: default_max_diversity(),
            rrf_k: default_rrf_k(),
        }
    }
}

/// Stage 3: reranking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub method: RerankMethod,

    /// Candidate rankings to draw when sampling (H)
    #[serde(default = "default_num_hypotheses")]
    pub num_hypotheses: usize,

    #[serde(default = "default_beta_one")]
    pub beta: f64,

    /// Only the first `max_documents` are reranked; the tail keeps its order
    #[serde(default = "default_max_rerank_documents")]
    pub max_documents: usize,

    /// δ weight of rank-distance diversity against quality
    #[serde(default = "default_diversity_weight")]
    pub diversity_weight: f64,

    /// Blend a verifier score into ranking selection
    #[serde(default)]
    pub trm_enabled: bool,

    /// w weight of the verifier score when blending
    #[serde(default = "default_trm_weight")]
    pub trm_weight: f64,

    /// Draw multiple candidate rankings instead of a single listwise call
    #[serde(default = "default_true")]
    pub use_inference_sampling: bool,
}

impl Default for RerankingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: RerankMethod::default(),
            num_hypotheses: default_num_hypotheses(),
            beta: default_beta_one(),
            max_documents: default_max_rerank_documents(),
            diversity_weight: default_diversity_weight(),
            trm_enabled: false,
            trm_weight: default_trm_weight(),
            use_inference_sampling: true,
        }
    }
}

/// Stage 4: context synthesis and delta memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Soft character budget for the synthesized context
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,

    #[serde(default = "default_true")]
    pub use_delta_rule: bool,

    #[serde(default)]
    pub gating_strategy: GatingStrategy,

    /// Topic-shift score above which the gate opens toward forgetting
    #[serde(default = "default_topic_shift_threshold")]
    pub topic_shift_threshold: f64,

    /// Delta-rule write strength β
    #[serde(default = "default_delta_beta")]
    pub beta: f64,

    #[serde(default)]
    pub use_inference_sampling: bool,

    #[serde(default = "default_num_candidates")]
    pub num_candidates: usize,

    /// Dimension of the memory state vector
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_context_length: default_max_context_length(),
            use_delta_rule: true,
            gating_strategy: GatingStrategy::default(),
            topic_shift_threshold: default_topic_shift_threshold(),
            beta: default_delta_beta(),
            use_inference_sampling: false,
            num_candidates: default_num_candidates(),
            embedding_dim: default_embedding_dim(),
        }
    }
}

/// Stage 5: answer generation and verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Soft character budget for the answer
    #[serde(default = "default_max_answer_length")]
    pub max_answer_length: usize,

    #[serde(default = "default_true")]
    pub use_inference_sampling: bool,

    #[serde(default = "default_num_candidates")]
    pub num_candidates: usize,

    #[serde(default = "default_beta_one")]
    pub beta: f64,

    /// Judge whether the answer is entailed by the context
    #[serde(default = "default_true")]
    pub verify_faithfulness: bool,

    /// Measure agreement across sampled candidates
    #[serde(default = "default_true")]
    pub use_self_consistency: bool,

    /// Keep drawing candidates until this confidence is reached
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Attempt cap for the adaptive loop
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Gate the answer through the verifier adapter
    #[serde(default)]
    pub use_trm_verification: bool,

    /// Verifier score below which the answer is sent to `improve`
    #[serde(default = "default_trm_min_score")]
    pub trm_min_score: f64,

    /// Improvement rounds the verifier may take
    #[serde(default = "default_trm_max_steps")]
    pub trm_max_steps: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_answer_length: default_max_answer_length(),
            use_inference_sampling: true,
            num_candidates: default_num_candidates(),
            beta: default_beta_one(),
            verify_faithfulness: true,
            use_self_consistency: true,
            confidence_threshold: default_confidence_threshold(),
            max_attempts: default_max_attempts(),
            use_trm_verification: false,
            trm_min_score: default_trm_min_score(),
            trm_max_steps: default_trm_max_steps(),
        }
    }
}

/// Connection settings for an OpenAI-compatible inference service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorServiceConfig {
    /// Base URL of the service for chat completions
    pub url: String,

    /// Model name for chat completions
    #[serde(default = "default_chat_model")]
    pub model: String,

    /// Base URL for embeddings (falls back to `url`)
    #[serde(default)]
    pub embedding_url: Option<String>,

    /// Model name for embeddings
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Embedding dimensions
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,

    /// API key (optional, for authenticated services)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl GeneratorServiceConfig {
    /// Get the embeddings URL (falls back to main URL if not specified)
    pub fn embeddings_url(&self) -> &str {
        self.embedding_url.as_deref().unwrap_or(&self.url)
    }

    /// Environment-derived config with the chat model overridden, typically
    /// from `PipelineConfig::model`.
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }
}

impl Default for GeneratorServiceConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("RAGLINE_LLM_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            model: default_chat_model(),
            embedding_url: std::env::var("RAGLINE_EMBEDDING_URL").ok(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: std::env::var("RAGLINE_EMBEDDING_DIMS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_embedding_dimensions),
            api_key: std::env::var("RAGLINE_LLM_API_KEY").ok(),
            timeout_secs: default_timeout(),
        }
    }
}

fn default_chat_model() -> String {
    std::env::var("RAGLINE_LLM_MODEL")
        .unwrap_or_else(|_| "meta-llama/Llama-3.1-8B-Instruct".to_string())
}

fn default_embedding_model() -> String {
    std::env::var("RAGLINE_EMBEDDING_MODEL")
        .unwrap_or_else(|_| "sentence-transformers/all-MiniLM-L6-v2".to_string())
}

fn default_embedding_dimensions() -> usize {
    384
}

fn default_timeout() -> u64 {
    30
}

fn default_temperature() -> f32 {
    0.7
}

fn default_true() -> bool {
    true
}

fn default_num_reformulations() -> usize {
    3
}

fn default_strategies() -> Vec<ReformulationStrategy> {
    vec![
        ReformulationStrategy::Expansion,
        ReformulationStrategy::Clarification,
        ReformulationStrategy::Decomposition,
    ]
}

fn default_beta_one() -> f64 {
    1.0
}

fn default_dedup_threshold() -> f64 {
    0.8
}

fn default_retrieval_k() -> usize {
    10
}

fn default_hybrid_alpha() -> f64 {
    0.7
}

fn default_max_diversity() -> f64 {
    0.1
}

fn default_rrf_k() -> f64 {
    60.0
}

fn default_num_hypotheses() -> usize {
    4
}

fn default_max_rerank_documents() -> usize {
    10
}

fn default_diversity_weight() -> f64 {
    0.3
}

fn default_trm_weight() -> f64 {
    0.5
}

fn default_max_context_length() -> usize {
    2000
}

fn default_topic_shift_threshold() -> f64 {
    0.5
}

fn default_delta_beta() -> f64 {
    0.8
}

fn default_num_candidates() -> usize {
    3
}

fn default_embedding_dim() -> usize {
    64
}

fn default_max_answer_length() -> usize {
    1024
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_max_attempts() -> usize {
    2
}

fn default_trm_min_score() -> f64 {
    0.6
}

fn default_trm_max_steps() -> usize {
    3
}
