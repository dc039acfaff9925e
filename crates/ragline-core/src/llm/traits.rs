//! Generator and embedder trait definitions

use crate::error::Result;
use async_trait::async_trait;

/// Options for a single generation call
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Sampling temperature
    pub temperature: f32,
    /// Completion token cap
    pub max_tokens: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 512,
        }
    }
}

/// One generator completion
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    /// Length-normalized log probability, when the service reports logprobs
    pub logprob: Option<f64>,
}

/// Text generation trait
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a single completion for a prompt
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<Generation>;

    /// Get model name
    fn model_name(&self) -> &str;
}

/// Embedding generation trait
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for batch of texts
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get embedding dimensions
    fn dimensions(&self) -> usize;

    /// Get model name
    fn model_name(&self) -> &str;
}
