//! Deterministic mock generator and embedder shared by the integration tests

use async_trait::async_trait;
use ragline_core::error::Result;
use std::sync::Once;
use ragline_core::llm::{Embedder, GenerateOptions, Generation, Generator};
use ragline_core::text::hashed_embedding;
use regex::Regex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const EMBEDDING_DIM: usize = 32;

static TRACING: Once = Once::new();

/// Install a test subscriber once, honoring RUST_LOG.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Routes pipeline prompts to canned, deterministic responses.
pub struct MockGenerator {
    reformulation_bank: Vec<String>,
    reformulation_calls: AtomicUsize,
    /// Override for listwise ranking prompts (used to force parse failures)
    pub ranking_response: Option<String>,
    ranking_count: Regex,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self {
            reformulation_bank: vec![
                "capital city of the French republic".to_string(),
                "Which city is the seat of the French government?".to_string(),
                "France main city administrative center".to_string(),
                "Where is the French seat of power located?".to_string(),
                "principal municipality governing France".to_string(),
                "What town hosts the national institutions?".to_string(),
            ],
            reformulation_calls: AtomicUsize::new(0),
            ranking_response: None,
            ranking_count: Regex::new(r"the (\d+) document numbers").unwrap(),
        }
    }

    pub fn with_ranking_response(response: impl Into<String>) -> Self {
        Self {
            ranking_response: Some(response.into()),
            ..Self::new()
        }
    }

    fn identity_ranking(&self, prompt: &str) -> String {
        let m = self
            .ranking_count
            .captures(prompt)
            .and_then(|c| c[1].parse::<usize>().ok())
            .unwrap_or(1);
        (1..=m)
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn synthesis_echo(prompt: &str) -> String {
        let start = prompt.find("Documents:\n").map(|i| i + "Documents:\n".len());
        let end = prompt.rfind("\nContext:");
        match (start, end) {
            (Some(s), Some(e)) if s < e => prompt[s..e].to_string(),
            _ => "no documents".to_string(),
        }
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(&self, prompt: &str, _options: &GenerateOptions) -> Result<Generation> {
        let text = if prompt.contains("Reply YES or NO") {
            "YES".to_string()
        } else if prompt.contains("Reply with exactly one letter") {
            "A".to_string()
        } else if prompt.contains("number between 0.0 and 1.0") {
            "0.9".to_string()
        } else if prompt.contains("Reply with a single number") {
            "7".to_string()
        } else if prompt.contains("document numbers as a comma-separated list") {
            match &self.ranking_response {
                Some(forced) => forced.clone(),
                None => self.identity_ranking(prompt),
            }
        } else if prompt.contains("Condense these documents") {
            Self::synthesis_echo(prompt)
        } else if prompt.contains("Answer:") {
            if prompt.contains("Paris") {
                "The capital of France is Paris.".to_string()
            } else {
                "The available documents do not answer this question.".to_string()
            }
        } else {
            // Reformulation prompts: walk the bank
            let idx = self.reformulation_calls.fetch_add(1, Ordering::SeqCst);
            self.reformulation_bank[idx % self.reformulation_bank.len()].clone()
        };

        Ok(Generation {
            text,
            logprob: Some(-0.05),
        })
    }

    fn model_name(&self) -> &str {
        "mock-generator"
    }
}

/// Stateless deterministic embedder: feature-hashed bag of words.
pub struct MockEmbedder;

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(hashed_embedding(text, EMBEDDING_DIM))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| hashed_embedding(t, EMBEDDING_DIM))
            .collect())
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }

    fn model_name(&self) -> &str {
        "mock-embedder"
    }
}
