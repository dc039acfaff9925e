//! Error types for ragline

use thiserror::Error;

/// Result type alias using RaglineError
pub type Result<T> = std::result::Result<T, RaglineError>;

/// Error type alias for convenience
pub type Error = RaglineError;

/// Main error type for ragline
#[derive(Debug, Error)]
pub enum RaglineError {
    #[error("Generator error: {0}")]
    Generator(String),

    #[error("Embedder error: {0}")]
    Embedder(String),

    #[error("Vector backend error: {0}")]
    Backend(String),

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid ranking: {0}")]
    InvalidRanking(String),

    #[error("Retrieval returned no documents")]
    EmptyResult,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl RaglineError {
    /// Whether the stage that produced this error may recover locally
    /// instead of failing the pipeline.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidRanking(_) | Self::EmptyResult)
    }
}
