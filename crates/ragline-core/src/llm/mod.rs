//! Inference integration: generator/embedder traits and the HTTP client

mod cache;
mod client;
mod traits;

pub use cache::{embedding_cache_key, generation_cache_key, ResponseCache};
pub use client::{ApiMetrics, HttpGenerator, MetricsSnapshot};
pub use traits::{Embedder, GenerateOptions, Generation, Generator};
