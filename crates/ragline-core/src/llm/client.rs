//! HTTP client for external inference services (vLLM, OpenAI, etc.)

use crate::config::GeneratorServiceConfig;
use crate::error::{RaglineError, Result};
use crate::llm::traits::{Embedder, GenerateOptions, Generation, Generator};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{atomic::AtomicU64, Arc};
use std::time::{Duration, Instant};

/// API metrics for monitoring
#[derive(Debug, Default)]
pub struct ApiMetrics {
    pub total_requests: AtomicU64,
    pub total_errors: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub total_latency_ms: AtomicU64,
}

/// Snapshot of API metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub avg_latency_ms: f64,
}

/// OpenAI-compatible client implementing both [`Generator`] and [`Embedder`]
pub struct HttpGenerator {
    http_client: reqwest::Client,
    config: GeneratorServiceConfig,
    cache: Arc<super::cache::ResponseCache>,
    metrics: Arc<ApiMetrics>,
}

impl HttpGenerator {
    /// Create new client from configuration
    pub fn new(config: GeneratorServiceConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(RaglineError::Http)?;

        Ok(Self {
            http_client,
            config,
            cache: Arc::new(super::cache::ResponseCache::new()),
            metrics: Arc::new(ApiMetrics::default()),
        })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(GeneratorServiceConfig::default())
    }

    /// Get current API metrics
    pub fn metrics(&self) -> MetricsSnapshot {
        use std::sync::atomic::Ordering;

        let total = self.metrics.total_requests.load(Ordering::Relaxed);
        let hits = self.metrics.cache_hits.load(Ordering::Relaxed);

        MetricsSnapshot {
            total_requests: total,
            total_errors: self.metrics.total_errors.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: self.metrics.cache_misses.load(Ordering::Relaxed),
            cache_hit_rate: if total > 0 {
                hits as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            avg_latency_ms: if total > 0 {
                self.metrics.total_latency_ms.load(Ordering::Relaxed) as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref api_key) = self.config.api_key {
            req.header("Authorization", format!("Bearer {}", api_key))
        } else {
            req
        }
    }

    fn record_error(&self) {
        use std::sync::atomic::Ordering;
        self.metrics.total_errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<Generation> {
        use std::sync::atomic::Ordering;

        let start = Instant::now();
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

        // Stochastic calls must stay stochastic for the sampling engine, so
        // only greedy completions hit the cache.
        let greedy = options.temperature <= 0.0;
        let cache_key = super::cache::generation_cache_key(&self.config.model, prompt);

        if greedy {
            if let Some(cached) = self.cache.get(&cache_key) {
                tracing::debug!("Cache hit for greedy completion");
                self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Generation {
                    text: cached,
                    logprob: None,
                });
            }
            self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        #[derive(Serialize)]
        struct ChatMessage<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(Serialize)]
        struct ChatRequest<'a> {
            model: &'a str,
            messages: Vec<ChatMessage<'a>>,
            temperature: f32,
            max_tokens: u32,
            logprobs: bool,
        }

        #[derive(Deserialize)]
        struct TokenLogprob {
            logprob: f64,
        }

        #[derive(Deserialize)]
        struct ChoiceLogprobs {
            #[serde(default)]
            content: Vec<TokenLogprob>,
        }

        #[derive(Deserialize)]
        struct ResponseMessage {
            content: String,
        }

        #[derive(Deserialize)]
        struct ChatChoice {
            message: ResponseMessage,
            logprobs: Option<ChoiceLogprobs>,
        }

        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<ChatChoice>,
        }

        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            logprobs: true,
        };

        let url = format!("{}/v1/chat/completions", self.config.url);
        let req = self.authorize(self.http_client.post(&url).json(&request));

        let response = req.send().await.map_err(|e| {
            self.record_error();
            RaglineError::Http(e)
        })?;

        if !response.status().is_success() {
            self.record_error();
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RaglineError::Generator(format!(
                "inference service error (HTTP {}): {}",
                status, body
            )));
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| {
            self.record_error();
            RaglineError::Http(e)
        })?;

        let choice = chat_response.choices.into_iter().next().ok_or_else(|| {
            self.record_error();
            RaglineError::Generator("no completion returned".to_string())
        })?;

        // Length-normalized mean token logprob when the service reports them
        let logprob = choice.logprobs.and_then(|lp| {
            if lp.content.is_empty() {
                None
            } else {
                Some(lp.content.iter().map(|t| t.logprob).sum::<f64>() / lp.content.len() as f64)
            }
        });

        if greedy {
            self.cache.set(cache_key, choice.message.content.clone());
        }

        let elapsed = start.elapsed().as_millis() as u64;
        self.metrics
            .total_latency_ms
            .fetch_add(elapsed, Ordering::Relaxed);

        Ok(Generation {
            text: choice.message.content,
            logprob,
        })
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl Embedder for HttpGenerator {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.embed_batch(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| RaglineError::Embedder("no embedding returned".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        use std::sync::atomic::Ordering;

        let start = Instant::now();
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

        let mut results: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut uncached_texts = Vec::new();
        let mut uncached_indices = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let cache_key =
                super::cache::embedding_cache_key(&self.config.embedding_model, text);
            if let Some(cached) = self.cache.get(&cache_key) {
                if let Ok(embedding) = serde_json::from_str::<Vec<f32>>(&cached) {
                    results.push(Some(embedding));
                    self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }
            self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
            results.push(None);
            uncached_texts.push(text.clone());
            uncached_indices.push(i);
        }

        if uncached_texts.is_empty() {
            tracing::debug!("All {} embeddings from cache", texts.len());
            return Ok(results.into_iter().flatten().collect());
        }

        #[derive(Serialize)]
        struct EmbedRequest<'a> {
            model: &'a str,
            input: &'a [String],
        }

        #[derive(Deserialize)]
        struct EmbedData {
            embedding: Vec<f32>,
        }

        #[derive(Deserialize)]
        struct EmbedResponse {
            data: Vec<EmbedData>,
        }

        let request = EmbedRequest {
            model: &self.config.embedding_model,
            input: &uncached_texts,
        };

        let url = format!("{}/v1/embeddings", self.config.embeddings_url());
        let req = self.authorize(self.http_client.post(&url).json(&request));

        let response = req.send().await.map_err(|e| {
            self.record_error();
            RaglineError::Http(e)
        })?;

        if !response.status().is_success() {
            self.record_error();
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RaglineError::Embedder(format!(
                "embedding service error (HTTP {}): {}",
                status, body
            )));
        }

        let embed_response: EmbedResponse = response.json().await.map_err(|e| {
            self.record_error();
            RaglineError::Http(e)
        })?;

        if embed_response.data.len() != uncached_texts.len() {
            self.record_error();
            return Err(RaglineError::Embedder(format!(
                "expected {} embeddings, got {}",
                uncached_texts.len(),
                embed_response.data.len()
            )));
        }

        for (i, data) in embed_response.data.into_iter().enumerate() {
            let original_idx = uncached_indices[i];
            let cache_key =
                super::cache::embedding_cache_key(&self.config.embedding_model, &uncached_texts[i]);
            if let Ok(json) = serde_json::to_string(&data.embedding) {
                self.cache.set(cache_key, json);
            }
            results[original_idx] = Some(data.embedding);
        }

        let elapsed = start.elapsed().as_millis() as u64;
        self.metrics
            .total_latency_ms
            .fetch_add(elapsed, Ordering::Relaxed);

        Ok(results.into_iter().flatten().collect())
    }

    fn dimensions(&self) -> usize {
        self.config.embedding_dimensions
    }

    fn model_name(&self) -> &str {
        &self.config.embedding_model
    }
}
