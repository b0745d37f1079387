//! Embedding service abstraction
//!
//! Provides a unified interface for embedding providers:
//! - OpenAI (text-embedding-3-small, text-embedding-3-large)
//! - A deterministic mock for tests and offline runs
//!
//! [`EmbeddingClient`] layers the retry, fallback and batching policy on top
//! of any [`Embedder`].

use crate::config::EmbeddingConfig;
use crate::errors::{AppError, Result};
use crate::tokens::Tokenizer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Trait for embedding generation
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts in one provider call
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;
}

/// OpenAI embedding client
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimension: usize,
    base_url: String,
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

impl OpenAIEmbedder {
    /// Create a new OpenAI embedder
    pub fn new(
        api_key: String,
        model: String,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let dimension = match model.as_str() {
            "text-embedding-ada-002" => 1536,
            "text-embedding-3-small" => 1536,
            "text-embedding-3-large" => 3072,
            _ => crate::DEFAULT_EMBEDDING_DIMENSION,
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key,
            model,
            dimension,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        })
    }

    async fn make_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);

        let request = OpenAIRequest {
            input: texts,
            model: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::provider("openai", format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::provider(
                "openai",
                format!("API error {}: {}", status, body),
            ));
        }

        let mut result: OpenAIResponse = response.json().await.map_err(|e| {
            AppError::provider("openai", format!("Failed to parse response: {}", e))
        })?;

        if result.data.len() != texts.len() {
            return Err(AppError::provider(
                "openai",
                format!(
                    "Expected {} embeddings, received {}",
                    texts.len(),
                    result.data.len()
                ),
            ));
        }

        result.data.sort_by_key(|e| e.index);
        Ok(result.data.into_iter().map(|e| e.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.make_request(&[text.to_string()]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| AppError::provider("openai", "Empty response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.make_request(texts).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Mock embedder for testing.
///
/// Vectors are seeded from the sha256 of the text, so equal texts embed
/// equally and tests can assert on similarity.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        use sha2::{Digest, Sha256};

        let seed: [u8; 32] = Sha256::digest(text.as_bytes()).into();
        let mut rng = StdRng::from_seed(seed);
        (0..self.dimension).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => {
            let key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
                message: "embedding.api_key is required for the openai provider".to_string(),
            })?;
            Ok(Arc::new(OpenAIEmbedder::new(
                key,
                config.model.clone(),
                config.api_base.clone(),
                config.timeout(),
            )?))
        }
        "mock" => Ok(Arc::new(MockEmbedder::new(config.dimension))),
        other => {
            tracing::warn!(provider = other, "Unknown embedding provider, using mock");
            Ok(Arc::new(MockEmbedder::new(config.dimension)))
        }
    }
}

/// Retry and batching policy around an [`Embedder`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before retry n is `base_delay * 2^n`
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Embedding client used by the pipeline
#[derive(Clone)]
pub struct EmbeddingClient {
    embedder: Arc<dyn Embedder>,
    tokenizer: Arc<dyn Tokenizer>,
    retry: RetryPolicy,
    batch_size: usize,
    batch_delay: Duration,
}

impl EmbeddingClient {
    pub fn new(embedder: Arc<dyn Embedder>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            embedder,
            tokenizer,
            retry: RetryPolicy::default(),
            batch_size: 100,
            batch_delay: Duration::from_millis(100),
        }
    }

    pub fn from_config(
        embedder: Arc<dyn Embedder>,
        tokenizer: Arc<dyn Tokenizer>,
        config: &EmbeddingConfig,
    ) -> Self {
        Self::new(embedder, tokenizer)
            .with_retry(RetryPolicy {
                max_retries: config.max_retries,
                base_delay: config.retry_base_delay(),
            })
            .with_batching(config.batch_size, config.batch_delay())
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batching(mut self, batch_size: usize, batch_delay: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.batch_delay = batch_delay;
        self
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    /// Count tokens with the provider's encoder
    pub fn count_tokens(&self, text: &str) -> usize {
        self.tokenizer.count(text)
    }

    /// Embed a single text. Blank text has no embedding.
    pub async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let start = Instant::now();
        let result = self.embedder.embed(text).await;
        crate::metrics::record_embedding(
            start.elapsed().as_secs_f64(),
            self.embedder.model_name(),
            1,
            result.is_ok(),
        );
        result.map(Some)
    }

    /// Embed with exponential backoff, surfacing the last error on exhaustion
    pub async fn embed_with_retry(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let mut last_error = None;

        for attempt in 0..=self.retry.max_retries {
            match self.embed(text).await {
                Ok(embedding) => return Ok(embedding),
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.retry.max_retries,
                        error = %e,
                        "Embedding request failed"
                    );
                    last_error = Some(e);
                    if attempt < self.retry.max_retries {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::provider(
            self.embedder.model_name(),
            "Unknown error after retries",
        )))
    }

    /// Embed with retry, substituting the all-zero vector when retries are exhausted
    pub async fn embed_or_zero(&self, text: &str) -> Vec<f32> {
        match self.embed_with_retry(text).await {
            Ok(Some(embedding)) => embedding,
            Ok(None) => self.zero_vector(),
            Err(e) => {
                tracing::error!(error = %e, "Embedding retries exhausted, using zero vector");
                self.zero_vector()
            }
        }
    }

    /// Deterministic fallback vector of the provider dimension
    pub fn zero_vector(&self) -> Vec<f32> {
        vec![0.0; self.embedder.dimension()]
    }

    /// Embed texts in fixed-size batches.
    ///
    /// A failed batch yields `None` for each of its texts and later batches
    /// still run.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        let batch_count = texts.len().div_ceil(self.batch_size);

        for (batch_index, batch) in texts.chunks(self.batch_size).enumerate() {
            let start = Instant::now();
            match self.embedder.embed_batch(batch).await {
                Ok(embeddings) if embeddings.len() == batch.len() => {
                    crate::metrics::record_embedding(
                        start.elapsed().as_secs_f64(),
                        self.embedder.model_name(),
                        batch.len(),
                        true,
                    );
                    results.extend(embeddings.into_iter().map(Some));
                }
                Ok(embeddings) => {
                    tracing::error!(
                        batch = batch_index,
                        expected = batch.len(),
                        received = embeddings.len(),
                        "Embedding batch size mismatch"
                    );
                    results.extend(std::iter::repeat_with(|| None).take(batch.len()));
                }
                Err(e) => {
                    crate::metrics::record_embedding(
                        start.elapsed().as_secs_f64(),
                        self.embedder.model_name(),
                        batch.len(),
                        false,
                    );
                    tracing::error!(batch = batch_index, error = %e, "Embedding batch failed");
                    results.extend(std::iter::repeat_with(|| None).take(batch.len()));
                }
            }

            if batch_index + 1 < batch_count {
                tokio::time::sleep(self.batch_delay).await;
            }
        }

        results
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embedder failing the first `failures` calls
    pub struct FlakyEmbedder {
        pub calls: AtomicUsize,
        pub failures: usize,
        pub inner: MockEmbedder,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(AppError::provider("flaky", "transient"));
            }
            self.inner.embed(text).await
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(AppError::provider("flaky", "transient"));
            }
            self.inner.embed_batch(texts).await
        }

        fn model_name(&self) -> &str {
            "flaky"
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FlakyEmbedder;
    use super::*;
    use crate::tokens::WordTokenizer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client(embedder: Arc<dyn Embedder>) -> EmbeddingClient {
        EmbeddingClient::new(embedder, Arc::new(WordTokenizer::new()))
            .with_retry(RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
            })
            .with_batching(2, Duration::from_millis(1))
    }

    fn flaky(failures: usize) -> Arc<FlakyEmbedder> {
        Arc::new(FlakyEmbedder {
            calls: AtomicUsize::new(0),
            failures,
            inner: MockEmbedder::new(8),
        })
    }

    #[tokio::test]
    async fn test_mock_embedder_is_deterministic() {
        let embedder = MockEmbedder::new(16);
        let a = embedder.embed("same text").await.unwrap();
        let b = embedder.embed("same text").await.unwrap();
        let c = embedder.embed("other text").await.unwrap();
        assert_eq!(a.len(), 16);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_blank_text_has_no_embedding() {
        let client = client(Arc::new(MockEmbedder::new(8)));
        assert!(client.embed("   \n").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let embedder = flaky(2);
        let client = client(embedder.clone());
        let embedding = client.embed_with_retry("hello").await.unwrap().unwrap();
        assert_eq!(embedding.len(), 8);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_vector_after_exhausted_retries() {
        let embedder = flaky(usize::MAX);
        let client = client(embedder.clone());
        let embedding = client.embed_or_zero("hello").await;
        assert_eq!(embedding, vec![0.0; 8]);
        // first attempt plus three retries
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failed_batch_yields_none_without_aborting() {
        // The first of three batches fails
        let client = client(flaky(1));
        let texts: Vec<String> = (0..5).map(|i| format!("text {i}")).collect();
        let results = client.embed_batch(&texts).await;
        assert_eq!(results.len(), 5);
        assert!(results[0].is_none());
        assert!(results[1].is_none());
        assert!(results[2..].iter().all(Option::is_some));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn test_create_embedder_requires_key_for_openai() {
        let config = EmbeddingConfig::default();
        assert!(create_embedder(&config).is_err());

        let config = EmbeddingConfig {
            provider: "mock".into(),
            ..Default::default()
        };
        assert_eq!(create_embedder(&config).unwrap().dimension(), 1536);
    }
}
