//! Chat completion provider abstraction
//!
//! The generation pipeline talks to a [`CompletionModel`] through a
//! [`CompletionClient`], which applies the same exponential backoff policy as
//! the embedding client.

use crate::config::CompletionConfig;
use crate::embeddings::RetryPolicy;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One chat message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Parameters for a single completion
#[derive(Debug, Clone, Copy)]
pub struct CompletionParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Trait for chat completion providers
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], params: CompletionParams) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// OpenAI-compatible chat completions client
pub struct OpenAIChatModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

impl OpenAIChatModel {
    pub fn new(
        api_key: String,
        model: String,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let base = base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key,
            model,
        })
    }
}

#[async_trait]
impl CompletionModel for OpenAIChatModel {
    async fn complete(&self, messages: &[ChatMessage], params: CompletionParams) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
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

        let result: ChatResponse = response.json().await.map_err(|e| {
            AppError::provider("openai", format!("Failed to parse response: {}", e))
        })?;

        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::provider("openai", "Completion had no content"))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Completion model replaying scripted responses in order.
///
/// Used by tests and dry runs; each call pops the next response, and an
/// exhausted script is a provider error.
#[derive(Default)]
pub struct ScriptedCompletionModel {
    responses: Mutex<VecDeque<Result<String>>>,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedCompletionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, response: impl Into<String>) -> Self {
        self.lock_responses().push_back(Ok(response.into()));
        self
    }

    pub fn fail(self, message: impl Into<String>) -> Self {
        self.lock_responses()
            .push_back(Err(AppError::provider("scripted", message)));
        self
    }

    /// Messages received so far, one entry per call
    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        match self.prompts.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String>>> {
        match self.responses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl CompletionModel for ScriptedCompletionModel {
    async fn complete(&self, messages: &[ChatMessage], _params: CompletionParams) -> Result<String> {
        match self.prompts.lock() {
            Ok(mut guard) => guard.push(messages.to_vec()),
            Err(poisoned) => poisoned.into_inner().push(messages.to_vec()),
        }
        self.lock_responses()
            .pop_front()
            .unwrap_or_else(|| Err(AppError::provider("scripted", "No scripted response left")))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Create a completion model based on configuration
pub fn create_completion_model(config: &CompletionConfig) -> Result<Arc<dyn CompletionModel>> {
    match config.provider.as_str() {
        "openai" => {
            let key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
                message: "completion.api_key is required for the openai provider".to_string(),
            })?;
            Ok(Arc::new(OpenAIChatModel::new(
                key,
                config.model.clone(),
                config.api_base.clone(),
                config.timeout(),
            )?))
        }
        other => Err(AppError::Configuration {
            message: format!("Unknown completion provider: {}", other),
        }),
    }
}

/// Completion client with retry
#[derive(Clone)]
pub struct CompletionClient {
    model: Arc<dyn CompletionModel>,
    retry: RetryPolicy,
}

impl CompletionClient {
    pub fn new(model: Arc<dyn CompletionModel>) -> Self {
        Self {
            model,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(model: Arc<dyn CompletionModel>, config: &CompletionConfig) -> Self {
        Self::new(model).with_retry(RetryPolicy {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Complete with exponential backoff between attempts
    pub async fn complete_with_retry(
        &self,
        messages: &[ChatMessage],
        params: CompletionParams,
    ) -> Result<String> {
        let mut last_error = None;

        for attempt in 0..=self.retry.max_retries {
            let start = Instant::now();
            let result = self.model.complete(messages, params).await;
            crate::metrics::record_completion(
                start.elapsed().as_secs_f64(),
                self.model.model_name(),
                result.is_ok(),
            );

            match result {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.retry.max_retries,
                        error = %e,
                        "Completion request failed"
                    );
                    last_error = Some(e);
                    if attempt < self.retry.max_retries {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            AppError::provider(self.model.model_name(), "Unknown error after retries")
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: CompletionParams = CompletionParams {
        temperature: 0.1,
        max_tokens: 100,
    };

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let model = Arc::new(ScriptedCompletionModel::new().fail("boom").respond("[]"));
        let client = CompletionClient::new(model.clone()).with_retry(fast_retry());
        let text = client
            .complete_with_retry(&[ChatMessage::user("hi")], PARAMS)
            .await
            .unwrap();
        assert_eq!(text, "[]");
        assert_eq!(model.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_provider_error() {
        let model = Arc::new(ScriptedCompletionModel::new().fail("a").fail("b").fail("c"));
        let client = CompletionClient::new(model).with_retry(fast_retry());
        let err = client
            .complete_with_retry(&[ChatMessage::user("hi")], PARAMS)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Provider { .. }));
    }

    #[test]
    fn test_message_constructors() {
        assert_eq!(ChatMessage::system("x").role, "system");
        assert_eq!(ChatMessage::user("y").role, "user");
    }
}
