use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::types::{ChatRequest, ChatResponse, Generation, Message};
use super::CodeGenerator;
use crate::config::{LlmConfig, RequestConfig};
use crate::error::{LlmError, LlmResult};
use crate::resilience::{retry_with_backoff, RetryPolicy};

/// Client for an OpenAI-compatible chat-completions API
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: Option<f32>,
    request_config: RequestConfig,
}

impl LlmClient {
    /// Create a new client using the configured code model
    pub fn new(config: &LlmConfig, request_config: RequestConfig) -> LlmResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(LlmError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.code_model.clone(),
            temperature: Some(0.0),
            request_config,
        })
    }

    /// Same connection, different model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Override the sampling temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Model used for requests
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a chat request with retry and backoff
    pub async fn chat(&self, request: ChatRequest) -> LlmResult<ChatResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let policy = RetryPolicy::from(&self.request_config);
        let start = Instant::now();

        let result = retry_with_backoff(policy, "llm_chat", || self.execute_request(&url, &request)).await;

        match result {
            Ok(response) => {
                info!(
                    model = %request.model,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "LLM call succeeded"
                );
                Ok(response)
            }
            Err(exhausted) => {
                error!(
                    model = %request.model,
                    error = %exhausted.last_error,
                    attempts = exhausted.attempts,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "LLM call failed"
                );
                if exhausted.attempts > 1 {
                    Err(LlmError::Unavailable {
                        message: exhausted.last_error.to_string(),
                        retries: exhausted.attempts - 1,
                    })
                } else {
                    Err(exhausted.last_error)
                }
            }
        }
    }

    /// Execute a single request (internal)
    async fn execute_request(&self, url: &str, request: &ChatRequest) -> LlmResult<ChatResponse> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Calling chat completions"
        );

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else {
                    LlmError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| LlmError::InvalidResponse {
                message: format!("Failed to parse response: {}", e),
            })
    }
}

#[async_trait]
impl CodeGenerator for LlmClient {
    async fn generate(&self, instruction: &str, context: &str) -> LlmResult<Generation> {
        let mut request = ChatRequest::new(
            self.model.clone(),
            vec![Message::system(instruction), Message::user(context)],
        );
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }

        let response = self.chat(request).await?;
        let content = response
            .first_content()
            .map(str::to_string)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LlmError::InvalidResponse {
                message: "Response contained no completion".to_string(),
            })?;

        let mut generation = Generation::new(content);
        if let Some(usage) = response.usage {
            generation = generation.with_usage(usage);
        }
        Ok(generation)
    }
}
