//! Completion API access.
//!
//! [`CompletionInvoker`] sends the whole bounded context to a
//! [`CompletionClient`] exactly once per inbound message and always comes back
//! with text: any failure becomes [`FALLBACK_REPLY`].

use crate::context::Turn;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reply used whenever the completion call fails.
pub const FALLBACK_REPLY: &str = "I'm sorry, I encountered an error while processing your request.";

/// Failure of a single completion request.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("response contained no choices")]
    EmptyChoices,
}

impl CompletionError {
    /// Short label for structured logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport(_) => "transport",
            Self::Auth(_) => "auth",
            Self::RateLimited(_) => "rate_limited",
            Self::Status { .. } => "status",
            Self::Malformed(_) => "malformed",
            Self::EmptyChoices => "empty_choices",
        }
    }
}

impl From<reqwest::Error> for CompletionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// A chat-completion backend.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn name(&self) -> &str;

    /// Generate the next assistant message for `turns`.
    async fn complete(&self, model: &str, turns: &[Turn]) -> Result<String, CompletionError>;
}

// ============================================================================
// OpenAI
// ============================================================================

/// OpenAI chat completions client.
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: &str, timeout: Duration) -> Self {
        Self::with_base_url(api_key, "https://api.openai.com", timeout)
    }

    /// Create with custom base URL (Azure OpenAI, compatible gateways, tests).
    pub fn with_base_url(api_key: &str, base_url: impl Into<String>, timeout: Duration) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .unwrap_or_else(|_| HeaderValue::from_static("")),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, model: &str, turns: &[Turn]) -> Result<String, CompletionError> {
        let start = Instant::now();
        let url = format!("{}/v1/chat/completions", self.base_url);
        let request = OpenAiRequest {
            model,
            messages: turns,
        };

        tracing::debug!(model, turns = turns.len(), "Calling completion API");

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CompletionError::Auth(body),
                StatusCode::TOO_MANY_REQUESTS => CompletionError::RateLimited(body),
                StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                    CompletionError::Timeout
                }
                _ => CompletionError::Status {
                    status: status.as_u16(),
                    body,
                },
            });
        }

        let parsed: OpenAiResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(CompletionError::EmptyChoices)?;
        let content = choice
            .message
            .content
            .ok_or_else(|| CompletionError::Malformed("first choice has no content".into()))?;

        tracing::debug!(
            model = parsed.model.as_deref().unwrap_or(model),
            finish_reason = ?choice.finish_reason,
            latency_ms = start.elapsed().as_millis() as u64,
            "Completion received"
        );

        Ok(content)
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

// ============================================================================
// Invoker
// ============================================================================

/// Fixed-model, single-attempt completion with a fallback reply.
pub struct CompletionInvoker {
    client: Arc<dyn CompletionClient>,
    model: String,
    timeout: Duration,
}

impl CompletionInvoker {
    pub fn new(client: Arc<dyn CompletionClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Set the overall deadline for one completion call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Call the backend once, bounded by the configured timeout.
    pub async fn try_reply(&self, turns: &[Turn]) -> Result<String, CompletionError> {
        tokio::time::timeout(self.timeout, self.client.complete(&self.model, turns))
            .await
            .unwrap_or(Err(CompletionError::Timeout))
    }

    /// Reply text for `turns`, or [`FALLBACK_REPLY`] if the call fails.
    pub async fn reply(&self, turns: &[Turn]) -> String {
        match self.try_reply(turns).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(
                    provider = self.client.name(),
                    model = %self.model,
                    kind = e.kind(),
                    error = %e,
                    "Error in completion API call"
                );
                FALLBACK_REPLY.to_string()
            }
        }
    }
}
