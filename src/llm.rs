//! Analysis-service provider abstraction and implementations.
//!
//! Defines the [`CompletionProvider`] trait and:
//! - **[`OpenAiCompatProvider`]**: calls an OpenAI-compatible
//!   `POST /chat/completions` endpoint (OpenAI, OpenRouter, Ollama).
//! - **[`RateLimitedProvider`]**: wraps any provider with a token bucket.
//!
//! Providers never retry. They classify every failure into an
//! [`ErrorKind`] and leave the retry policy to the analyzer.
//!
//! # Error classification
//!
//! | Condition | Kind |
//! |-----------|------|
//! | network error or timeout | `Transient` |
//! | HTTP 429 / 5xx / 529 | `Transient` |
//! | HTTP 429 or 403 mentioning quota exhaustion | `QuotaExhausted` |
//! | other HTTP 4xx, unparseable body | `Fatal` |

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::LlmConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub json_mode: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: String,
}

impl CompletionResponse {
    /// True when the service stopped because it hit the token budget.
    pub fn is_truncated(&self) -> bool {
        matches!(
            self.finish_reason.as_str(),
            "length" | "max_tokens" | "MAX_TOKENS"
        )
    }
}

/// How the caller should react to a failed completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rate limited or overloaded; worth retrying after a pause.
    Transient,
    /// The account is out of quota; further calls this run are wasted.
    QuotaExhausted,
    /// Authentication, malformed request, or anything else not worth retrying.
    Fatal,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited or overloaded: {0}")]
    Transient(String),
    #[error("API quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error("{0}")]
    Fatal(String),
    #[error("request cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Transient(_) => ErrorKind::Transient,
            ProviderError::QuotaExhausted(_) => ErrorKind::QuotaExhausted,
            ProviderError::Fatal(_) | ProviderError::Cancelled => ErrorKind::Fatal,
        }
    }
}

/// A chat-completion backend.
///
/// `cancel` is observed while waiting (rate limiting); a request already
/// on the wire is allowed to finish.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Short identifier used in logs (e.g. `"openai"`).
    fn name(&self) -> &str;

    async fn complete(
        &self,
        cancel: &CancellationToken,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;
}

// ============ Rate limiting ============

struct Bucket {
    tokens: u32,
    last_fill: Instant,
}

/// Token-bucket limiter allowing `rpm` requests per minute.
///
/// Each limiter owns its bucket; there is no process-wide state.
pub struct RateLimiter {
    rpm: u32,
    poll_interval: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rpm: u32) -> Self {
        let rpm = rpm.max(1);
        Self {
            rpm,
            poll_interval: Duration::from_millis(100),
            bucket: Mutex::new(Bucket {
                tokens: rpm,
                last_fill: Instant::now(),
            }),
        }
    }

    /// Take a token if one is available, refilling lazily from elapsed time.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_fill);
        let refill = (elapsed.as_secs_f64() * self.rpm as f64 / 60.0) as u32;
        if refill > 0 {
            bucket.tokens = bucket.tokens.saturating_add(refill).min(self.rpm);
            // Advance by whole tokens only so the fractional remainder carries over.
            bucket.last_fill += Duration::from_secs_f64(refill as f64 * 60.0 / self.rpm as f64);
        }
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Wait for a token, polling at a fixed interval so cancellation is
    /// noticed promptly.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            if self.try_acquire() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// Wraps a provider so that at most `rpm` requests start per minute.
pub struct RateLimitedProvider<P> {
    inner: P,
    limiter: RateLimiter,
}

impl<P: CompletionProvider> RateLimitedProvider<P> {
    pub fn new(inner: P, rpm: u32) -> Self {
        Self {
            inner,
            limiter: RateLimiter::new(rpm),
        }
    }
}

#[async_trait]
impl<P: CompletionProvider> CompletionProvider for RateLimitedProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(
        &self,
        cancel: &CancellationToken,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.limiter.acquire(cancel).await?;
        self.inner.complete(cancel, request).await
    }
}

// ============ OpenAI-compatible provider ============

/// Provider for any endpoint speaking the OpenAI chat-completions protocol.
///
/// The API key is read from the environment variable named by
/// `llm.api_key_env`; local servers such as Ollama need none.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = match config.api_key_var() {
            Some(var) => match std::env::var(var) {
                Ok(key) => Some(key),
                Err(_) => bail!("{} environment variable not set", var),
            },
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            name: config.provider.clone(),
            base_url: config.base_url().trim_end_matches('/').to_string(),
            api_key,
            default_model: config.model.clone().unwrap_or_default(),
            client,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        cancel: &CancellationToken,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let model = if request.model.is_empty() {
            &self.default_model
        } else {
            &request.model
        };

        let mut body = serde_json::json!({
            "model": model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if request.json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let mut http = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(ref key) = self.api_key {
            http = http.header("Authorization", format!("Bearer {}", key));
        }

        let response = http
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("{} request failed: {}", self.name, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status.as_u16(), &body_text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("invalid response body: {}", e)))?;
        parse_chat_response(&json)
    }
}

/// Map an HTTP failure onto an [`ErrorKind`].
pub fn classify_http_error(status: u16, body: &str) -> ProviderError {
    let message = format!("HTTP {}: {}", status, body);
    let lower = body.to_ascii_lowercase();
    let mentions_quota = lower.contains("insufficient_quota")
        || lower.contains("resource_exhausted")
        || lower.contains("quota");

    match status {
        429 | 403 if mentions_quota => ProviderError::QuotaExhausted(message),
        429 | 529 => ProviderError::Transient(message),
        s if (500..600).contains(&s) => ProviderError::Transient(message),
        _ => ProviderError::Fatal(message),
    }
}

/// Extract content, usage and finish reason from a chat-completions body.
fn parse_chat_response(json: &serde_json::Value) -> Result<CompletionResponse, ProviderError> {
    let choice = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| ProviderError::Fatal("Invalid response: missing choices".to_string()))?;

    let content = choice
        .pointer("/message/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|f| f.as_str())
        .unwrap_or_default()
        .to_string();
    let usage = json.get("usage");
    let input_tokens = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|t| t.as_u64())
        .unwrap_or(0);
    let output_tokens = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|t| t.as_u64())
        .unwrap_or(0);

    Ok(CompletionResponse {
        content,
        input_tokens,
        output_tokens,
        finish_reason,
    })
}

/// Create the provider named in configuration, rate limited if configured.
pub fn create_provider(config: &LlmConfig) -> Result<Box<dyn CompletionProvider>> {
    match config.provider.as_str() {
        "openai" | "openrouter" | "ollama" => {
            let provider = OpenAiCompatProvider::new(config)?;
            match config.requests_per_minute {
                Some(rpm) if rpm > 0 => Ok(Box::new(RateLimitedProvider::new(provider, rpm))),
                _ => Ok(Box::new(provider)),
            }
        }
        "disabled" => bail!("LLM provider is disabled. Set [llm] provider in config."),
        other => bail!("Unknown LLM provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_http_error() {
        assert_eq!(classify_http_error(429, "slow down").kind(), ErrorKind::Transient);
        assert_eq!(
            classify_http_error(429, r#"{"error":{"code":"insufficient_quota"}}"#).kind(),
            ErrorKind::QuotaExhausted
        );
        assert_eq!(
            classify_http_error(403, "RESOURCE_EXHAUSTED").kind(),
            ErrorKind::QuotaExhausted
        );
        assert_eq!(classify_http_error(503, "overloaded").kind(), ErrorKind::Transient);
        assert_eq!(classify_http_error(529, "").kind(), ErrorKind::Transient);
        assert_eq!(classify_http_error(401, "bad key").kind(), ErrorKind::Fatal);
        assert_eq!(classify_http_error(400, "bad request").kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_parse_chat_response() {
        let json = serde_json::json!({
            "choices": [{"message": {"content": "{}"}, "finish_reason": "length"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 34}
        });
        let resp = parse_chat_response(&json).unwrap();
        assert_eq!(resp.content, "{}");
        assert_eq!(resp.input_tokens, 12);
        assert_eq!(resp.output_tokens, 34);
        assert!(resp.is_truncated());

        let err = parse_chat_response(&serde_json::json!({})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_rate_limiter_capacity() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_rate_limiter_keeps_partial_refill() {
        let limiter = RateLimiter::new(60);
        {
            let mut bucket = limiter.bucket.lock().unwrap();
            bucket.tokens = 0;
            bucket.last_fill = Instant::now()
                .checked_sub(Duration::from_millis(1500))
                .unwrap();
        }
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        // One token per second: the unused half second is still owed.
        let bucket = limiter.bucket.lock().unwrap();
        let carried = bucket.last_fill.elapsed();
        assert!(carried >= Duration::from_millis(450), "{:?}", carried);
        assert!(carried < Duration::from_millis(1000), "{:?}", carried);
    }

    #[tokio::test]
    async fn test_rate_limiter_honors_cancellation() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.try_acquire());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = limiter.acquire(&cancel).await;
        assert!(matches!(result, Err(ProviderError::Cancelled)));
    }

    #[test]
    fn test_message_serialization() {
        let json = serde_json::to_value(Message::system("hi")).unwrap();
        assert_eq!(json["role"], "system");
        assert_eq!(json["content"], "hi");
    }
}
