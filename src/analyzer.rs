//! Per-file analysis against the completion service.
//!
//! [`Analyzer::analyze`] turns one source file into an [`AnalysisResult`].
//! Service errors are retried according to [`RetryPolicy`]; malformed
//! responses are never errors. They run through an escalation chain:
//!
//! 1. **Direct**: parse the response (code fences stripped).
//! 2. **Repair**: close unterminated strings, brackets and braces, re-parse.
//! 3. **Resample**: same prompt at a higher temperature.
//! 4. **Fallback**: minimal `summary`/`purpose` prompt at temperature 0.
//!
//! If every step fails a result with [`ANALYSIS_FAILED_SUMMARY`] is
//! synthesized, so a file with a readable service but unreadable output
//! still counts as processed.
//!
//! [`ANALYSIS_FAILED_SUMMARY`]: crate::models::ANALYSIS_FAILED_SUMMARY

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AnalysisConfig;
use crate::llm::{
    CompletionProvider, CompletionRequest, CompletionResponse, ErrorKind, Message, ProviderError,
};
use crate::models::{content_hash, AnalysisResult, QualityTier};
use crate::prompts::{build_fallback_messages, build_messages};

const INITIAL_MAX_TOKENS: u32 = 4096;
const TRUNCATED_MAX_TOKENS: u32 = 8192;
const FALLBACK_MAX_TOKENS: u32 = 1024;
const INITIAL_TEMPERATURE: f32 = 0.1;
const RESAMPLE_TEMPERATURE: f32 = 0.2;
const FALLBACK_TEMPERATURE: f32 = 0.0;

/// Exponential backoff for transient service errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(15),
            max_backoff: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("llm completion: {0}")]
    Provider(ProviderError),
    #[error("rate limited after {retries} retries: {source}")]
    RetriesExhausted {
        retries: u32,
        #[source]
        source: ProviderError,
    },
    #[error("analysis cancelled")]
    Cancelled,
}

impl AnalyzeError {
    /// Quota exhaustion trips the batch circuit breaker.
    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self, AnalyzeError::Provider(e) if e.kind() == ErrorKind::QuotaExhausted)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AnalyzeError::Cancelled)
    }

    /// Errors after which no further call for the same file is worth making.
    fn aborts_file(&self) -> bool {
        self.is_quota_exhausted() || self.is_cancelled()
    }
}

impl From<ProviderError> for AnalyzeError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Cancelled => AnalyzeError::Cancelled,
            other => AnalyzeError::Provider(other),
        }
    }
}

/// An analysis plus the tokens every service call for it consumed.
#[derive(Debug, Clone)]
pub struct AnalyzeOutput {
    pub result: AnalysisResult,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Anything that can analyze one file. The batcher is generic over this.
#[async_trait]
pub trait FileAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        cancel: &CancellationToken,
        file_path: &str,
        content: &[u8],
        language: &str,
    ) -> Result<AnalyzeOutput, AnalyzeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseStrategy {
    Direct,
    Repair,
    Resample,
    Fallback,
}

const ESCALATION: [ParseStrategy; 4] = [
    ParseStrategy::Direct,
    ParseStrategy::Repair,
    ParseStrategy::Resample,
    ParseStrategy::Fallback,
];

#[derive(Default)]
struct Usage {
    input: u64,
    output: u64,
}

impl Usage {
    fn add(&mut self, resp: &CompletionResponse) {
        self.input += resp.input_tokens;
        self.output += resp.output_tokens;
    }
}

/// Per-call state shared by the escalation steps.
struct Attempt<'a> {
    file_path: &'a str,
    source: &'a str,
    messages: Vec<Message>,
    response: CompletionResponse,
    usage: Usage,
}

/// LLM-backed [`FileAnalyzer`].
pub struct Analyzer {
    provider: Arc<dyn CompletionProvider>,
    tier: QualityTier,
    model: String,
    retry: RetryPolicy,
}

impl Analyzer {
    pub fn new(provider: Arc<dyn CompletionProvider>, tier: QualityTier, model: impl Into<String>) -> Self {
        Self {
            provider,
            tier,
            model: model.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request(&self, messages: Vec<Message>, max_tokens: u32, temperature: f32) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens,
            temperature,
            json_mode: true,
        }
    }

    /// Issue `request`, retrying transient failures with exponential backoff.
    /// Every wait observes `cancel`.
    async fn complete_with_retry(
        &self,
        cancel: &CancellationToken,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, AnalyzeError> {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(AnalyzeError::Cancelled);
            }
            let err = match self.provider.complete(cancel, request).await {
                Ok(resp) => return Ok(resp),
                Err(e) => e,
            };
            if err.kind() != ErrorKind::Transient {
                return Err(err.into());
            }
            if attempt >= self.retry.max_retries {
                return Err(AnalyzeError::RetriesExhausted {
                    retries: self.retry.max_retries,
                    source: err,
                });
            }
            attempt += 1;
            let delay = self.retry.backoff(attempt);
            warn!(
                provider = self.provider.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Transient completion error, retrying: {}",
                err
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(AnalyzeError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run one escalation step. `Ok(None)` means "try the next step".
    async fn escalate(
        &self,
        cancel: &CancellationToken,
        strategy: ParseStrategy,
        attempt: &mut Attempt<'_>,
    ) -> Result<Option<AnalysisResult>, AnalyzeError> {
        let request = match strategy {
            ParseStrategy::Direct => return Ok(parse_analysis(&attempt.response.content).ok()),
            ParseStrategy::Repair => {
                return Ok(parse_analysis(&repair_json(&attempt.response.content)).ok())
            }
            ParseStrategy::Resample => self.request(
                attempt.messages.clone(),
                INITIAL_MAX_TOKENS,
                RESAMPLE_TEMPERATURE,
            ),
            ParseStrategy::Fallback => self.request(
                build_fallback_messages(attempt.file_path, attempt.source),
                FALLBACK_MAX_TOKENS,
                FALLBACK_TEMPERATURE,
            ),
        };

        match self.complete_with_retry(cancel, &request).await {
            Ok(resp) => {
                attempt.usage.add(&resp);
                Ok(parse_analysis(&resp.content).ok())
            }
            Err(e) if e.aborts_file() => Err(e),
            Err(e) => {
                debug!(file = attempt.file_path, ?strategy, "Escalation call failed: {}", e);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl FileAnalyzer for Analyzer {
    async fn analyze(
        &self,
        cancel: &CancellationToken,
        file_path: &str,
        content: &[u8],
        language: &str,
    ) -> Result<AnalyzeOutput, AnalyzeError> {
        let source = String::from_utf8_lossy(content);
        let messages = build_messages(self.tier, file_path, &source, language);

        let initial = self.request(messages.clone(), INITIAL_MAX_TOKENS, INITIAL_TEMPERATURE);
        let response = self.complete_with_retry(cancel, &initial).await?;
        let mut attempt = Attempt {
            file_path,
            source: source.as_ref(),
            messages,
            response,
            usage: Usage::default(),
        };
        attempt.usage.add(&attempt.response);

        if attempt.response.is_truncated() {
            debug!(file = file_path, "Response truncated, retrying with a larger budget");
            let larger = self.request(
                attempt.messages.clone(),
                TRUNCATED_MAX_TOKENS,
                INITIAL_TEMPERATURE,
            );
            match self.complete_with_retry(cancel, &larger).await {
                Ok(resp) => {
                    attempt.usage.add(&resp);
                    attempt.response = resp;
                }
                Err(e) if e.aborts_file() => return Err(e),
                Err(e) => debug!(file = file_path, "Truncation retry failed: {}", e),
            }
        }

        let mut parsed = None;
        for strategy in ESCALATION {
            if let Some(result) = self.escalate(cancel, strategy, &mut attempt).await? {
                if strategy != ParseStrategy::Direct {
                    debug!(file = file_path, ?strategy, "Recovered analysis");
                }
                parsed = Some(result);
                break;
            }
        }

        let mut result = parsed.unwrap_or_else(|| {
            warn!(file = file_path, "Could not parse any analysis response");
            AnalysisResult::failed(file_path, language)
        });
        result.file_path = file_path.to_string();
        result.language = language.to_string();
        result.content_hash = content_hash(content);

        Ok(AnalyzeOutput {
            result,
            input_tokens: attempt.usage.input,
            output_tokens: attempt.usage.output,
        })
    }
}

/// Remove a surrounding markdown code fence (first line and closing ```).
fn strip_code_fence(raw: &str) -> &str {
    let raw = raw.trim();
    if !raw.starts_with("```") {
        return raw;
    }
    let Some(first_newline) = raw.find('\n') else {
        return raw;
    };
    let body = &raw[first_newline + 1..];
    match body.trim_end().strip_suffix("```") {
        Some(inner) if inner.is_empty() || inner.ends_with('\n') => inner,
        _ => body,
    }
}

/// Parse a service response into an [`AnalysisResult`].
pub fn parse_analysis(raw: &str) -> Result<AnalysisResult, serde_json::Error> {
    serde_json::from_str(strip_code_fence(raw))
}

/// Close whatever a truncated JSON response left open.
///
/// Tracks string state (with escapes) and a stack of open `{`/`[`. If the
/// text ends inside a string the string is closed (after dropping a
/// dangling backslash), a trailing comma is
/// dropped, and the open containers are closed innermost first. Text that
/// is already balanced is returned unchanged (minus any code fence).
pub fn repair_json(raw: &str) -> String {
    let body = strip_code_fence(raw);

    let mut open: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in body.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                open.pop();
            }
            _ => {}
        }
    }

    if open.is_empty() {
        return body.to_string();
    }

    let mut repaired = body.to_string();
    if escaped {
        repaired.pop();
    }
    if in_string {
        repaired.push('"');
    }
    let trimmed_len = repaired.trim_end().len();
    repaired.truncate(trimmed_len);
    if repaired.ends_with(',') {
        repaired.pop();
    }
    while let Some(close) = open.pop() {
        repaired.push(close);
    }
    repaired
}
