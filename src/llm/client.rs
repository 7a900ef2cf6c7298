//! Chat-completion client with rate limiting, cost accounting and retry.
//!
//! [`ChatTransport`] is the network seam: [`OpenRouterTransport`] speaks the
//! OpenAI-compatible `/chat/completions` protocol over `reqwest`. [`LlmClient`]
//! wraps any transport with the process-wide [`RateLimiter`] and
//! [`CostTracker`], a per-call timeout and exponential backoff.
//!
//! # Retry Strategy
//!
//! - `max_retries` is the total number of attempts for one logical request
//! - timeouts, 5xx and connection failures are retried
//! - 429 and 402 fail immediately; retrying them only burns quota
//! - delay = min(base_delay * 2^(attempt-1), max_delay) + jitter(0..250ms)

use crate::error::{LlmError, TransportError};
use crate::llm::cost::{CostTracker, TokenUsage};
use crate::llm::rate_limiter::RateLimiter;
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use rand::{Rng, rng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "deepseek/deepseek-v3.2-exp";

const APP_REFERER: &str = "https://github.com/noticiero/noticiero";
const APP_TITLE: &str = "noticiero";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Body of a chat-completion request.
///
/// An empty `model` is replaced by the client's default before sending.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            model: String::new(),
            messages,
            temperature: None,
            max_tokens: None,
            response_format: None,
        }
    }

    pub fn model(mut self, model: Option<&str>) -> Self {
        if let Some(model) = model {
            self.model = model.to_string();
        }
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Ask the provider for a JSON object response.
    pub fn json_object(mut self) -> Self {
        self.response_format = Some(ResponseFormat {
            kind: "json_object".to_string(),
        });
        self
    }

    fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub message: ChoiceMessage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

/// Provider response, trimmed to the fields the pipeline reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Successful outcome of [`LlmClient::chat`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost: f64,
}

/// One HTTP exchange with a chat-completion provider. No retries, no limits.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, TransportError>;
}

/// OpenAI-compatible transport, defaulting to OpenRouter.
pub struct OpenRouterTransport {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl fmt::Debug for OpenRouterTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenRouterTransport")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl OpenRouterTransport {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl ChatTransport for OpenRouterTransport {
    #[instrument(level = "debug", skip_all, fields(model = %request.model))]
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, TransportError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", APP_REFERER)
            .header("X-Title", APP_TITLE)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: truncate_for_log(&body, 500),
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            warn!(error = %e, body = %truncate_for_log(&body, 300), "Malformed completion body");
            TransportError::Decode(e.to_string())
        })
    }
}

/// A limiter slot between `check_limit` and `record_request`.
///
/// Dropped unrecorded (caller timeout, task abort, panic) it hands the slot back.
struct Slot<'a> {
    limiter: &'a RateLimiter,
    recorded: bool,
}

impl<'a> Slot<'a> {
    async fn acquire(limiter: &'a RateLimiter) -> Result<Self, LlmError> {
        limiter.check_limit().await?;
        Ok(Self {
            limiter,
            recorded: false,
        })
    }

    fn record(mut self) {
        self.limiter.record_request();
        self.recorded = true;
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.limiter.release();
        }
    }
}

/// Tunables for [`LlmClient`].
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub default_model: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(120),
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Rate-limited, cost-tracked chat client shared by every LLM caller.
#[derive(Clone)]
pub struct LlmClient {
    transport: Arc<dyn ChatTransport>,
    limiter: Arc<RateLimiter>,
    costs: Arc<CostTracker>,
    settings: LlmSettings,
}

impl fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmClient")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl LlmClient {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        limiter: Arc<RateLimiter>,
        costs: Arc<CostTracker>,
        settings: LlmSettings,
    ) -> Self {
        Self {
            transport,
            limiter,
            costs,
            settings,
        }
    }

    pub fn default_model(&self) -> &str {
        &self.settings.default_model
    }

    pub fn costs(&self) -> &CostTracker {
        &self.costs
    }

    /// Send one logical request, retrying transient failures.
    ///
    /// Every attempt passes through the rate limiter first, so an exhausted
    /// daily ceiling fails before anything reaches the network.
    #[instrument(level = "info", skip_all, fields(model = tracing::field::Empty))]
    pub async fn chat(&self, mut request: ChatRequest) -> Result<ChatReply, LlmError> {
        if request.model.is_empty() {
            request.model = self.settings.default_model.clone();
        }
        tracing::Span::current().record("model", request.model.as_str());

        let max_attempts = self.settings.max_retries.max(1);
        let total_t0 = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let slot = Slot::acquire(&self.limiter).await?;

            let attempt_t0 = Instant::now();
            let outcome = match timeout(self.settings.timeout, self.transport.send(&request)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(TransportError::Timeout),
            };
            slot.record();
            let attempt_dt = attempt_t0.elapsed();

            let err = match outcome {
                Ok(response) => {
                    let reply = self.settle(&request, response)?;
                    info!(
                        attempt,
                        tokens = reply.usage.total(),
                        cost = reply.cost,
                        elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                        "chat() succeeded"
                    );
                    return Ok(reply);
                }
                Err(e) => e,
            };

            match err {
                TransportError::Status { status: 429, body } => {
                    error!(attempt, body = %body, "Provider rate limit hit; not retrying");
                    return Err(LlmError::RateLimited(body));
                }
                TransportError::Status { status: 402, body } => {
                    error!(attempt, body = %body, "Provider reports insufficient credit; not retrying");
                    return Err(LlmError::InsufficientCredit(body));
                }
                e if e.is_transient() => {
                    if attempt >= max_attempts {
                        error!(
                            attempt,
                            max = max_attempts,
                            elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                            elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                            error = %e,
                            "chat() exhausted retries"
                        );
                        return Err(LlmError::RetriesExhausted {
                            attempts: attempt,
                            last: e,
                        });
                    }

                    let delay = self.backoff(attempt);
                    warn!(
                        attempt,
                        max = max_attempts,
                        elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                        elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                        ?delay,
                        error = %e,
                        "chat() attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
                e => {
                    error!(attempt, error = %e, "chat() failed with non-retryable error");
                    return Err(LlmError::Api(e));
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .settings
            .base_delay
            .saturating_mul(1 << exp)
            .min(self.settings.max_delay);
        let jitter_ms: u64 = rng().random_range(0..=250);
        delay + Duration::from_millis(jitter_ms)
    }

    /// Turn a raw response into a reply and book its cost.
    fn settle(&self, request: &ChatRequest, response: ChatResponse) -> Result<ChatReply, LlmError> {
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LlmError::Decode("completion has no content".to_string()))?;

        let usage = match response.usage {
            Some(u) => TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            },
            None => {
                // ~4 chars per token when the provider omits usage
                let estimated = TokenUsage {
                    prompt_tokens: (request.prompt_chars() / 4) as u32,
                    completion_tokens: (content.chars().count() / 4) as u32,
                };
                debug!(?estimated, "Provider omitted usage; estimating");
                estimated
            }
        };

        let cost =
            self.costs
                .calculate_cost(&request.model, usage.prompt_tokens, usage.completion_tokens);
        self.costs.record_usage(&request.model, cost, usage);

        Ok(ChatReply {
            content,
            model: response.model.unwrap_or_else(|| request.model.clone()),
            usage,
            cost,
        })
    }
}
