//! Error taxonomy for the pipeline.
//!
//! Errors are split by boundary so each stage can decide locally whether a
//! failure is per-item (counted and skipped), stage-level (stops one stage of
//! the cycle) or fatal (stops the process before any work starts).

use thiserror::Error;

/// Problems detected while validating configuration at boot.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to load source catalog {path}: {reason}")]
    Sources { path: String, reason: String },
}

/// Low-level failure of a single chat-completion HTTP exchange.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("could not decode provider response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Timeouts, 5xx responses and connection failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout | TransportError::Network(_) => true,
            TransportError::Status { status, .. } => *status >= 500,
            TransportError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

/// Classified outcome of an LLM call after retries.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider rate limit hit (429): {0}")]
    RateLimited(String),

    #[error("insufficient provider credit (402): {0}")]
    InsufficientCredit(String),

    #[error("daily request ceiling of {limit} exhausted")]
    DailyLimitExhausted { limit: u32 },

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },

    #[error("provider rejected request: {0}")]
    Api(TransportError),

    #[error("unusable model response: {0}")]
    Decode(String),
}

impl LlmError {
    /// Errors after which no further LLM call can succeed in this cycle.
    pub fn is_fatal_for_cycle(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited(_)
                | LlmError::InsufficientCredit(_)
                | LlmError::DailyLimitExhausted { .. }
        )
    }
}

/// Failure fetching or parsing a page.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("page load timed out: {0}")]
    Timeout(String),

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("network error: {0}")]
    Network(String),

    #[error("could not parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },
}

impl CrawlError {
    pub fn is_transient(&self) -> bool {
        match self {
            CrawlError::Timeout(_) | CrawlError::Network(_) => true,
            CrawlError::Status { status, .. } => *status >= 500 || *status == 429,
            CrawlError::Parse { .. } => false,
        }
    }
}

impl From<reqwest::Error> for CrawlError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        if err.is_timeout() {
            CrawlError::Timeout(url)
        } else if let Some(status) = err.status() {
            CrawlError::Status {
                url,
                status: status.as_u16(),
            }
        } else {
            CrawlError::Network(err.to_string())
        }
    }
}

/// Failure talking to the article table or the image bucket.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Backend(String),
}

/// Errors that end a pipeline cycle early.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cycle cancelled before stage {0}")]
    Cancelled(&'static str),

    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}
