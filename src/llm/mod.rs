//! LLM access: request ceilings, spend accounting and the chat client.

pub mod client;
pub mod cost;
pub mod rate_limiter;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ChatMessage, ChatReply, ChatRequest, ChatTransport, LlmClient, LlmSettings};
pub use cost::{CostStats, CostTracker, TokenUsage};
pub use rate_limiter::RateLimiter;
