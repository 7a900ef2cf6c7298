//! Content rewriting on top of [`LlmClient`].
//!
//! [`RewriteService`] exposes the three model-facing operations used by the
//! pipeline (rewrite, headline, summary) and composes them per candidate in
//! [`RewriteService::rewrite_candidate`]. Rewrites and summaries are cached by
//! content hash for [`RewriteSettings::cache_ttl`] so identical input within a
//! cycle, or across close cycles, is only paid for once. A hit reports zero
//! tokens and zero cost, keeping per-article spend equal to what
//! [`CostTracker`](crate::llm::CostTracker) booked.
//!
//! [`jobs`] runs candidates through a bounded worker pool.

pub mod jobs;
pub mod prompts;

use crate::error::LlmError;
use crate::llm::{ChatMessage, ChatRequest, LlmClient};
use crate::models::{Headline, RawCandidate, RewriteOptions, RewriteResult, RewrittenArticle};
use crate::utils::{clean_text, content_hash, excerpt_from, looks_truncated, strip_html, truncate_for_log};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub use jobs::{RewriteBatch, RewriteQueue};

/// Excerpt length used for summaries and for the fallback when summarizing fails.
pub const EXCERPT_CHARS: usize = 200;

/// Cap on how much of the rewritten body goes into the headline prompt.
const HEADLINE_CONTEXT_CHARS: usize = 4_000;
const MAX_FALLBACK_TITLE_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct RewriteSettings {
    /// Cheaper model used for summaries; the client default when `None`.
    pub summary_model: Option<String>,
    pub cache_ttl: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for RewriteSettings {
    fn default() -> Self {
        Self {
            summary_model: None,
            cache_ttl: Duration::from_secs(3_600),
            temperature: 0.7,
            max_tokens: 3_500,
        }
    }
}

/// A generated headline and what it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadlineResult {
    pub headline: Headline,
    pub tokens_used: u32,
    pub cost: f64,
}

#[derive(Debug, Deserialize)]
struct HeadlineJson {
    #[serde(default)]
    title: String,
    #[serde(default)]
    subtitle: Option<String>,
}

#[derive(Debug)]
pub struct RewriteService {
    client: LlmClient,
    settings: RewriteSettings,
    cache: Mutex<HashMap<String, (Instant, RewriteResult)>>,
}

impl RewriteService {
    pub fn new(client: LlmClient, settings: RewriteSettings) -> Self {
        Self {
            client,
            settings,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// A live cache entry. Nothing is billed for a hit, so its spend is zeroed.
    fn cached(&self, key: &str) -> Option<RewriteResult> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(key)
            .filter(|(at, _)| at.elapsed() < self.settings.cache_ttl)
            .map(|(_, result)| RewriteResult {
                tokens_used: 0,
                cost: 0.0,
                ..result.clone()
            })
    }

    fn remember(&self, key: String, result: &RewriteResult) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let ttl = self.settings.cache_ttl;
        cache.retain(|_, (at, _)| at.elapsed() < ttl);
        cache.insert(key, (Instant::now(), result.clone()));
    }

    /// Rewrite an article body in the requested style, tone and length.
    ///
    /// The model output is normalized to `<p>` paragraphs and otherwise
    /// treated as opaque text.
    #[instrument(level = "info", skip_all, fields(title = %truncate_for_log(title, 60)))]
    pub async fn rewrite_article(
        &self,
        title: &str,
        body: &str,
        options: &RewriteOptions,
    ) -> Result<RewriteResult, LlmError> {
        let key = content_hash(&["rewrite", title, body, &format!("{options:?}")]);
        if let Some(hit) = self.cached(&key) {
            debug!("Rewrite cache hit");
            return Ok(hit);
        }

        let request = ChatRequest::new(vec![
            ChatMessage::system(prompts::rewrite_system_prompt(options)),
            ChatMessage::user(prompts::rewrite_user_prompt(title, body, options)),
        ])
        .model(options.model.as_deref())
        .temperature(self.settings.temperature)
        .max_tokens(self.settings.max_tokens);

        let reply = self.client.chat(request).await?;
        let rewritten_text = normalize_body(&reply.content);
        if rewritten_text.is_empty() {
            return Err(LlmError::Decode(format!(
                "rewrite produced no body: {}",
                truncate_for_log(&reply.content, 200)
            )));
        }

        let result = RewriteResult {
            rewritten_text,
            tokens_used: reply.usage.total(),
            cost: reply.cost,
            model: reply.model,
        };
        self.remember(key, &result);
        Ok(result)
    }

    /// Generate a headline and optional subtitle from a JSON model response.
    ///
    /// A response that is not the expected JSON object becomes the headline
    /// as a whole, with no subtitle.
    #[instrument(level = "info", skip_all)]
    pub async fn generate_headline(
        &self,
        content: &str,
        options: &RewriteOptions,
    ) -> Result<HeadlineResult, LlmError> {
        let request = ChatRequest::new(vec![
            ChatMessage::system(prompts::headline_system_prompt(options)),
            ChatMessage::user(prompts::headline_user_prompt(content)),
        ])
        .model(options.model.as_deref())
        .temperature(self.settings.temperature)
        .max_tokens(300)
        .json_object();

        let reply = self.client.chat(request).await?;
        Ok(HeadlineResult {
            headline: parse_headline(&reply.content),
            tokens_used: reply.usage.total(),
            cost: reply.cost,
        })
    }

    /// Summarize `content` in at most `target_len` characters using the summary model.
    #[instrument(level = "info", skip_all, fields(target_len))]
    pub async fn summarize_article(
        &self,
        content: &str,
        target_len: usize,
    ) -> Result<RewriteResult, LlmError> {
        let key = content_hash(&["summary", content, &target_len.to_string()]);
        if let Some(hit) = self.cached(&key) {
            debug!("Summary cache hit");
            return Ok(hit);
        }

        let request = ChatRequest::new(vec![
            ChatMessage::system(prompts::summary_system_prompt()),
            ChatMessage::user(prompts::summary_user_prompt(content, target_len)),
        ])
        .model(self.settings.summary_model.as_deref())
        .temperature(0.3)
        .max_tokens(400);

        let reply = self.client.chat(request).await?;
        let text = strip_html(strip_code_fences(&reply.content))
            .trim_matches('"')
            .to_string();
        if text.is_empty() {
            return Err(LlmError::Decode("empty summary".to_string()));
        }
        let rewritten_text = if text.chars().count() > target_len {
            excerpt_from(&text, target_len.saturating_sub(3))
        } else {
            text
        };

        let result = RewriteResult {
            rewritten_text,
            tokens_used: reply.usage.total(),
            cost: reply.cost,
            model: reply.model,
        };
        self.remember(key, &result);
        Ok(result)
    }

    /// Rewrite, title and summarize one candidate.
    ///
    /// A failed summary falls back to the first [`EXCERPT_CHARS`] characters of
    /// the rewritten body, unless the failure stops all further LLM calls.
    #[instrument(level = "info", skip_all, fields(url = %candidate.source_url))]
    pub async fn rewrite_candidate(
        &self,
        candidate: &RawCandidate,
        options: &RewriteOptions,
    ) -> Result<RewrittenArticle, LlmError> {
        let title = clean_text(&candidate.title);
        let body = clean_text(candidate.text());

        let rewrite = self.rewrite_article(&title, &body, options).await?;
        let plain = strip_html(&rewrite.rewritten_text);
        let context: String = plain.chars().take(HEADLINE_CONTEXT_CHARS).collect();
        let headline = self.generate_headline(&context, options).await?;

        let (excerpt, summary_tokens, summary_cost) =
            match self.summarize_article(&plain, EXCERPT_CHARS).await {
                Ok(summary) => (summary.rewritten_text, summary.tokens_used, summary.cost),
                Err(e) if e.is_fatal_for_cycle() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Summary failed; using body excerpt");
                    (excerpt_from(&rewrite.rewritten_text, EXCERPT_CHARS), 0, 0.0)
                }
            };

        let article = RewrittenArticle {
            title: headline.headline.title,
            subtitle: headline.headline.subtitle,
            excerpt,
            body: rewrite.rewritten_text,
            tokens_used: rewrite.tokens_used + headline.tokens_used + summary_tokens,
            cost: rewrite.cost + headline.cost + summary_cost,
            model: rewrite.model,
        };
        info!(
            tokens = article.tokens_used,
            cost = article.cost,
            "Rewrote candidate"
        );
        Ok(article)
    }
}

/// Inner text of the first fenced block, or the trimmed input when unfenced.
pub(crate) fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[start + 3..];
    let after = match after.find('\n') {
        Some(nl) if after[..nl].chars().all(|c| c.is_ascii_alphanumeric()) => &after[nl + 1..],
        _ => after.trim_start_matches("json"),
    };
    match after.find("```") {
        Some(end) => after[..end].trim(),
        None => after.trim(),
    }
}

/// Model output as `<p>` paragraphs.
fn normalize_body(raw: &str) -> String {
    let body = strip_code_fences(raw);
    if body.contains("<p") {
        return body.to_string();
    }
    body.split('\n')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{p}</p>"))
        .collect()
}

fn parse_headline(raw: &str) -> Headline {
    let cleaned = strip_code_fences(raw);
    match serde_json::from_str::<HeadlineJson>(cleaned) {
        Ok(parsed) if !parsed.title.trim().is_empty() => Headline {
            title: parsed.title.trim().to_string(),
            subtitle: parsed
                .subtitle
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        },
        Ok(_) => {
            warn!("Headline JSON has no title; using raw response");
            fallback_headline(cleaned)
        }
        Err(e) => {
            warn!(
                error = %e,
                truncated = looks_truncated(&e),
                response_preview = %truncate_for_log(cleaned, 200),
                "Headline response is not JSON; using it verbatim"
            );
            fallback_headline(cleaned)
        }
    }
}

fn fallback_headline(raw: &str) -> Headline {
    let title: String = raw
        .trim()
        .trim_matches('"')
        .chars()
        .take(MAX_FALLBACK_TITLE_CHARS)
        .collect();
    Headline {
        title: title.trim().to_string(),
        subtitle: None,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::llm::testing::{ScriptedTransport, completion, server_error};
    use crate::llm::{CostTracker, LlmSettings, RateLimiter};
    use std::sync::Arc;

    pub const BODY: &str = "<p>El Banco Central informó una suba de reservas.</p><p>La cifra alcanzó récord.</p>";

    /// Answers headline, summary and rewrite prompts with plausible canned output.
    pub fn newsroom(fail_summaries: bool) -> ScriptedTransport {
        ScriptedTransport::responder(move |request| {
            let system = &request.messages[0].content;
            if system.contains("títulos") {
                Ok(completion(
                    r#"{"title": "Reservas en alza", "subtitle": "El BCRA informó un récord"}"#,
                    200,
                    30,
                ))
            } else if system.contains("bajadas") {
                if fail_summaries {
                    server_error(400)
                } else {
                    Ok(completion("Las reservas del Banco Central marcaron un récord.", 150, 20))
                }
            } else {
                Ok(completion(BODY, 900, 400))
            }
        })
    }

    pub fn service(transport: Arc<ScriptedTransport>) -> RewriteService {
        let client = LlmClient::new(
            transport,
            Arc::new(RateLimiter::new(1_000, 10_000)),
            Arc::new(CostTracker::new()),
            LlmSettings::default(),
        );
        RewriteService::new(client, RewriteSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{BODY, newsroom, service};
    use super::*;
    use crate::llm::testing::{ScriptedTransport, completion};
    use crate::models::fixtures;
    use crate::models::{Style, Tone};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_rewrite_is_cached_by_content_and_options() {
        let transport = Arc::new(newsroom(false));
        let service = service(Arc::clone(&transport));
        let options = RewriteOptions::default();

        let first = service.rewrite_article("T", "Cuerpo", &options).await.unwrap();
        let second = service.rewrite_article("T", "Cuerpo", &options).await.unwrap();
        assert_eq!(first.rewritten_text, second.rewritten_text);
        assert_eq!(first.model, second.model);
        assert_eq!(transport.calls(), 1);

        let casual = RewriteOptions {
            style: Style::Casual,
            ..options.clone()
        };
        service.rewrite_article("T", "Cuerpo", &casual).await.unwrap();
        service.rewrite_article("T", "Otro cuerpo", &options).await.unwrap();
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_cache_hit_reports_no_spend() {
        let transport = Arc::new(newsroom(false));
        let service = service(Arc::clone(&transport));
        let options = RewriteOptions::default();

        let first = service.rewrite_article("T", "Cuerpo", &options).await.unwrap();
        let second = service.rewrite_article("T", "Cuerpo", &options).await.unwrap();
        assert!(first.cost > 0.0);
        assert_eq!(second.tokens_used, 0);
        assert_eq!(second.cost, 0.0);

        let summary = service.summarize_article("nota", 200).await.unwrap();
        let again = service.summarize_article("nota", 200).await.unwrap();
        assert_eq!(again.cost, 0.0);

        let booked = service.client.costs().get_stats().total_cost;
        let reported = first.cost + second.cost + summary.cost + again.cost;
        assert!((reported - booked).abs() < 1e-12, "reported {reported}, booked {booked}");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let transport = Arc::new(newsroom(false));
        let service = service(Arc::clone(&transport));
        let options = RewriteOptions::default();

        service.rewrite_article("T", "Cuerpo", &options).await.unwrap();
        tokio::time::advance(Duration::from_secs(3_601)).await;
        service.rewrite_article("T", "Cuerpo", &options).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_rewrite_uses_style_tone_and_model_override() {
        let transport = Arc::new(newsroom(false));
        let service = service(Arc::clone(&transport));
        let options = RewriteOptions {
            style: Style::Opinion,
            tone: Tone::Supportive,
            model: Some("openai/gpt-4o-mini".to_string()),
            ..RewriteOptions::default()
        };

        service.rewrite_article("T", "Cuerpo", &options).await.unwrap();
        let request = &transport.requests()[0];
        assert_eq!(request.model, "openai/gpt-4o-mini");
        assert!(request.messages[0].content.contains("OPINIÓN"));
        assert!(request.messages[0].content.contains("favorable"));
        assert_eq!(request.max_tokens, Some(3_500));
    }

    #[tokio::test]
    async fn test_plain_text_rewrite_is_wrapped_in_paragraphs() {
        let transport = Arc::new(ScriptedTransport::repeating(completion(
            "```\nPrimer párrafo.\n\nSegundo párrafo.\n```",
            10,
            10,
        )));
        let result = service(transport)
            .rewrite_article("T", "B", &RewriteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.rewritten_text, "<p>Primer párrafo.</p><p>Segundo párrafo.</p>");
    }

    #[tokio::test]
    async fn test_headline_parses_json_with_subtitle() {
        let transport = Arc::new(ScriptedTransport::repeating(completion(
            "```json\n{\"title\": \"Suba del dólar\", \"subtitle\": \"El blue cerró a $1500\"}\n```",
            10,
            10,
        )));
        let service = service(Arc::clone(&transport));
        let result = service
            .generate_headline("nota", &RewriteOptions::default())
            .await
            .unwrap();

        assert_eq!(result.headline.title, "Suba del dólar");
        assert_eq!(result.headline.subtitle.as_deref(), Some("El blue cerró a $1500"));
        assert!(transport.requests()[0].response_format.is_some());
    }

    #[tokio::test]
    async fn test_malformed_headline_json_becomes_title() {
        let transport = Arc::new(ScriptedTransport::repeating(completion(
            "Suba del dólar: el blue cerró a $1500",
            10,
            10,
        )));
        let result = service(transport)
            .generate_headline("nota", &RewriteOptions::default())
            .await
            .unwrap();

        assert_eq!(result.headline.title, "Suba del dólar: el blue cerró a $1500");
        assert_eq!(result.headline.subtitle, None);
    }

    #[tokio::test]
    async fn test_summary_is_bounded() {
        let transport = Arc::new(ScriptedTransport::repeating(completion(&"palabra ".repeat(60), 10, 10)));
        let summary = service(transport)
            .summarize_article("nota larga", 100)
            .await
            .unwrap();
        assert!(summary.rewritten_text.chars().count() <= 100);
        assert!(summary.rewritten_text.ends_with("..."));
    }

    #[tokio::test]
    async fn test_rewrite_candidate_composes_all_three_calls() {
        let transport = Arc::new(newsroom(false));
        let service = service(Arc::clone(&transport));
        let candidate = fixtures::candidate("https://site/a", "X");

        let article = service
            .rewrite_candidate(&candidate, &RewriteOptions::default())
            .await
            .unwrap();

        assert_eq!(article.title, "Reservas en alza");
        assert_eq!(article.subtitle.as_deref(), Some("El BCRA informó un récord"));
        assert_eq!(article.body, BODY);
        assert_eq!(article.excerpt, "Las reservas del Banco Central marcaron un récord.");
        assert_eq!(article.tokens_used, 1_300 + 230 + 170);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_failed_summary_falls_back_to_excerpt() {
        let transport = Arc::new(newsroom(true));
        let article = service(transport)
            .rewrite_candidate(&fixtures::candidate("https://site/a", "X"), &RewriteOptions::default())
            .await
            .unwrap();
        assert_eq!(article.excerpt, excerpt_from(BODY, EXCERPT_CHARS));
    }

    #[test]
    fn test_strip_code_fences_variants() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json{\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("Aquí va:\n```\n<p>x</p>\n```"), "<p>x</p>");
    }
}
