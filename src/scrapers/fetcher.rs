//! Page fetch backends.
//!
//! [`HttpFetcher`] issues plain GET requests; [`BrowserlessFetcher`] asks a
//! Browserless-compatible headless browser for the rendered HTML through its
//! `/content` endpoint. Both present the session's user agent, headers and
//! (for the browser) viewport, and both enforce the page timeout themselves.

use crate::error::CrawlError;
use crate::scrapers::stealth::Session;
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use rand::{Rng, rng};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, instrument, warn};

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Return the document body at `url`.
    async fn fetch(&self, url: &str, session: &Session) -> Result<String, CrawlError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: reqwest::Client,
    page_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(http: reqwest::Client, page_timeout: Duration) -> Self {
        Self { http, page_timeout }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    #[instrument(level = "debug", skip_all, fields(%url))]
    async fn fetch(&self, url: &str, session: &Session) -> Result<String, CrawlError> {
        let mut request = self
            .http
            .get(url)
            .timeout(self.page_timeout)
            .header(reqwest::header::USER_AGENT, &session.user_agent);
        for (name, value) in &session.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CrawlError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.text().await?)
    }
}

pub struct BrowserlessFetcher {
    http: reqwest::Client,
    endpoint: String,
    page_timeout: Duration,
}

impl fmt::Debug for BrowserlessFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // endpoint may carry the token
        f.debug_struct("BrowserlessFetcher")
            .field("page_timeout", &self.page_timeout)
            .finish_non_exhaustive()
    }
}

impl BrowserlessFetcher {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        token: Option<&str>,
        page_timeout: Duration,
    ) -> Self {
        let mut endpoint = format!("{}/content", base_url.trim_end_matches('/'));
        if let Some(token) = token {
            endpoint.push_str(&format!("?token={}", urlencoding::encode(token)));
        }
        Self {
            http,
            endpoint,
            page_timeout,
        }
    }

    fn body(&self, url: &str, session: &Session) -> serde_json::Value {
        let extra_headers: HashMap<&str, &str> = session
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        json!({
            "url": url,
            "userAgent": session.user_agent,
            "viewport": {
                "width": session.viewport.width,
                "height": session.viewport.height,
            },
            "setExtraHTTPHeaders": extra_headers,
            "gotoOptions": {
                "waitUntil": "domcontentloaded",
                "timeout": self.page_timeout.as_millis() as u64,
            },
        })
    }
}

#[async_trait]
impl PageFetcher for BrowserlessFetcher {
    #[instrument(level = "debug", skip_all, fields(%url))]
    async fn fetch(&self, url: &str, session: &Session) -> Result<String, CrawlError> {
        let response = self
            .http
            .post(&self.endpoint)
            // browser navigation plus rendering overhead
            .timeout(self.page_timeout + Duration::from_secs(10))
            .json(&self.body(url, session))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CrawlError::Timeout(url.to_string())
                } else {
                    CrawlError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), message = %truncate_for_log(&message, 200), "Browserless rejected page");
            return Err(CrawlError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.text().await?)
    }
}

/// Fetch with a hard timeout and bounded retries on transient failures.
///
/// `retries` counts retries after the first attempt. Backoff doubles from
/// `base_delay` with up to 250ms jitter.
pub async fn fetch_with_retry(
    fetcher: &dyn PageFetcher,
    url: &str,
    session: &Session,
    page_timeout: Duration,
    retries: u32,
    base_delay: Duration,
) -> Result<String, CrawlError> {
    let mut attempt = 0u32;
    loop {
        let outcome = match timeout(page_timeout, fetcher.fetch(url, session)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CrawlError::Timeout(url.to_string())),
        };
        match outcome {
            Ok(body) => return Ok(body),
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                let delay = base_delay.saturating_mul(1 << (attempt - 1).min(16))
                    + Duration::from_millis(rng().random_range(0..=250));
                warn!(%url, attempt, ?delay, error = %e, "Fetch failed; backing off");
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves canned pages by URL; unknown URLs are 404s.
    #[derive(Default)]
    pub struct FakeFetcher {
        pages: Mutex<HashMap<String, Vec<Result<String, u16>>>>,
        pub calls: AtomicUsize,
    }

    impl FakeFetcher {
        pub fn page(self, url: &str, body: &str) -> Self {
            self.respond(url, vec![Ok(body.to_string())])
        }

        /// Scripted responses for `url`: `Err(status)` entries fail; the last entry repeats.
        pub fn respond(self, url: &str, script: Vec<Result<String, u16>>) -> Self {
            self.pages.lock().unwrap().insert(url.to_string(), script);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PageFetcher for FakeFetcher {
        async fn fetch(&self, url: &str, _session: &Session) -> Result<String, CrawlError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut pages = self.pages.lock().unwrap();
            let script = pages.get_mut(url).ok_or_else(|| CrawlError::Status {
                url: url.to_string(),
                status: 404,
            })?;
            let next = if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            };
            next.map_err(|status| CrawlError::Status {
                url: url.to_string(),
                status,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeFetcher;
    use super::*;
    use crate::scrapers::stealth::{FixedStealth, StealthPolicy};

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let fetcher = FakeFetcher::default().respond(
            "https://site/feed",
            vec![Err(503), Err(502), Ok("<rss/>".to_string())],
        );
        let body = fetch_with_retry(
            &fetcher,
            "https://site/feed",
            &FixedStealth.session(),
            TIMEOUT,
            2,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(body, "<rss/>");
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let fetcher = FakeFetcher::default().respond("https://site/feed", vec![Err(500)]);
        let err = fetch_with_retry(
            &fetcher,
            "https://site/feed",
            &FixedStealth.session(),
            TIMEOUT,
            2,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CrawlError::Status { status: 500, .. }));
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let fetcher = FakeFetcher::default();
        let err = fetch_with_retry(
            &fetcher,
            "https://site/missing",
            &FixedStealth.session(),
            TIMEOUT,
            2,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CrawlError::Status { status: 404, .. }));
        assert_eq!(fetcher.calls(), 1);
    }

    #[test]
    fn test_browserless_request_carries_session() {
        let fetcher = BrowserlessFetcher::new(
            reqwest::Client::new(),
            "http://browserless:3000/",
            Some("s3cr3t"),
            TIMEOUT,
        );
        assert_eq!(fetcher.endpoint, "http://browserless:3000/content?token=s3cr3t");

        let session = FixedStealth.session();
        let body = fetcher.body("https://site/a", &session);
        assert_eq!(body["url"], "https://site/a");
        assert_eq!(body["viewport"]["width"], 1920);
        assert_eq!(body["userAgent"], session.user_agent.as_str());
        assert_eq!(body["setExtraHTTPHeaders"]["Accept-Language"], "es-AR,es;q=0.9,en;q=0.8");
        assert_eq!(body["gotoOptions"]["timeout"], 30_000);
    }
}
