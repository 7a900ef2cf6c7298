//! Feed crawling for the configured news sources.
//!
//! Every (source, category) pair in the [`SourceCatalog`] is crawled as its
//! own task:
//!
//! 1. **Listing**: fetch and parse the category's RSS feed
//! 2. **Detail**: fetch each linked article page and extract body and metadata
//!
//! Tasks run concurrently up to `CrawlSettings::concurrency`. A failing feed
//! is logged and counted and never affects its siblings; a failing article
//! page falls back to the feed's description or drops that one item.
//!
//! # Submodules
//!
//! | Module | Role |
//! |--------|------|
//! | [`sources`] | source catalog, category ids and heuristics |
//! | [`feed`] | RSS parsing |
//! | [`article`] | detail-page extraction |
//! | [`fetcher`] | plain HTTP and headless-browser backends, retry |
//! | [`stealth`] | session identity and request pacing |

pub mod article;
pub mod feed;
pub mod fetcher;
pub mod sources;
pub mod stealth;

use crate::error::CrawlError;
use crate::images::is_probably_logo;
use crate::models::RawCandidate;
use crate::utils::{clean_text, excerpt_from, strip_html};
use article::{PageExtract, extract_article};
use chrono::Utc;
use feed::{FeedItem, parse_feed};
use fetcher::{PageFetcher, fetch_with_retry};
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use sources::{CategorySignals, FeedConfig, SourceCatalog, SourceConfig, detect_category};
use stealth::{Session, StealthPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

/// Characters kept from the description when it stands in for the excerpt.
const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub max_per_category: usize,
    pub concurrency: usize,
    pub page_timeout: Duration,
    /// Retries after the first attempt, for transient failures only.
    pub fetch_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            max_per_category: 10,
            concurrency: 4,
            page_timeout: Duration::from_secs(30),
            fetch_retries: 2,
            retry_base_delay: Duration::from_secs(2),
        }
    }
}

/// Result of one crawl across the whole catalog.
#[derive(Debug, Default)]
pub struct CrawlReport {
    /// In catalog order.
    pub candidates: Vec<RawCandidate>,
    pub failed_feeds: usize,
    pub dropped_items: usize,
}

struct FeedOutcome {
    candidates: Vec<RawCandidate>,
    dropped: usize,
}

#[derive(Clone)]
pub struct Crawler {
    fetcher: Arc<dyn PageFetcher>,
    stealth: Arc<dyn StealthPolicy>,
    catalog: Arc<SourceCatalog>,
    settings: CrawlSettings,
}

impl Crawler {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        stealth: Arc<dyn StealthPolicy>,
        catalog: Arc<SourceCatalog>,
        settings: CrawlSettings,
    ) -> Self {
        Self {
            fetcher,
            stealth,
            catalog,
            settings,
        }
    }

    /// Crawl every feed in the catalog with bounded concurrency.
    #[instrument(level = "info", skip_all)]
    pub async fn crawl(&self) -> CrawlReport {
        let jobs: Vec<(usize, SourceConfig, FeedConfig)> = self
            .catalog
            .pairs()
            .enumerate()
            .map(|(i, (source, feed))| (i, source.clone(), feed.clone()))
            .collect();
        let total = jobs.len();

        let mut finished: Vec<(usize, FeedOutcome)> = Vec::with_capacity(total);
        let mut report = CrawlReport::default();

        let results = stream::iter(jobs)
            .map(|(index, source, feed)| {
                let crawler = self.clone();
                tokio::spawn(async move {
                    let outcome = crawler.crawl_feed(&source, &feed).await;
                    (index, source.id, feed.category, outcome)
                })
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        for joined in results {
            match joined {
                Ok((index, _, _, Ok(outcome))) => finished.push((index, outcome)),
                Ok((_, source, category, Err(e))) => {
                    warn!(%source, %category, error = %e, "Feed crawl failed");
                    report.failed_feeds += 1;
                }
                Err(e) => {
                    error!(error = %e, "Feed task panicked");
                    report.failed_feeds += 1;
                }
            }
        }

        finished.sort_by_key(|(index, _)| *index);
        for (_, outcome) in finished {
            report.dropped_items += outcome.dropped;
            report.candidates.extend(outcome.candidates);
        }

        info!(
            feeds = total,
            failed_feeds = report.failed_feeds,
            candidates = report.candidates.len(),
            dropped = report.dropped_items,
            "Crawl complete"
        );
        report
    }

    async fn fetch(&self, url: &str, session: &Session) -> Result<String, CrawlError> {
        fetch_with_retry(
            self.fetcher.as_ref(),
            url,
            session,
            self.settings.page_timeout,
            self.settings.fetch_retries,
            self.settings.retry_base_delay,
        )
        .await
    }

    #[instrument(level = "info", skip_all, fields(source = %source.id, category = %feed.category))]
    async fn crawl_feed(
        &self,
        source: &SourceConfig,
        feed: &FeedConfig,
    ) -> Result<FeedOutcome, CrawlError> {
        let session = self.stealth.session();
        let xml = self.fetch(&feed.url, &session).await?;
        let items = parse_feed(&xml)?;
        debug!(items = items.len(), "Parsed feed");

        let base = Url::parse(&source.base_url).ok();
        let mut outcome = FeedOutcome {
            candidates: Vec::new(),
            dropped: 0,
        };

        for mut item in items
            .into_iter()
            .filter_map(|mut item| {
                item.link = absolutize(base.as_ref(), &item.link)?;
                Some(item)
            })
            .unique_by(|item| item.link.clone())
        {
            if outcome.candidates.len() >= self.settings.max_per_category {
                break;
            }
            sleep(self.stealth.delay()).await;

            let page = match self.fetch(&item.link, &session).await {
                Ok(html) => extract_article(&html, source.body_selector.as_deref()),
                Err(e) => {
                    warn!(url = %item.link, error = %e, "Article page unavailable; using feed data");
                    PageExtract::default()
                }
            };
            item.title = clean_text(&strip_html(&item.title));

            match build_candidate(source, feed, base.as_ref(), item, page) {
                Some(candidate) => outcome.candidates.push(candidate),
                None => outcome.dropped += 1,
            }
        }

        info!(
            candidates = outcome.candidates.len(),
            dropped = outcome.dropped,
            "Feed crawled"
        );
        Ok(outcome)
    }
}

fn absolutize(base: Option<&Url>, link: &str) -> Option<String> {
    match Url::parse(link) {
        Ok(url) => Some(url.to_string()),
        Err(_) => base.and_then(|b| b.join(link).ok()).map(|u| u.to_string()),
    }
}

/// Merge feed and page data into a candidate, or `None` if there is nothing to rewrite.
fn build_candidate(
    source: &SourceConfig,
    feed: &FeedConfig,
    base: Option<&Url>,
    item: FeedItem,
    page: PageExtract,
) -> Option<RawCandidate> {
    let title = Some(item.title.clone())
        .filter(|t| !t.is_empty())
        .or_else(|| page.title.as_deref().map(clean_text))
        .filter(|t| !t.is_empty());
    let Some(title) = title else {
        debug!(url = %item.link, "Dropping item without title");
        return None;
    };

    let body = page.body.as_deref().map(clean_text).filter(|b| !b.is_empty());
    let description = clean_text(&strip_html(&item.description));
    let excerpt = if !description.is_empty() {
        excerpt_from(&description, EXCERPT_CHARS)
    } else if let Some(meta) = page.description.as_deref().map(clean_text).filter(|d| !d.is_empty()) {
        excerpt_from(&meta, EXCERPT_CHARS)
    } else if let Some(body) = &body {
        excerpt_from(body, EXCERPT_CHARS)
    } else {
        debug!(url = %item.link, "Dropping item without body or description");
        return None;
    };

    let image_candidates: Vec<String> = item
        .image_candidates()
        .into_iter()
        .chain(page.image_url.clone())
        .filter_map(|u| absolutize(base, &u))
        .filter(|u| !is_probably_logo(u))
        .unique()
        .collect();

    let text = format!("{title} {excerpt} {}", body.as_deref().unwrap_or_default());
    let category = detect_category(
        &CategorySignals {
            url: &item.link,
            section: page.section.as_deref(),
            news_keywords: page.news_keywords.as_deref(),
            text: &text,
        },
        &feed.category,
    );

    let now = Utc::now();
    Some(RawCandidate {
        source_id: source.id.clone(),
        source_name: source.name.clone(),
        category,
        source_url: item.link,
        title,
        excerpt,
        body,
        image_candidates,
        published_at: item.pub_date.or(page.published_at).unwrap_or(now),
        scraped_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::fetcher::fake::FakeFetcher;
    use super::stealth::FixedStealth;
    use super::*;

    fn feed_xml(items: &[(&str, &str, &str)]) -> String {
        let body: String = items
            .iter()
            .map(|(title, link, description)| {
                format!(
                    "<item><title>{title}</title><link>{link}</link>\
                     <description><![CDATA[{description}]]></description>\
                     <pubDate>Sun, 16 Nov 2025 10:30:00 -0300</pubDate>\
                     <media:content url=\"https://img.clarin.com/2025/{title}.jpg\" medium=\"image\"/></item>"
                )
            })
            .collect();
        format!(
            "<rss version=\"2.0\" xmlns:media=\"http://search.yahoo.com/mrss/\"><channel>{body}</channel></rss>"
        )
    }

    fn page(paragraph: &str) -> String {
        format!("<html><body><h1>Titular</h1><div class=\"body-nota\"><p>{paragraph}</p></div></body></html>")
    }

    fn source(id: &str, feeds: &[(&str, &str)]) -> SourceConfig {
        SourceConfig {
            id: id.to_string(),
            name: id.to_uppercase(),
            base_url: format!("https://www.{id}.com"),
            body_selector: Some("div.body-nota p".to_string()),
            feeds: feeds
                .iter()
                .map(|(category, url)| FeedConfig {
                    category: category.to_string(),
                    url: url.to_string(),
                })
                .collect(),
        }
    }

    fn crawler(fetcher: FakeFetcher, sources: Vec<SourceConfig>, max: usize) -> Crawler {
        Crawler::new(
            Arc::new(fetcher),
            Arc::new(FixedStealth),
            Arc::new(SourceCatalog { sources }),
            CrawlSettings {
                max_per_category: max,
                concurrency: 2,
                page_timeout: Duration::from_secs(5),
                fetch_retries: 0,
                retry_base_delay: Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn test_crawl_builds_candidates_from_feed_and_pages() {
        let xml = feed_xml(&[
            ("dolar", "/economia/dolar_0_a.html", "El dólar subió"),
            ("tasas", "https://www.clarin.com/economia/tasas_0_b.html", "Suben las tasas"),
            ("bonos", "https://www.clarin.com/economia/bonos_0_c.html", "Bonos en alza"),
        ]);
        let fetcher = FakeFetcher::default()
            .page("https://www.clarin.com/rss/economia/", &xml)
            .page(
                "https://www.clarin.com/economia/dolar_0_a.html",
                &page("El dólar oficial cerró en alza por tercera jornada consecutiva."),
            )
            .page(
                "https://www.clarin.com/economia/tasas_0_b.html",
                &page("Los bancos subieron las tasas de plazo fijo durante la semana."),
            );
        let crawler = crawler(
            fetcher,
            vec![source("clarin", &[("economia", "https://www.clarin.com/rss/economia/")])],
            2,
        );

        let report = crawler.crawl().await;
        assert_eq!(report.failed_feeds, 0);
        assert_eq!(report.candidates.len(), 2);

        let first = &report.candidates[0];
        assert_eq!(first.source_url, "https://www.clarin.com/economia/dolar_0_a.html");
        assert_eq!(first.title, "dolar");
        assert_eq!(first.excerpt, "El dólar subió");
        assert_eq!(
            first.body.as_deref(),
            Some("El dólar oficial cerró en alza por tercera jornada consecutiva.")
        );
        assert_eq!(first.image_candidates, vec!["https://img.clarin.com/2025/dolar.jpg"]);
        assert_eq!(first.category, "economia");
        assert_eq!(first.published_at.to_rfc3339(), "2025-11-16T13:30:00+00:00");
    }

    #[tokio::test]
    async fn test_candidate_keeps_every_image_and_reads_page_section() {
        let xml = feed_xml(&[(
            "senado",
            "https://www.ambito.com/nota-789",
            "<img src=\"https://www.ambito.com/logo-ambito.png\">El Senado aprobó la ley",
        )]);
        let html = "<html><head>\
            <meta property=\"article:section\" content=\"Política\">\
            <meta property=\"og:image\" content=\"/fotos/principal.jpg\">\
            </head><body><div class=\"body-nota\">\
            <p>El Senado aprobó la ley con cuarenta votos a favor.</p></div></body></html>";
        let fetcher = FakeFetcher::default()
            .page("https://www.ambito.com/rss/economia", &xml)
            .page("https://www.ambito.com/nota-789", html);
        let crawler = crawler(
            fetcher,
            vec![source("ambito", &[("economia", "https://www.ambito.com/rss/economia")])],
            10,
        );

        let report = crawler.crawl().await;
        assert_eq!(report.candidates.len(), 1);
        let only = &report.candidates[0];
        assert_eq!(only.category, "politica");
        assert_eq!(
            only.image_candidates,
            vec![
                "https://img.clarin.com/2025/senado.jpg",
                "https://www.ambito.com/fotos/principal.jpg",
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_feed_does_not_block_siblings() {
        let xml = feed_xml(&[("causa", "https://www.lanacion.com/politica/causa_1.html", "Avanza la causa")]);
        let fetcher = FakeFetcher::default()
            .page("https://www.lanacion.com/rss/politica", &xml)
            .page(
                "https://www.lanacion.com/politica/causa_1.html",
                &page("La causa judicial avanzó con nuevas declaraciones de testigos."),
            );
        let crawler = crawler(
            fetcher,
            vec![
                source("clarin", &[("economia", "https://www.clarin.com/rss/roto/")]),
                source("lanacion", &[("politica", "https://www.lanacion.com/rss/politica")]),
            ],
            10,
        );

        let report = crawler.crawl().await;
        assert_eq!(report.failed_feeds, 1);
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.candidates[0].source_id, "lanacion");
    }

    #[tokio::test]
    async fn test_missing_page_falls_back_to_description() {
        let xml = feed_xml(&[
            ("con-bajada", "https://www.clarin.com/sociedad/a.html", "Una bajada que alcanza"),
            ("sin-bajada", "https://www.clarin.com/sociedad/b.html", ""),
        ]);
        let fetcher = FakeFetcher::default().page("https://www.clarin.com/rss/sociedad/", &xml);
        let crawler = crawler(
            fetcher,
            vec![source("clarin", &[("sociedad", "https://www.clarin.com/rss/sociedad/")])],
            10,
        );

        let report = crawler.crawl().await;
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.dropped_items, 1);
        let only = &report.candidates[0];
        assert!(only.body.is_none());
        assert_eq!(only.text(), "Una bajada que alcanza");
    }

    #[tokio::test]
    async fn test_repeated_links_are_crawled_once() {
        let xml = feed_xml(&[
            ("uno", "https://www.clarin.com/politica/x.html", "Primera aparición"),
            ("uno-bis", "https://www.clarin.com/politica/x.html", "Segunda aparición"),
        ]);
        let fetcher = FakeFetcher::default().page("https://www.clarin.com/rss/politica/", &xml);
        let crawler = crawler(
            fetcher,
            vec![source("clarin", &[("politica", "https://www.clarin.com/rss/politica/")])],
            10,
        );

        let report = crawler.crawl().await;
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.candidates[0].title, "uno");
    }
}
