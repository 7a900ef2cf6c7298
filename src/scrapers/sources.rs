//! Source catalog: which outlets and category feeds a cycle crawls.
//!
//! The built-in catalog covers the Argentine outlets the site republishes.
//! A YAML file can replace it without a rebuild:
//!
//! ```yaml
//! - id: clarin
//!   name: Clarín
//!   base_url: https://www.clarin.com
//!   body_selector: "div.body-nota p"
//!   feeds:
//!     - category: economia
//!       url: https://www.clarin.com/rss/economia/
//! ```

use crate::error::ConfigError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Category slugs and their ids in the store.
pub const CATEGORIES: &[(&str, i64)] = &[
    ("economia", 1),
    ("politica", 2),
    ("judicial", 3),
    ("internacional", 4),
    ("sociedad", 5),
];

pub fn category_id(slug: &str) -> Option<i64> {
    CATEGORIES
        .iter()
        .find(|(known, _)| *known == slug)
        .map(|(_, id)| *id)
}

/// URL path segments that identify a category on the source sites.
const PATH_HINTS: &[(&str, &str)] = &[
    ("/economia/", "economia"),
    ("/finanzas/", "economia"),
    ("/politica/", "politica"),
    ("/el-mundo/", "internacional"),
    ("/mundo/", "internacional"),
    ("/internacional/", "internacional"),
    ("/policiales/", "judicial"),
    ("/seguridad/", "judicial"),
    ("/judiciales/", "judicial"),
    ("/sociedad/", "sociedad"),
];

const KEYWORDS: &[(&str, &[&str])] = &[
    (
        "economia",
        &[
            "dólar", "inflación", "bcra", "reservas", "tasas", "mercados", "fmi", "exportaciones",
            "salario", "impuestos", "tarifas",
        ],
    ),
    (
        "politica",
        &[
            "milei", "congreso", "senado", "diputados", "gobierno", "elecciones", "gobernador",
            "ministro", "decreto", "candidato",
        ],
    ),
    (
        "judicial",
        &[
            "justicia", "fiscal", "juez", "causa", "detenido", "tribunal", "corte suprema",
            "imputado", "sentencia", "juicio",
        ],
    ),
    (
        "internacional",
        &[
            "estados unidos", "brasil", "china", "europa", "ucrania", "onu", "trump", "embajada",
            "naciones unidas", "uruguay", "chile",
        ],
    ),
    (
        "sociedad",
        &[
            "salud", "educación", "clima", "transporte", "universidad", "hospital", "cultura",
            "tránsito", "accidente",
        ],
    ),
];

/// Section names used in `article:section` and `news_keywords` meta tags.
const SECTION_LABELS: &[(&str, &str)] = &[
    ("economía", "economia"),
    ("economia", "economia"),
    ("finanzas", "economia"),
    ("política", "politica"),
    ("politica", "politica"),
    ("policiales", "judicial"),
    ("seguridad", "judicial"),
    ("judicial", "judicial"),
    ("justicia", "judicial"),
    ("el mundo", "internacional"),
    ("mundo", "internacional"),
    ("internacional", "internacional"),
    ("sociedad", "sociedad"),
];

/// Terms that place a story in Argentina.
const ARGENTINA_KEYWORDS: &[&str] = &[
    "argentina", "argentino", "argentinos", "argentinas", "buenos aires", "caba", "rosario",
    "córdoba", "mendoza", "la plata", "milei", "kirchner", "macri", "bullrich", "casa rosada",
    "bcra", "ypf", "patagonia", "afa",
];

/// Keyword hits a text needs before it overrides the feed's category.
const MIN_CONTENT_SCORE: usize = 3;

fn word_pattern(word: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(word))).expect("static regex")
}

static KEYWORD_PATTERNS: Lazy<Vec<(&'static str, Vec<Regex>)>> = Lazy::new(|| {
    KEYWORDS
        .iter()
        .map(|(slug, words)| (*slug, words.iter().map(|w| word_pattern(w)).collect()))
        .collect()
});
static ARGENTINA_PATTERNS: Lazy<Vec<Regex>> =
    Lazy::new(|| ARGENTINA_KEYWORDS.iter().map(|w| word_pattern(w)).collect());

/// What an article exposes about its own category.
#[derive(Debug, Clone, Copy, Default)]
pub struct CategorySignals<'a> {
    pub url: &'a str,
    /// `article:section` meta tag.
    pub section: Option<&'a str>,
    /// `news_keywords` meta tag.
    pub news_keywords: Option<&'a str>,
    /// Title, excerpt and body.
    pub text: &'a str,
}

fn category_from_path(url: &str) -> Option<&'static str> {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_else(|_| url.to_lowercase());
    PATH_HINTS
        .iter()
        .find(|(segment, _)| path.contains(segment))
        .map(|(_, category)| *category)
}

fn category_from_metadata(
    section: Option<&str>,
    news_keywords: Option<&str>,
) -> Option<&'static str> {
    let from_label = |raw: &str| {
        let label = raw.trim().to_lowercase();
        SECTION_LABELS
            .iter()
            .find(|(name, _)| label == *name)
            .map(|(_, category)| *category)
    };
    section
        .and_then(from_label)
        .or_else(|| news_keywords?.split(',').find_map(from_label))
}

/// Whole-word keyword hits per category, in catalog order.
fn content_scores(text: &str) -> Vec<(&'static str, usize)> {
    KEYWORD_PATTERNS
        .iter()
        .map(|(slug, patterns)| (*slug, patterns.iter().map(|p| p.find_iter(text).count()).sum()))
        .collect()
}

fn category_from_content(text: &str, hint: &str) -> Option<&'static str> {
    let scores = content_scores(text);
    let hint_score = scores
        .iter()
        .find(|(slug, _)| *slug == hint)
        .map_or(0, |(_, score)| *score);
    scores
        .into_iter()
        .rev()
        .filter(|(_, score)| *score >= MIN_CONTENT_SCORE && *score > hint_score)
        .max_by_key(|(_, score)| *score)
        .map(|(slug, _)| slug)
}

/// True if the text mentions Argentina or a distinctly Argentine name.
fn is_about_argentina(text: &str) -> bool {
    ARGENTINA_PATTERNS.iter().any(|p| p.is_match(text))
}

/// Refine a feed's category hint.
///
/// Feeds are already per category, so the hint wins unless the URL path,
/// the page's section metadata or a clear majority of content keywords
/// place the story elsewhere, checked in that order. A story that names
/// foreign places and nothing Argentine is filed under `internacional`.
pub fn detect_category(signals: &CategorySignals<'_>, hint: &str) -> String {
    let category = category_from_path(signals.url)
        .or_else(|| category_from_metadata(signals.section, signals.news_keywords))
        .or_else(|| category_from_content(signals.text, hint))
        .unwrap_or(hint);

    let abroad = content_scores(signals.text)
        .iter()
        .any(|(slug, score)| *slug == "internacional" && *score > 0);
    if category != "internacional" && abroad && !is_about_argentina(signals.text) {
        debug!(url = signals.url, from = category, "Foreign story filed under internacional");
        return "internacional".to_string();
    }
    category.to_string()
}

/// Category keywords that appear in `text`, for SEO metadata.
pub fn matched_keywords(category: &str, text: &str) -> Vec<&'static str> {
    let lowered = text.to_lowercase();
    KEYWORDS
        .iter()
        .filter(|(slug, _)| *slug == category)
        .flat_map(|(_, words)| words.iter().copied())
        .filter(|word| lowered.contains(word))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub category: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    pub base_url: String,
    /// CSS selector for body paragraphs on detail pages.
    #[serde(default)]
    pub body_selector: Option<String>,
    pub feeds: Vec<FeedConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceCatalog {
    pub sources: Vec<SourceConfig>,
}

fn source(
    id: &str,
    name: &str,
    base_url: &str,
    body_selector: Option<&str>,
    feeds: &[(&str, &str)],
) -> SourceConfig {
    SourceConfig {
        id: id.to_string(),
        name: name.to_string(),
        base_url: base_url.to_string(),
        body_selector: body_selector.map(str::to_string),
        feeds: feeds
            .iter()
            .map(|(category, url)| FeedConfig {
                category: category.to_string(),
                url: url.to_string(),
            })
            .collect(),
    }
}

impl SourceCatalog {
    pub fn builtin() -> Self {
        Self {
            sources: vec![
                source(
                    "clarin",
                    "Clarín",
                    "https://www.clarin.com",
                    Some("div.body-nota p"),
                    &[
                        ("economia", "https://www.clarin.com/rss/economia/"),
                        ("politica", "https://www.clarin.com/rss/politica/"),
                        ("internacional", "https://www.clarin.com/rss/mundo/"),
                        ("sociedad", "https://www.clarin.com/rss/sociedad/"),
                        ("judicial", "https://www.clarin.com/rss/policiales/"),
                    ],
                ),
                source(
                    "lanacion",
                    "La Nación",
                    "https://www.lanacion.com.ar",
                    Some("section.article-body p"),
                    &[
                        (
                            "economia",
                            "https://www.lanacion.com.ar/arc/outboundfeeds/rss/category/economia/",
                        ),
                        (
                            "politica",
                            "https://www.lanacion.com.ar/arc/outboundfeeds/rss/category/politica/",
                        ),
                        (
                            "internacional",
                            "https://www.lanacion.com.ar/arc/outboundfeeds/rss/category/el-mundo/",
                        ),
                        (
                            "sociedad",
                            "https://www.lanacion.com.ar/arc/outboundfeeds/rss/category/sociedad/",
                        ),
                        (
                            "judicial",
                            "https://www.lanacion.com.ar/arc/outboundfeeds/rss/category/seguridad/",
                        ),
                    ],
                ),
                source(
                    "cronista",
                    "El Cronista",
                    "https://www.cronista.com",
                    None,
                    &[
                        ("economia", "https://www.cronista.com/rss/economia/"),
                        ("politica", "https://www.cronista.com/rss/politica/"),
                    ],
                ),
                source(
                    "ambito",
                    "Ámbito",
                    "https://www.ambito.com",
                    None,
                    &[("economia", "https://www.ambito.com/contenidos/economia.rss")],
                ),
            ],
        }
    }

    /// Parse a YAML catalog, rejecting unknown categories and empty feeds.
    pub fn from_yaml(yaml: &str, origin: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::Sources {
            path: origin.to_string(),
            reason,
        };

        let sources: Vec<SourceConfig> =
            serde_yaml::from_str(yaml).map_err(|e| invalid(e.to_string()))?;
        if sources.is_empty() {
            return Err(invalid("catalog has no sources".to_string()));
        }
        for src in &sources {
            if src.feeds.is_empty() {
                return Err(invalid(format!("source {} has no feeds", src.id)));
            }
            if let Some(feed) = src.feeds.iter().find(|f| category_id(&f.category).is_none()) {
                return Err(invalid(format!(
                    "source {} uses unknown category {}",
                    src.id, feed.category
                )));
            }
            if let Some(selector) = &src.body_selector {
                scraper::Selector::parse(selector).map_err(|e| {
                    invalid(format!("source {} has invalid body_selector: {e}", src.id))
                })?;
            }
        }
        Ok(Self { sources })
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let origin = path.display().to_string();
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Sources {
                path: origin.clone(),
                reason: e.to_string(),
            })?;
        let catalog = Self::from_yaml(&yaml, &origin)?;
        info!(path = %origin, sources = catalog.sources.len(), "Loaded source catalog");
        Ok(catalog)
    }

    /// Every `(source, feed)` pair; the crawl's unit of isolation.
    pub fn pairs(&self) -> impl Iterator<Item = (&SourceConfig, &FeedConfig)> {
        self.sources
            .iter()
            .flat_map(|src| src.feeds.iter().map(move |feed| (src, feed)))
    }
}
