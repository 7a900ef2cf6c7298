//! Detail-page extraction.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

/// Tried in order when the source has no selector of its own, or it matches nothing.
const FALLBACK_BODY_SELECTORS: &[&str] = &[
    "div.body-nota p",
    "section.article-body p",
    "div.article-content p",
    "div#cuerpo p",
    "article p",
];

/// Boilerplate paragraphs the outlets insert between real ones.
const BOILERPLATE_PREFIXES: &[&str] = &[
    "mirá también",
    "mira también",
    "lee también",
    "te puede interesar",
    "seguí leyendo",
    "newsletter",
    "suscribite",
];

const MIN_PARAGRAPH_CHARS: usize = 25;

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

static H1: Lazy<Selector> = Lazy::new(|| selector("h1"));
static OG_TITLE: Lazy<Selector> = Lazy::new(|| selector(r#"meta[property="og:title"]"#));
static OG_IMAGE: Lazy<Selector> = Lazy::new(|| selector(r#"meta[property="og:image"]"#));
static OG_DESCRIPTION: Lazy<Selector> = Lazy::new(|| selector(r#"meta[property="og:description"]"#));
static META_DESCRIPTION: Lazy<Selector> = Lazy::new(|| selector(r#"meta[name="description"]"#));
static SECTION: Lazy<Selector> = Lazy::new(|| {
    selector(r#"meta[property="article:section"], meta[name="category"]"#)
});
static NEWS_KEYWORDS: Lazy<Selector> = Lazy::new(|| selector(r#"meta[name="news_keywords"]"#));
static PUBLISHED: Lazy<Selector> =
    Lazy::new(|| selector(r#"meta[property="article:published_time"]"#));
static TIME: Lazy<Selector> = Lazy::new(|| selector("time[datetime]"));
static FALLBACKS: Lazy<Vec<Selector>> =
    Lazy::new(|| FALLBACK_BODY_SELECTORS.iter().map(|css| selector(css)).collect());

/// What a detail page yielded. Every field is optional; the feed item fills gaps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageExtract {
    pub title: Option<String>,
    /// Body paragraphs joined by blank lines.
    pub body: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// `article:section` (or `category`) meta tag, e.g. `Economía`.
    pub section: Option<String>,
    /// Comma separated `news_keywords` meta tag.
    pub news_keywords: Option<String>,
}

fn meta_content(doc: &Html, sel: &Selector) -> Option<String> {
    doc.select(sel)
        .filter_map(|m| m.value().attr("content"))
        .map(str::trim)
        .find(|c| !c.is_empty())
        .map(str::to_string)
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_boilerplate(paragraph: &str) -> bool {
    let lowered = paragraph.to_lowercase();
    BOILERPLATE_PREFIXES.iter().any(|p| lowered.starts_with(p))
}

fn paragraphs(doc: &Html, sel: &Selector) -> Vec<String> {
    doc.select(sel)
        .map(element_text)
        .filter(|p| p.chars().count() >= MIN_PARAGRAPH_CHARS && !is_boilerplate(p))
        .collect()
}

/// Extract title, body and metadata from an article page.
///
/// `body_selector` is the source's own paragraph selector, tried before the
/// generic fallbacks.
pub fn extract_article(html: &str, body_selector: Option<&str>) -> PageExtract {
    let doc = Html::parse_document(html);

    let own = body_selector.and_then(|css| Selector::parse(css).ok());
    let body = own
        .iter()
        .chain(FALLBACKS.iter())
        .map(|sel| paragraphs(&doc, sel))
        .find(|ps| !ps.is_empty())
        .map(|ps| ps.join("\n\n"));
    if body.is_none() {
        debug!("No body paragraphs matched");
    }

    let title = doc
        .select(&H1)
        .map(element_text)
        .find(|t| !t.is_empty())
        .or_else(|| meta_content(&doc, &OG_TITLE));

    let published_at = meta_content(&doc, &PUBLISHED)
        .or_else(|| {
            doc.select(&TIME)
                .filter_map(|t| t.value().attr("datetime"))
                .map(str::to_string)
                .next()
        })
        .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc));

    PageExtract {
        title,
        body,
        description: meta_content(&doc, &OG_DESCRIPTION)
            .or_else(|| meta_content(&doc, &META_DESCRIPTION)),
        image_url: meta_content(&doc, &OG_IMAGE),
        published_at,
        section: meta_content(&doc, &SECTION),
        news_keywords: meta_content(&doc, &NEWS_KEYWORDS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head>
        <meta property="og:title" content="Título OG">
        <meta property="og:image" content="https://img.clarin.com/2025/11/16/foto-principal.jpg">
        <meta name="description" content="Bajada de la nota">
        <meta property="article:published_time" content="2025-11-16T10:30:00-03:00">
        <meta property="article:section" content="Economía">
        <meta name="news_keywords" content="dólar, BCRA, mercados">
      </head><body>
        <h1> El dólar  cerró en alza </h1>
        <div class="body-nota">
          <p>El dólar oficial cerró en alza por tercera jornada consecutiva.</p>
          <p>Mirá también: las tasas de plazo fijo de hoy en todos los bancos</p>
          <p>corto</p>
          <p>Los analistas atribuyen la suba a la demanda de cobertura.</p>
        </div>
      </body></html>"#;

    #[test]
    fn test_extracts_body_and_metadata() {
        let page = extract_article(PAGE, Some("div.body-nota p"));
        assert_eq!(page.title.as_deref(), Some("El dólar cerró en alza"));
        assert_eq!(
            page.body.as_deref(),
            Some(
                "El dólar oficial cerró en alza por tercera jornada consecutiva.\n\nLos analistas atribuyen la suba a la demanda de cobertura."
            )
        );
        assert_eq!(page.description.as_deref(), Some("Bajada de la nota"));
        assert_eq!(
            page.image_url.as_deref(),
            Some("https://img.clarin.com/2025/11/16/foto-principal.jpg")
        );
        assert_eq!(
            page.published_at.unwrap().to_rfc3339(),
            "2025-11-16T13:30:00+00:00"
        );
        assert_eq!(page.section.as_deref(), Some("Economía"));
        assert_eq!(page.news_keywords.as_deref(), Some("dólar, BCRA, mercados"));
    }

    #[test]
    fn test_falls_back_to_generic_selectors() {
        let html = r#"<article><p>Un párrafo suficientemente largo como para contar.</p></article>"#;
        let page = extract_article(html, Some("div.no-existe p"));
        assert_eq!(
            page.body.as_deref(),
            Some("Un párrafo suficientemente largo como para contar.")
        );
        assert!(page.title.is_none());
    }

    #[test]
    fn test_broken_markup_yields_empty_extract() {
        let page = extract_article("<html><body><div", None);
        assert_eq!(page, PageExtract::default());
    }
}
