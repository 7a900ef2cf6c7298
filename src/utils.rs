//! Helpers for slugs, hashing, text cleanup, log truncation and file system checks.

use chrono::{Local, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::error::Error;
use std::fs as stdfs;
use tokio::fs;
use tracing::{info, instrument};

/// Maximum length of the title part of a slug.
const SLUG_TITLE_MAX: usize = 100;

/// Classify the current local time into the edition name used for cycle reports.
///
/// - **Morning**: 00:00 - 08:00
/// - **Afternoon**: 08:00 - 16:00
/// - **Evening**: 16:00 - 24:00
pub fn time_of_day() -> String {
    edition_for(Local::now().time()).to_string()
}

fn edition_for(tod: NaiveTime) -> &'static str {
    let morning_high = NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN);
    let afternoon_high = NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN);

    if tod < morning_high {
        "morning"
    } else if tod < afternoon_high {
        "afternoon"
    } else {
        "evening"
    }
}

/// Truncate a string for logging, appending `…(+N bytes)` when cut.
///
/// Cuts on a char boundary so multi-byte text never panics.
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Detect if a serde_json error indicates truncated/incomplete JSON.
///
/// Models that hit their token limit return JSON cut off mid-object; callers
/// use this to tell truncation apart from a model ignoring the format.
pub fn looks_truncated(e: &serde_json::Error) -> bool {
    use serde_json::error::Category;
    matches!(e.classify(), Category::Eof)
}

fn fold_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'ä' | 'â' | 'ã' => 'a',
        'é' | 'è' | 'ë' | 'ê' => 'e',
        'í' | 'ì' | 'ï' | 'î' => 'i',
        'ó' | 'ò' | 'ö' | 'ô' | 'õ' => 'o',
        'ú' | 'ù' | 'ü' | 'û' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        other => other,
    }
}

/// Convert a title to a lowercase, ASCII, hyphen-separated slug.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(slugify_title("Milei anunció superávit"), "milei-anuncio-superavit");
/// ```
pub fn slugify_title(title: &str) -> String {
    let folded: String = title
        .to_lowercase()
        .chars()
        .map(fold_accent)
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();

    let mut slug = folded.split_whitespace().collect::<Vec<_>>().join("-");
    if slug.len() > SLUG_TITLE_MAX {
        slug.truncate(SLUG_TITLE_MAX);
        while slug.ends_with('-') {
            slug.pop();
        }
    }
    slug
}

/// Slug for a persisted article: the title slug plus a short hash of the source URL.
///
/// Two stories with the same headline from different URLs get different slugs,
/// while the same URL always maps to the same slug.
pub fn article_slug(title: &str, source_url: &str) -> String {
    let base = slugify_title(title);
    let suffix = &content_hash(&[source_url])[..8];
    if base.is_empty() {
        format!("nota-{suffix}")
    } else {
        format!("{base}-{suffix}")
    }
}

/// Hex SHA-256 over the given parts, separated so `("ab", "c")` and `("a", "bc")` differ.
pub fn content_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

static SOURCE_REFERENCES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)fuente:\s*(clar[ií]n|infobae|la\s+naci[oó]n|lanacion|el\s+cronista|[aá]mbito)(\.com(\.ar)?)?",
        r"(?i)(seg[uú]n|por)\s+(clar[ií]n|infobae|lanacion)\.com(\.ar)?",
        r"(?i)(leer|ver)\s+m[aá]s\s+en\s+[a-z]+\.com(\.ar)?",
        r"(?i)(continuar\s+leyendo|nota\s+completa|m[aá]s\s+informaci[oó]n)\s+en\s+[a-z]+\.com(\.ar)?",
        r"(?i)www\.(clarin|infobae|lanacion|cronista|ambito)\.com(\.ar)?",
        r"(?i)segu[ií]\s*nos\s+en\s+(twitter|facebook|instagram|x)",
        r"(?i)compartir\s+en\s+(twitter|facebook|instagram|whatsapp)",
        r"(?:^|\s)@[A-Za-z0-9_]{2,}",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));
static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("static regex"));

/// Remove self-references to the source outlet and normalize whitespace.
pub fn clean_text(text: &str) -> String {
    let mut cleaned = text.replace('\u{a0}', " ").replace('\u{200b}', "");
    for pattern in SOURCE_REFERENCES.iter() {
        cleaned = pattern.replace_all(&cleaned, " ").into_owned();
    }
    WHITESPACE.replace_all(&cleaned, " ").trim().to_string()
}

/// Strip HTML tags, leaving space-separated text.
pub fn strip_html(html: &str) -> String {
    let text = TAGS.replace_all(html, " ");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// First `max_chars` characters of the body's text with `...` appended when cut.
pub fn excerpt_from(body: &str, max_chars: usize) -> String {
    let text = strip_html(body);
    if text.chars().count() <= max_chars {
        return text;
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

/// Ensure a directory exists and is writable.
///
/// Creates the directory if needed, then writes and removes a probe file.
#[instrument(level = "info", skip_all, fields(path = %path))]
pub async fn ensure_writable_dir(path: &str) -> Result<(), Box<dyn Error>> {
    fs::create_dir_all(path).await?;
    let probe_path = format!("{}/..__probe_write__", path.trim_end_matches('/'));
    match stdfs::File::create(&probe_path) {
        Ok(_) => {
            let _ = stdfs::remove_file(&probe_path);
            info!("Output directory is writable");
            Ok(())
        }
        Err(e) => Err(Box::new(e)),
    }
}
