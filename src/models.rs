//! Data models shared across pipeline stages.
//!
//! - [`RawCandidate`]: a scraped, not-yet-deduplicated article
//! - [`RewriteJob`]: one unit of LLM work and its lifecycle
//! - [`NewArticle`] / [`Article`]: the persisted entity before and after insert
//! - [`ImageRef`]: either an uploaded image or the explicit placeholder
//! - [`RunStats`]: per-cycle counters logged and reported at cycle end
//!
//! Candidates are never persisted directly; only the uploader turns a
//! rewritten candidate into a [`NewArticle`].

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A freshly scraped article record.
///
/// `source_url` is the natural key used for deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    /// Identifier of the source adapter (e.g. `clarin`).
    pub source_id: String,
    /// Human readable source name (e.g. `Clarín`).
    pub source_name: String,
    pub source_url: String,
    /// Category slug (e.g. `economia`).
    pub category: String,
    pub title: String,
    pub excerpt: String,
    pub body: Option<String>,
    /// Lead image URLs in preference order: feed media first, then the page's `og:image`.
    pub image_candidates: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
}

impl RawCandidate {
    /// The text handed to the rewriter: the full body when available, the excerpt otherwise.
    pub fn text(&self) -> &str {
        match self.body.as_deref() {
            Some(body) if !body.trim().is_empty() => body,
            _ => &self.excerpt,
        }
    }
}

/// Editorial register of the rewritten article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    #[default]
    Formal,
    Casual,
    Investigative,
    Opinion,
}

/// Attitude the rewrite takes towards its subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    #[default]
    Neutral,
    Critical,
    Supportive,
}

/// Requested length of the rewrite relative to the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LengthChange {
    Shorter,
    #[default]
    Same,
    Longer,
}

/// Knobs for a single rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RewriteOptions {
    pub style: Style,
    pub tone: Tone,
    pub length: LengthChange,
    pub preserve_facts: bool,
    /// Overrides the client's default model when set.
    pub model: Option<String>,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            style: Style::default(),
            tone: Tone::default(),
            length: LengthChange::default(),
            preserve_facts: true,
            model: None,
        }
    }
}

/// Output of a single LLM rewrite or summary call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteResult {
    pub rewritten_text: String,
    pub tokens_used: u32,
    pub cost: f64,
    pub model: String,
}

/// A generated headline, optionally with a subtitle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Headline {
    pub title: String,
    pub subtitle: Option<String>,
}

/// Everything the rewriting stage produces for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewrittenArticle {
    pub title: String,
    pub subtitle: Option<String>,
    pub excerpt: String,
    pub body: String,
    pub tokens_used: u32,
    pub cost: f64,
    pub model: String,
}

/// Lifecycle of a [`RewriteJob`]. The result only exists in the completed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed(RewrittenArticle),
    Failed(String),
}

/// Payload-free view of [`JobState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A unit of LLM work owned by the rewriting subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteJob {
    pub id: Uuid,
    /// Source URL of the candidate being rewritten.
    pub target: String,
    pub options: RewriteOptions,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RewriteJob {
    pub fn new(target: impl Into<String>, options: RewriteOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            options,
            state: JobState::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self.state {
            JobState::Pending => JobStatus::Pending,
            JobState::Processing => JobStatus::Processing,
            JobState::Completed(_) => JobStatus::Completed,
            JobState::Failed(_) => JobStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Completed(_) | JobState::Failed(_))
    }

    pub fn result(&self) -> Option<&RewrittenArticle> {
        match &self.state {
            JobState::Completed(result) => Some(result),
            _ => None,
        }
    }

    /// `pending -> processing`. Returns false if the job was not pending.
    pub fn start(&mut self) -> bool {
        if matches!(self.state, JobState::Pending) {
            self.state = JobState::Processing;
            true
        } else {
            false
        }
    }

    /// Moves a non-terminal job to completed.
    pub fn complete(&mut self, result: RewrittenArticle) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = JobState::Completed(result);
        self.completed_at = Some(Utc::now());
        true
    }

    /// Moves a non-terminal job to failed.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = JobState::Failed(error.into());
        self.completed_at = Some(Utc::now());
        true
    }
}

/// Publication status of a persisted article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    Draft,
    #[default]
    Published,
    Archived,
}

/// How an article entered the store. Stored as an integer column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SourceType {
    #[default]
    ScrapedRewritten,
    Manual,
}

impl From<SourceType> for u8 {
    fn from(value: SourceType) -> Self {
        match value {
            SourceType::ScrapedRewritten => 0,
            SourceType::Manual => 1,
        }
    }
}

impl TryFrom<u8> for SourceType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SourceType::ScrapedRewritten),
            1 => Ok(SourceType::Manual),
            other => Err(format!("unknown source_type {other}")),
        }
    }
}

/// Reference to an article's image: an uploaded object or the placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageRef {
    Stored { path: String, public_url: String },
    Placeholder,
}

impl ImageRef {
    /// `(image_url, image_path)` column values.
    pub fn columns(&self, placeholder_url: &str) -> (String, Option<String>) {
        match self {
            ImageRef::Stored { path, public_url } => (public_url.clone(), Some(path.clone())),
            ImageRef::Placeholder => (placeholder_url.to_string(), None),
        }
    }
}

/// An article ready to be inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewArticle {
    pub slug: String,
    pub category_id: i64,
    pub category_slug: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub excerpt: String,
    pub body: String,
    pub image_url: String,
    pub image_path: Option<String>,
    /// Image URL found by the crawler, kept so missing images can be backfilled.
    pub original_image_url: Option<String>,
    pub source: String,
    pub source_type: SourceType,
    pub source_url: String,
    pub status: ArticleStatus,
    pub is_breaking: bool,
    pub published_at: DateTime<Utc>,
    pub meta_description: Option<String>,
    pub meta_keywords: Option<String>,
}

/// A persisted article row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: Uuid,
    pub slug: String,
    pub category_id: i64,
    pub category_slug: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub excerpt: String,
    pub body: String,
    pub image_url: String,
    pub image_path: Option<String>,
    pub original_image_url: Option<String>,
    pub source: String,
    pub source_type: SourceType,
    pub source_url: String,
    pub status: ArticleStatus,
    pub views: i64,
    pub is_breaking: bool,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub meta_description: Option<String>,
    pub meta_keywords: Option<String>,
}

impl Article {
    /// Materializes a row from a [`NewArticle`] with fresh id and timestamps.
    pub fn from_new(new: NewArticle) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            slug: new.slug,
            category_id: new.category_id,
            category_slug: new.category_slug,
            title: new.title,
            subtitle: new.subtitle,
            excerpt: new.excerpt,
            body: new.body,
            image_url: new.image_url,
            image_path: new.image_path,
            original_image_url: new.original_image_url,
            source: new.source,
            source_type: new.source_type,
            source_url: new.source_url,
            status: new.status,
            views: 0,
            is_breaking: new.is_breaking,
            published_at: new.published_at,
            created_at: now,
            updated_at: now,
            meta_description: new.meta_description,
            meta_keywords: new.meta_keywords,
        }
    }

    pub fn has_placeholder_image(&self) -> bool {
        self.image_path.is_none()
    }
}

/// Counters for one pipeline cycle.
///
/// Per-item failures end up here instead of stopping the cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub started_at: Option<DateTime<Utc>>,
    /// Candidates produced by the crawler.
    pub found: usize,
    /// Dropped by the dedup gate (already stored or repeated this cycle).
    pub deduped: usize,
    pub rewritten: usize,
    /// Per-item failures across all stages.
    pub failed: usize,
    pub images_ok: usize,
    pub placeholders: usize,
    pub uploaded: usize,
    /// Already stored by the time of upload.
    pub skipped: usize,
    pub deferred: usize,
    pub deleted: usize,
    pub failed_feeds: usize,
    pub tokens_used: u64,
    pub cost: f64,
    pub elapsed_ms: u64,
    /// Why the cycle stopped early, if it did.
    pub aborted: Option<String>,
}

impl RunStats {
    pub fn succeeded(&self) -> bool {
        self.aborted.is_none()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn candidate(url: &str, title: &str) -> RawCandidate {
        RawCandidate {
            source_id: "clarin".to_string(),
            source_name: "Clarín".to_string(),
            source_url: url.to_string(),
            category: "economia".to_string(),
            title: title.to_string(),
            excerpt: "El dólar cerró en alza.".to_string(),
            body: Some("El dólar cerró en alza por tercera jornada consecutiva.".to_string()),
            image_candidates: vec!["https://img.site/fotos/dolar-2025.jpg".to_string()],
            published_at: Utc::now(),
            scraped_at: Utc::now(),
        }
    }

    pub fn new_article(url: &str, published_at: DateTime<Utc>) -> NewArticle {
        NewArticle {
            slug: format!("nota-{}", url.len()),
            category_id: 1,
            category_slug: "economia".to_string(),
            title: "Nota".to_string(),
            subtitle: None,
            excerpt: "Resumen".to_string(),
            body: "<p>Cuerpo</p>".to_string(),
            image_url: "/placeholder.jpg".to_string(),
            image_path: None,
            original_image_url: None,
            source: "Clarín".to_string(),
            source_type: SourceType::ScrapedRewritten,
            source_url: url.to_string(),
            status: ArticleStatus::Published,
            is_breaking: false,
            published_at,
            meta_description: None,
            meta_keywords: None,
        }
    }
}
