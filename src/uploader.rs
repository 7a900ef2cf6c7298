//! Persists rewritten articles together with their images.
//!
//! An article is never lost because of its image. When there is no usable
//! image, or the bucket upload fails, the row is inserted with the
//! placeholder image (`ImageFailurePolicy::Placeholder`), or the whole item
//! is parked until the next cycle (`ImageFailurePolicy::Defer`). Placeholder
//! rows keep the crawler's image URL so [`StorageUploader::backfill_images`]
//! can try again later.

use crate::error::StoreError;
use crate::images::{ImageProcessor, ProcessedImage};
use crate::models::{
    Article, ArticleStatus, ImageRef, NewArticle, RawCandidate, RewrittenArticle, SourceType,
};
use crate::scrapers::sources::{category_id, matched_keywords};
use crate::store::{ArticleStore, ImageStore, UpsertOutcome};
use crate::utils::{article_slug, excerpt_from, strip_html};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Neutral "Sin imagen" card; the article table requires a non-null image URL.
pub const DEFAULT_PLACEHOLDER_IMAGE: &str = "data:image/svg+xml,%3Csvg xmlns=%22http://www.w3.org/2000/svg%22 width=%22800%22 height=%22400%22%3E%3Crect width=%22800%22 height=%22400%22 fill=%22%23e5e7eb%22/%3E%3Ctext x=%2250%25%22 y=%2250%25%22 dominant-baseline=%22middle%22 text-anchor=%22middle%22 font-family=%22sans-serif%22 font-size=%2224%22 fill=%22%239ca3af%22%3ESin imagen%3C/text%3E%3C/svg%3E";

const META_DESCRIPTION_CHARS: usize = 157;
/// A deferred item falls back to the placeholder after this many failed uploads.
const MAX_DEFERRED_ATTEMPTS: u32 = 3;

/// What to do with an article whose image could not be uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ImageFailurePolicy {
    /// Publish now with the placeholder image.
    #[default]
    Placeholder,
    /// Hold the article back and retry the upload next cycle.
    Defer,
}

#[derive(Debug, Clone)]
pub struct UploaderSettings {
    pub placeholder_url: String,
    pub failure_policy: ImageFailurePolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Inserted { article: Article },
    AlreadyPresent { article: Article },
    Deferred,
}

#[derive(Debug, Clone)]
struct DeferredUpload {
    candidate: RawCandidate,
    rewritten: RewrittenArticle,
    image: ProcessedImage,
    attempts: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackfillReport {
    pub attempted: usize,
    pub filled: usize,
}

pub struct StorageUploader {
    articles: Arc<dyn ArticleStore>,
    images: Arc<dyn ImageStore>,
    settings: UploaderSettings,
    deferred: Mutex<Vec<DeferredUpload>>,
    /// Articles whose source image was rejected; later backfills pass over them.
    unusable_sources: Mutex<HashSet<Uuid>>,
}

/// Bucket path for an article image: `articles/{slug}-{hash8}.jpg`.
pub fn object_path(slug: &str, image_hash: &str) -> String {
    let short = image_hash.get(..8).unwrap_or(image_hash);
    format!("articles/{slug}-{short}.jpg")
}

impl StorageUploader {
    pub fn new(
        articles: Arc<dyn ArticleStore>,
        images: Arc<dyn ImageStore>,
        settings: UploaderSettings,
    ) -> Self {
        Self {
            articles,
            images,
            settings,
            deferred: Mutex::new(Vec::new()),
            unusable_sources: Mutex::new(HashSet::new()),
        }
    }

    /// Source URLs currently parked for a retry.
    pub fn deferred_urls(&self) -> Vec<String> {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|d| d.candidate.source_url.clone())
            .collect()
    }

    /// Insert the article unless its `source_url` is already stored.
    #[instrument(level = "info", skip_all, fields(url = %candidate.source_url))]
    pub async fn upsert_article(
        &self,
        candidate: &RawCandidate,
        rewritten: &RewrittenArticle,
        image: Option<&ProcessedImage>,
    ) -> Result<UploadOutcome, StoreError> {
        self.upsert_attempt(candidate, rewritten, image, 0).await
    }

    async fn upsert_attempt(
        &self,
        candidate: &RawCandidate,
        rewritten: &RewrittenArticle,
        image: Option<&ProcessedImage>,
        previous_attempts: u32,
    ) -> Result<UploadOutcome, StoreError> {
        let slug = article_slug(&rewritten.title, &candidate.source_url);

        let image_ref = match image {
            None => ImageRef::Placeholder,
            Some(image) => match self.upload_image(&slug, image).await {
                Ok((path, public_url)) => ImageRef::Stored { path, public_url },
                Err(e) => {
                    let attempts = previous_attempts + 1;
                    if self.settings.failure_policy == ImageFailurePolicy::Defer
                        && attempts < MAX_DEFERRED_ATTEMPTS
                    {
                        warn!(error = %e, attempts, "Image upload failed; deferring article");
                        self.defer(DeferredUpload {
                            candidate: candidate.clone(),
                            rewritten: rewritten.clone(),
                            image: image.clone(),
                            attempts,
                        });
                        return Ok(UploadOutcome::Deferred);
                    }
                    warn!(error = %e, "Image upload failed; publishing with placeholder");
                    ImageRef::Placeholder
                }
            },
        };

        let original_image_url = image
            .map(|i| i.source_url.clone())
            .or_else(|| candidate.image_candidates.first().cloned());
        let article = self.new_article(candidate, rewritten, slug, &image_ref, original_image_url)?;
        match self.articles.insert_if_absent(article).await? {
            UpsertOutcome::Inserted(article) => {
                info!(
                    slug = %article.slug,
                    placeholder = article.has_placeholder_image(),
                    "Article stored"
                );
                Ok(UploadOutcome::Inserted { article })
            }
            UpsertOutcome::Existing(article) => {
                info!(slug = %article.slug, "Article already stored; skipped");
                Ok(UploadOutcome::AlreadyPresent { article })
            }
        }
    }

    /// Returns `(path, public_url)`.
    async fn upload_image(
        &self,
        slug: &str,
        image: &ProcessedImage,
    ) -> Result<(String, String), StoreError> {
        let path = object_path(slug, &image.hash);
        let public_url = self
            .images
            .upload(&path, image.bytes.clone(), ProcessedImage::CONTENT_TYPE)
            .await?;
        Ok((path, public_url))
    }

    fn defer(&self, item: DeferredUpload) {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
    }

    fn new_article(
        &self,
        candidate: &RawCandidate,
        rewritten: &RewrittenArticle,
        slug: String,
        image: &ImageRef,
        original_image_url: Option<String>,
    ) -> Result<NewArticle, StoreError> {
        let category = category_id(&candidate.category).ok_or_else(|| {
            StoreError::Backend(format!("unknown category {}", candidate.category))
        })?;
        let (image_url, image_path) = image.columns(&self.settings.placeholder_url);

        let keyword_text = format!("{} {}", rewritten.title, strip_html(&rewritten.body));
        let keywords = matched_keywords(&candidate.category, &keyword_text);

        Ok(NewArticle {
            slug,
            category_id: category,
            category_slug: candidate.category.clone(),
            title: rewritten.title.clone(),
            subtitle: rewritten.subtitle.clone(),
            excerpt: rewritten.excerpt.clone(),
            body: rewritten.body.clone(),
            image_url,
            image_path,
            original_image_url,
            source: candidate.source_name.clone(),
            source_type: SourceType::ScrapedRewritten,
            source_url: candidate.source_url.clone(),
            status: ArticleStatus::Published,
            is_breaking: false,
            published_at: candidate.published_at,
            meta_description: Some(excerpt_from(&rewritten.excerpt, META_DESCRIPTION_CHARS))
                .filter(|d| !d.is_empty()),
            meta_keywords: (!keywords.is_empty()).then(|| keywords.join(", ")),
        })
    }

    /// Retry every parked item. Items that fail again are parked again
    /// until they run out of attempts and fall back to the placeholder.
    #[instrument(level = "info", skip_all)]
    pub async fn retry_deferred(&self) -> Vec<Result<UploadOutcome, StoreError>> {
        let pending = mem::take(&mut *self.deferred.lock().unwrap_or_else(PoisonError::into_inner));
        if pending.is_empty() {
            return Vec::new();
        }
        info!(count = pending.len(), "Retrying deferred uploads");

        let mut outcomes = Vec::with_capacity(pending.len());
        for item in pending {
            outcomes.push(
                self.upsert_attempt(&item.candidate, &item.rewritten, Some(&item.image), item.attempts)
                    .await,
            );
        }
        outcomes
    }

    /// Give placeholder articles another chance at their original image.
    ///
    /// An article whose source image is rejected is not tried again by this
    /// uploader, so each run reaches `limit` rows that have not failed yet.
    #[instrument(level = "info", skip_all)]
    pub async fn backfill_images(
        &self,
        processor: &ImageProcessor,
        limit: usize,
    ) -> Result<BackfillReport, StoreError> {
        let unusable = self
            .unusable_sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let rows = self
            .articles
            .articles_missing_image(limit + unusable.len())
            .await?;

        let mut report = BackfillReport::default();
        for article in rows
            .into_iter()
            .filter(|a| !unusable.contains(&a.id))
            .take(limit)
        {
            let Some(source) = article.original_image_url.as_deref() else {
                continue;
            };
            report.attempted += 1;
            let Some(image) = processor.process(source).await else {
                self.unusable_sources
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(article.id);
                continue;
            };
            match self.upload_image(&article.slug, &image).await {
                Ok((path, public_url)) => {
                    self.articles.set_image(article.id, &public_url, &path).await?;
                    report.filled += 1;
                }
                Err(e) => warn!(slug = %article.slug, error = %e, "Backfill upload failed"),
            }
        }
        info!(attempted = report.attempted, filled = report.filled, "Backfill complete");
        Ok(report)
    }
}
