//! Retention: removes expired articles and images nothing points at.
//!
//! Sweeping is housekeeping. Every failure is logged and reported in
//! [`SweepReport::errors`], never returned to the caller.

use crate::error::StoreError;
use crate::store::{ArticleStore, ImageStore};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Bucket folder holding article images.
const IMAGE_PREFIX: &str = "articles/";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted_articles: usize,
    pub removed_images: usize,
    pub errors: usize,
}

pub struct RetentionSweeper {
    articles: Arc<dyn ArticleStore>,
    images: Arc<dyn ImageStore>,
}

impl RetentionSweeper {
    pub fn new(articles: Arc<dyn ArticleStore>, images: Arc<dyn ImageStore>) -> Self {
        Self { articles, images }
    }

    pub async fn sweep(&self, retention_days: u32) -> SweepReport {
        self.sweep_at(retention_days, Utc::now()).await
    }

    #[instrument(level = "info", skip(self))]
    pub async fn sweep_at(&self, retention_days: u32, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = now - Duration::days(i64::from(retention_days));

        match self.articles.delete_published_before(cutoff).await {
            Ok(deleted) => report.deleted_articles = deleted.len(),
            Err(e) => {
                warn!(error = %e, %cutoff, "Could not delete expired articles");
                report.errors += 1;
            }
        }

        match self.orphaned_images().await {
            Ok(orphans) if orphans.is_empty() => {}
            Ok(orphans) => match self.images.remove(&orphans).await {
                Ok(removed) => report.removed_images = removed,
                Err(e) => {
                    warn!(error = %e, count = orphans.len(), "Could not remove orphaned images");
                    report.errors += 1;
                }
            },
            Err(e) => {
                warn!(error = %e, "Could not list images");
                report.errors += 1;
            }
        }

        info!(
            deleted_articles = report.deleted_articles,
            removed_images = report.removed_images,
            errors = report.errors,
            "Sweep complete"
        );
        report
    }

    async fn orphaned_images(&self) -> Result<Vec<String>, StoreError> {
        let referenced = self.articles.referenced_image_paths().await?;
        Ok(self
            .images
            .list(IMAGE_PREFIX)
            .await?
            .into_iter()
            .filter(|path| !referenced.contains(path))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::new_article;
    use crate::store::memory::{MemoryArticleStore, MemoryImageStore};

    #[tokio::test]
    async fn test_expired_articles_and_their_images_are_removed() {
        let articles = Arc::new(MemoryArticleStore::new());
        let images = Arc::new(MemoryImageStore::new());
        let now = Utc::now();

        let mut old = new_article("https://site/old", now - Duration::days(4));
        old.image_path = Some("articles/old.jpg".to_string());
        let mut fresh = new_article("https://site/fresh-one", now - Duration::days(1));
        fresh.image_path = Some("articles/fresh.jpg".to_string());
        articles.insert_if_absent(old).await.unwrap();
        articles.insert_if_absent(fresh).await.unwrap();
        images.put("articles/old.jpg", vec![1]);
        images.put("articles/fresh.jpg", vec![2]);
        images.put("articles/never-used.jpg", vec![3]);

        let sweeper = RetentionSweeper::new(articles.clone(), images.clone());
        let report = sweeper.sweep_at(3, now).await;

        assert_eq!(
            report,
            SweepReport {
                deleted_articles: 1,
                removed_images: 2,
                errors: 0
            }
        );
        assert!(!articles.exists_by_source_url("https://site/old").await.unwrap());
        assert!(articles.exists_by_source_url("https://site/fresh-one").await.unwrap());
        assert_eq!(images.paths(), vec!["articles/fresh.jpg"]);
    }

    #[tokio::test]
    async fn test_nothing_to_sweep() {
        let sweeper = RetentionSweeper::new(
            Arc::new(MemoryArticleStore::new()),
            Arc::new(MemoryImageStore::new()),
        );
        assert_eq!(sweeper.sweep(3).await, SweepReport::default());
    }
}
