//! In-process store used for dry runs and tests.

use super::{ArticleStore, ImageStore, UpsertOutcome};
use crate::error::StoreError;
use crate::models::{Article, NewArticle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Articles keyed by `source_url`, with a unique slug check.
#[derive(Debug, Default)]
pub struct MemoryArticleStore {
    rows: Mutex<HashMap<String, Article>>,
}

impl MemoryArticleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Article> {
        let mut rows: Vec<Article> = lock(&self.rows).values().cloned().collect();
        rows.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        rows
    }

    #[cfg(test)]
    pub fn get(&self, source_url: &str) -> Option<Article> {
        lock(&self.rows).get(source_url).cloned()
    }
}

#[async_trait]
impl ArticleStore for MemoryArticleStore {
    async fn exists_by_source_url(&self, source_url: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.rows).contains_key(source_url))
    }

    async fn insert_if_absent(&self, article: NewArticle) -> Result<UpsertOutcome, StoreError> {
        let mut rows = lock(&self.rows);
        if let Some(existing) = rows.get(&article.source_url) {
            return Ok(UpsertOutcome::Existing(existing.clone()));
        }
        if rows.values().any(|row| row.slug == article.slug) {
            return Err(StoreError::Status {
                status: 409,
                body: format!("duplicate slug {}", article.slug),
            });
        }
        let row = Article::from_new(article);
        rows.insert(row.source_url.clone(), row.clone());
        Ok(UpsertOutcome::Inserted(row))
    }

    async fn delete_published_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Article>, StoreError> {
        let mut rows = lock(&self.rows);
        let expired: Vec<String> = rows
            .values()
            .filter(|row| row.published_at < cutoff)
            .map(|row| row.source_url.clone())
            .collect();
        Ok(expired.iter().filter_map(|url| rows.remove(url)).collect())
    }

    async fn referenced_image_paths(&self) -> Result<HashSet<String>, StoreError> {
        Ok(lock(&self.rows)
            .values()
            .filter_map(|row| row.image_path.clone())
            .collect())
    }

    async fn articles_missing_image(&self, limit: usize) -> Result<Vec<Article>, StoreError> {
        Ok(self
            .all()
            .into_iter()
            .filter(|a| a.has_placeholder_image() && a.original_image_url.is_some())
            .take(limit)
            .collect())
    }

    async fn set_image(
        &self,
        id: Uuid,
        image_url: &str,
        image_path: &str,
    ) -> Result<(), StoreError> {
        let mut rows = lock(&self.rows);
        let row = rows
            .values_mut()
            .find(|row| row.id == id)
            .ok_or_else(|| StoreError::Backend(format!("article {id} not found")))?;
        row.image_url = image_url.to_string();
        row.image_path = Some(image_path.to_string());
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(lock(&self.rows).len())
    }
}

/// Bucket objects kept in memory. Uploads can be made to fail for tests.
#[derive(Debug, Default)]
pub struct MemoryImageStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_uploads: AtomicBool,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn paths(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    pub fn put(&self, path: &str, bytes: Vec<u8>) {
        lock(&self.objects).insert(path.to_string(), bytes);
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, StoreError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StoreError::Status {
                status: 503,
                body: "bucket unavailable".to_string(),
            });
        }
        self.put(path, bytes);
        Ok(self.public_url(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(lock(&self.objects)
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn remove(&self, paths: &[String]) -> Result<usize, StoreError> {
        let mut objects = lock(&self.objects);
        Ok(paths.iter().filter(|p| objects.remove(*p).is_some()).count())
    }

    fn public_url(&self, path: &str) -> String {
        format!("memory://images/{path}")
    }
}
