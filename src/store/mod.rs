//! Persistence collaborators: the article table and the image bucket.
//!
//! Two backends implement these traits:
//! - [`memory`]: process-local, used by tests and dry runs
//! - [`supabase`]: PostgREST table plus Supabase Storage bucket
//!
//! `source_url` is the article's natural key. Both backends enforce its
//! uniqueness themselves so that overlapping cycles can never insert twice.

pub mod memory;
pub mod supabase;

use crate::error::StoreError;
use crate::models::{Article, NewArticle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

/// What an idempotent insert did.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Inserted(Article),
    /// A row with the same `source_url` already existed and was left untouched.
    Existing(Article),
}

#[async_trait]
pub trait ArticleStore: Send + Sync {
    async fn exists_by_source_url(&self, source_url: &str) -> Result<bool, StoreError>;

    /// Insert unless a row with the same `source_url` exists.
    async fn insert_if_absent(&self, article: NewArticle) -> Result<UpsertOutcome, StoreError>;

    /// Delete articles published before `cutoff`, returning the removed rows.
    async fn delete_published_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Article>, StoreError>;

    /// Bucket paths still referenced by some article.
    async fn referenced_image_paths(&self) -> Result<HashSet<String>, StoreError>;

    /// Most recent articles still showing the placeholder image that have a
    /// source image to retry.
    async fn articles_missing_image(&self, limit: usize) -> Result<Vec<Article>, StoreError>;

    async fn set_image(&self, id: Uuid, image_url: &str, image_path: &str)
    -> Result<(), StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Upload (overwriting) `bytes` at `path`; returns the public URL.
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError>;

    /// Object paths under `prefix`, including the prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Remove objects; returns how many were removed.
    async fn remove(&self, paths: &[String]) -> Result<usize, StoreError>;

    fn public_url(&self, path: &str) -> String;
}
