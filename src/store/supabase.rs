//! Supabase backend: PostgREST for the article table, Storage for images.
//!
//! Idempotent inserts rely on the table's unique constraint on `source_url`:
//! the insert is sent with `on_conflict=source_url` and
//! `Prefer: resolution=ignore-duplicates`, so a repeated `source_url` returns
//! an empty representation instead of a second row.

use super::{ArticleStore, ImageStore, UpsertOutcome};
use crate::error::StoreError;
use crate::models::{Article, NewArticle};
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Shared connection details for both Supabase APIs.
#[derive(Clone)]
pub struct SupabaseClient {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl fmt::Debug for SupabaseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupabaseClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SupabaseClient {
    pub fn new(http: reqwest::Client, base_url: &str, service_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }
}

async fn checked(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body: truncate_for_log(&body, 300),
    })
}

async fn json_body<T: DeserializeOwned>(response: Response) -> Result<T, StoreError> {
    let bytes = checked(response).await?.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone)]
pub struct SupabaseArticleStore {
    client: SupabaseClient,
    table: String,
}

impl SupabaseArticleStore {
    pub fn new(client: SupabaseClient, table: &str) -> Self {
        Self {
            client,
            table: table.to_string(),
        }
    }

    fn endpoint(&self, query: &str) -> String {
        format!("{}/rest/v1/{}?{}", self.client.base_url, self.table, query)
    }

    async fn find_by_source_url(&self, source_url: &str) -> Result<Option<Article>, StoreError> {
        let url = self.endpoint(&format!(
            "select=*&source_url=eq.{}&limit=1",
            urlencoding::encode(source_url)
        ));
        let response = self.client.authorized(self.client.http.get(url)).send().await?;
        let rows: Vec<Article> = json_body(response).await?;
        Ok(rows.into_iter().next())
    }
}

#[derive(Deserialize)]
struct ImagePathRow {
    image_path: Option<String>,
}

#[async_trait]
impl ArticleStore for SupabaseArticleStore {
    async fn exists_by_source_url(&self, source_url: &str) -> Result<bool, StoreError> {
        let url = self.endpoint(&format!(
            "select=id&source_url=eq.{}&limit=1",
            urlencoding::encode(source_url)
        ));
        let response = self.client.authorized(self.client.http.get(url)).send().await?;
        let rows: Vec<serde_json::Value> = json_body(response).await?;
        Ok(!rows.is_empty())
    }

    #[instrument(level = "debug", skip_all, fields(source_url = %article.source_url))]
    async fn insert_if_absent(&self, article: NewArticle) -> Result<UpsertOutcome, StoreError> {
        let source_url = article.source_url.clone();
        let response = self
            .client
            .authorized(self.client.http.post(self.endpoint("on_conflict=source_url")))
            .header("Prefer", "resolution=ignore-duplicates,return=representation")
            .json(&[article])
            .send()
            .await?;
        let inserted: Vec<Article> = json_body(response).await?;

        if let Some(row) = inserted.into_iter().next() {
            return Ok(UpsertOutcome::Inserted(row));
        }
        debug!("Row already present");
        self.find_by_source_url(&source_url)
            .await?
            .map(UpsertOutcome::Existing)
            .ok_or_else(|| {
                StoreError::Backend(format!(
                    "insert of {source_url} was ignored but no existing row was found"
                ))
            })
    }

    async fn delete_published_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Article>, StoreError> {
        let url = self.endpoint(&format!(
            "published_at=lt.{}",
            urlencoding::encode(&timestamp(cutoff))
        ));
        let response = self
            .client
            .authorized(self.client.http.delete(url))
            .header("Prefer", "return=representation")
            .send()
            .await?;
        json_body(response).await
    }

    async fn referenced_image_paths(&self) -> Result<HashSet<String>, StoreError> {
        let url = self.endpoint("select=image_path&image_path=not.is.null");
        let response = self.client.authorized(self.client.http.get(url)).send().await?;
        let rows: Vec<ImagePathRow> = json_body(response).await?;
        Ok(rows.into_iter().filter_map(|r| r.image_path).collect())
    }

    async fn articles_missing_image(&self, limit: usize) -> Result<Vec<Article>, StoreError> {
        let url = self.endpoint(&format!(
            "select=*&image_path=is.null&original_image_url=not.is.null&order=published_at.desc&limit={limit}"
        ));
        let response = self.client.authorized(self.client.http.get(url)).send().await?;
        json_body(response).await
    }

    async fn set_image(
        &self,
        id: Uuid,
        image_url: &str,
        image_path: &str,
    ) -> Result<(), StoreError> {
        let response = self
            .client
            .authorized(self.client.http.patch(self.endpoint(&format!("id=eq.{id}"))))
            .json(&json!({
                "image_url": image_url,
                "image_path": image_path,
                "updated_at": timestamp(Utc::now()),
            }))
            .send()
            .await?;
        checked(response).await?;
        Ok(())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let response = self
            .client
            .authorized(self.client.http.get(self.endpoint("select=id&limit=1")))
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let response = checked(response).await?;
        response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| StoreError::Backend("missing Content-Range total".to_string()))
    }
}

/// Total from a PostgREST `Content-Range` header such as `0-0/42` or `*/0`.
fn parse_content_range_total(header: &str) -> Option<usize> {
    header.rsplit('/').next()?.trim().parse().ok()
}

#[derive(Debug, Clone)]
pub struct SupabaseImageStore {
    client: SupabaseClient,
    bucket: String,
}

#[derive(Deserialize)]
struct StorageObject {
    name: String,
}

impl SupabaseImageStore {
    pub fn new(client: SupabaseClient, bucket: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
        }
    }

    fn storage(&self, tail: &str) -> String {
        format!("{}/storage/v1/{}", self.client.base_url, tail)
    }
}

#[async_trait]
impl ImageStore for SupabaseImageStore {
    #[instrument(level = "debug", skip_all, fields(%path, bytes = bytes.len()))]
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError> {
        let url = self.storage(&format!("object/{}/{}", self.bucket, path));
        let response = self
            .client
            .authorized(self.client.http.post(url))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await?;
        checked(response).await?;
        Ok(self.public_url(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let folder = prefix.trim_end_matches('/');
        let mut paths = Vec::new();
        let mut offset = 0usize;
        const PAGE: usize = 1000;
        loop {
            let response = self
                .client
                .authorized(
                    self.client
                        .http
                        .post(self.storage(&format!("object/list/{}", self.bucket))),
                )
                .json(&json!({ "prefix": folder, "limit": PAGE, "offset": offset }))
                .send()
                .await?;
            let page: Vec<StorageObject> = json_body(response).await?;
            let fetched = page.len();
            paths.extend(page.into_iter().map(|o| format!("{folder}/{}", o.name)));
            if fetched < PAGE {
                return Ok(paths);
            }
            offset += fetched;
        }
    }

    async fn remove(&self, paths: &[String]) -> Result<usize, StoreError> {
        if paths.is_empty() {
            return Ok(0);
        }
        let response = self
            .client
            .authorized(
                self.client
                    .http
                    .delete(self.storage(&format!("object/{}", self.bucket))),
            )
            .json(&json!({ "prefixes": paths }))
            .send()
            .await?;
        let removed: Vec<serde_json::Value> = json_body(response).await?;
        Ok(removed.len())
    }

    fn public_url(&self, path: &str) -> String {
        self.storage(&format!("object/public/{}/{}", self.bucket, path))
    }
}
