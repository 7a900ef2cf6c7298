//! Cycle orchestration.
//!
//! One cycle walks the stages in order:
//!
//! ```text
//! idle → scraping → deduping → rewriting → imaging → uploading → sweeping → idle
//! ```
//!
//! Each stage consumes the batch of the previous one. Per-item failures are
//! counted in [`RunStats`] and never stop the batch. The cancellation flag is
//! checked between stages only; work already in flight finishes or times out.
//!
//! [`Pipeline::run_continuous`] repeats cycles with an interval sleep and is
//! the only place that knows about scheduling.

use crate::dedup::DedupGate;
use crate::error::{PipelineError, StoreError};
use crate::images::{ImageProcessor, ProcessedImage};
use crate::llm::CostTracker;
use crate::models::RunStats;
use crate::outputs::json::{CycleReport, write_cycle_report};
use crate::rewrite::RewriteQueue;
use crate::scrapers::Crawler;
use crate::store::ArticleStore;
use crate::sweeper::RetentionSweeper;
use crate::uploader::{StorageUploader, UploadOutcome};
use chrono::Utc;
use clap::ValueEnum;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Continuous,
    Once,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    #[default]
    Idle,
    Scraping,
    Deduping,
    Rewriting,
    Imaging,
    Uploading,
    Sweeping,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Scraping => "scraping",
            PipelineState::Deduping => "deduping",
            PipelineState::Rewriting => "rewriting",
            PipelineState::Imaging => "imaging",
            PipelineState::Uploading => "uploading",
            PipelineState::Sweeping => "sweeping",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub retention_days: u32,
    pub interval: Duration,
    /// Pause before the next cycle after a cycle-fatal error.
    pub error_backoff: Duration,
    pub image_workers: usize,
    pub backfill_images: bool,
    pub backfill_limit: usize,
    pub report_dir: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retention_days: 3,
            interval: Duration::from_secs(3_600),
            error_backoff: Duration::from_secs(60),
            image_workers: 4,
            backfill_images: false,
            backfill_limit: 20,
            report_dir: None,
        }
    }
}

/// The collaborators a pipeline drives.
pub struct PipelineParts {
    pub crawler: Crawler,
    pub dedup: DedupGate,
    pub rewriter: RewriteQueue,
    /// `None` when image download is disabled; every article gets the placeholder.
    pub images: Option<ImageProcessor>,
    pub uploader: StorageUploader,
    pub sweeper: RetentionSweeper,
    pub store: Arc<dyn ArticleStore>,
    pub costs: Arc<CostTracker>,
}

pub struct Pipeline {
    parts: PipelineParts,
    settings: PipelineSettings,
    state: Mutex<PipelineState>,
    cancel: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(parts: PipelineParts, settings: PipelineSettings, cancel: Arc<AtomicBool>) -> Self {
        Self {
            parts,
            settings,
            state: Mutex::new(PipelineState::Idle),
            cancel,
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`, unless cancellation was requested.
    fn enter(&self, next: PipelineState) -> Result<(), PipelineError> {
        if self.cancel.load(Ordering::SeqCst) {
            self.set_state(PipelineState::Idle);
            warn!(stage = %next, "Cancellation requested; stopping cycle");
            return Err(PipelineError::Cancelled(next.as_str()));
        }
        self.set_state(next);
        info!(stage = %next, "Entering stage");
        Ok(())
    }

    fn set_state(&self, next: PipelineState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Run one full cycle.
    ///
    /// Returns `Err` only when the cycle could not run at all (store
    /// unreachable) or was cancelled. A rewriting stage stopped by a provider
    /// error still uploads what was rewritten and is reported through
    /// [`RunStats::aborted`].
    #[instrument(level = "info", skip_all)]
    pub async fn run_once(&self) -> Result<RunStats, PipelineError> {
        let t0 = Instant::now();
        let mut stats = RunStats {
            started_at: Some(Utc::now()),
            ..RunStats::default()
        };
        let parts = &self.parts;

        let stored_before = parts.store.count().await?;
        info!(stored = stored_before, "Cycle starting");

        self.enter(PipelineState::Scraping)?;
        let crawl = parts.crawler.crawl().await;
        stats.found = crawl.candidates.len();
        stats.failed_feeds = crawl.failed_feeds;
        stats.failed += crawl.dropped_items;

        self.enter(PipelineState::Deduping)?;
        parts.dedup.reset();
        parts.dedup.mark_seen(parts.uploader.deferred_urls());
        let (fresh, dedup_counts) = parts.dedup.filter(crawl.candidates).await;
        stats.deduped = dedup_counts.duplicates;
        stats.failed += dedup_counts.lookup_failures;

        self.enter(PipelineState::Rewriting)?;
        let batch = parts.rewriter.run(fresh).await;
        stats.failed += batch.failed_count();
        if let Some(reason) = &batch.aborted {
            error!(%reason, "Rewriting stopped by provider; uploading what was rewritten");
            stats.aborted = Some(reason.clone());
        }
        let rewritten = batch.into_completed();
        stats.rewritten = rewritten.len();
        stats.tokens_used = rewritten.iter().map(|(_, r)| u64::from(r.tokens_used)).sum();
        stats.cost = rewritten.iter().map(|(_, r)| r.cost).sum();

        self.enter(PipelineState::Imaging)?;
        let images: Vec<Option<ProcessedImage>> = match &parts.images {
            Some(processor) => {
                stream::iter(0..rewritten.len())
                    .map(|i| processor.first_usable(&rewritten[i].0.image_candidates))
                    .buffered(self.settings.image_workers.max(1))
                    .collect::<Vec<_>>()
                    .await
            }
            None => vec![None; rewritten.len()],
        };
        stats.images_ok = images.iter().filter(|i| i.is_some()).count();

        self.enter(PipelineState::Uploading)?;
        for outcome in parts.uploader.retry_deferred().await {
            tally(&mut stats, outcome);
        }
        for ((candidate, article), image) in rewritten.iter().zip(images.iter()) {
            let outcome = parts
                .uploader
                .upsert_article(candidate, article, image.as_ref())
                .await;
            if let Err(e) = &outcome {
                warn!(url = %candidate.source_url, error = %e, "Upload failed");
            }
            tally(&mut stats, outcome);
        }
        if self.settings.backfill_images
            && let Some(processor) = &parts.images
            && let Err(e) = parts
                .uploader
                .backfill_images(processor, self.settings.backfill_limit)
                .await
        {
            warn!(error = %e, "Image backfill failed");
        }

        self.enter(PipelineState::Sweeping)?;
        let sweep = parts.sweeper.sweep(self.settings.retention_days).await;
        stats.deleted = sweep.deleted_articles;

        self.set_state(PipelineState::Idle);
        stats.elapsed_ms = t0.elapsed().as_millis() as u64;
        log_summary(&stats);
        self.write_report(&stats).await;
        Ok(stats)
    }

    async fn write_report(&self, stats: &RunStats) {
        let Some(dir) = &self.settings.report_dir else {
            return;
        };
        let costs = self.parts.costs.get_stats();
        if let Err(e) = write_cycle_report(&CycleReport::now(stats, &costs), dir).await {
            warn!(error = %e, "Could not write cycle report");
        }
    }

    /// Run cycles until cancelled.
    ///
    /// A failed cycle is logged and retried after `error_backoff`; only
    /// cancellation ends the loop.
    #[instrument(level = "info", skip_all)]
    pub async fn run_continuous(&self) {
        let mut cycle = 0u64;
        loop {
            cycle += 1;
            info!(cycle, "Starting cycle");
            let pause = match self.run_once().await {
                Ok(_) => self.settings.interval,
                Err(PipelineError::Cancelled(_)) => break,
                Err(e) => {
                    error!(cycle, error = %e, "Cycle failed");
                    self.settings.error_backoff
                }
            };
            info!(cycle, next_in_secs = pause.as_secs(), "Sleeping until next cycle");
            if !self.sleep_unless_cancelled(pause).await {
                break;
            }
        }
        info!("Continuous mode stopped");
    }

    /// Sleep for `duration`; `false` if cancellation arrived meanwhile.
    async fn sleep_unless_cancelled(&self, duration: Duration) -> bool {
        let step = Duration::from_millis(500);
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.cancel.load(Ordering::SeqCst) {
                return false;
            }
            let nap = remaining.min(step);
            sleep(nap).await;
            remaining -= nap;
        }
        !self.cancel.load(Ordering::SeqCst)
    }
}

fn tally(stats: &mut RunStats, outcome: Result<UploadOutcome, StoreError>) {
    match outcome {
        Ok(UploadOutcome::Inserted { article }) => {
            stats.uploaded += 1;
            if article.has_placeholder_image() {
                stats.placeholders += 1;
            }
        }
        Ok(UploadOutcome::AlreadyPresent { .. }) => stats.skipped += 1,
        Ok(UploadOutcome::Deferred) => stats.deferred += 1,
        Err(_) => stats.failed += 1,
    }
}

fn log_summary(stats: &RunStats) {
    info!(
        found = stats.found,
        deduped = stats.deduped,
        rewritten = stats.rewritten,
        images_ok = stats.images_ok,
        placeholders = stats.placeholders,
        uploaded = stats.uploaded,
        skipped = stats.skipped,
        deferred = stats.deferred,
        failed = stats.failed,
        failed_feeds = stats.failed_feeds,
        deleted = stats.deleted,
        tokens = stats.tokens_used,
        cost = format!("${:.4}", stats.cost),
        elapsed_ms = stats.elapsed_ms,
        aborted = stats.aborted.is_some(),
        "Cycle complete"
    );
}
