//! # Noticiero
//!
//! An automated news pipeline: it crawls RSS feeds of Argentine outlets,
//! drops articles that were already published, rewrites each one through an
//! OpenAI-compatible LLM, validates and re-encodes the lead image, and
//! publishes the result to a Supabase table and storage bucket.
//!
//! ## Usage
//!
//! ```sh
//! noticiero --run-mode once --store memory --report-dir ./reports
//! ```
//!
//! ## Architecture
//!
//! Each cycle runs these stages in order:
//! 1. **Crawl**: read feeds, fetch detail pages with human-like pacing
//! 2. **Dedup**: skip source URLs already in the store or seen this cycle
//! 3. **Rewrite**: rewrite, headline and summarize (bounded workers)
//! 4. **Images**: download, validate and re-encode lead images
//! 5. **Upload**: insert-if-absent into the table, images into the bucket
//! 6. **Sweep**: delete expired articles and orphaned images
//!
//! In continuous mode the cycle repeats every `--scrape-interval` seconds
//! until Ctrl-C.

use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod dedup;
mod error;
mod images;
mod llm;
mod models;
mod outputs;
mod pipeline;
mod rewrite;
mod scrapers;
mod store;
mod sweeper;
mod uploader;
mod utils;

use cli::{Cli, StoreBackend};
use dedup::DedupGate;
use images::{HttpImageSource, ImageProcessor, ImageSettings};
use llm::client::OpenRouterTransport;
use llm::{CostTracker, LlmClient, LlmSettings, RateLimiter};
use pipeline::{Pipeline, PipelineParts, PipelineSettings, RunMode};
use rewrite::{RewriteQueue, RewriteService, RewriteSettings};
use scrapers::fetcher::{BrowserlessFetcher, HttpFetcher, PageFetcher};
use scrapers::sources::SourceCatalog;
use scrapers::stealth::HumanLikeStealth;
use scrapers::{CrawlSettings, Crawler};
use store::memory::{MemoryArticleStore, MemoryImageStore};
use store::supabase::{SupabaseArticleStore, SupabaseClient, SupabaseImageStore};
use store::{ArticleStore, ImageStore};
use sweeper::RetentionSweeper;
use uploader::{StorageUploader, UploaderSettings};
use utils::ensure_writable_dir;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    let args = Cli::parse();

    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!(version = env!("CARGO_PKG_VERSION"), "noticiero starting up");
    debug!(run_mode = ?args.run_mode, store = ?args.store, "Parsed CLI arguments");

    if let Err(e) = args.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    // Early check: ensure the report dir is writable
    if let Some(report_dir) = &args.report_dir
        && let Err(e) = ensure_writable_dir(report_dir).await
    {
        error!(
            path = %report_dir,
            error = %e,
            "Report directory is not writable (fix perms or choose a different path)"
        );
        return Err(e);
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let pipeline = build_pipeline(&args, cancel.clone()).await?;
    spawn_ctrl_c_handler(cancel);

    let result = match args.run_mode {
        RunMode::Once => match pipeline.run_once().await {
            Ok(stats) if stats.succeeded() => Ok(()),
            Ok(stats) => {
                let reason = stats.aborted.unwrap_or_default();
                error!(%reason, "Cycle aborted");
                Err(format!("cycle aborted: {reason}").into())
            }
            Err(e) => {
                error!(error = %e, "Cycle failed");
                Err(e.into())
            }
        },
        RunMode::Continuous => {
            pipeline.run_continuous().await;
            Ok(())
        }
    };

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );
    result
}

fn spawn_ctrl_c_handler(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Shutdown requested; finishing the current stage");
                cancel.store(true, Ordering::SeqCst);
            }
            Err(e) => error!(error = %e, "Could not listen for Ctrl-C"),
        }
    });
}

/// Wire every stage from the parsed configuration. `cancel` is polled between stages.
async fn build_pipeline(args: &Cli, cancel: Arc<AtomicBool>) -> Result<Pipeline, Box<dyn Error>> {
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    // ---- Crawling ----
    let fetcher: Arc<dyn PageFetcher> = match &args.browserless_url {
        Some(url) => {
            info!("Fetching pages through Browserless");
            Arc::new(BrowserlessFetcher::new(
                http.clone(),
                url,
                args.browserless_token.as_deref(),
                args.page_timeout(),
            ))
        }
        None => Arc::new(HttpFetcher::new(http.clone(), args.page_timeout())),
    };
    let catalog = match &args.sources_file {
        Some(path) => SourceCatalog::load(path).await?,
        None => SourceCatalog::builtin(),
    };
    info!(
        sources = catalog.sources.len(),
        feeds = catalog.pairs().count(),
        "Crawl targets ready"
    );
    let crawler = Crawler::new(
        fetcher,
        Arc::new(HumanLikeStealth::default()),
        Arc::new(catalog),
        CrawlSettings {
            max_per_category: args.max_articles_per_category,
            concurrency: args.crawl_concurrency,
            page_timeout: args.page_timeout(),
            ..CrawlSettings::default()
        },
    );

    // ---- LLM ----
    let api_key = args.openrouter_api_key.clone().unwrap_or_default();
    let transport = Arc::new(OpenRouterTransport::new(
        http.clone(),
        &args.llm_base_url,
        api_key,
    ));
    let limiter = Arc::new(RateLimiter::new(
        args.llm_requests_per_minute,
        args.llm_requests_per_day,
    ));
    let costs = Arc::new(CostTracker::new());
    let client = LlmClient::new(
        transport,
        limiter,
        costs.clone(),
        LlmSettings {
            default_model: args.llm_model.clone(),
            timeout: args.llm_timeout(),
            max_retries: args.llm_max_retries,
            ..LlmSettings::default()
        },
    );
    let service = RewriteService::new(
        client,
        RewriteSettings {
            summary_model: args.llm_summary_model.clone(),
            ..RewriteSettings::default()
        },
    );
    let rewriter = RewriteQueue::new(
        Arc::new(service),
        args.rewrite_options(),
        args.rewrite_workers,
    );

    // ---- Images ----
    let images = args.download_images.then(|| {
        ImageProcessor::new(
            Arc::new(HttpImageSource::new(http.clone(), args.image_timeout())),
            ImageSettings {
                max_bytes: args.max_image_bytes,
                quality: args.image_quality,
                ..ImageSettings::default()
            },
        )
    });
    if images.is_none() {
        info!("Image download disabled; every article gets the placeholder");
    }

    // ---- Stores ----
    let (articles, buckets): (Arc<dyn ArticleStore>, Arc<dyn ImageStore>) = match args.store {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; nothing is persisted");
            (
                Arc::new(MemoryArticleStore::new()),
                Arc::new(MemoryImageStore::new()),
            )
        }
        StoreBackend::Supabase => {
            let supabase = SupabaseClient::new(
                http.clone(),
                args.supabase_url.as_deref().unwrap_or_default(),
                args.supabase_service_key.as_deref().unwrap_or_default(),
            );
            (
                Arc::new(SupabaseArticleStore::new(supabase.clone(), &args.supabase_table)),
                Arc::new(SupabaseImageStore::new(supabase, &args.supabase_bucket)),
            )
        }
    };

    let uploader = StorageUploader::new(
        articles.clone(),
        buckets.clone(),
        UploaderSettings {
            placeholder_url: args.placeholder_image_url.clone(),
            failure_policy: args.image_failure_policy,
        },
    );

    let parts = PipelineParts {
        crawler,
        dedup: DedupGate::new(articles.clone()),
        rewriter,
        images,
        uploader,
        sweeper: RetentionSweeper::new(articles.clone(), buckets),
        store: articles,
        costs,
    };
    let settings = PipelineSettings {
        retention_days: args.retention_days,
        interval: args.scrape_interval(),
        backfill_images: args.backfill_images,
        report_dir: args.report_dir.as_ref().map(PathBuf::from),
        ..PipelineSettings::default()
    };
    Ok(Pipeline::new(parts, settings, cancel))
}
