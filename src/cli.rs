//! Command-line interface and configuration.
//!
//! Every option can be given as a flag or through the environment variable
//! named next to it; a `.env` file is loaded before parsing. [`Cli::validate`]
//! rejects missing credentials and out-of-range values before anything starts.

use crate::error::ConfigError;
use crate::llm::client::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::models::{LengthChange, RewriteOptions, Style, Tone};
use crate::pipeline::RunMode;
use crate::uploader::{DEFAULT_PLACEHOLDER_IMAGE, ImageFailurePolicy};
use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Where articles and images are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum StoreBackend {
    #[default]
    Supabase,
    /// Process memory; nothing survives a restart. For dry runs.
    Memory,
}

/// Scrape news feeds, rewrite the articles with an LLM and publish them.
///
/// # Examples
///
/// ```sh
/// # One cycle against an in-memory store
/// noticiero --run-mode once --store memory
///
/// # Hourly cycles, rendering pages through a headless browser
/// BROWSERLESS_URL=http://localhost:3000 noticiero --scrape-interval 3600
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// OpenRouter (or compatible) API key
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    pub openrouter_api_key: Option<String>,

    /// Chat-completions base URL
    #[arg(long, env = "LLM_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub llm_base_url: String,

    /// Model used for rewrites and headlines
    #[arg(long, env = "LLM_MODEL", default_value = DEFAULT_MODEL)]
    pub llm_model: String,

    /// Cheaper model for summaries (defaults to --llm-model)
    #[arg(long, env = "LLM_SUMMARY_MODEL")]
    pub llm_summary_model: Option<String>,

    #[arg(long, env = "LLM_TIMEOUT_SECS", default_value_t = 120)]
    pub llm_timeout_secs: u64,

    /// Total attempts per LLM call, first one included
    #[arg(long, env = "LLM_MAX_RETRIES", default_value_t = 3)]
    pub llm_max_retries: u32,

    #[arg(long, env = "LLM_REQUESTS_PER_MINUTE", default_value_t = 20)]
    pub llm_requests_per_minute: u32,

    #[arg(long, env = "LLM_REQUESTS_PER_DAY", default_value_t = 1000)]
    pub llm_requests_per_day: u32,

    /// Concurrent rewrite workers
    #[arg(long, env = "REWRITE_WORKERS", default_value_t = 3)]
    pub rewrite_workers: usize,

    #[arg(long, env = "REWRITE_STYLE", value_enum, default_value_t = Style::Formal)]
    pub rewrite_style: Style,

    #[arg(long, env = "REWRITE_TONE", value_enum, default_value_t = Tone::Neutral)]
    pub rewrite_tone: Tone,

    #[arg(long, env = "REWRITE_LENGTH", value_enum, default_value_t = LengthChange::Same)]
    pub rewrite_length: LengthChange,

    #[arg(long, env = "RUN_MODE", value_enum, default_value_t = RunMode::Continuous)]
    pub run_mode: RunMode,

    /// Seconds between cycles in continuous mode
    #[arg(long, env = "SCRAPE_INTERVAL", default_value_t = 3600)]
    pub scrape_interval: u64,

    #[arg(long, env = "MAX_ARTICLES_PER_CATEGORY", default_value_t = 10)]
    pub max_articles_per_category: usize,

    /// Feeds crawled at the same time
    #[arg(long, env = "CRAWL_CONCURRENCY", default_value_t = 4)]
    pub crawl_concurrency: usize,

    #[arg(long, env = "PAGE_TIMEOUT_SECS", default_value_t = 30)]
    pub page_timeout_secs: u64,

    /// Browserless base URL; pages are fetched with plain HTTP when unset
    #[arg(long, env = "BROWSERLESS_URL")]
    pub browserless_url: Option<String>,

    #[arg(long, env = "BROWSERLESS_TOKEN", hide_env_values = true)]
    pub browserless_token: Option<String>,

    /// YAML source catalog replacing the built-in one
    #[arg(long, env = "SOURCES_FILE")]
    pub sources_file: Option<PathBuf>,

    /// Articles older than this many days are deleted
    #[arg(long, env = "RETENTION_DAYS", default_value_t = 3)]
    pub retention_days: u32,

    #[arg(long, env = "DOWNLOAD_IMAGES", default_value_t = true, action = ArgAction::Set)]
    pub download_images: bool,

    /// JPEG quality for re-encoded images (1-100)
    #[arg(long, env = "IMAGE_QUALITY", default_value_t = 85)]
    pub image_quality: u8,

    #[arg(long, env = "MAX_IMAGE_BYTES", default_value_t = 8 * 1024 * 1024)]
    pub max_image_bytes: u64,

    #[arg(long, env = "IMAGE_TIMEOUT_SECS", default_value_t = 30)]
    pub image_timeout_secs: u64,

    #[arg(long, env = "IMAGE_FAILURE_POLICY", value_enum, default_value_t = ImageFailurePolicy::Placeholder)]
    pub image_failure_policy: ImageFailurePolicy,

    #[arg(long, env = "PLACEHOLDER_IMAGE_URL", default_value = DEFAULT_PLACEHOLDER_IMAGE, hide_default_value = true)]
    pub placeholder_image_url: String,

    /// Retry the original image of placeholder articles after each upload stage
    #[arg(long, env = "BACKFILL_IMAGES", default_value_t = false, action = ArgAction::Set)]
    pub backfill_images: bool,

    #[arg(long, env = "STORE", value_enum, default_value_t = StoreBackend::Supabase)]
    pub store: StoreBackend,

    #[arg(long, env = "SUPABASE_URL")]
    pub supabase_url: Option<String>,

    #[arg(long, env = "SUPABASE_SERVICE_KEY", hide_env_values = true)]
    pub supabase_service_key: Option<String>,

    #[arg(long, env = "SUPABASE_TABLE", default_value = "noticias")]
    pub supabase_table: String,

    #[arg(long, env = "SUPABASE_BUCKET", default_value = "noticias")]
    pub supabase_bucket: String,

    /// Directory for per-cycle JSON reports
    #[arg(short, long, env = "REPORT_DIR")]
    pub report_dir: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

fn require<'a>(value: &'a Option<String>, key: &'static str) -> Result<&'a str, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn positive<T: PartialOrd + Default>(value: T, key: &'static str) -> Result<(), ConfigError> {
    if value > T::default() {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            key,
            reason: "must be greater than zero".to_string(),
        })
    }
}

impl Cli {
    /// Check credentials and ranges. Fatal at boot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(&self.openrouter_api_key, "OPENROUTER_API_KEY")?;
        if self.store == StoreBackend::Supabase {
            let url = require(&self.supabase_url, "SUPABASE_URL")?;
            url::Url::parse(url).map_err(|e| ConfigError::Invalid {
                key: "SUPABASE_URL",
                reason: e.to_string(),
            })?;
            require(&self.supabase_service_key, "SUPABASE_SERVICE_KEY")?;
        }
        if let Some(url) = &self.browserless_url {
            url::Url::parse(url).map_err(|e| ConfigError::Invalid {
                key: "BROWSERLESS_URL",
                reason: e.to_string(),
            })?;
        }

        positive(self.llm_max_retries, "LLM_MAX_RETRIES")?;
        positive(self.llm_requests_per_minute, "LLM_REQUESTS_PER_MINUTE")?;
        positive(self.llm_requests_per_day, "LLM_REQUESTS_PER_DAY")?;
        positive(self.llm_timeout_secs, "LLM_TIMEOUT_SECS")?;
        positive(self.rewrite_workers, "REWRITE_WORKERS")?;
        positive(self.scrape_interval, "SCRAPE_INTERVAL")?;
        positive(self.max_articles_per_category, "MAX_ARTICLES_PER_CATEGORY")?;
        positive(self.crawl_concurrency, "CRAWL_CONCURRENCY")?;
        positive(self.page_timeout_secs, "PAGE_TIMEOUT_SECS")?;
        positive(self.retention_days, "RETENTION_DAYS")?;
        positive(self.max_image_bytes, "MAX_IMAGE_BYTES")?;
        positive(self.image_timeout_secs, "IMAGE_TIMEOUT_SECS")?;
        if !(1..=100).contains(&self.image_quality) {
            return Err(ConfigError::Invalid {
                key: "IMAGE_QUALITY",
                reason: format!("{} is outside 1-100", self.image_quality),
            });
        }
        Ok(())
    }

    pub fn rewrite_options(&self) -> RewriteOptions {
        RewriteOptions {
            style: self.rewrite_style,
            tone: self.rewrite_tone,
            length: self.rewrite_length,
            ..RewriteOptions::default()
        }
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.image_timeout_secs)
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &[&str] = &["noticiero", "--openrouter-api-key", "sk-or-test"];

    fn parse(extra: &[&str]) -> Cli {
        Cli::parse_from(BASE.iter().chain(extra.iter()))
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["--store", "memory"]);
        assert_eq!(cli.llm_model, DEFAULT_MODEL);
        assert_eq!(cli.llm_requests_per_minute, 20);
        assert_eq!(cli.run_mode, RunMode::Continuous);
        assert_eq!(cli.retention_days, 3);
        assert!(cli.download_images);
        assert_eq!(cli.image_failure_policy, ImageFailurePolicy::Placeholder);
        assert_eq!(cli.rewrite_options(), RewriteOptions::default());
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_value_enums_and_bools() {
        let cli = parse(&[
            "--store",
            "memory",
            "--run-mode",
            "once",
            "--rewrite-style",
            "investigative",
            "--rewrite-length",
            "shorter",
            "--download-images",
            "false",
            "--image-failure-policy",
            "defer",
        ]);
        assert_eq!(cli.run_mode, RunMode::Once);
        assert_eq!(cli.rewrite_options().style, Style::Investigative);
        assert_eq!(cli.rewrite_options().length, LengthChange::Shorter);
        assert!(!cli.download_images);
        assert_eq!(cli.image_failure_policy, ImageFailurePolicy::Defer);
    }

    #[test]
    fn test_supabase_requires_credentials() {
        let cli = parse(&["--store", "supabase"]);
        assert!(matches!(
            cli.validate(),
            Err(ConfigError::Missing("SUPABASE_URL"))
        ));

        let cli = parse(&[
            "--supabase-url",
            "https://proj.supabase.co",
            "--supabase-service-key",
            "key",
        ]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_missing_api_key_is_fatal() {
        let cli = Cli::parse_from(["noticiero", "--store", "memory", "--openrouter-api-key", " "]);
        assert!(matches!(
            cli.validate(),
            Err(ConfigError::Missing("OPENROUTER_API_KEY"))
        ));
    }

    #[test]
    fn test_out_of_range_values() {
        let cli = parse(&["--store", "memory", "--image-quality", "0"]);
        assert!(matches!(
            cli.validate(),
            Err(ConfigError::Invalid { key: "IMAGE_QUALITY", .. })
        ));

        let cli = parse(&["--store", "memory", "--crawl-concurrency", "0"]);
        assert!(matches!(
            cli.validate(),
            Err(ConfigError::Invalid { key: "CRAWL_CONCURRENCY", .. })
        ));
    }
}
