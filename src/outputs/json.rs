//! JSON cycle reports.
//!
//! Reports are grouped by local date and edition:
//! ```text
//! report_dir/
//! └── 2025-11-16/
//!     ├── morning.json
//!     ├── afternoon.json
//!     └── evening.json
//! ```
//!
//! Each file holds an array with one entry per cycle of that edition, so
//! hourly cycles append instead of overwriting each other.

use crate::llm::CostStats;
use crate::models::RunStats;
use crate::utils::time_of_day;
use chrono::Local;
use serde::Serialize;
use std::error::Error;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Serialize)]
pub struct CycleReport<'a> {
    pub local_date: String,
    pub edition: String,
    pub stats: &'a RunStats,
    /// Cumulative provider spend for the process.
    pub costs: &'a CostStats,
}

impl<'a> CycleReport<'a> {
    pub fn now(stats: &'a RunStats, costs: &'a CostStats) -> Self {
        Self {
            local_date: Local::now().date_naive().to_string(),
            edition: time_of_day(),
            stats,
            costs,
        }
    }
}

/// Append `report` to `{report_dir}/{date}/{edition}.json`, returning the file path.
#[instrument(level = "info", skip_all, fields(report_dir = %report_dir.display()))]
pub async fn write_cycle_report(
    report: &CycleReport<'_>,
    report_dir: &Path,
) -> Result<PathBuf, Box<dyn Error>> {
    let dir = report_dir.join(&report.local_date);
    if let Err(e) = fs::create_dir_all(&dir).await {
        error!(dir = %dir.display(), error = %e, "Failed to create report dir");
        return Err(e.into());
    }
    let path = dir.join(format!("{}.json", report.edition));

    let mut entries: Vec<serde_json::Value> = match fs::read(&path).await {
        Ok(existing) => serde_json::from_slice(&existing).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Existing report unreadable; starting over");
            Vec::new()
        }),
        Err(_) => Vec::new(),
    };
    entries.push(serde_json::to_value(report)?);

    fs::write(&path, serde_json::to_vec_pretty(&entries)?).await?;
    info!(path = %path.display(), cycles = entries.len(), "Wrote cycle report");
    Ok(path)
}
