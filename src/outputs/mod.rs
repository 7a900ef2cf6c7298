//! Files written alongside the store.
//!
//! # Submodules
//!
//! - [`json`]: per-cycle run report, grouped by date and edition
//!
//! ```text
//! report_dir/
//! ├── 2025-11-16/
//! │   ├── morning.json
//! │   ├── afternoon.json
//! │   └── evening.json
//! ```

pub mod json;
