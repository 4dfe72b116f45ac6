//! JSON run summary
//!
//! Written at the end of a run when `--json-output` is given, so scripts can
//! collect best scores without scraping the console.
//!
//! ```json
//! {
//!   "generated_at": "2024-05-01T12:00:00Z",
//!   "iterations": 1532,
//!   "errors": 4,
//!   "found_zero": false,
//!   "targets": [
//!     { "name": "func", "dir": "nonmatchings/func", "base_score": 300, "best_score": 120, "distinct_outputs": 9 }
//!   ]
//! }
//! ```

use crate::coordinator::RunSummary;
use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRunSummary {
    pub generated_at: DateTime<Utc>,
    pub iterations: u64,
    pub errors: u64,
    pub found_zero: bool,
    pub targets: Vec<JsonTargetSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonTargetSummary {
    pub name: String,
    pub dir: PathBuf,
    pub base_score: u64,
    pub best_score: u64,
    pub distinct_outputs: usize,
}

impl JsonRunSummary {
    pub fn from_summary(summary: &RunSummary) -> Self {
        Self {
            generated_at: Utc::now(),
            iterations: summary.iterations,
            errors: summary.errors,
            found_zero: summary.found_zero,
            targets: summary
                .targets
                .iter()
                .map(|t| JsonTargetSummary {
                    name: t.name.clone(),
                    dir: t.dir.clone(),
                    base_score: t.base_score,
                    best_score: t.best_score,
                    distinct_outputs: t.distinct_outputs,
                })
                .collect(),
        }
    }
}

/// Write `summary` as pretty-printed JSON to `path`
pub fn write_json_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &JsonRunSummary::from_summary(summary))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
