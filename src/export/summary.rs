//! Run summary written next to the manifests.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExportError;

/// File name of the run summary inside the output directory.
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

/// Per-dataset counts and stage timings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub dataset: String,
    /// Rows read from the inputs.
    pub loaded: usize,
    /// Rows excluded before selection.
    pub skipped: usize,
    /// Rows that took part in selection.
    pub selected_from: usize,
    pub num_folds: usize,
    pub embedding_dim: usize,
    /// Whether embeddings came from the cache.
    pub cache_hit: bool,
    /// Subset sizes written, by label.
    pub subsets: Vec<SubsetSummary>,
    pub timings: StageTimings,
}

/// One written subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsetSummary {
    pub label: String,
    pub size: usize,
    pub metadata_path: PathBuf,
}

/// Wall-clock time per stage, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub render_ms: u64,
    pub encode_ms: u64,
    pub select_ms: u64,
    pub write_ms: u64,
}

/// Summary of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub datasets: Vec<DatasetSummary>,
}

impl RunSummary {
    /// Total rows selected across every subset.
    pub fn total_selected(&self) -> usize {
        self.datasets
            .iter()
            .flat_map(|d| d.subsets.iter())
            .map(|s| s.size)
            .sum()
    }

    /// Writes the summary as `run_summary.json` in `dir`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf, ExportError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(RUN_SUMMARY_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}
