//! Export of selection results.
//!
//! Writes subset manifests, the selected records and the run summary.

pub mod manifest;
pub mod summary;

pub use manifest::{read_manifest, write_manifest, ManifestContext, ManifestFiles, SubsetManifest};
pub use summary::{DatasetSummary, RunSummary, StageTimings, SubsetSummary, RUN_SUMMARY_FILE};
