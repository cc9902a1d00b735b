//! Pipeline orchestration for diverse subset selection.
//!
//! # Pipeline Flow
//!
//! 1. **Device resolution**: accelerators are detected, or the CPU is used in testing mode
//! 2. **Loading**: input files are read into datasets, one per file or one combined
//! 3. **Rendering**: each record is rendered to text through the configured template
//! 4. **Encoding**: texts are embedded in batches across devices, or read from the cache
//! 5. **Partitioning**: records are shuffled into folds with a seeded generator
//! 6. **Ranking**: each fold is ranked by facility-location greedy
//! 7. **Assembly**: per-fold prefixes are merged into one subset per requested size
//! 8. **Export**: manifests, subset records and a run summary are written
//!
//! # Example
//!
//! ```rust,ignore
//! use subset_forge::diversity::SubsetRequest;
//! use subset_forge::pipeline::{SelectionConfig, SelectionPipeline};
//!
//! let config = SelectionConfig::new()
//!     .with_input_files(vec!["data/train.jsonl".into()])
//!     .with_subset_sizes(vec![SubsetRequest::Fraction(0.1), SubsetRequest::Count(5000)])
//!     .with_num_folds(50);
//!
//! let report = SelectionPipeline::new(config)?.run().await?;
//! println!("Selected {} records", report.summary.total_selected());
//! ```

pub mod config;
pub mod runner;

pub use config::{
    ConfigError, CustomTemplate, DataErrorPolicy, SelectionConfig, SystemConfig, TemplateConfig,
};
pub use runner::{PipelineError, RunReport, SelectionPipeline};
