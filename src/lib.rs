//! subset-forge: diverse subset selection for large record collections.
//!
//! Records are rendered to text, embedded, split into folds and ranked per
//! fold by facility-location greedy maximization. The top of every fold's
//! ranking is merged into one subset per requested size.

// Core modules
pub mod cli;
pub mod diversity;
pub mod encoder;
pub mod error;
pub mod export;
pub mod pipeline;
pub mod source;
pub mod template;
pub mod utils;

// Re-export commonly used error types
pub use error::{
    DataError, EncoderError, ExportError, PartitionError, SelectionError, SourceError,
    TemplateError,
};
pub use pipeline::{PipelineError, SelectionConfig, SelectionPipeline};
