//! Error types for subset-forge operations.
//!
//! Defines error types for each stage of subset selection:
//! - Loading records from input files
//! - Rendering records through templates
//! - Encoding rendered text into embeddings
//! - Partitioning records into folds
//! - Greedy facility-location selection
//! - Writing manifests

use std::ops::Range;

use thiserror::Error;

/// Errors that can occur while loading input files.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("No input files provided")]
    NoInputs,

    #[error("Input path '{0}' does not exist")]
    NotFound(String),

    #[error("Unsupported input format for '{0}': expected .jsonl, .json, .csv, .tsv or .parquet")]
    UnsupportedFormat(String),

    #[error("Failed to parse '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

impl SourceError {
    /// Whether a read failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Errors that can occur during template rendering.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    #[error("Unknown template '{name}' (registered: {available})")]
    UnknownTemplate { name: String, available: String },

    #[error("Template '{template}' requires field '{field}' which is missing from the record")]
    MissingField { template: String, field: String },

    #[error("Failed to compile template '{name}': {message}")]
    Compile { name: String, message: String },

    #[error("Failed to render template '{name}': {message}")]
    Render { name: String, message: String },
}

/// Per-record problems. Subject to the configured data error policy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("Record {index}: malformed row: {message}")]
    MalformedRow { index: usize, message: String },

    #[error("Record {index}: {source}")]
    Render {
        index: usize,
        #[source]
        source: TemplateError,
    },
}

impl DataError {
    /// Position of the offending record in the input ordering.
    pub fn index(&self) -> usize {
        match self {
            DataError::MalformedRow { index, .. } | DataError::Render { index, .. } => *index,
        }
    }
}

/// Errors that can occur while encoding text into embeddings.
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("Unknown encoder type '{name}' (registered: {available})")]
    UnknownEncoder { name: String, available: String },

    #[error("No accelerator available; pass --testing-mode to allow CPU fallback")]
    NoAcceleratorAvailable,

    #[error("Failed to load encoder '{encoder}' on {device}: {message}")]
    LoadFailed {
        encoder: String,
        device: String,
        message: String,
    },

    #[error("Encoder request failed: {0}")]
    RequestFailed(String),

    #[error("Encoder API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Encoder returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Encoding failed for records {}..{} after {attempts} attempt(s): {cause}", range.start, range.end)]
    EncodingFailed {
        range: Range<usize>,
        attempts: u32,
        #[source]
        cause: Box<EncoderError>,
    },

    #[error("Encoding cancelled")]
    Cancelled,

    #[error("Embedding cache error: {0}")]
    Cache(String),

    #[error("Encoder worker failed: {0}")]
    Worker(String),
}

impl EncoderError {
    /// Whether the failure is a transient resource error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            EncoderError::LoadFailed { .. } | EncoderError::RequestFailed(_) => true,
            EncoderError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Errors that can occur while partitioning records into folds.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PartitionError {
    #[error("Invalid fold count {num_folds} for {n} records: must be between 1 and {n}")]
    InvalidFoldCount { num_folds: usize, n: usize },

    #[error("Fold partition invariant violated: {0}")]
    InvariantViolation(String),
}

/// Errors that can occur during greedy selection and subset assembly.
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("Invalid subset size '{value}': {reason}")]
    InvalidSubsetSize { value: String, reason: String },

    #[error("Ranking invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Selection cancelled")]
    Cancelled,

    #[error("Fold worker failed: {0}")]
    Worker(String),
}

/// Errors that can occur while writing manifests and subsets.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Dataset '{dataset}' has no valid record at index {index}")]
    MissingRecord { dataset: String, index: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_transient_classification() {
        assert!(EncoderError::RequestFailed("reset".to_string()).is_transient());
        assert!(EncoderError::Api {
            status: 503,
            message: "busy".to_string()
        }
        .is_transient());
        assert!(EncoderError::Api {
            status: 429,
            message: "slow down".to_string()
        }
        .is_transient());
        assert!(!EncoderError::Api {
            status: 400,
            message: "bad input".to_string()
        }
        .is_transient());
        assert!(!EncoderError::NoAcceleratorAvailable.is_transient());
    }

    #[test]
    fn test_encoding_failed_message_names_range() {
        let err = EncoderError::EncodingFailed {
            range: 10..20,
            attempts: 3,
            cause: Box::new(EncoderError::RequestFailed("timeout".to_string())),
        };
        let message = err.to_string();
        assert!(message.contains("10..20"));
        assert!(message.contains("3 attempt"));
    }

    #[test]
    fn test_source_io_transient() {
        let err = SourceError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(err.is_transient());
        let err = SourceError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_data_error_index() {
        let err = DataError::Render {
            index: 4,
            source: TemplateError::MissingField {
                template: "default".to_string(),
                field: "text".to_string(),
            },
        };
        assert_eq!(err.index(), 4);
        assert!(err.to_string().contains("text"));
    }
}
