//! On-disk embedding cache.
//!
//! Embeddings are stored as a single-column Parquet file (`embedding`,
//! a list of float32 per row) next to a small JSON sidecar carrying the
//! fingerprint of everything that determines them. A cached matrix is only
//! reused when the fingerprint matches exactly.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, Float32Array, Float32Builder, ListArray, ListBuilder};
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use ndarray::Array2;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::EncoderError;

use super::EncoderConfig;

const EMBEDDINGS_FILE: &str = "embeddings.parquet";
const META_FILE: &str = "embeddings.meta.json";
const EMBEDDING_COLUMN: &str = "embedding";

/// Fingerprint of the inputs that determine a set of embeddings.
///
/// Covers encoder type, model, instruction, output width, template name and
/// every rendered text (length-prefixed so boundaries are unambiguous).
pub fn fingerprint(config: &EncoderConfig, template: &str, texts: &[String]) -> String {
    let mut hasher = Sha256::new();
    for part in [
        config.encoder_type.as_str(),
        config.model.as_str(),
        config.instruction.as_deref().unwrap_or(""),
        template,
    ] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.update((config.dimension as u64).to_le_bytes());
    hasher.update((texts.len() as u64).to_le_bytes());
    for text in texts {
        hasher.update((text.len() as u64).to_le_bytes());
        hasher.update(text.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Sidecar describing a cached matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheMeta {
    fingerprint: String,
    rows: usize,
    dimension: usize,
    encoder_type: String,
    model: String,
    created_at: DateTime<Utc>,
}

/// Embedding cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    dir: PathBuf,
}

impl EmbeddingCache {
    /// Creates a cache in `dir`. Nothing is touched until the first store.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the cached matrix if it was produced from the same fingerprint.
    pub fn load(&self, fingerprint: &str) -> Result<Option<Array2<f32>>, EncoderError> {
        let meta_path = self.dir.join(META_FILE);
        let data_path = self.dir.join(EMBEDDINGS_FILE);
        if !meta_path.exists() || !data_path.exists() {
            return Ok(None);
        }

        let meta: CacheMeta = match std::fs::read_to_string(&meta_path)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
        {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %meta_path.display(), error = %e, "Ignoring unreadable embedding cache");
                return Ok(None);
            }
        };

        if meta.fingerprint != fingerprint {
            debug!(path = %self.dir.display(), "Embedding cache fingerprint differs");
            return Ok(None);
        }

        let matrix = read_matrix(&data_path, meta.rows, meta.dimension)?;
        info!(
            path = %data_path.display(),
            rows = meta.rows,
            dimension = meta.dimension,
            "Loaded cached embeddings"
        );
        Ok(Some(matrix))
    }

    /// Writes the matrix and its fingerprint, replacing any previous entry.
    pub fn store(
        &self,
        fingerprint: &str,
        config: &EncoderConfig,
        embeddings: &Array2<f32>,
    ) -> Result<(), EncoderError> {
        std::fs::create_dir_all(&self.dir).map_err(cache_err)?;

        let data_path = self.dir.join(EMBEDDINGS_FILE);
        write_matrix(&data_path, embeddings)?;

        let meta = CacheMeta {
            fingerprint: fingerprint.to_string(),
            rows: embeddings.nrows(),
            dimension: embeddings.ncols(),
            encoder_type: config.encoder_type.clone(),
            model: config.model.clone(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&meta).map_err(cache_err)?;
        std::fs::write(self.dir.join(META_FILE), json).map_err(cache_err)?;

        debug!(path = %data_path.display(), rows = meta.rows, "Stored embeddings");
        Ok(())
    }
}

fn cache_err(e: impl std::fmt::Display) -> EncoderError {
    EncoderError::Cache(e.to_string())
}

fn write_matrix(path: &Path, embeddings: &Array2<f32>) -> Result<(), EncoderError> {
    let mut builder = ListBuilder::new(Float32Builder::with_capacity(embeddings.len()));
    for row in embeddings.rows() {
        builder.values().append_slice(&row.to_vec());
        builder.append(true);
    }
    let array = builder.finish();

    let schema = Arc::new(Schema::new(vec![Field::new(
        EMBEDDING_COLUMN,
        array.data_type().clone(),
        false,
    )]));
    let batch = RecordBatch::try_new(schema, vec![Arc::new(array)]).map_err(cache_err)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(Default::default()))
        .build();
    let file = File::create(path).map_err(cache_err)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props)).map_err(cache_err)?;
    writer.write(&batch).map_err(cache_err)?;
    writer.close().map_err(cache_err)?;
    Ok(())
}

fn read_matrix(path: &Path, rows: usize, dimension: usize) -> Result<Array2<f32>, EncoderError> {
    let file = File::open(path).map_err(cache_err)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(cache_err)?
        .build()
        .map_err(cache_err)?;

    let mut values = Vec::with_capacity(rows * dimension);
    let mut seen = 0;
    for batch in reader {
        let batch = batch.map_err(cache_err)?;
        let column = batch
            .column_by_name(EMBEDDING_COLUMN)
            .ok_or_else(|| cache_err(format!("missing '{}' column", EMBEDDING_COLUMN)))?;
        let lists = column
            .as_any()
            .downcast_ref::<ListArray>()
            .ok_or_else(|| cache_err("embedding column is not a list"))?;

        for i in 0..lists.len() {
            let row = lists.value(i);
            let floats = row
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| cache_err("embedding values are not float32"))?;
            if floats.len() != dimension {
                return Err(EncoderError::DimensionMismatch {
                    expected: dimension,
                    actual: floats.len(),
                });
            }
            values.extend(floats.values().iter().copied());
            seen += 1;
        }
    }

    if seen != rows {
        return Err(cache_err(format!(
            "cache holds {} rows, expected {}",
            seen, rows
        )));
    }
    Array2::from_shape_vec((rows, dimension), values).map_err(cache_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    fn config() -> EncoderConfig {
        EncoderConfig {
            encoder_type: "hash".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_fingerprint_sensitivity() {
        let texts = vec!["a".to_string(), "b".to_string()];
        let base = fingerprint(&config(), "default", &texts);
        assert_eq!(base.len(), 64);
        assert_eq!(base, fingerprint(&config(), "default", &texts));

        assert_ne!(base, fingerprint(&config(), "qa", &texts));

        let mut other = config();
        other.instruction = Some("query: ".to_string());
        assert_ne!(base, fingerprint(&other, "default", &texts));

        let joined = vec!["ab".to_string()];
        assert_ne!(base, fingerprint(&config(), "default", &joined));
    }

    #[test]
    fn test_store_then_load() {
        let dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::new(dir.path().join("embeddings"));
        let matrix = array![[1.0f32, 0.0, 0.5], [0.0, 1.0, -0.5]];

        assert!(cache.load("abc").unwrap().is_none());
        cache.store("abc", &config(), &matrix).unwrap();

        let loaded = cache.load("abc").unwrap().unwrap();
        assert_eq!(loaded, matrix);
        assert!(cache.load("other").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_meta_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::new(dir.path());
        cache
            .store("abc", &config(), &array![[1.0f32, 2.0]])
            .unwrap();
        std::fs::write(dir.path().join(META_FILE), "not json").unwrap();
        assert!(cache.load("abc").unwrap().is_none());
    }
}
