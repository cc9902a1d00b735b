//! Subset manifests and subset record files.
//!
//! For each request two files are written under the dataset directory:
//!
//! - `<dataset>_samples_<label>_metadata.json` - the manifest
//! - `<dataset>_samples_<label>_subset.jsonl` - the selected records, one per
//!   line, in manifest order

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::diversity::{SubsetRequest, SubsetSelection};
use crate::error::ExportError;
use crate::source::Dataset;

/// Run parameters recorded in every manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestContext {
    pub dataset: String,
    /// Records that took part in selection.
    pub total_records: usize,
    /// Rows skipped before selection (malformed or unrenderable).
    pub skipped_records: usize,
    pub num_folds: usize,
    pub seed: u64,
    pub epsilon: f64,
    pub optimizer: String,
    pub encoder_type: String,
    pub encoder_model: String,
    pub template_name: String,
}

/// Description of one selected subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsetManifest {
    #[serde(flatten)]
    pub context: ManifestContext,
    pub request: SubsetRequest,
    pub label: String,
    /// Resolved global subset size.
    pub target: usize,
    /// Record indices, highest coverage gain first.
    pub indices: Vec<usize>,
    /// Gain recorded for each entry of `indices`.
    pub gains: Vec<f64>,
    /// Records taken from each fold.
    pub fold_counts: Vec<usize>,
}

impl SubsetManifest {
    /// Builds the manifest for an assembled selection.
    pub fn new(context: ManifestContext, selection: &SubsetSelection) -> Self {
        Self {
            context,
            request: selection.request,
            label: selection.request.label(),
            target: selection.target,
            indices: selection.indices(),
            gains: selection.items.iter().map(|item| item.gain).collect(),
            fold_counts: selection.fold_counts.clone(),
        }
    }

    /// Number of selected records.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Returns true if nothing was selected.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// File name stem shared by the manifest and subset files.
    pub fn file_stem(&self) -> String {
        format!("{}_samples_{}", self.context.dataset, self.label)
    }
}

/// Paths written for one manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFiles {
    pub metadata: PathBuf,
    pub subset: PathBuf,
}

/// Writes the manifest and the selected records into `dir`.
pub fn write_manifest(
    dir: &Path,
    manifest: &SubsetManifest,
    dataset: &Dataset,
) -> Result<ManifestFiles, ExportError> {
    std::fs::create_dir_all(dir)?;
    let stem = manifest.file_stem();
    let metadata = dir.join(format!("{}_metadata.json", stem));
    let subset = dir.join(format!("{}_subset.jsonl", stem));

    let json = serde_json::to_string_pretty(manifest)?;
    std::fs::write(&metadata, json)?;

    let mut writer = BufWriter::new(File::create(&subset)?);
    for &index in &manifest.indices {
        let record = match dataset.slots.get(index) {
            Some(Ok(record)) => record,
            _ => {
                return Err(ExportError::MissingRecord {
                    dataset: dataset.name.clone(),
                    index,
                })
            }
        };
        serde_json::to_writer(&mut writer, &record.to_value())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;

    info!(
        dataset = %manifest.context.dataset,
        label = %manifest.label,
        selected = manifest.len(),
        path = %metadata.display(),
        "Wrote subset manifest"
    );
    Ok(ManifestFiles { metadata, subset })
}

/// Reads a manifest written by [`write_manifest`].
pub fn read_manifest(path: &Path) -> Result<SubsetManifest, ExportError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diversity::SelectedItem;
    use crate::source::Record;
    use serde_json::json;
    use tempfile::TempDir;

    fn dataset() -> Dataset {
        let slots = (0..4)
            .map(|i| {
                let value = json!({"text": format!("row {}", i)});
                match value {
                    serde_json::Value::Object(map) => Ok(Record::new(i, map)),
                    _ => unreachable!(),
                }
            })
            .collect();
        Dataset::new("toy", slots)
    }

    fn context() -> ManifestContext {
        ManifestContext {
            dataset: "toy".to_string(),
            total_records: 4,
            skipped_records: 0,
            num_folds: 2,
            seed: 42,
            epsilon: 160.0,
            optimizer: "lazy-greedy".to_string(),
            encoder_type: "hash".to_string(),
            encoder_model: "none".to_string(),
            template_name: "default".to_string(),
        }
    }

    fn selection(indices: &[usize]) -> SubsetSelection {
        SubsetSelection {
            request: SubsetRequest::Fraction(0.5),
            target: indices.len(),
            items: indices
                .iter()
                .enumerate()
                .map(|(rank, &index)| SelectedItem {
                    index,
                    fold: 0,
                    rank,
                    gain: 1.0 / (rank + 1) as f64,
                })
                .collect(),
            fold_counts: vec![1, 1],
        }
    }

    #[test]
    fn test_write_and_read_manifest() {
        let dir = TempDir::new().unwrap();
        let manifest = SubsetManifest::new(context(), &selection(&[3, 1]));
        let files = write_manifest(dir.path(), &manifest, &dataset()).unwrap();

        assert!(files
            .metadata
            .ends_with("toy_samples_50_percent_metadata.json"));
        assert!(files.subset.ends_with("toy_samples_50_percent_subset.jsonl"));

        let loaded = read_manifest(&files.metadata).unwrap();
        assert_eq!(loaded, manifest);

        let lines: Vec<serde_json::Value> = std::fs::read_to_string(&files.subset)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![json!({"text": "row 3"}), json!({"text": "row 1"})]);
    }

    #[test]
    fn test_manifest_json_shape() {
        let manifest = SubsetManifest::new(context(), &selection(&[0]));
        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["dataset"], "toy");
        assert_eq!(value["request"], 0.5);
        assert_eq!(value["indices"], json!([0]));
    }

    #[test]
    fn test_missing_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let manifest = SubsetManifest::new(context(), &selection(&[9]));
        assert!(matches!(
            write_manifest(dir.path(), &manifest, &dataset()),
            Err(ExportError::MissingRecord { index: 9, .. })
        ));
    }
}
