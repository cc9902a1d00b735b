//! Input file loading.
//!
//! Supports newline-delimited JSON, JSON arrays, delimited text and Parquet.
//! Record shape is not validated here; missing fields surface when the
//! record is rendered.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{DataError, SourceError};
use crate::utils::{retry, RetryError, RetryPolicy};

use super::record::{slot_from_value, Dataset, RecordSlot};

/// Name of the dataset produced when input files are concatenated.
pub const COMBINED_DATASET_NAME: &str = "combined";

/// Supported input encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// One JSON object per line.
    JsonLines,
    /// A single JSON array of objects.
    JsonArray,
    /// Delimited text with a header row.
    Delimited { delimiter: u8 },
    /// Apache Parquet.
    Parquet,
}

impl InputFormat {
    /// Detects the format from the file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "jsonl" | "ndjson" => Some(InputFormat::JsonLines),
            "json" => Some(InputFormat::JsonArray),
            "csv" => Some(InputFormat::Delimited { delimiter: b',' }),
            "tsv" => Some(InputFormat::Delimited { delimiter: b'\t' }),
            "parquet" => Some(InputFormat::Parquet),
            _ => None,
        }
    }
}

/// Expands directories and checks that every input exists and is supported.
pub fn resolve_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>, SourceError> {
    if paths.is_empty() {
        return Err(SourceError::NoInputs);
    }

    let mut resolved = Vec::new();
    for path in paths {
        if !path.exists() {
            return Err(SourceError::NotFound(path.display().to_string()));
        }

        if path.is_dir() {
            let before = resolved.len();
            for entry in WalkDir::new(path)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let entry_path = entry.path();
                if entry_path.is_file() && InputFormat::from_path(entry_path).is_some() {
                    resolved.push(entry_path.to_path_buf());
                }
            }
            if resolved.len() == before {
                warn!(dir = %path.display(), "Input directory contains no supported files");
            }
        } else if InputFormat::from_path(path).is_some() {
            resolved.push(path.clone());
        } else {
            return Err(SourceError::UnsupportedFormat(path.display().to_string()));
        }
    }

    if resolved.is_empty() {
        return Err(SourceError::NoInputs);
    }
    Ok(resolved)
}

/// Loads one file. Slot indices start at `first_index`.
pub fn load_file(path: &Path, first_index: usize) -> Result<Vec<RecordSlot>, SourceError> {
    let format = InputFormat::from_path(path)
        .ok_or_else(|| SourceError::UnsupportedFormat(path.display().to_string()))?;

    let values = match format {
        InputFormat::JsonLines => return load_json_lines(path, first_index),
        InputFormat::JsonArray => load_json_array(path)?,
        InputFormat::Delimited { delimiter } => {
            return load_delimited(path, delimiter, first_index)
        }
        InputFormat::Parquet => load_parquet(path)?,
    };

    Ok(values
        .into_iter()
        .enumerate()
        .map(|(offset, value)| slot_from_value(first_index + offset, value))
        .collect())
}

fn load_json_lines(path: &Path, first_index: usize) -> Result<Vec<RecordSlot>, SourceError> {
    let content = std::fs::read_to_string(path)?;
    let mut slots = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let index = first_index + slots.len();
        let slot = match serde_json::from_str::<Value>(line) {
            Ok(value) => slot_from_value(index, value),
            Err(e) => Err(DataError::MalformedRow {
                index,
                message: e.to_string(),
            }),
        };
        slots.push(slot);
    }

    Ok(slots)
}

fn load_json_array(path: &Path) -> Result<Vec<Value>, SourceError> {
    let content = std::fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&content)? {
        Value::Array(items) => Ok(items),
        _ => Err(SourceError::Parse {
            path: path.display().to_string(),
            message: "expected a top-level JSON array".to_string(),
        }),
    }
}

/// Reads a delimited file with a header row. Every cell is kept as a string;
/// empty cells are left out of the record. A row whose field count differs
/// from the header becomes a malformed slot.
fn load_delimited(
    path: &Path,
    delimiter: u8,
    first_index: usize,
) -> Result<Vec<RecordSlot>, SourceError> {
    let parse_err = |e: csv::Error| SourceError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(parse_err)?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(parse_err)?
        .iter()
        .map(str::to_string)
        .collect();

    let mut slots = Vec::new();
    for row in reader.records() {
        let index = first_index + slots.len();
        let slot = match row {
            Ok(row) if row.len() != headers.len() => Err(DataError::MalformedRow {
                index,
                message: format!(
                    "expected {} fields, found {}",
                    headers.len(),
                    row.len()
                ),
            }),
            Ok(row) => {
                let fields = headers
                    .iter()
                    .zip(row.iter())
                    .filter(|(_, cell)| !cell.is_empty())
                    .map(|(name, cell)| (name.clone(), Value::String(cell.to_string())))
                    .collect();
                slot_from_value(index, Value::Object(fields))
            }
            Err(e) if e.is_io_error() => return Err(parse_err(e)),
            Err(e) => Err(DataError::MalformedRow {
                index,
                message: e.to_string(),
            }),
        };
        slots.push(slot);
    }

    Ok(slots)
}

fn load_parquet(path: &Path) -> Result<Vec<Value>, SourceError> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let batches = reader.collect::<Result<Vec<_>, _>>()?;
    batches_to_values(&batches)
}

/// Converts Arrow batches into JSON objects, one per row. Null cells are omitted.
fn batches_to_values(batches: &[RecordBatch]) -> Result<Vec<Value>, SourceError> {
    if batches.iter().all(|b| b.num_rows() == 0) {
        return Ok(Vec::new());
    }

    let mut writer = arrow::json::ArrayWriter::new(Vec::new());
    for batch in batches {
        writer.write(batch)?;
    }
    writer.finish()?;
    let bytes = writer.into_inner();

    Ok(serde_json::from_slice(&bytes)?)
}

/// Loads every input as its own dataset, or as one concatenated dataset.
///
/// File reads are retried on transient IO errors.
pub async fn load_datasets(
    paths: &[PathBuf],
    combine_files: bool,
    policy: &RetryPolicy,
) -> Result<Vec<Dataset>, SourceError> {
    let files = resolve_inputs(paths)?;
    let mut datasets = Vec::new();
    let mut combined: Vec<RecordSlot> = Vec::new();
    let mut used_names = HashSet::new();

    for path in &files {
        let first_index = if combine_files { combined.len() } else { 0 };
        let label = format!("read {}", path.display());
        let slots = retry(policy, &label, SourceError::is_transient, |_| async {
            load_file(path, first_index)
        })
        .await
        .map_err(RetryError::into_inner)?;

        let malformed = slots.iter().filter(|s| s.is_err()).count();
        info!(
            path = %path.display(),
            rows = slots.len(),
            malformed = malformed,
            "Loaded input file"
        );

        if combine_files {
            combined.extend(slots);
        } else {
            let name = unique_dataset_name(path, &mut used_names);
            debug!(dataset = %name, "Registered dataset");
            datasets.push(Dataset::new(name, slots));
        }
    }

    if combine_files {
        datasets.push(Dataset::new(COMBINED_DATASET_NAME, combined));
    }

    Ok(datasets)
}

fn unique_dataset_name(path: &Path, used: &mut HashSet<String>) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("dataset")
        .to_string();

    let mut name = stem.clone();
    let mut suffix = 2;
    while used.contains(&name) {
        name = format!("{}_{}", stem, suffix);
        suffix += 1;
    }
    used.insert(name.clone());
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            InputFormat::from_path(Path::new("a.jsonl")),
            Some(InputFormat::JsonLines)
        );
        assert_eq!(
            InputFormat::from_path(Path::new("a.JSON")),
            Some(InputFormat::JsonArray)
        );
        assert_eq!(
            InputFormat::from_path(Path::new("a.tsv")),
            Some(InputFormat::Delimited { delimiter: b'\t' })
        );
        assert_eq!(InputFormat::from_path(Path::new("a.txt")), None);
    }

    #[test]
    fn test_json_lines_keeps_malformed_slots() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "data.jsonl",
            "{\"text\": \"a\"}\n\nnot json\n{\"text\": \"c\"}\n",
        );

        let slots = load_file(&path, 0).unwrap();
        assert_eq!(slots.len(), 3);
        assert!(slots[0].is_ok());
        assert!(matches!(
            slots[1],
            Err(DataError::MalformedRow { index: 1, .. })
        ));
        assert_eq!(slots[2].as_ref().unwrap().index(), 2);
    }

    #[test]
    fn test_json_array_with_offset() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "data.json", r#"[{"q": 1}, {"q": 2}]"#);

        let slots = load_file(&path, 10).unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[1].as_ref().unwrap().index(), 11);
    }

    #[test]
    fn test_json_object_top_level_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "data.json", r#"{"q": 1}"#);
        assert!(matches!(
            load_file(&path, 0),
            Err(SourceError::Parse { .. })
        ));
    }

    #[test]
    fn test_csv_rows_become_records() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "qa.csv",
            "question,answer\nWhat is Rust?,A language\nWhy?,Because\n",
        );

        let slots = load_file(&path, 0).unwrap();
        assert_eq!(slots.len(), 2);
        let first = slots[0].as_ref().unwrap();
        assert_eq!(first.get("question"), Some(&json!("What is Rust?")));
        assert_eq!(first.get("answer"), Some(&json!("A language")));
    }

    #[test]
    fn test_csv_ragged_row_is_malformed_slot() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "ragged.csv",
            "text,label\nhello,a\nbad,row,extra\nworld,b\n",
        );

        let slots = load_file(&path, 0).unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].as_ref().unwrap().get("text"), Some(&json!("hello")));
        assert!(matches!(
            slots[1],
            Err(DataError::MalformedRow { index: 1, .. })
        ));
        let last = slots[2].as_ref().unwrap();
        assert_eq!(last.index(), 2);
        assert_eq!(last.get("text"), Some(&json!("world")));
    }

    #[test]
    fn test_csv_cells_stay_text() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "codes.tsv", "text\tcode\n007\t0012\n1.50\t\n");

        let slots = load_file(&path, 0).unwrap();
        let first = slots[0].as_ref().unwrap();
        assert_eq!(first.get("text"), Some(&json!("007")));
        assert_eq!(first.get("code"), Some(&json!("0012")));
        let second = slots[1].as_ref().unwrap();
        assert_eq!(second.get("text"), Some(&json!("1.50")));
        assert_eq!(second.get("code"), None);
    }

    #[test]
    fn test_resolve_inputs_expands_directories() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "b.jsonl", "{}\n");
        write_file(&dir, "a.json", "[]");
        write_file(&dir, "notes.txt", "ignored");

        let resolved = resolve_inputs(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<_> = resolved
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.json", "b.jsonl"]);
    }

    #[test]
    fn test_resolve_inputs_errors() {
        assert!(matches!(resolve_inputs(&[]), Err(SourceError::NoInputs)));
        assert!(matches!(
            resolve_inputs(&[PathBuf::from("/definitely/not/here.jsonl")]),
            Err(SourceError::NotFound(_))
        ));

        let dir = TempDir::new().unwrap();
        let txt = write_file(&dir, "notes.txt", "x");
        assert!(matches!(
            resolve_inputs(&[txt]),
            Err(SourceError::UnsupportedFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_load_datasets_combined_indices_continue() {
        let dir = TempDir::new().unwrap();
        let a = write_file(&dir, "a.jsonl", "{\"text\": \"1\"}\n{\"text\": \"2\"}\n");
        let b = write_file(&dir, "b.jsonl", "{\"text\": \"3\"}\n");

        let datasets = load_datasets(&[a.clone(), b.clone()], true, &RetryPolicy::no_retry())
            .await
            .unwrap();
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].name, COMBINED_DATASET_NAME);
        let indices: Vec<usize> = datasets[0]
            .slots
            .iter()
            .map(|s| s.as_ref().unwrap().index())
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);

        let separate = load_datasets(&[a, b], false, &RetryPolicy::no_retry())
            .await
            .unwrap();
        assert_eq!(separate.len(), 2);
        assert_eq!(separate[0].name, "a");
        assert_eq!(separate[1].slots[0].as_ref().unwrap().index(), 0);
    }

    #[test]
    fn test_unique_dataset_names() {
        let mut used = HashSet::new();
        assert_eq!(unique_dataset_name(Path::new("x/data.jsonl"), &mut used), "data");
        assert_eq!(unique_dataset_name(Path::new("y/data.csv"), &mut used), "data_2");
    }
}
