//! End-to-end selection runs through the library API.
//!
//! Every test uses the `hash` encoder in testing mode, so no accelerator or
//! embeddings endpoint is needed.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use subset_forge::diversity::{parse_subset_sizes, partition, Optimizer, SubsetRequest};
use subset_forge::encoder::{Device, Encoder, EncoderConfig, EncoderRegistry, HashEncoder};
use subset_forge::export::read_manifest;
use subset_forge::pipeline::{PipelineError, SelectionConfig, SelectionPipeline};
use subset_forge::EncoderError;
use tempfile::TempDir;

fn write_jsonl(dir: &Path, name: &str, rows: &[Value]) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    for row in rows {
        writeln!(file, "{}", row).unwrap();
    }
    path
}

fn text_rows(n: usize) -> Vec<Value> {
    let topics = ["databases", "astronomy", "cooking"];
    (0..n)
        .map(|i| json!({"id": i, "text": format!("note {} on {}", i, topics[i % topics.len()])}))
        .collect()
}

fn hash_config(out: &Path, inputs: Vec<PathBuf>, sizes: &str) -> SelectionConfig {
    let mut config = SelectionConfig::new()
        .with_input_files(inputs)
        .with_output_dir(out)
        .with_subset_sizes(parse_subset_sizes(sizes).unwrap())
        .with_template_name("default")
        .with_testing_mode(true)
        .with_encoder(EncoderConfig {
            encoder_type: "hash".to_string(),
            dimension: 64,
            ..EncoderConfig::default()
        });
    config.encoder.num_gpus = Some(0);
    config
}

/// Hash encoder that counts how many batches it was asked to encode.
struct CountingEncoder {
    inner: HashEncoder,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Encoder for CountingEncoder {
    fn name(&self) -> &str {
        "counting"
    }

    fn dimension(&self) -> Option<usize> {
        self.inner.dimension()
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EncoderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.encode(texts).await
    }
}

fn counting_registry(calls: Arc<AtomicUsize>) -> Arc<EncoderRegistry> {
    let mut registry = EncoderRegistry::with_builtins();
    registry.register("counting", move |config: &EncoderConfig, _device: Device| {
        Ok(Box::new(CountingEncoder {
            inner: HashEncoder::new(config.dimension),
            calls: Arc::clone(&calls),
        }) as Box<dyn Encoder>)
    });
    Arc::new(registry)
}

#[tokio::test]
async fn nine_records_three_folds_two_sizes() {
    let dir = TempDir::new().unwrap();
    let input = write_jsonl(dir.path(), "toy.jsonl", &text_rows(9));
    let out = dir.path().join("out");
    let config = hash_config(&out, vec![input], "0.34,6").with_num_folds(3);

    let report = SelectionPipeline::new(config).unwrap().run().await.unwrap();

    let sizes: Vec<usize> = report.manifests.iter().map(|m| m.len()).collect();
    assert_eq!(sizes, vec![3, 6]);

    for manifest in &report.manifests {
        let unique: HashSet<usize> = manifest.indices.iter().copied().collect();
        assert_eq!(unique.len(), manifest.len(), "duplicate index in manifest");
        assert!(manifest.indices.iter().all(|&i| i < 9));
        assert_eq!(manifest.fold_counts.iter().sum::<usize>(), manifest.len());
        assert_eq!(manifest.gains.len(), manifest.len());
    }

    let folds = partition(9, 3, 42).unwrap();
    let mut covered: Vec<usize> = folds.iter().flat_map(|f| f.indices.clone()).collect();
    covered.sort_unstable();
    assert_eq!(covered, (0..9).collect::<Vec<_>>());

    let small = read_manifest(&out.join("toy/toy_samples_34_percent_metadata.json")).unwrap();
    let large = read_manifest(&out.join("toy/toy_samples_6_metadata.json")).unwrap();
    assert_eq!(small.target, 3);
    assert_eq!(large.target, 6);
    assert_eq!(small.context.num_folds, 3);

    let subset = std::fs::read_to_string(out.join("toy/toy_samples_6_subset.jsonl")).unwrap();
    let ids: Vec<u64> = subset
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).unwrap()["id"].as_u64().unwrap())
        .collect();
    let expected: Vec<u64> = large.indices.iter().map(|&i| i as u64).collect();
    assert_eq!(ids, expected);

    assert!(out.join("run_summary.json").exists());
    assert_eq!(report.summary.total_selected(), 9);
}

#[tokio::test]
async fn record_missing_templated_field_is_skipped() {
    let dir = TempDir::new().unwrap();
    let mut rows = text_rows(6);
    rows[2] = json!({"id": 2, "body": "no text field here"});
    let input = write_jsonl(dir.path(), "gaps.jsonl", &rows);
    let out = dir.path().join("out");
    let config = hash_config(&out, vec![input], "5").with_num_folds(2);

    let report = SelectionPipeline::new(config).unwrap().run().await.unwrap();

    let manifest = &report.manifests[0];
    assert_eq!(manifest.context.total_records, 5);
    assert_eq!(manifest.context.skipped_records, 1);

    let mut indices = manifest.indices.clone();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 3, 4, 5]);

    let summary = &report.summary.datasets[0];
    assert_eq!(summary.loaded, 6);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.selected_from, 5);
}

#[tokio::test]
async fn no_accelerator_without_testing_mode_fails_before_embedding() {
    let dir = TempDir::new().unwrap();
    let input = write_jsonl(dir.path(), "toy.jsonl", &text_rows(4));
    let out = dir.path().join("out");
    let mut config = hash_config(&out, vec![input], "2").with_testing_mode(false);
    config.encoder.encoder_type = "counting".to_string();

    let calls = Arc::new(AtomicUsize::new(0));
    let err = SelectionPipeline::new(config)
        .unwrap()
        .with_encoder_registry(counting_registry(Arc::clone(&calls)))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Encoder(EncoderError::NoAcceleratorAvailable)
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!out.exists());
}

#[tokio::test]
async fn runs_are_deterministic() {
    let dir = TempDir::new().unwrap();
    let input = write_jsonl(dir.path(), "toy.jsonl", &text_rows(30));

    let mut reports = Vec::new();
    for run in 0..2 {
        let out = dir.path().join(format!("out{}", run));
        let config = hash_config(&out, vec![input.clone()], "0.25,10").with_num_folds(4);
        reports.push(SelectionPipeline::new(config).unwrap().run().await.unwrap());
    }

    for (a, b) in reports[0].manifests.iter().zip(&reports[1].manifests) {
        assert_eq!(a.indices, b.indices);
        assert_eq!(a.gains, b.gains);
        assert_eq!(a.fold_counts, b.fold_counts);
    }
}

#[tokio::test]
async fn exact_optimizer_selects_the_same_first_pick_per_fold() {
    let dir = TempDir::new().unwrap();
    let input = write_jsonl(dir.path(), "toy.jsonl", &text_rows(12));

    let mut firsts = Vec::new();
    for optimizer in [Optimizer::LazyGreedy, Optimizer::Exact] {
        let out = dir.path().join(optimizer.to_string());
        let mut config = hash_config(&out, vec![input.clone()], "1").with_num_folds(1);
        config.optimizer = optimizer;
        let report = SelectionPipeline::new(config).unwrap().run().await.unwrap();
        firsts.push(report.manifests[0].indices[0]);
    }
    assert_eq!(firsts[0], firsts[1]);
}

#[tokio::test]
async fn combined_files_form_one_dataset() {
    let dir = TempDir::new().unwrap();
    let first = write_jsonl(dir.path(), "first.jsonl", &text_rows(3));
    let second = write_jsonl(dir.path(), "second.jsonl", &text_rows(4));
    let out = dir.path().join("out");
    let mut config = hash_config(&out, vec![first, second], "7").with_num_folds(2);
    config.combine_files = true;

    let report = SelectionPipeline::new(config).unwrap().run().await.unwrap();

    assert_eq!(report.summary.datasets.len(), 1);
    assert_eq!(report.summary.datasets[0].dataset, "combined");
    let mut indices = report.manifests[0].indices.clone();
    indices.sort_unstable();
    assert_eq!(indices, (0..7).collect::<Vec<_>>());
    assert!(out
        .join("combined/combined_samples_7_metadata.json")
        .exists());
}

#[tokio::test]
async fn separate_files_form_separate_datasets() {
    let dir = TempDir::new().unwrap();
    let first = write_jsonl(dir.path(), "first.jsonl", &text_rows(3));
    let second = write_jsonl(dir.path(), "second.jsonl", &text_rows(4));
    let out = dir.path().join("out");
    let config = hash_config(&out, vec![first, second], "2").with_num_folds(1);

    let report = SelectionPipeline::new(config).unwrap().run().await.unwrap();

    let names: Vec<&str> = report
        .summary
        .datasets
        .iter()
        .map(|d| d.dataset.as_str())
        .collect();
    assert_eq!(names, vec!["first", "second"]);
    assert!(report.manifests.iter().all(|m| m.len() == 2));
}

#[tokio::test]
async fn conversation_template_renders_messages() {
    let dir = TempDir::new().unwrap();
    let rows: Vec<Value> = (0..5)
        .map(|i| {
            json!({
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": format!("question {}", i)},
                    {"role": "assistant", "content": format!("answer {}", i)}
                ]
            })
        })
        .collect();
    let input = write_jsonl(dir.path(), "chat.jsonl", &rows);
    let out = dir.path().join("out");
    let config = hash_config(&out, vec![input], "0.6")
        .with_num_folds(1)
        .with_template_name("conversation");

    let report = SelectionPipeline::new(config).unwrap().run().await.unwrap();
    assert_eq!(report.manifests[0].len(), 3);
    assert_eq!(report.manifests[0].request, SubsetRequest::Fraction(0.6));
}

#[tokio::test]
async fn too_many_folds_is_a_configuration_error() {
    let dir = TempDir::new().unwrap();
    let input = write_jsonl(dir.path(), "toy.jsonl", &text_rows(3));
    let out = dir.path().join("out");
    let config = hash_config(&out, vec![input], "1").with_num_folds(5);

    let err = SelectionPipeline::new(config)
        .unwrap()
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Partition(_)));
}
