//! End-to-end selection run.
//!
//! For each dataset the runner renders records, encodes them (or reuses
//! cached embeddings), partitions them into folds, ranks every fold with
//! facility-location greedy and assembles one manifest per requested size.
//! Manifests are written only after every dataset has been selected.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use ndarray::Array2;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::diversity::{
    assemble, partition, rank_folds, verify_partition, FoldJob, FoldRankingPlan, SubsetRequest,
};
use crate::encoder::{fingerprint, DevicePool, EmbeddingCache, EncoderPool, EncoderRegistry};
use crate::error::{
    DataError, EncoderError, ExportError, PartitionError, SelectionError, SourceError,
    TemplateError,
};
use crate::export::{
    write_manifest, DatasetSummary, ManifestContext, RunSummary, StageTimings, SubsetManifest,
    SubsetSummary,
};
use crate::source::{load_datasets, Dataset};
use crate::template::TemplateRegistry;
use crate::utils::CancellationFlag;

use super::config::{ConfigError, DataErrorPolicy, SelectionConfig};

/// Directory under each dataset directory holding cached embeddings.
const EMBEDDINGS_DIR: &str = "embeddings";

/// Errors that can abort a selection run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Input loading error.
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Template lookup or compilation error.
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    /// A bad record under the `fail` data error policy.
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    /// Encoding error.
    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    /// Fold partitioning error.
    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),

    /// Ranking or assembly error.
    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    /// Output writing error.
    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    /// The run was cancelled.
    #[error("Run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether the run stopped because it was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled
                | PipelineError::Encoder(EncoderError::Cancelled)
                | PipelineError::Selection(SelectionError::Cancelled)
        )
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Summary also written to `run_summary.json`.
    pub summary: RunSummary,
    /// Every manifest written, in dataset then request order.
    pub manifests: Vec<SubsetManifest>,
    /// Location of the written summary.
    pub summary_path: std::path::PathBuf,
}

/// Records of one dataset that survived rendering.
#[derive(Debug, Default)]
struct RenderedDataset {
    /// Record index of each rendered text.
    record_indices: Vec<usize>,
    texts: Vec<String>,
    skipped: usize,
}

/// A dataset whose subsets are chosen but not yet written.
#[derive(Debug)]
struct SelectedDataset {
    summary: DatasetSummary,
    manifests: Vec<SubsetManifest>,
}

/// Runs diverse subset selection over a set of input files.
pub struct SelectionPipeline {
    config: SelectionConfig,
    templates: TemplateRegistry,
    encoders: Arc<EncoderRegistry>,
    cancel: CancellationFlag,
    detected_accelerators: Option<usize>,
}

impl SelectionPipeline {
    /// Creates a pipeline with the built-in encoders and templates plus any
    /// custom templates from the configuration.
    pub fn new(config: SelectionConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let mut templates = TemplateRegistry::with_builtins()?;
        for (name, custom) in &config.template.custom {
            templates.register(name, &custom.source, &custom.required_fields)?;
        }

        Ok(Self {
            config,
            templates,
            encoders: Arc::new(EncoderRegistry::with_builtins()),
            cancel: CancellationFlag::new(),
            detected_accelerators: None,
        })
    }

    /// Replaces the encoder registry.
    pub fn with_encoder_registry(mut self, registry: Arc<EncoderRegistry>) -> Self {
        self.encoders = registry;
        self
    }

    /// Sets the flag observed between stages, batches and folds.
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Overrides accelerator detection with a fixed count.
    pub fn with_detected_accelerators(mut self, count: usize) -> Self {
        self.detected_accelerators = Some(count);
        self
    }

    /// The configuration this pipeline runs with.
    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Runs selection for every dataset and writes the run summary.
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        let started_at = Utc::now();

        // Fail on configuration problems before any data is touched.
        self.templates.get(&self.config.template.name)?;
        self.encoders.check(&self.config.encoder.encoder_type)?;
        let devices = self.resolve_devices()?;

        self.ensure_running()?;
        let retry = self.config.retry_policy();
        let datasets =
            load_datasets(&self.config.input_files, self.config.combine_files, &retry).await?;
        info!(datasets = datasets.len(), "Loaded inputs");

        let pool = EncoderPool::new(Arc::clone(&self.encoders), devices)
            .with_retry(retry)
            .with_cancellation(self.cancel.clone());
        let requests = unique_requests(&self.config.subset_sizes);

        let mut pending = Vec::with_capacity(datasets.len());
        for dataset in &datasets {
            self.ensure_running()?;
            if let Some(selected) = self.process_dataset(dataset, &pool, &requests).await? {
                pending.push((dataset, selected));
            }
        }

        // Nothing is written until every dataset has been selected.
        self.ensure_running()?;
        let mut summaries = Vec::with_capacity(pending.len());
        let mut manifests = Vec::new();
        for (dataset, selected) in pending {
            let (summary, written) = self.write_dataset(dataset, selected)?;
            summaries.push(summary);
            manifests.extend(written);
        }

        let summary = RunSummary {
            started_at,
            finished_at: Utc::now(),
            datasets: summaries,
        };
        let summary_path = summary.write(&self.config.output_dir)?;
        info!(
            datasets = summary.datasets.len(),
            manifests = manifests.len(),
            selected = summary.total_selected(),
            path = %summary_path.display(),
            "Selection run complete"
        );

        Ok(RunReport {
            summary,
            manifests,
            summary_path,
        })
    }

    fn resolve_devices(&self) -> Result<DevicePool, EncoderError> {
        let requested = self.config.encoder.num_gpus;
        let testing_mode = self.config.system.testing_mode;
        match self.detected_accelerators {
            Some(detected) => DevicePool::resolve(requested, detected, testing_mode),
            None => DevicePool::detect(requested, testing_mode),
        }
    }

    fn ensure_running(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    async fn process_dataset(
        &self,
        dataset: &Dataset,
        pool: &EncoderPool,
        requests: &[SubsetRequest],
    ) -> Result<Option<SelectedDataset>, PipelineError> {
        let mut timings = StageTimings::default();

        let started = Instant::now();
        let rendered = self.render_dataset(dataset)?;
        timings.render_ms = elapsed_ms(started);

        let n = rendered.texts.len();
        if n == 0 {
            warn!(
                dataset = %dataset.name,
                skipped = rendered.skipped,
                "Dataset has no valid records, skipping"
            );
            return Ok(None);
        }
        info!(
            dataset = %dataset.name,
            records = n,
            skipped = rendered.skipped,
            "Rendered records"
        );

        self.ensure_running()?;
        let started = Instant::now();
        let (embeddings, cache_hit) = self.embed(dataset, &rendered.texts, pool).await?;
        timings.encode_ms = elapsed_ms(started);
        let embedding_dim = embeddings.ncols();

        self.ensure_running()?;
        let started = Instant::now();
        let folds = partition(n, self.config.num_folds, self.config.seed)?;
        verify_partition(&folds, n)?;

        let record_indices = Arc::new(rendered.record_indices);
        let jobs: Vec<FoldJob> = folds
            .into_iter()
            .map(|fold| FoldJob {
                fold,
                record_indices: Arc::clone(&record_indices),
            })
            .collect();
        let plan = FoldRankingPlan {
            selector: self.config.selector(),
            similarity_mode: self.config.similarity_mode,
            tile_size: self.config.tile_size,
        };
        let rankings = rank_folds(
            Arc::new(embeddings),
            jobs,
            pool.devices(),
            &plan,
            &self.cancel,
        )
        .await?;
        self.ensure_running()?;

        let selections = requests
            .iter()
            .map(|&request| assemble(&rankings, request, self.config.exact_sizes))
            .collect::<Result<Vec<_>, _>>()?;
        timings.select_ms = elapsed_ms(started);

        let context = self.manifest_context(dataset, n, rendered.skipped);
        let manifests = selections
            .iter()
            .map(|selection| SubsetManifest::new(context.clone(), selection))
            .collect();

        let summary = DatasetSummary {
            dataset: dataset.name.clone(),
            loaded: dataset.len(),
            skipped: rendered.skipped,
            selected_from: n,
            num_folds: self.config.num_folds,
            embedding_dim,
            cache_hit,
            subsets: Vec::new(),
            timings,
        };
        Ok(Some(SelectedDataset { summary, manifests }))
    }

    fn write_dataset(
        &self,
        dataset: &Dataset,
        selected: SelectedDataset,
    ) -> Result<(DatasetSummary, Vec<SubsetManifest>), PipelineError> {
        let SelectedDataset {
            mut summary,
            manifests,
        } = selected;

        let started = Instant::now();
        let dir = self.config.dataset_dir(&dataset.name);
        for manifest in &manifests {
            let files = write_manifest(&dir, manifest, dataset)?;
            summary.subsets.push(SubsetSummary {
                label: manifest.label.clone(),
                size: manifest.len(),
                metadata_path: files.metadata,
            });
        }
        summary.timings.write_ms = elapsed_ms(started);
        Ok((summary, manifests))
    }

    fn render_dataset(&self, dataset: &Dataset) -> Result<RenderedDataset, PipelineError> {
        let template = &self.config.template.name;
        let mut rendered = RenderedDataset::default();

        for slot in &dataset.slots {
            let outcome = match slot {
                Ok(record) => self
                    .templates
                    .render(record, template)
                    .map(|text| (record.index(), text))
                    .map_err(|source| DataError::Render {
                        index: record.index(),
                        source,
                    }),
                Err(err) => Err(err.clone()),
            };

            match outcome {
                Ok((index, text)) => {
                    rendered.record_indices.push(index);
                    rendered.texts.push(text);
                }
                Err(err) => match self.config.on_data_error {
                    DataErrorPolicy::Fail => return Err(err.into()),
                    DataErrorPolicy::Skip => {
                        warn!(
                            dataset = %dataset.name,
                            index = err.index(),
                            error = %err,
                            "Skipping record"
                        );
                        rendered.skipped += 1;
                    }
                },
            }
        }

        Ok(rendered)
    }

    async fn embed(
        &self,
        dataset: &Dataset,
        texts: &[String],
        pool: &EncoderPool,
    ) -> Result<(Array2<f32>, bool), PipelineError> {
        let cache = self.config.system.embedding_cache.then(|| {
            EmbeddingCache::new(self.config.dataset_dir(&dataset.name).join(EMBEDDINGS_DIR))
        });
        let key = fingerprint(&self.config.encoder, &self.config.template.name, texts);

        if let Some(cache) = &cache {
            match cache.load(&key) {
                Ok(Some(matrix)) if matrix.nrows() == texts.len() => {
                    info!(dataset = %dataset.name, "Reusing cached embeddings");
                    return Ok((matrix, true));
                }
                Ok(_) => debug!(dataset = %dataset.name, "No usable cached embeddings"),
                Err(err) => warn!(dataset = %dataset.name, error = %err, "Ignoring unreadable embedding cache"),
            }
        }

        let matrix = pool.encode_all(texts, &self.config.encoder).await?;

        if let Some(cache) = &cache {
            if let Err(err) = cache.store(&key, &self.config.encoder, &matrix) {
                warn!(dataset = %dataset.name, error = %err, "Failed to cache embeddings");
            }
        }
        Ok((matrix, false))
    }

    fn manifest_context(&self, dataset: &Dataset, n: usize, skipped: usize) -> ManifestContext {
        ManifestContext {
            dataset: dataset.name.clone(),
            total_records: n,
            skipped_records: skipped,
            num_folds: self.config.num_folds,
            seed: self.config.seed,
            epsilon: self.config.epsilon,
            optimizer: self.config.optimizer.to_string(),
            encoder_type: self.config.encoder.encoder_type.clone(),
            encoder_model: self.config.encoder.model.clone(),
            template_name: self.config.template.name.clone(),
        }
    }
}

/// Drops requests whose label repeats an earlier one, since they would
/// write the same files.
fn unique_requests(requests: &[SubsetRequest]) -> Vec<SubsetRequest> {
    let mut seen = HashSet::new();
    requests
        .iter()
        .copied()
        .filter(|request| {
            let fresh = seen.insert(request.label());
            if !fresh {
                warn!(request = %request, "Ignoring duplicate subset size");
            }
            fresh
        })
        .collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
