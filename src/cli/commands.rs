//! CLI definition for subset-forge.
//!
//! A single command: every flag overrides the matching configuration value
//! from the YAML file and `SUBSET_*` environment variables.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::diversity::{parse_subset_sizes, Optimizer, SimilarityMode, ToleranceMode};
use crate::pipeline::{DataErrorPolicy, SelectionConfig, SelectionPipeline};
use crate::utils::CancellationFlag;

/// Select diverse subsets of large record collections.
#[derive(Parser, Debug)]
#[command(name = "subset-forge")]
#[command(about = "Select diverse subsets of large record collections via facility location")]
#[command(version)]
#[command(
    long_about = "subset-forge embeds every record, splits the records into folds and ranks each fold by facility-location greedy selection. The top of each fold's ranking is merged into one subset per requested size.\n\nExample usage:\n  subset-forge --input data/train.jsonl --subset-sizes 0.1,5000 --output-dir ./subsets"
)]
pub struct Cli {
    /// Input files or directories (.jsonl, .json, .csv, .tsv, .parquet).
    #[arg(short, long, num_args = 1..)]
    pub input: Vec<PathBuf>,

    /// Comma-separated subset sizes; tokens with a '.' are fractions, others counts.
    #[arg(short, long)]
    pub subset_sizes: Option<String>,

    /// Root directory for outputs.
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// YAML configuration file.
    #[arg(short, long, env = "SUBSET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", env = "SUBSET_LOG_LEVEL")]
    pub log_level: String,

    /// Texts per encoding batch.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Folds per dataset.
    #[arg(long)]
    pub num_folds: Option<usize>,

    /// Lazy greedy acceptance tolerance.
    #[arg(long)]
    pub epsilon: Option<f64>,

    /// How epsilon is applied.
    #[arg(long, value_enum)]
    pub epsilon_mode: Option<ToleranceMode>,

    /// Greedy variant.
    #[arg(long, value_enum)]
    pub optimizer: Option<Optimizer>,

    /// Similarity representation used during ranking.
    #[arg(long, value_enum)]
    pub similarity_mode: Option<SimilarityMode>,

    /// Rows per similarity tile.
    #[arg(long)]
    pub tile_size: Option<usize>,

    /// Accelerators to use; detected when omitted.
    #[arg(long)]
    pub num_gpus: Option<usize>,

    /// Treat all inputs as one dataset.
    #[arg(long)]
    pub combine_files: bool,

    /// Allow CPU fallback when no accelerator is available.
    #[arg(long)]
    pub testing_mode: bool,

    /// Encoder registry key.
    #[arg(long)]
    pub encoder_type: Option<String>,

    /// Model identifier passed to the encoder.
    #[arg(long)]
    pub encoder_model: Option<String>,

    /// Embedding dimension for encoders that take one.
    #[arg(long)]
    pub embedding_dim: Option<usize>,

    /// Text prepended to every record before encoding.
    #[arg(long)]
    pub instruction: Option<String>,

    /// Template used to render records.
    #[arg(long)]
    pub template_name: Option<String>,

    /// Seed for fold partitioning.
    #[arg(long)]
    pub seed: Option<u64>,

    /// What to do with records that cannot be parsed or rendered.
    #[arg(long, value_enum)]
    pub on_data_error: Option<DataErrorPolicy>,

    /// Allow subset sizes to drift from the target by fold rounding.
    #[arg(long)]
    pub no_exact_sizes: bool,

    /// Retries after a failed encoder load, batch or file read.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Base delay between retries in milliseconds.
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,

    /// Always re-encode, ignoring and not writing the embedding cache.
    #[arg(long)]
    pub no_embedding_cache: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// Use this when you need access to CLI args before running (e.g., for log level).
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(&cli)?;

    let cancel = CancellationFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let pipeline = SelectionPipeline::new(config)
        .context("Invalid configuration")?
        .with_cancellation(cancel);
    let report = pipeline.run().await.context("Selection run failed")?;

    for dataset in &report.summary.datasets {
        for subset in &dataset.subsets {
            info!(
                dataset = %dataset.dataset,
                label = %subset.label,
                size = subset.size,
                path = %subset.metadata_path.display(),
                "Subset written"
            );
        }
    }
    println!(
        "Selected {} records across {} dataset(s); summary at {}",
        report.summary.total_selected(),
        report.summary.datasets.len(),
        report.summary_path.display()
    );
    Ok(())
}

/// Layers defaults, the YAML file, the environment and the flags.
pub fn build_config(cli: &Cli) -> anyhow::Result<SelectionConfig> {
    let mut config = match &cli.config {
        Some(path) => SelectionConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => SelectionConfig::default(),
    };
    config.apply_env()?;
    apply_flags(&mut config, cli)?;
    config.validate()?;
    Ok(config)
}

fn apply_flags(config: &mut SelectionConfig, cli: &Cli) -> anyhow::Result<()> {
    if !cli.input.is_empty() {
        config.input_files = cli.input.clone();
    }
    if let Some(sizes) = &cli.subset_sizes {
        config.subset_sizes = parse_subset_sizes(sizes)?;
    }
    if let Some(dir) = &cli.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(batch_size) = cli.batch_size {
        config.encoder.batch_size = batch_size;
    }
    if let Some(num_folds) = cli.num_folds {
        config.num_folds = num_folds;
    }
    if let Some(epsilon) = cli.epsilon {
        config.epsilon = epsilon;
    }
    if let Some(mode) = cli.epsilon_mode {
        config.tolerance_mode = mode;
    }
    if let Some(optimizer) = cli.optimizer {
        config.optimizer = optimizer;
    }
    if let Some(mode) = cli.similarity_mode {
        config.similarity_mode = mode;
    }
    if let Some(tile_size) = cli.tile_size {
        config.tile_size = tile_size;
    }
    if cli.num_gpus.is_some() {
        config.encoder.num_gpus = cli.num_gpus;
    }
    if cli.combine_files {
        config.combine_files = true;
    }
    if cli.testing_mode {
        config.system.testing_mode = true;
    }
    if let Some(encoder_type) = &cli.encoder_type {
        config.encoder.encoder_type = encoder_type.clone();
    }
    if let Some(model) = &cli.encoder_model {
        config.encoder.model = model.clone();
    }
    if let Some(dim) = cli.embedding_dim {
        config.encoder.dimension = dim;
    }
    if cli.instruction.is_some() {
        config.encoder.instruction = cli.instruction.clone();
    }
    if let Some(name) = &cli.template_name {
        config.template.name = name.clone();
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(policy) = cli.on_data_error {
        config.on_data_error = policy;
    }
    if cli.no_exact_sizes {
        config.exact_sizes = false;
    }
    if let Some(retries) = cli.max_retries {
        config.system.max_retries = retries;
    }
    if let Some(delay) = cli.retry_delay_ms {
        config.system.retry_delay_ms = delay;
    }
    if cli.no_embedding_cache {
        config.system.embedding_cache = false;
    }
    Ok(())
}
