//! Multi-device batch encoding.
//!
//! Texts are cut into contiguous batches and dealt round-robin to the
//! resolved devices. Each device gets one tokio task that loads its own
//! encoder instance and processes its batches in order. Rows are written
//! back by original index, so the output ordering never depends on
//! scheduling.

use std::ops::Range;
use std::sync::Arc;

use ndarray::{Array2, ArrayView1};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::EncoderError;
use crate::utils::{retry, CancellationFlag, RetryPolicy};

use super::{Device, DevicePool, EncoderConfig, EncoderRegistry};

/// One encoded batch.
#[derive(Debug)]
struct EncodedBatch {
    range: Range<usize>,
    attempts: u32,
    rows: Vec<Vec<f32>>,
}

/// Drives encoder instances across a fixed set of devices.
#[derive(Debug, Clone)]
pub struct EncoderPool {
    registry: Arc<EncoderRegistry>,
    devices: DevicePool,
    retry: RetryPolicy,
    cancel: CancellationFlag,
}

impl EncoderPool {
    /// Creates a pool with the default retry policy.
    pub fn new(registry: Arc<EncoderRegistry>, devices: DevicePool) -> Self {
        Self {
            registry,
            devices,
            retry: RetryPolicy::default(),
            cancel: CancellationFlag::new(),
        }
    }

    /// Sets the retry policy used around encoder loads and batches.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the flag checked between batches.
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Devices this pool dispatches to.
    pub fn devices(&self) -> &DevicePool {
        &self.devices
    }

    /// Encodes every text; row `i` of the result belongs to `texts[i]`.
    pub async fn encode_all(
        &self,
        texts: &[String],
        config: &EncoderConfig,
    ) -> Result<Array2<f32>, EncoderError> {
        self.registry.check(&config.encoder_type)?;
        if self.cancel.is_cancelled() {
            return Err(EncoderError::Cancelled);
        }
        if texts.is_empty() {
            return Ok(Array2::zeros((0, 0)));
        }

        let prepared: Arc<Vec<String>> =
            Arc::new(texts.iter().map(|t| config.prepare(t)).collect());
        let batches = batch_ranges(texts.len(), config.batch_size);
        let assignments = self.devices.assign(batches.iter().cloned());

        info!(
            texts = texts.len(),
            batches = batches.len(),
            devices = assignments.len(),
            encoder = %config.encoder_type,
            model = %config.model,
            "Encoding texts"
        );

        let mut workers = JoinSet::new();
        for (device, ranges) in assignments {
            let registry = Arc::clone(&self.registry);
            let texts = Arc::clone(&prepared);
            let config = config.clone();
            let policy = self.retry.clone();
            let cancel = self.cancel.clone();
            workers.spawn(async move {
                encode_on_device(registry, device, texts, ranges, config, policy, cancel).await
            });
        }

        let mut encoded = Vec::with_capacity(batches.len());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(parts)) => encoded.extend(parts),
                Ok(Err(err)) => {
                    workers.abort_all();
                    return Err(err);
                }
                Err(join_err) => {
                    workers.abort_all();
                    return Err(EncoderError::Worker(join_err.to_string()));
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(EncoderError::Cancelled);
        }

        assemble_rows(texts.len(), encoded)
    }
}

/// Contiguous `[start, end)` batches of at most `batch_size` items.
pub(crate) fn batch_ranges(n: usize, batch_size: usize) -> Vec<Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..n)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(n))
        .collect()
}

async fn encode_on_device(
    registry: Arc<EncoderRegistry>,
    device: Device,
    texts: Arc<Vec<String>>,
    ranges: Vec<Range<usize>>,
    config: EncoderConfig,
    policy: RetryPolicy,
    cancel: CancellationFlag,
) -> Result<Vec<EncodedBatch>, EncoderError> {
    let load_label = format!("load {} on {}", config.encoder_type, device);
    let encoder = retry(&policy, &load_label, EncoderError::is_transient, |_| {
        let registry = Arc::clone(&registry);
        let config = config.clone();
        async move { registry.create(&config, device) }
    })
    .await
    .map_err(|e| e.into_inner())?;

    debug!(%device, encoder = encoder.name(), batches = ranges.len(), "Encoder loaded");

    let encoder = encoder.as_ref();
    let mut parts = Vec::with_capacity(ranges.len());
    for range in ranges {
        if cancel.is_cancelled() {
            return Err(EncoderError::Cancelled);
        }

        let batch = &texts[range.clone()];
        let label = format!("encode {}..{} on {}", range.start, range.end, device);
        let mut attempts = 0;
        let rows = retry(&policy, &label, EncoderError::is_transient, |attempt| {
            attempts = attempt;
            encoder.encode(batch)
        })
        .await
        .map_err(|e| EncoderError::EncodingFailed {
            range: range.clone(),
            attempts: e.attempts(),
            cause: Box::new(e.into_inner()),
        })?;

        if rows.len() != range.len() {
            return Err(EncoderError::EncodingFailed {
                range: range.clone(),
                attempts,
                cause: Box::new(EncoderError::InvalidResponse(format!(
                    "expected {} rows, got {}",
                    range.len(),
                    rows.len()
                ))),
            });
        }

        debug!(%device, start = range.start, end = range.end, "Batch encoded");
        parts.push(EncodedBatch {
            range,
            attempts,
            rows,
        });
    }

    Ok(parts)
}

/// Writes batch rows into one matrix by original index, checking that every
/// row has the same width.
fn assemble_rows(n: usize, mut parts: Vec<EncodedBatch>) -> Result<Array2<f32>, EncoderError> {
    parts.sort_by_key(|p| p.range.start);

    let dimension = parts
        .iter()
        .flat_map(|p| p.rows.first())
        .map(Vec::len)
        .next()
        .unwrap_or(0);

    let mut matrix = Array2::<f32>::zeros((n, dimension));
    let mut filled = 0;
    for part in &parts {
        for (offset, row) in part.rows.iter().enumerate() {
            if row.len() != dimension {
                return Err(EncoderError::EncodingFailed {
                    range: part.range.clone(),
                    attempts: part.attempts,
                    cause: Box::new(EncoderError::DimensionMismatch {
                        expected: dimension,
                        actual: row.len(),
                    }),
                });
            }
            matrix
                .row_mut(part.range.start + offset)
                .assign(&ArrayView1::from(row.as_slice()));
            filled += 1;
        }
    }

    if filled != n {
        return Err(EncoderError::InvalidResponse(format!(
            "assembled {} of {} rows",
            filled, n
        )));
    }
    Ok(matrix)
}
