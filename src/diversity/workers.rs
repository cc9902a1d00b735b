//! Parallel fold ranking.
//!
//! Folds are dealt round-robin to one blocking worker per device. A worker
//! owns its folds for the whole run: it gathers each fold's embedding rows,
//! builds the similarity source, ranks the fold and drops the similarity
//! before moving on, so one fold's matrix is alive per worker at a time.

use std::sync::Arc;
use std::time::Instant;

use ndarray::{Array2, Axis};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::encoder::{Device, DevicePool};
use crate::error::SelectionError;
use crate::utils::CancellationFlag;

use super::assembler::FoldRanking;
use super::facility::FacilityLocationSelector;
use super::partition::Fold;
use super::similarity::{build_similarity, SimilarityMode};

/// How each fold is ranked.
#[derive(Debug, Clone)]
pub struct FoldRankingPlan {
    pub selector: FacilityLocationSelector,
    pub similarity_mode: SimilarityMode,
    pub tile_size: usize,
}

/// A fold whose indices are embedding rows, paired with the record indices
/// reported for it.
#[derive(Debug, Clone)]
pub struct FoldJob {
    /// Fold over embedding row positions.
    pub fold: Fold,
    /// Record index for each row position in the embedding matrix.
    pub record_indices: Arc<Vec<usize>>,
}

/// Ranks every fold, spreading folds across device workers.
///
/// Results come back ordered by fold id, with fold indices translated to
/// record indices.
pub async fn rank_folds(
    embeddings: Arc<Array2<f32>>,
    jobs: Vec<FoldJob>,
    devices: &DevicePool,
    plan: &FoldRankingPlan,
    cancel: &CancellationFlag,
) -> Result<Vec<FoldRanking>, SelectionError> {
    let total = jobs.len();
    let mut workers = JoinSet::new();
    for (device, assigned) in devices.assign(jobs) {
        let embeddings = Arc::clone(&embeddings);
        let plan = plan.clone();
        let cancel = cancel.clone();
        workers.spawn_blocking(move || rank_on_device(device, &embeddings, assigned, &plan, &cancel));
    }

    let mut results = Vec::with_capacity(total);
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(rankings)) => results.extend(rankings),
            Ok(Err(err)) => {
                cancel.cancel();
                return Err(err);
            }
            Err(join_err) => {
                cancel.cancel();
                return Err(SelectionError::Worker(join_err.to_string()));
            }
        }
    }

    results.sort_by_key(|r: &FoldRanking| r.fold.id);
    Ok(results)
}

fn rank_on_device(
    device: Device,
    embeddings: &Array2<f32>,
    jobs: Vec<FoldJob>,
    plan: &FoldRankingPlan,
    cancel: &CancellationFlag,
) -> Result<Vec<FoldRanking>, SelectionError> {
    let mut rankings = Vec::with_capacity(jobs.len());
    for job in jobs {
        if cancel.is_cancelled() {
            return Err(SelectionError::Cancelled);
        }

        let started = Instant::now();
        let fold_embeddings = embeddings.select(Axis(0), &job.fold.indices);
        let ranking = {
            let sim = build_similarity(plan.similarity_mode, fold_embeddings.view(), plan.tile_size);
            plan.selector.rank(sim.as_ref(), cancel)?
        };

        let record_indices = job
            .fold
            .indices
            .iter()
            .map(|&row| {
                job.record_indices.get(row).copied().ok_or_else(|| {
                    SelectionError::InvariantViolation(format!(
                        "fold {} refers to embedding row {} beyond {} records",
                        job.fold.id,
                        row,
                        job.record_indices.len()
                    ))
                })
            })
            .collect::<Result<Vec<usize>, _>>()?;

        info!(
            %device,
            fold = job.fold.id,
            size = job.fold.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fold ranked"
        );
        debug!(
            fold = job.fold.id,
            top_gain = ranking.gains.first().copied().unwrap_or(0.0),
            "Fold ranking head"
        );

        rankings.push(FoldRanking {
            fold: Fold {
                id: job.fold.id,
                indices: record_indices,
            },
            ranking,
        });
    }
    Ok(rankings)
}
