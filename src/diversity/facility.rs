//! Facility-location greedy ranking.
//!
//! The objective for a selected set `S` over a fold `U` is
//!
//! ```text
//! F(S) = sum_{i in U} max_{j in S} max(0, sim(i, j))
//! ```
//!
//! `F` is monotone submodular, so greedily adding the index with the largest
//! marginal gain yields a ranking whose every prefix is the greedy solution
//! of that size. The whole fold is ranked once; subset sizes are cut from the
//! front afterwards.
//!
//! Two optimizers are provided. [`Optimizer::Exact`] rescans every candidate
//! each round. [`Optimizer::LazyGreedy`] keeps cached gains in a max-heap:
//! since gains only shrink as coverage grows, a cached gain is an upper
//! bound, and a candidate whose refreshed gain still tops the next bound is
//! the true argmax. With `epsilon > 0` a refreshed candidate is also
//! accepted when it is within tolerance of the next bound.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

use clap::ValueEnum;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SelectionError;
use crate::utils::CancellationFlag;

use super::similarity::{SimilaritySource, DEFAULT_TILE_SIZE};

/// Default epsilon for lazy greedy acceptance.
pub const DEFAULT_EPSILON: f64 = 160.0;

/// Greedy variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Optimizer {
    /// Rescan all candidates every round.
    Exact,
    /// Heap of cached upper bounds with epsilon acceptance.
    #[default]
    LazyGreedy,
}

impl fmt::Display for Optimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Optimizer::Exact => write!(f, "exact"),
            Optimizer::LazyGreedy => write!(f, "lazy-greedy"),
        }
    }
}

/// How `epsilon` is compared against the best remaining bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ToleranceMode {
    /// Accept when `gain + epsilon >= bound`.
    #[default]
    Absolute,
    /// Accept when `gain >= (1 - epsilon) * bound`.
    Relative,
}

impl fmt::Display for ToleranceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToleranceMode::Absolute => write!(f, "absolute"),
            ToleranceMode::Relative => write!(f, "relative"),
        }
    }
}

/// Every fold-local index in selection order, with the marginal gain each
/// had when chosen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GreedyRanking {
    /// Fold-local indices in selection order.
    pub order: Vec<usize>,
    /// Marginal gain recorded at each step.
    pub gains: Vec<f64>,
}

impl GreedyRanking {
    /// Number of ranked indices.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true for the ranking of an empty fold.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The greedy solution of size `k` (clamped to the ranking length).
    pub fn prefix(&self, k: usize) -> &[usize] {
        &self.order[..k.min(self.order.len())]
    }

    /// Checks that the ranking is a permutation of `[0, n)`.
    pub fn verify_permutation(&self, n: usize) -> Result<(), SelectionError> {
        if self.order.len() != n || self.gains.len() != n {
            return Err(SelectionError::InvariantViolation(format!(
                "ranking has {} entries and {} gains for a fold of {}",
                self.order.len(),
                self.gains.len(),
                n
            )));
        }
        let mut seen = vec![false; n];
        for &index in &self.order {
            if index >= n || seen[index] {
                return Err(SelectionError::InvariantViolation(format!(
                    "ranking is not a permutation: index {} repeated or out of range",
                    index
                )));
            }
            seen[index] = true;
        }
        Ok(())
    }
}

/// Heap entry: a candidate, its cached gain and the round it was computed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    gain: OrderedFloat<f64>,
    index: usize,
    round: usize,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on gain; equal gains pop the lower index first.
        self.gain
            .cmp(&other.gain)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Marginal gain of adding a candidate whose similarity row is `row`.
fn marginal_gain<'a>(row: impl IntoIterator<Item = &'a f32>, cover: &[f32]) -> f64 {
    row.into_iter()
        .zip(cover)
        .map(|(s, c)| f64::from((s - c).max(0.0)))
        .sum()
}

fn update_cover(cover: &mut [f32], row: &[f32]) {
    for (c, s) in cover.iter_mut().zip(row) {
        if *s > *c {
            *c = *s;
        }
    }
}

/// Objective value `F(S)` for the given fold-local indices.
pub fn coverage(sim: &dyn SimilaritySource, selected: &[usize]) -> f64 {
    let n = sim.len();
    let mut cover = vec![0.0f32; n];
    let mut row = vec![0.0f32; n];
    for &i in selected {
        sim.row_into(i, &mut row);
        update_cover(&mut cover, &row);
    }
    cover.iter().map(|c| f64::from(*c)).sum()
}

/// Ranks a fold by greedy facility-location gain.
#[derive(Debug, Clone, PartialEq)]
pub struct FacilityLocationSelector {
    optimizer: Optimizer,
    epsilon: f64,
    tolerance: ToleranceMode,
    tile_size: usize,
}

impl Default for FacilityLocationSelector {
    fn default() -> Self {
        Self {
            optimizer: Optimizer::default(),
            epsilon: DEFAULT_EPSILON,
            tolerance: ToleranceMode::default(),
            tile_size: DEFAULT_TILE_SIZE,
        }
    }
}

impl FacilityLocationSelector {
    /// Creates a selector with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the optimizer.
    pub fn with_optimizer(mut self, optimizer: Optimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Sets epsilon and how it is interpreted.
    pub fn with_epsilon(mut self, epsilon: f64, tolerance: ToleranceMode) -> Self {
        self.epsilon = epsilon.max(0.0);
        self.tolerance = tolerance;
        self
    }

    /// Sets the tile size used for full-matrix passes.
    pub fn with_tile_size(mut self, tile_size: usize) -> Self {
        self.tile_size = tile_size.max(1);
        self
    }

    /// Produces the full ranking for one fold.
    pub fn rank(
        &self,
        sim: &dyn SimilaritySource,
        cancel: &CancellationFlag,
    ) -> Result<GreedyRanking, SelectionError> {
        let n = sim.len();
        if n == 0 {
            warn!("Empty fold, nothing to rank; check the fold count against the dataset size");
            return Ok(GreedyRanking::default());
        }

        let ranking = match self.optimizer {
            Optimizer::Exact => self.rank_exact(sim, cancel)?,
            Optimizer::LazyGreedy => self.rank_lazy(sim, cancel)?,
        };
        ranking.verify_permutation(n)?;
        Ok(ranking)
    }

    /// Whether a refreshed gain is close enough to the next bound.
    fn within_tolerance(&self, gain: f64, bound: f64) -> bool {
        if self.epsilon <= 0.0 {
            return false;
        }
        match self.tolerance {
            ToleranceMode::Absolute => gain + self.epsilon >= bound,
            ToleranceMode::Relative => gain >= (1.0 - self.epsilon) * bound,
        }
    }

    /// Whether an absolute tolerance of this size accepts every refreshed
    /// candidate, given the largest gain in the fold.
    pub fn tolerance_covers_all_gains(&self, max_gain: f64) -> bool {
        self.tolerance == ToleranceMode::Absolute && self.epsilon > 0.0 && self.epsilon >= max_gain
    }

    /// Gains with nothing selected: the positive row sums.
    fn initial_gains(&self, sim: &dyn SimilaritySource) -> Vec<f64> {
        let n = sim.len();
        let cover = vec![0.0f32; n];
        let mut gains = vec![0.0; n];
        sim.for_each_tile(self.tile_size, &mut |start, tile| {
            for (offset, row) in tile.rows().into_iter().enumerate() {
                gains[start + offset] = marginal_gain(row, &cover);
            }
        });
        gains
    }

    fn rank_lazy(
        &self,
        sim: &dyn SimilaritySource,
        cancel: &CancellationFlag,
    ) -> Result<GreedyRanking, SelectionError> {
        let n = sim.len();
        let initial = self.initial_gains(sim);
        let max_gain = initial.iter().copied().fold(0.0, f64::max);
        if self.tolerance_covers_all_gains(max_gain) {
            warn!(
                epsilon = self.epsilon,
                max_gain,
                fold_size = n,
                "Epsilon is at least the largest gain in the fold; every refreshed candidate is \
                 accepted and the ranking follows initial gains instead of coverage"
            );
        }
        let mut heap: BinaryHeap<Candidate> = initial
            .into_iter()
            .enumerate()
            .map(|(index, gain)| Candidate {
                gain: OrderedFloat(gain),
                index,
                round: 0,
            })
            .collect();

        let mut cover = vec![0.0f32; n];
        let mut row = vec![0.0f32; n];
        let mut ranking = GreedyRanking {
            order: Vec::with_capacity(n),
            gains: Vec::with_capacity(n),
        };
        let mut refreshes = 0usize;

        while let Some(top) = heap.pop() {
            let round = ranking.order.len();
            if cancel.is_cancelled() {
                return Err(SelectionError::Cancelled);
            }

            let (chosen, gain) = if top.round == round {
                (top.index, top.gain.into_inner())
            } else {
                sim.row_into(top.index, &mut row);
                let gain = marginal_gain(&row, &cover);
                refreshes += 1;

                let accept = match heap.peek() {
                    None => true,
                    Some(next) => {
                        let bound = next.gain.into_inner();
                        gain > bound
                            || (gain == bound && top.index < next.index)
                            || self.within_tolerance(gain, bound)
                    }
                };
                if !accept {
                    heap.push(Candidate {
                        gain: OrderedFloat(gain),
                        index: top.index,
                        round,
                    });
                    continue;
                }
                (top.index, gain)
            };

            sim.row_into(chosen, &mut row);
            update_cover(&mut cover, &row);
            ranking.order.push(chosen);
            ranking.gains.push(gain);
        }

        debug!(fold_size = n, refreshes, "Lazy greedy ranking complete");
        Ok(ranking)
    }

    fn rank_exact(
        &self,
        sim: &dyn SimilaritySource,
        cancel: &CancellationFlag,
    ) -> Result<GreedyRanking, SelectionError> {
        let n = sim.len();
        let mut cover = vec![0.0f32; n];
        let mut row = vec![0.0f32; n];
        let mut selected = vec![false; n];
        let mut ranking = GreedyRanking {
            order: Vec::with_capacity(n),
            gains: Vec::with_capacity(n),
        };

        for _ in 0..n {
            if cancel.is_cancelled() {
                return Err(SelectionError::Cancelled);
            }

            let mut best: Option<(usize, f64)> = None;
            sim.for_each_tile(self.tile_size, &mut |start, tile| {
                for (offset, sim_row) in tile.rows().into_iter().enumerate() {
                    let index = start + offset;
                    if selected[index] {
                        continue;
                    }
                    let gain = marginal_gain(sim_row, &cover);
                    let better = match best {
                        None => true,
                        Some((_, best_gain)) => gain > best_gain,
                    };
                    if better {
                        best = Some((index, gain));
                    }
                }
            });

            let Some((chosen, gain)) = best else {
                break;
            };
            selected[chosen] = true;
            sim.row_into(chosen, &mut row);
            update_cover(&mut cover, &row);
            ranking.order.push(chosen);
            ranking.gains.push(gain);
        }

        debug!(fold_size = n, "Exact greedy ranking complete");
        Ok(ranking)
    }
}
