//! Fold-local cosine similarity.
//!
//! Rows are L2-normalized once (zero rows stay zero), then similarity is
//! computed as a matrix product in row tiles of `tile_size x fold_size`, so
//! at most one tile is in flight beyond what the chosen strategy keeps.
//! Values are clamped to `[-1, 1]` to absorb rounding.

use std::fmt;
use std::ops::Range;

use clap::ValueEnum;
use ndarray::{s, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Default number of rows per similarity tile.
pub const DEFAULT_TILE_SIZE: usize = 1024;

/// How similarity rows are provided to the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMode {
    /// Materialize the full fold matrix.
    #[default]
    Dense,
    /// Keep only normalized embeddings and recompute rows on demand.
    Streaming,
}

impl fmt::Display for SimilarityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimilarityMode::Dense => write!(f, "dense"),
            SimilarityMode::Streaming => write!(f, "streaming"),
        }
    }
}

/// Row access to a square, symmetric similarity matrix.
pub trait SimilaritySource {
    /// Matrix order (fold size).
    fn len(&self) -> usize;

    /// Returns true for an empty fold.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes row `i` into `out`, which must have length `len()`.
    fn row_into(&self, i: usize, out: &mut [f32]);

    /// Visits consecutive row tiles in order; `f` receives the first row
    /// index of the tile and the tile itself.
    fn for_each_tile(&self, tile_size: usize, f: &mut dyn FnMut(usize, ArrayView2<'_, f32>));
}

/// L2-normalizes every row; rows with zero norm are left as zeros.
pub fn normalize_rows(embeddings: ArrayView2<'_, f32>) -> Array2<f32> {
    let mut normalized = embeddings.to_owned();
    for mut row in normalized.axis_iter_mut(Axis(0)) {
        let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 1e-12 {
            row.mapv_inplace(|x| x / norm);
        }
    }
    normalized
}

/// Similarity of rows `rows` against every row of `normalized`.
fn similarity_tile(normalized: &Array2<f32>, rows: Range<usize>) -> Array2<f32> {
    let mut tile = normalized
        .slice(s![rows, ..])
        .dot(&normalized.t());
    tile.mapv_inplace(|v| v.clamp(-1.0, 1.0));
    tile
}

fn tile_ranges(n: usize, tile_size: usize) -> impl Iterator<Item = Range<usize>> {
    let tile_size = tile_size.max(1);
    (0..n)
        .step_by(tile_size)
        .map(move |start| start..(start + tile_size).min(n))
}

/// Full cosine similarity matrix of `embeddings`, built tile by tile.
pub fn similarity(embeddings: ArrayView2<'_, f32>, tile_size: usize) -> Array2<f32> {
    let normalized = normalize_rows(embeddings);
    let n = normalized.nrows();
    let mut matrix = Array2::<f32>::zeros((n, n));
    for rows in tile_ranges(n, tile_size) {
        let tile = similarity_tile(&normalized, rows.clone());
        matrix.slice_mut(s![rows, ..]).assign(&tile);
    }
    matrix
}

/// Materialized similarity matrix.
#[derive(Debug, Clone)]
pub struct DenseSimilarity {
    matrix: Array2<f32>,
}

impl DenseSimilarity {
    /// Computes the matrix for a fold's embeddings.
    pub fn new(embeddings: ArrayView2<'_, f32>, tile_size: usize) -> Self {
        Self {
            matrix: similarity(embeddings, tile_size),
        }
    }

    /// The underlying matrix.
    pub fn matrix(&self) -> &Array2<f32> {
        &self.matrix
    }
}

impl SimilaritySource for DenseSimilarity {
    fn len(&self) -> usize {
        self.matrix.nrows()
    }

    fn row_into(&self, i: usize, out: &mut [f32]) {
        for (o, v) in out.iter_mut().zip(self.matrix.row(i)) {
            *o = *v;
        }
    }

    fn for_each_tile(&self, tile_size: usize, f: &mut dyn FnMut(usize, ArrayView2<'_, f32>)) {
        for rows in tile_ranges(self.len(), tile_size) {
            let start = rows.start;
            f(start, self.matrix.slice(s![rows, ..]));
        }
    }
}

/// Similarity computed on demand from normalized embeddings.
///
/// Memory is `O(fold_size * dim)` instead of `O(fold_size^2)`; every row
/// access costs one matrix-vector product.
#[derive(Debug, Clone)]
pub struct StreamingSimilarity {
    normalized: Array2<f32>,
}

impl StreamingSimilarity {
    /// Normalizes and keeps a fold's embeddings.
    pub fn new(embeddings: ArrayView2<'_, f32>) -> Self {
        Self {
            normalized: normalize_rows(embeddings),
        }
    }
}

impl SimilaritySource for StreamingSimilarity {
    fn len(&self) -> usize {
        self.normalized.nrows()
    }

    fn row_into(&self, i: usize, out: &mut [f32]) {
        let query: ArrayView1<'_, f32> = self.normalized.row(i);
        let row = self.normalized.dot(&query);
        for (o, v) in out.iter_mut().zip(row.iter()) {
            *o = v.clamp(-1.0, 1.0);
        }
    }

    fn for_each_tile(&self, tile_size: usize, f: &mut dyn FnMut(usize, ArrayView2<'_, f32>)) {
        for rows in tile_ranges(self.len(), tile_size) {
            let start = rows.start;
            let tile = similarity_tile(&self.normalized, rows);
            f(start, tile.view());
        }
    }
}

/// Builds the similarity source for a fold.
pub fn build_similarity(
    mode: SimilarityMode,
    embeddings: ArrayView2<'_, f32>,
    tile_size: usize,
) -> Box<dyn SimilaritySource> {
    match mode {
        SimilarityMode::Dense => Box::new(DenseSimilarity::new(embeddings, tile_size)),
        SimilarityMode::Streaming => Box::new(StreamingSimilarity::new(embeddings)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample() -> Array2<f32> {
        array![
            [1.0, 0.0, 0.0],
            [0.0, 2.0, 0.0],
            [1.0, 1.0, 0.0],
            [-1.0, 0.0, 0.0],
            [0.0, 0.0, 0.0]
        ]
    }

    #[test]
    fn test_normalize_rows_keeps_zero_rows() {
        let normalized = normalize_rows(sample().view());
        assert!((normalized[[1, 1]] - 1.0).abs() < 1e-6);
        assert!(normalized.row(4).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_similarity_properties() {
        let m = similarity(sample().view(), 2);
        assert_eq!(m.dim(), (5, 5));
        for i in 0..5 {
            for j in 0..5 {
                assert!((m[[i, j]] - m[[j, i]]).abs() < 1e-6);
                assert!((-1.0..=1.0).contains(&m[[i, j]]));
            }
        }
        assert!((m[[0, 0]] - 1.0).abs() < 1e-6);
        assert!((m[[0, 3]] + 1.0).abs() < 1e-6);
        assert!((m[[0, 2]] - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);
        assert_eq!(m[[4, 4]], 0.0);
    }

    #[test]
    fn test_tile_size_does_not_change_result() {
        let a = similarity(sample().view(), 1);
        let b = similarity(sample().view(), 64);
        assert_eq!(a, b);
    }

    #[test]
    fn test_streaming_matches_dense() {
        let dense = DenseSimilarity::new(sample().view(), 2);
        let streaming = StreamingSimilarity::new(sample().view());
        assert_eq!(dense.len(), streaming.len());

        let mut a = vec![0.0; 5];
        let mut b = vec![0.0; 5];
        for i in 0..5 {
            dense.row_into(i, &mut a);
            streaming.row_into(i, &mut b);
            for (x, y) in a.iter().zip(&b) {
                assert!((x - y).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_for_each_tile_visits_every_row_once() {
        for source in [
            build_similarity(SimilarityMode::Dense, sample().view(), 2),
            build_similarity(SimilarityMode::Streaming, sample().view(), 2),
        ] {
            let mut starts = Vec::new();
            let mut rows = 0;
            source.for_each_tile(2, &mut |start, tile| {
                starts.push(start);
                assert_eq!(tile.ncols(), 5);
                rows += tile.nrows();
            });
            assert_eq!(starts, vec![0, 2, 4]);
            assert_eq!(rows, 5);
        }
    }

    #[test]
    fn test_empty_fold() {
        let empty = Array2::<f32>::zeros((0, 3));
        let source = build_similarity(SimilarityMode::Dense, empty.view(), 4);
        assert!(source.is_empty());
    }
}
