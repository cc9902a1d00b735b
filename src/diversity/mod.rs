//! Diverse subset selection by facility-location maximization.
//!
//! Selection runs per fold so that similarity never spans the full dataset:
//!
//! 1. **Partition** - shuffle record positions with a fixed seed and split
//!    them into near-equal folds.
//! 2. **Similarity** - cosine similarity within a fold, computed in row tiles,
//!    either materialized or recomputed on demand.
//! 3. **Ranking** - greedy facility-location ordering of every fold (lazy
//!    heap with epsilon acceptance, or exact rescans).
//! 4. **Assembly** - per-fold quotas for each requested size, merged by gain.
//!
//! # Usage
//!
//! ```rust,ignore
//! use subset_forge::diversity::{
//!     assemble, partition, DenseSimilarity, FacilityLocationSelector, FoldRanking,
//!     SubsetRequest,
//! };
//!
//! let folds = partition(embeddings.nrows(), 4, 42)?;
//! let selector = FacilityLocationSelector::new();
//! let mut rankings = Vec::new();
//! for fold in folds {
//!     let sim = DenseSimilarity::new(embeddings.select(Axis(0), &fold.indices).view(), 1024);
//!     let ranking = selector.rank(&sim, &cancel)?;
//!     rankings.push(FoldRanking { fold, ranking });
//! }
//! let subset = assemble(&rankings, SubsetRequest::Fraction(0.1), true)?;
//! ```

pub mod assembler;
pub mod facility;
pub mod partition;
pub mod similarity;
pub mod workers;

pub use assembler::{
    allocate, assemble, parse_subset_sizes, FoldRanking, SelectedItem, SubsetRequest,
    SubsetSelection,
};
pub use facility::{
    coverage, FacilityLocationSelector, GreedyRanking, Optimizer, ToleranceMode, DEFAULT_EPSILON,
};
pub use partition::{partition, verify_partition, Fold};
pub use similarity::{
    build_similarity, normalize_rows, similarity, DenseSimilarity, SimilarityMode,
    SimilaritySource, StreamingSimilarity, DEFAULT_TILE_SIZE,
};
pub use workers::{rank_folds, FoldJob, FoldRankingPlan};
