//! Seeded fold partitioning.
//!
//! The index range `[0, n)` is shuffled with a seeded ChaCha8 generator and
//! sliced into `num_folds` contiguous chunks. The first `n % num_folds`
//! chunks carry one extra element, so no fold is empty and every fold holds
//! at most `ceil(n / num_folds)` indices.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::PartitionError;

/// A disjoint slice of the record positions, selected independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    /// Fold number, `0..num_folds`.
    pub id: usize,
    /// Positions in this fold, in shuffled order. Position `i` of this
    /// vector is the fold-local index `i`.
    pub indices: Vec<usize>,
}

impl Fold {
    /// Number of positions in the fold.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Returns true if the fold holds no positions.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Splits `[0, n)` into `num_folds` near-equal folds.
pub fn partition(n: usize, num_folds: usize, seed: u64) -> Result<Vec<Fold>, PartitionError> {
    if num_folds < 1 || num_folds > n {
        return Err(PartitionError::InvalidFoldCount { num_folds, n });
    }

    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    let base = n / num_folds;
    let extra = n % num_folds;
    let mut folds = Vec::with_capacity(num_folds);
    let mut start = 0;
    for id in 0..num_folds {
        let size = base + usize::from(id < extra);
        folds.push(Fold {
            id,
            indices: order[start..start + size].to_vec(),
        });
        start += size;
    }

    Ok(folds)
}

/// Checks that `folds` cover `[0, n)` exactly once.
pub fn verify_partition(folds: &[Fold], n: usize) -> Result<(), PartitionError> {
    let mut seen = vec![false; n];
    for fold in folds {
        for &index in &fold.indices {
            if index >= n {
                return Err(PartitionError::InvariantViolation(format!(
                    "fold {} holds index {} outside [0, {})",
                    fold.id, index, n
                )));
            }
            if seen[index] {
                return Err(PartitionError::InvariantViolation(format!(
                    "index {} appears in more than one fold (again in fold {})",
                    index, fold.id
                )));
            }
            seen[index] = true;
        }
    }

    if let Some(missing) = seen.iter().position(|s| !s) {
        return Err(PartitionError::InvariantViolation(format!(
            "index {} is not covered by any fold",
            missing
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_covers_range_once() {
        let folds = partition(103, 7, 42).unwrap();
        assert_eq!(folds.len(), 7);
        verify_partition(&folds, 103).unwrap();
    }

    #[test]
    fn test_fold_sizes_are_balanced() {
        let folds = partition(10, 3, 1).unwrap();
        let sizes: Vec<usize> = folds.iter().map(Fold::len).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert!(folds.iter().all(|f| f.len() <= 10_usize.div_ceil(3)));
    }

    #[test]
    fn test_partition_is_deterministic() {
        assert_eq!(partition(50, 4, 7).unwrap(), partition(50, 4, 7).unwrap());
        assert_ne!(partition(50, 4, 7).unwrap(), partition(50, 4, 8).unwrap());
    }

    #[test]
    fn test_one_fold_per_record() {
        let folds = partition(5, 5, 0).unwrap();
        assert!(folds.iter().all(|f| f.len() == 1));
        verify_partition(&folds, 5).unwrap();
    }

    #[test]
    fn test_invalid_fold_counts() {
        assert_eq!(
            partition(5, 0, 0),
            Err(PartitionError::InvalidFoldCount { num_folds: 0, n: 5 })
        );
        assert_eq!(
            partition(3, 4, 0),
            Err(PartitionError::InvalidFoldCount { num_folds: 4, n: 3 })
        );
    }

    #[test]
    fn test_verify_detects_violations() {
        let overlap = vec![
            Fold {
                id: 0,
                indices: vec![0, 1],
            },
            Fold {
                id: 1,
                indices: vec![1, 2],
            },
        ];
        assert!(verify_partition(&overlap, 3).is_err());

        let gap = vec![Fold {
            id: 0,
            indices: vec![0, 2],
        }];
        assert!(verify_partition(&gap, 3).is_err());

        let out_of_range = vec![Fold {
            id: 0,
            indices: vec![0, 1, 5],
        }];
        assert!(verify_partition(&out_of_range, 2).is_err());
    }
}
