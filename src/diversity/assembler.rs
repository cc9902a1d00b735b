//! Turns per-fold rankings into global subsets.
//!
//! A request is resolved to a global size `k`, split into per-fold quotas
//! proportional to fold size, and filled from the front of each fold's
//! ranking. The merged subset is ordered by recorded gain so that it reads
//! as a diversity ranking of its own.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::SelectionError;

use super::facility::GreedyRanking;
use super::partition::Fold;

/// One requested subset size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SubsetRequest {
    /// Fraction of the dataset, in `(0, 1]`.
    Fraction(f64),
    /// Absolute number of records, at least 1.
    Count(usize),
}

impl SubsetRequest {
    /// Validated fraction request.
    pub fn fraction(value: f64) -> Result<Self, SelectionError> {
        if !value.is_finite() || value <= 0.0 || value > 1.0 {
            return Err(SelectionError::InvalidSubsetSize {
                value: value.to_string(),
                reason: "fractions must be in (0, 1]".to_string(),
            });
        }
        Ok(SubsetRequest::Fraction(value))
    }

    /// Validated count request.
    pub fn count(value: usize) -> Result<Self, SelectionError> {
        if value == 0 {
            return Err(SelectionError::InvalidSubsetSize {
                value: "0".to_string(),
                reason: "counts must be at least 1".to_string(),
            });
        }
        Ok(SubsetRequest::Count(value))
    }

    /// Global subset size for a dataset of `n` records.
    ///
    /// Fractions round to the nearest count and are clamped to `[1, n]`;
    /// counts above `n` clamp to `n`.
    pub fn target(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        match *self {
            SubsetRequest::Fraction(f) => ((f * n as f64).round() as usize).clamp(1, n),
            SubsetRequest::Count(k) => k.clamp(1, n),
        }
    }

    /// File name label: `<pct>_percent` for fractions, the count otherwise.
    pub fn label(&self) -> String {
        match *self {
            SubsetRequest::Fraction(f) => {
                let pct = (f * 100.0 * 1e6).round() / 1e6;
                format!("{}_percent", pct)
            }
            SubsetRequest::Count(k) => k.to_string(),
        }
    }
}

impl fmt::Display for SubsetRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubsetRequest::Fraction(v) => write!(f, "{}", v),
            SubsetRequest::Count(k) => write!(f, "{}", k),
        }
    }
}

impl FromStr for SubsetRequest {
    type Err = SelectionError;

    /// A token containing `.` is a fraction, anything else a count.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        let invalid = |reason: &str| SelectionError::InvalidSubsetSize {
            value: token.to_string(),
            reason: reason.to_string(),
        };

        if token.contains('.') {
            let value: f64 = token
                .parse()
                .map_err(|_| invalid("not a valid fraction"))?;
            Self::fraction(value).map_err(|_| invalid("fractions must be in (0, 1]"))
        } else {
            let value: usize = token
                .parse()
                .map_err(|_| invalid("not a valid count"))?;
            Self::count(value)
        }
    }
}

impl<'de> Deserialize<'de> for SubsetRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(u64),
            Fraction(f64),
            Text(String),
        }

        let parsed = match Raw::deserialize(deserializer)? {
            Raw::Count(k) => usize::try_from(k)
                .map_err(|_| SelectionError::InvalidSubsetSize {
                    value: k.to_string(),
                    reason: "count too large".to_string(),
                })
                .and_then(SubsetRequest::count),
            Raw::Fraction(f) => SubsetRequest::fraction(f),
            Raw::Text(s) => s.parse(),
        };
        parsed.map_err(serde::de::Error::custom)
    }
}

/// Parses a comma-separated list such as `"0.1,0.5,1000"`.
pub fn parse_subset_sizes(input: &str) -> Result<Vec<SubsetRequest>, SelectionError> {
    let requests = input
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::parse::<SubsetRequest>)
        .collect::<Result<Vec<SubsetRequest>, _>>()?;

    if requests.is_empty() {
        return Err(SelectionError::InvalidSubsetSize {
            value: input.to_string(),
            reason: "no subset sizes given".to_string(),
        });
    }
    Ok(requests)
}

/// A fold together with its ranking. `fold.indices[i]` is the record index
/// of fold-local index `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldRanking {
    pub fold: Fold,
    pub ranking: GreedyRanking,
}

/// One record in an assembled subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedItem {
    /// Record index.
    pub index: usize,
    /// Fold the record came from.
    pub fold: usize,
    /// Position in its fold's ranking.
    pub rank: usize,
    /// Marginal gain when it was ranked.
    pub gain: f64,
}

/// The assembled answer to one request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubsetSelection {
    pub request: SubsetRequest,
    /// Resolved global size.
    pub target: usize,
    /// Selected records, highest gain first.
    pub items: Vec<SelectedItem>,
    /// Records taken from each fold.
    pub fold_counts: Vec<usize>,
}

impl SubsetSelection {
    /// Record indices in subset order.
    pub fn indices(&self) -> Vec<usize> {
        self.items.iter().map(|item| item.index).collect()
    }

    /// Number of selected records.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if nothing was selected.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Per-fold quotas for a global size `k`.
///
/// Each fold gets `round(k * size / n)`, capped at its size. With
/// `exact` set, drift is corrected until the quotas sum to `k`: a missing
/// slot goes to the fold with the most unused records, a surplus slot is
/// taken from the fold with the largest quota (lowest fold first on ties).
pub fn allocate(fold_sizes: &[usize], k: usize, exact: bool) -> Vec<usize> {
    let n: usize = fold_sizes.iter().sum();
    if n == 0 {
        return vec![0; fold_sizes.len()];
    }
    let k = k.min(n);

    let mut quotas: Vec<usize> = fold_sizes
        .iter()
        .map(|&size| (((k * size) as f64 / n as f64).round() as usize).min(size))
        .collect();

    if !exact {
        return quotas;
    }

    let mut total: usize = quotas.iter().sum();
    while total < k {
        let (fold, _) = quotas
            .iter()
            .zip(fold_sizes)
            .map(|(q, size)| size - q)
            .enumerate()
            .fold((0, 0), |best, (i, surplus)| {
                if surplus > best.1 {
                    (i, surplus)
                } else {
                    best
                }
            });
        quotas[fold] += 1;
        total += 1;
    }
    while total > k {
        let (fold, _) = quotas
            .iter()
            .enumerate()
            .fold((0, 0), |best, (i, &q)| if q > best.1 { (i, q) } else { best });
        quotas[fold] -= 1;
        total -= 1;
    }
    quotas
}

/// Builds the subset for one request from every fold's ranking.
pub fn assemble(
    rankings: &[FoldRanking],
    request: SubsetRequest,
    exact: bool,
) -> Result<SubsetSelection, SelectionError> {
    for entry in rankings {
        if entry.ranking.len() != entry.fold.len() {
            return Err(SelectionError::InvariantViolation(format!(
                "fold {} has {} records but its ranking has {}",
                entry.fold.id,
                entry.fold.len(),
                entry.ranking.len()
            )));
        }
    }

    let sizes: Vec<usize> = rankings.iter().map(|r| r.fold.len()).collect();
    let n: usize = sizes.iter().sum();
    if let SubsetRequest::Count(k) = request {
        if k > n {
            warn!(requested = k, available = n, "Subset count exceeds dataset size, clamping");
        }
    }

    let target = request.target(n);
    let fold_counts = allocate(&sizes, target, exact);

    // Each pick is keyed by the lowest gain seen so far in its fold, so a
    // fold's picks never overtake each other in the merge.
    let mut keyed: Vec<(f64, SelectedItem)> = Vec::with_capacity(target);
    for (entry, &quota) in rankings.iter().zip(&fold_counts) {
        let mut floor = f64::INFINITY;
        for (rank, (&local, &gain)) in entry
            .ranking
            .order
            .iter()
            .zip(&entry.ranking.gains)
            .take(quota)
            .enumerate()
        {
            let index = *entry.fold.indices.get(local).ok_or_else(|| {
                SelectionError::InvariantViolation(format!(
                    "fold {} ranking refers to local index {} beyond its size",
                    entry.fold.id, local
                ))
            })?;
            floor = floor.min(gain);
            keyed.push((
                floor,
                SelectedItem {
                    index,
                    fold: entry.fold.id,
                    rank,
                    gain,
                },
            ));
        }
    }

    keyed.sort_by(|(ka, a), (kb, b)| {
        kb.total_cmp(ka)
            .then(a.rank.cmp(&b.rank))
            .then(a.fold.cmp(&b.fold))
            .then(a.index.cmp(&b.index))
    });
    let items: Vec<SelectedItem> = keyed.into_iter().map(|(_, item)| item).collect();

    Ok(SubsetSelection {
        request,
        target,
        items,
        fold_counts,
    })
}
