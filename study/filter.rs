//! Unsupervised pre-filters applied to the training partition before selection.
//!
//! - `VarianceFilter` keeps the most variable features.
//! - `CorrelationPruner` drops one member of every highly correlated pair.
//!
//! Both read only the rows they are given, so fitting them on Train keeps the
//! held-out samples out of every selection decision.

use crate::data::{DataError, Dataset, FeatureSet};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Filtering needs a non-empty feature set and a positive feature count.")]
    EmptyFeatureSet,
    #[error("Correlation cutoff must lie in [0, 1], got {0}.")]
    InvalidCutoff(f64),
    #[error("Error from the dataset: {0}")]
    Data(#[from] DataError),
}

/// Pearson correlations between the columns of `x`.
///
/// A column with zero variance has correlation 0 with every column, itself included.
pub fn correlation_matrix(x: ArrayView2<f64>) -> Array2<f64> {
    let p = x.ncols();
    let means = x
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(p));
    let centered = &x - &means;
    let norms: Array1<f64> = centered
        .axis_iter(Axis(1))
        .map(|col| col.dot(&col).sqrt())
        .collect();
    let cross = centered.t().dot(&centered);
    let mut corr = Array2::zeros((p, p));
    for i in 0..p {
        for j in i..p {
            let scale = norms[i] * norms[j];
            let r = if scale > 1e-12 {
                (cross[[i, j]] / scale).clamp(-1.0, 1.0)
            } else {
                0.0
            };
            corr[[i, j]] = r;
            corr[[j, i]] = r;
        }
    }
    corr
}

/// Keeps the `top_n` features with the largest sample standard deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarianceFilter {
    top_n: usize,
}

impl VarianceFilter {
    pub fn new(top_n: usize) -> Self {
        Self { top_n }
    }

    /// Output is ordered by descending standard deviation, ties in input order.
    pub fn filter(&self, train: &Dataset, features: &FeatureSet) -> Result<FeatureSet, FilterError> {
        if self.top_n == 0 || features.is_empty() {
            return Err(FilterError::EmptyFeatureSet);
        }
        let x = train.design(features)?;
        let spread = if x.nrows() < 2 {
            Array1::zeros(x.ncols())
        } else {
            x.std_axis(Axis(0), 1.0)
        };

        let keep = if self.top_n > features.len() {
            log::warn!(
                "Variance filter asked for {} features but only {} are available; keeping all of them.",
                self.top_n,
                features.len()
            );
            features.len()
        } else {
            self.top_n
        };

        let mut order: Vec<usize> = (0..features.len()).collect();
        order.sort_by(|&a, &b| spread[b].total_cmp(&spread[a]));
        order.truncate(keep);

        log::info!("Variance filter kept {keep} of {} features", features.len());
        Ok(features.subset(&order))
    }
}

/// Removes features until no remaining pair has |r| above the cutoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationPruner {
    cutoff: f64,
}

impl CorrelationPruner {
    pub fn new(cutoff: f64) -> Result<Self, FilterError> {
        if !(0.0..=1.0).contains(&cutoff) {
            return Err(FilterError::InvalidCutoff(cutoff));
        }
        Ok(Self { cutoff })
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    /// Visits features by decreasing mean |r| and resolves each offending pair by
    /// dropping the member with the higher mean |r| to the features still present.
    /// On an exact tie the lexically higher name goes. Survivors keep input order.
    pub fn prune(&self, train: &Dataset, features: &FeatureSet) -> Result<FeatureSet, FilterError> {
        if features.is_empty() {
            return Err(FilterError::EmptyFeatureSet);
        }
        let x = train.design(features)?;
        let mut abs_corr = correlation_matrix(x.view()).mapv(f64::abs);
        abs_corr.diag_mut().fill(0.0);

        let p = features.len();
        let names = features.names();
        let mut alive = vec![true; p];
        let mut sums = abs_corr.sum_axis(Axis(1));

        let mut visit: Vec<usize> = (0..p).collect();
        visit.sort_by(|&a, &b| sums[b].total_cmp(&sums[a]));

        for (rank, &i) in visit.iter().enumerate() {
            for &j in &visit[rank + 1..] {
                if !alive[i] {
                    break;
                }
                if !alive[j] || abs_corr[[i, j]] <= self.cutoff {
                    continue;
                }
                let drop = match sums[i].total_cmp(&sums[j]) {
                    std::cmp::Ordering::Greater => i,
                    std::cmp::Ordering::Less => j,
                    std::cmp::Ordering::Equal => {
                        if names[i] > names[j] {
                            i
                        } else {
                            j
                        }
                    }
                };
                log::debug!(
                    "Dropping '{}' (|r| = {:.3} with '{}')",
                    names[drop],
                    abs_corr[[i, j]],
                    names[if drop == i { j } else { i }]
                );
                alive[drop] = false;
                for k in 0..p {
                    sums[k] -= abs_corr[[k, drop]];
                }
            }
        }

        let survivors: Vec<usize> = (0..p).filter(|&j| alive[j]).collect();
        log::info!(
            "Correlation pruning (cutoff {}) kept {} of {p} features",
            self.cutoff,
            survivors.len()
        );
        Ok(features.subset(&survivors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ClassNames, Label};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn dataset(values: Array2<f64>, names: &[&str]) -> Dataset {
        let n = values.nrows();
        Dataset::new(
            values,
            (0..n)
                .map(|i| if i % 2 == 0 { Label::Negative } else { Label::Positive })
                .collect(),
            names.iter().map(|s| s.to_string()).collect(),
            (0..n).map(|i| format!("s{i}")).collect(),
            ClassNames {
                negative: "A".into(),
                positive: "B".into(),
            },
        )
        .unwrap()
    }

    #[test]
    fn correlation_of_constant_column_is_zero() {
        let x = array![[1.0, 2.0, 5.0], [2.0, 4.0, 5.0], [3.0, 7.0, 5.0]];
        let r = correlation_matrix(x.view());
        assert_abs_diff_eq!(r[[0, 0]], 1.0, epsilon = 1e-12);
        assert!(r[[0, 1]] > 0.9);
        assert_eq!(r[[0, 2]], 0.0);
        assert_eq!(r[[2, 2]], 0.0);
    }

    #[test]
    fn variance_filter_ranks_and_is_idempotent() {
        let ds = dataset(
            array![[0.0, 0.0, 1.0], [1.0, 10.0, 1.0], [2.0, 20.0, 1.0], [3.0, 30.0, 1.0]],
            &["low", "high", "flat"],
        );
        let filter = VarianceFilter::new(2);
        let once = filter.filter(&ds, &ds.feature_set()).unwrap();
        assert_eq!(once.names(), &["high".to_string(), "low".to_string()]);
        let twice = filter.filter(&ds, &once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn variance_filter_clamps_and_rejects_empty_requests() {
        let ds = dataset(array![[0.0, 1.0], [1.0, 3.0]], &["a", "b"]);
        let all = VarianceFilter::new(10).filter(&ds, &ds.feature_set()).unwrap();
        assert_eq!(all.len(), 2);
        assert!(matches!(
            VarianceFilter::new(0).filter(&ds, &ds.feature_set()),
            Err(FilterError::EmptyFeatureSet)
        ));
    }

    #[test]
    fn pruning_leaves_no_pair_above_cutoff() {
        // b duplicates a almost exactly; c is independent of both.
        let ds = dataset(
            array![
                [1.0, 1.1, 3.0],
                [2.0, 2.0, -1.0],
                [3.0, 3.2, 2.0],
                [4.0, 3.9, -2.0],
                [5.0, 5.1, 0.5]
            ],
            &["a", "b", "c"],
        );
        let pruner = CorrelationPruner::new(0.9).unwrap();
        let kept = pruner.prune(&ds, &ds.feature_set()).unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept.contains("c"));

        let r = correlation_matrix(ds.design(&kept).unwrap().view());
        for i in 0..kept.len() {
            for j in (i + 1)..kept.len() {
                assert!(r[[i, j]].abs() <= 0.9);
            }
        }
    }

    #[test]
    fn exact_tie_keeps_the_lexically_lower_name() {
        let ds = dataset(
            array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0]],
            &["zeta", "alpha"],
        );
        let kept = CorrelationPruner::new(0.5)
            .unwrap()
            .prune(&ds, &ds.feature_set())
            .unwrap();
        assert_eq!(kept.names(), &["alpha".to_string()]);
    }

    #[test]
    fn cutoff_outside_unit_interval_is_rejected() {
        assert!(matches!(
            CorrelationPruner::new(1.5),
            Err(FilterError::InvalidCutoff(_))
        ));
        assert!(CorrelationPruner::new(f64::NAN).is_err());
        assert!(CorrelationPruner::new(1.0).is_ok());
    }
}
