//! # Two-Dimensional t-SNE Embedding
//!
//! Exact t-SNE over all samples of a dataset:
//!
//! - Inputs are centered and divided by their largest absolute value.
//! - Per-sample Gaussian bandwidths are found by bisection so each conditional
//!   distribution has the requested perplexity.
//! - The symmetrized affinities are matched by a Student-t layout using gradient
//!   descent with momentum, per-coordinate gains and early exaggeration.
//!
//! The initial layout comes from a seeded generator, so equal inputs and seeds give
//! equal coordinates regardless of how many threads compute the rows.

use crate::data::{DataError, Dataset};
use crate::kernel::squared_distances;
use ndarray::{Array1, Array2, Axis, Zip};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use thiserror::Error;

/// Output dimensionality.
pub const EMBEDDING_DIMS: usize = 2;
/// Coordinate names of an embedding turned into a dataset.
pub const EMBEDDING_FEATURES: [&str; EMBEDDING_DIMS] = ["tSNE1", "tSNE2"];

const EARLY_EXAGGERATION: f64 = 12.0;
const EXAGGERATION_ITERATIONS: usize = 250;
const INITIAL_MOMENTUM: f64 = 0.5;
const FINAL_MOMENTUM: f64 = 0.8;
const MIN_GAIN: f64 = 0.01;
const INIT_STD: f64 = 1e-4;
const BANDWIDTH_TOLERANCE: f64 = 1e-5;
const BANDWIDTH_STEPS: usize = 100;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Perplexity {perplexity} is too large for {samples} samples (need 3 * perplexity < samples - 1).")]
    PerplexityTooLarge { perplexity: f64, samples: usize },
    #[error("Invalid embedding parameter '{name}': {value}")]
    InvalidParameter { name: &'static str, value: f64 },
    #[error("The embedding diverged at iteration {0}.")]
    Diverged(usize),
    #[error("Error from the dataset: {0}")]
    Data(#[from] DataError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingProjector {
    pub perplexity: f64,
    pub iterations: usize,
    /// Upper bound on the step size. Each phase steps at most `n / (4 * exaggeration)`,
    /// the largest rate at which the attractive forces do not overshoot.
    pub learning_rate: f64,
    pub seed: u64,
}

impl Default for EmbeddingProjector {
    fn default() -> Self {
        Self {
            perplexity: 30.0,
            iterations: 1000,
            learning_rate: 200.0,
            seed: 42,
        }
    }
}

/// Coordinates for every sample, rows in dataset order.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub coordinates: Array2<f64>,
    pub kl_divergence: f64,
}

impl Embedding {
    /// The source dataset's samples described by their coordinates.
    pub fn to_dataset(&self, source: &Dataset) -> Result<Dataset, DataError> {
        source.with_features(
            self.coordinates.clone(),
            EMBEDDING_FEATURES.iter().map(|s| s.to_string()).collect(),
        )
    }
}

/// Conditional probabilities of row `i` for the bandwidth matching `log_perplexity`.
fn conditional_row(distances: ndarray::ArrayView1<f64>, i: usize, log_perplexity: f64) -> Array1<f64> {
    let n = distances.len();
    let mut beta = 1.0;
    let mut lower = f64::NEG_INFINITY;
    let mut upper = f64::INFINITY;
    let mut row = Array1::<f64>::zeros(n);

    for step in 0..BANDWIDTH_STEPS {
        for j in 0..n {
            row[j] = if j == i { 0.0 } else { (-distances[j] * beta).exp() };
        }
        let sum = row.sum().max(f64::MIN_POSITIVE);
        let weighted: f64 = row
            .iter()
            .zip(distances.iter())
            .map(|(p, d)| p * d)
            .sum();
        let entropy = sum.ln() + beta * weighted / sum;
        row /= sum;

        let gap = entropy - log_perplexity;
        if gap.abs() < BANDWIDTH_TOLERANCE {
            break;
        }
        if gap > 0.0 {
            lower = beta;
            beta = if upper.is_finite() { (beta + upper) / 2.0 } else { beta * 2.0 };
        } else {
            upper = beta;
            beta = if lower.is_finite() { (beta + lower) / 2.0 } else { beta / 2.0 };
        }
        if step + 1 == BANDWIDTH_STEPS {
            log::debug!("Bandwidth search for sample {i} stopped with entropy gap {gap:.2e}");
        }
    }
    row
}

/// Step size for one optimisation phase: the configured rate, capped where the
/// exaggerated attraction would overshoot on `samples` points.
fn phase_learning_rate(configured: f64, samples: usize, exaggeration: f64) -> f64 {
    configured.min(samples as f64 / (4.0 * exaggeration))
}

/// Student-t kernel values `1 / (1 + |y_i - y_j|^2)`, zero on the diagonal.
fn student_kernel(y: &Array2<f64>) -> Array2<f64> {
    let mut kernel = squared_distances(y.view(), y.view()).mapv(|d| 1.0 / (1.0 + d));
    kernel.diag_mut().fill(0.0);
    kernel
}

impl EmbeddingProjector {
    fn validate(&self, samples: usize) -> Result<(), EmbeddingError> {
        if !(self.perplexity.is_finite() && self.perplexity > 0.0) {
            return Err(EmbeddingError::InvalidParameter {
                name: "perplexity",
                value: self.perplexity,
            });
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(EmbeddingError::InvalidParameter {
                name: "learning_rate",
                value: self.learning_rate,
            });
        }
        if 3.0 * self.perplexity >= samples.saturating_sub(1) as f64 {
            return Err(EmbeddingError::PerplexityTooLarge {
                perplexity: self.perplexity,
                samples,
            });
        }
        Ok(())
    }

    /// Symmetric joint affinities `P` of the scaled inputs.
    fn affinities(&self, values: ndarray::ArrayView2<f64>) -> Array2<f64> {
        let n = values.nrows();
        let means = values
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(values.ncols()));
        let mut x = &values - &means;
        let max_abs = x.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        if max_abs > 0.0 {
            x /= max_abs;
        }

        let distances = squared_distances(x.view(), x.view());
        let log_perplexity = self.perplexity.ln();
        let rows: Vec<Array1<f64>> = (0..n)
            .into_par_iter()
            .map(|i| conditional_row(distances.row(i), i, log_perplexity))
            .collect();

        let mut conditional = Array2::<f64>::zeros((n, n));
        for (i, row) in rows.into_iter().enumerate() {
            conditional.row_mut(i).assign(&row);
        }
        let joint = (&conditional + &conditional.t()) / (2.0 * n as f64);
        joint.mapv(|p| p.max(1e-12))
    }

    pub fn project(&self, dataset: &Dataset) -> Result<Embedding, EmbeddingError> {
        let n = dataset.n_samples();
        self.validate(n)?;
        log::info!(
            "Embedding {n} samples x {} features with t-SNE (perplexity {}, {} iterations)",
            dataset.n_features(),
            self.perplexity,
            self.iterations
        );

        let p = self.affinities(dataset.values());

        let mut rng = StdRng::seed_from_u64(self.seed);
        let normal = Normal::new(0.0, INIT_STD).map_err(|_| EmbeddingError::InvalidParameter {
            name: "init_std",
            value: INIT_STD,
        })?;
        let mut y = Array2::from_shape_fn((n, EMBEDDING_DIMS), |_| normal.sample(&mut rng));
        let mut update = Array2::<f64>::zeros((n, EMBEDDING_DIMS));
        let mut gains = Array2::<f64>::ones((n, EMBEDDING_DIMS));
        log::debug!(
            "t-SNE step sizes: {:.3} while exaggerated, {:.3} after",
            phase_learning_rate(self.learning_rate, n, EARLY_EXAGGERATION),
            phase_learning_rate(self.learning_rate, n, 1.0)
        );

        for iter in 0..self.iterations {
            let (exaggeration, momentum) = if iter < EXAGGERATION_ITERATIONS {
                (EARLY_EXAGGERATION, INITIAL_MOMENTUM)
            } else {
                (1.0, FINAL_MOMENTUM)
            };
            let rate = phase_learning_rate(self.learning_rate, n, exaggeration);

            let kernel = student_kernel(&y);
            let normalizer = kernel.sum().max(f64::MIN_POSITIVE);
            let gradient_rows: Vec<[f64; EMBEDDING_DIMS]> = (0..n)
                .into_par_iter()
                .map(|i| {
                    let mut g = [0.0; EMBEDDING_DIMS];
                    for j in 0..n {
                        let q = kernel[[i, j]] / normalizer;
                        let force = 4.0 * (exaggeration * p[[i, j]] - q) * kernel[[i, j]];
                        for (d, gd) in g.iter_mut().enumerate() {
                            *gd += force * (y[[i, d]] - y[[j, d]]);
                        }
                    }
                    g
                })
                .collect();
            let gradient = Array2::from_shape_fn((n, EMBEDDING_DIMS), |(i, d)| gradient_rows[i][d]);

            Zip::from(&mut gains)
                .and(&gradient)
                .and(&update)
                .for_each(|gain, &g, &u| {
                    *gain = if (g > 0.0) != (u > 0.0) {
                        *gain + 0.2
                    } else {
                        (*gain * 0.8).max(MIN_GAIN)
                    };
                });
            update = &update * momentum - &(&gains * &gradient * rate);
            y += &update;

            let centre = y
                .mean_axis(Axis(0))
                .unwrap_or_else(|| Array1::zeros(EMBEDDING_DIMS));
            y -= &centre;

            if y.iter().any(|v| !v.is_finite()) {
                return Err(EmbeddingError::Diverged(iter));
            }
            if iter % 100 == 0 {
                log::debug!("t-SNE iteration {iter}: KL {:.4}", kl_divergence(&p, &y));
            }
        }

        let kl = kl_divergence(&p, &y);
        log::info!("t-SNE finished with KL divergence {kl:.4}");
        Ok(Embedding {
            coordinates: y,
            kl_divergence: kl,
        })
    }
}

fn kl_divergence(p: &Array2<f64>, y: &Array2<f64>) -> f64 {
    let kernel = student_kernel(y);
    let normalizer = kernel.sum().max(f64::MIN_POSITIVE);
    let mut kl = 0.0;
    for ((i, j), &pij) in p.indexed_iter() {
        if i != j {
            let q = (kernel[[i, j]] / normalizer).max(1e-12);
            kl += pij * (pij / q).ln();
        }
    }
    kl
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ClassNames, Label};
    use ndarray::array;

    /// Two tight, well separated clusters of 15 samples each in 5 dimensions.
    fn clusters() -> Dataset {
        let n = 30;
        let values = Array2::from_shape_fn((n, 5), |(i, j)| {
            let offset = if i < 15 { 0.0 } else { 10.0 };
            offset + ((i * 7 + j * 3) % 11) as f64 * 0.05
        });
        Dataset::new(
            values,
            (0..n)
                .map(|i| if i < 15 { Label::Negative } else { Label::Positive })
                .collect(),
            (0..5).map(|j| format!("g{j}")).collect(),
            (0..n).map(|i| format!("s{i}")).collect(),
            ClassNames {
                negative: "A".into(),
                positive: "B".into(),
            },
        )
        .unwrap()
    }

    fn projector() -> EmbeddingProjector {
        EmbeddingProjector {
            perplexity: 5.0,
            iterations: 300,
            learning_rate: 100.0,
            seed: 3,
        }
    }

    #[test]
    fn conditional_rows_hit_the_target_perplexity() {
        let distances = array![0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let row = conditional_row(distances.view(), 0, 3.0_f64.ln());
        assert_eq!(row[0], 0.0);
        assert!((row.sum() - 1.0).abs() < 1e-9);
        let entropy: f64 = row.iter().filter(|&&p| p > 0.0).map(|p| -p * p.ln()).sum();
        assert!((entropy - 3.0_f64.ln()).abs() < 1e-3);
    }

    #[test]
    fn same_seed_gives_the_same_embedding() {
        let ds = clusters();
        let a = projector().project(&ds).unwrap();
        let b = projector().project(&ds).unwrap();
        assert_eq!(a.coordinates, b.coordinates);
        assert_eq!(a.coordinates.dim(), (30, 2));
    }

    #[test]
    fn clusters_stay_apart() {
        let ds = clusters();
        let embedding = projector().project(&ds).unwrap();
        let y = &embedding.coordinates;
        let centroid = |rows: std::ops::Range<usize>| {
            let len = rows.len() as f64;
            let mut c = [0.0; 2];
            for i in rows {
                c[0] += y[[i, 0]] / len;
                c[1] += y[[i, 1]] / len;
            }
            c
        };
        let (a, b) = (centroid(0..15), centroid(15..30));
        let between = ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt();
        let spread = (0..15)
            .map(|i| ((y[[i, 0]] - a[0]).powi(2) + (y[[i, 1]] - a[1]).powi(2)).sqrt())
            .fold(0.0_f64, f64::max);
        assert!(between > spread, "between {between}, spread {spread}");

        let coords = embedding.to_dataset(&ds).unwrap();
        assert_eq!(coords.feature_names(), &["tSNE1".to_string(), "tSNE2".to_string()]);
        assert_eq!(coords.labels(), ds.labels());
    }

    #[test]
    fn large_learning_rate_keeps_neighbours_together() {
        let ds = clusters();
        let y = projector().project(&ds).unwrap().coordinates;
        let extent = y.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        assert!(extent < 100.0, "coordinates reach {extent}");

        let labels = ds.labels();
        for i in 0..30 {
            let nearest = (0..30)
                .filter(|&j| j != i)
                .min_by(|&a, &b| {
                    let da = (y[[i, 0]] - y[[a, 0]]).powi(2) + (y[[i, 1]] - y[[a, 1]]).powi(2);
                    let db = (y[[i, 0]] - y[[b, 0]]).powi(2) + (y[[i, 1]] - y[[b, 1]]).powi(2);
                    da.total_cmp(&db)
                })
                .unwrap();
            assert_eq!(labels[nearest], labels[i], "sample {i} sits next to the other cluster");
        }
    }

    #[test]
    fn step_size_is_capped_by_sample_count() {
        assert_eq!(phase_learning_rate(200.0, 30, 12.0), 30.0 / 48.0);
        assert_eq!(phase_learning_rate(200.0, 30, 1.0), 7.5);
        assert_eq!(phase_learning_rate(200.0, 100_000, 12.0), 200.0);
    }

    #[test]
    fn oversized_perplexity_is_rejected() {
        let ds = clusters();
        let projector = EmbeddingProjector {
            perplexity: 10.0,
            ..projector()
        };
        assert!(matches!(
            projector.project(&ds),
            Err(EmbeddingError::PerplexityTooLarge { .. })
        ));
    }
}
