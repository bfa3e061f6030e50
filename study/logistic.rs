//! Logistic regression solvers.
//!
//! Two fitting paths share the same GLM working vectors:
//! - `fit_ridge_logistic`: Newton/IRLS with an optional L2 penalty on the slopes and
//!   step-halving on the penalized objective. With no penalty it is the plain maximum
//!   likelihood fit used by stepwise selection, and it refuses to return coefficients
//!   that only exist because the classes are separable.
//! - `fit_lasso_logistic`: proximal Newton with cyclic coordinate descent on the
//!   weighted least-squares approximation, the L1 path solver.
//!
//! The intercept is never penalized.

use crate::linalg::solve_spd;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Linear predictors beyond this magnitude mean fitted probabilities of 0 or 1.
const SEPARATION_ETA: f64 = 25.0;
/// Maximum number of step-halvings before a Newton step is accepted as-is.
const MAX_STEP_HALVINGS: usize = 30;

/// Convergence controls for the Newton and coordinate-descent fits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrlsOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for IrlsOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-8,
        }
    }
}

/// Errors raised by any of the classifier fits.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("Model fit did not converge after {iterations} iterations: {reason}")]
    NonConvergence { iterations: usize, reason: String },
    #[error("Training data contains only one class.")]
    SingleClass,
    #[error("Design has {rows} rows but the response has {responses} entries.")]
    DimensionMismatch { rows: usize, responses: usize },
    #[error("Missing hyperparameter '{0}'.")]
    MissingHyperparameter(String),
    #[error("Invalid value {value} for hyperparameter '{name}'.")]
    InvalidHyperparameter { name: String, value: f64 },
}

/// A fitted logistic model on whatever columns it was given.
#[derive(Debug, Clone)]
pub struct LogisticFit {
    pub intercept: f64,
    pub coefficients: Array1<f64>,
    pub log_likelihood: f64,
    pub iterations: usize,
}

impl LogisticFit {
    pub fn linear_predictor(&self, x: ArrayView2<f64>) -> Array1<f64> {
        x.dot(&self.coefficients) + self.intercept
    }

    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Array1<f64> {
        self.linear_predictor(x).mapv(sigmoid)
    }

    /// Positions of the coefficients that are exactly nonzero.
    pub fn nonzero(&self) -> Vec<usize> {
        self.coefficients
            .iter()
            .enumerate()
            .filter(|(_, c)| **c != 0.0)
            .map(|(j, _)| j)
            .collect()
    }
}

pub fn sigmoid(eta: f64) -> f64 {
    let e = eta.clamp(-700.0, 700.0);
    1.0 / (1.0 + (-e).exp())
}

/// IRLS working quantities for the logit link: fitted means, weights and the
/// working response.
pub fn glm_working_vectors(
    y: ArrayView1<f64>,
    eta: &Array1<f64>,
) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    const MIN_WEIGHT: f64 = 1e-6;
    const PROB_EPS: f64 = 1e-8;

    let eta_clamped = eta.mapv(|e| e.clamp(-700.0, 700.0));
    let mut mu = eta_clamped.mapv(|e| 1.0 / (1.0 + (-e).exp()));
    mu.mapv_inplace(|v| v.clamp(PROB_EPS, 1.0 - PROB_EPS));
    let weights = (&mu * (1.0 - &mu)).mapv(|v| v.max(MIN_WEIGHT));
    let residual = &y - &mu;
    let z = &eta_clamped + &(&residual / &weights);
    (mu, weights, z)
}

/// Bernoulli log-likelihood of 0/1 responses `y` under means `mu`.
pub fn log_likelihood(y: ArrayView1<f64>, mu: &Array1<f64>) -> f64 {
    const EPS: f64 = 1e-12;
    Zip::from(y).and(mu).fold(0.0, |acc, &yi, &mui| {
        let m = mui.clamp(EPS, 1.0 - EPS);
        acc + yi * m.ln() + (1.0 - yi) * (1.0 - m).ln()
    })
}

/// Validates shapes and that both classes occur in `y`.
pub fn check_response(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), FitError> {
    if x.nrows() != y.len() {
        return Err(FitError::DimensionMismatch {
            rows: x.nrows(),
            responses: y.len(),
        });
    }
    let positives = y.iter().filter(|&&v| v > 0.5).count();
    if positives == 0 || positives == y.len() {
        return Err(FitError::SingleClass);
    }
    Ok(())
}

fn logit_of_mean(y: ArrayView1<f64>) -> f64 {
    let ybar = y.mean().unwrap_or(0.5).clamp(1e-6, 1.0 - 1e-6);
    (ybar / (1.0 - ybar)).ln()
}

/// Fits `P(y = 1) = sigmoid(b0 + x b)` minimizing `-logL + lambda/2 * |b|^2`.
///
/// `lambda = 0` gives the maximum-likelihood fit; it fails with
/// `FitError::NonConvergence` when the information matrix is singular or the
/// classes are (quasi-)separable.
pub fn fit_ridge_logistic(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    lambda: f64,
    options: &IrlsOptions,
) -> Result<LogisticFit, FitError> {
    check_response(x, y)?;
    if !(lambda.is_finite() && lambda >= 0.0) {
        return Err(FitError::InvalidHyperparameter {
            name: "lambda".to_string(),
            value: lambda,
        });
    }

    let (n, p) = x.dim();
    let mut design = Array2::<f64>::ones((n, p + 1));
    design.slice_mut(s![.., 1..]).assign(&x);

    let penalty = |b: &Array1<f64>| {
        let slopes = b.slice(s![1..]);
        0.5 * lambda * slopes.dot(&slopes)
    };

    let mut beta = Array1::<f64>::zeros(p + 1);
    beta[0] = logit_of_mean(y);
    let mut eta = design.dot(&beta);
    let (mut mu, mut weights, mut z) = glm_working_vectors(y, &eta);
    let mut objective = -log_likelihood(y, &mu) + penalty(&beta);

    for iter in 1..=options.max_iterations {
        let weighted = &design * &weights.view().insert_axis(Axis(1));
        let mut hessian = weighted.t().dot(&design);
        for j in 1..=p {
            hessian[[j, j]] += lambda;
        }
        let rhs = weighted.t().dot(&z);
        let proposal = solve_spd(&hessian, &rhs).map_err(|e| FitError::NonConvergence {
            iterations: iter,
            reason: format!("information matrix is not positive definite ({e})"),
        })?;
        let direction = &proposal - &beta;

        // Step-halving keeps the penalized objective monotone.
        let mut step = 1.0;
        let mut halvings = 0;
        let (candidate, candidate_eta, candidate_objective) = loop {
            let candidate = &beta + &(&direction * step);
            let candidate_eta = design.dot(&candidate);
            let (candidate_mu, _, _) = glm_working_vectors(y, &candidate_eta);
            let candidate_objective = -log_likelihood(y, &candidate_mu) + penalty(&candidate);
            let acceptable = candidate_objective.is_finite()
                && candidate_objective <= objective + 1e-12 * objective.abs().max(1.0);
            if acceptable || halvings >= MAX_STEP_HALVINGS {
                break (candidate, candidate_eta, candidate_objective);
            }
            step *= 0.5;
            halvings += 1;
        };

        if !candidate_objective.is_finite() {
            return Err(FitError::NonConvergence {
                iterations: iter,
                reason: "objective became non-finite".to_string(),
            });
        }

        let change = (objective - candidate_objective).abs();
        beta = candidate;
        eta = candidate_eta;
        (mu, weights, z) = glm_working_vectors(y, &eta);
        objective = candidate_objective;
        log::debug!(
            "IRLS iteration {iter}: objective {objective:.6e}, change {change:.3e}, step {step}"
        );

        if change < options.tolerance * (objective.abs() + 0.1) {
            let max_abs_eta = eta.iter().fold(0.0_f64, |m, e| m.max(e.abs()));
            if lambda == 0.0 && max_abs_eta > SEPARATION_ETA {
                return Err(FitError::NonConvergence {
                    iterations: iter,
                    reason: format!(
                        "fitted probabilities are numerically 0 or 1 (max |eta| = {max_abs_eta:.1}); the classes are separable"
                    ),
                });
            }
            return Ok(LogisticFit {
                intercept: beta[0],
                coefficients: beta.slice(s![1..]).to_owned(),
                log_likelihood: log_likelihood(y, &mu),
                iterations: iter,
            });
        }
    }

    Err(FitError::NonConvergence {
        iterations: options.max_iterations,
        reason: "iteration limit reached".to_string(),
    })
}

fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}

/// The smallest L1 penalty at which every slope is zero, for the objective
/// `-logL / n + lambda * |b|_1`.
pub fn lasso_lambda_max(x: ArrayView2<f64>, y: ArrayView1<f64>) -> f64 {
    let n = x.nrows().max(1) as f64;
    let ybar = y.mean().unwrap_or(0.0);
    let centered = y.mapv(|v| v - ybar);
    x.t()
        .dot(&centered)
        .iter()
        .fold(0.0_f64, |m, g| m.max(g.abs() / n))
}

/// Fits `-logL / n + lambda * |b|_1` by proximal Newton with coordinate descent.
///
/// `warm_start` seeds the coefficients, which is how a regularization path is
/// traversed from strong to weak penalties.
pub fn fit_lasso_logistic(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    lambda: f64,
    warm_start: Option<&LogisticFit>,
    options: &IrlsOptions,
) -> Result<LogisticFit, FitError> {
    const MAX_SWEEPS: usize = 1_000;

    check_response(x, y)?;
    if !(lambda.is_finite() && lambda >= 0.0) {
        return Err(FitError::InvalidHyperparameter {
            name: "l1_penalty".to_string(),
            value: lambda,
        });
    }

    let (n, p) = x.dim();
    let nf = n as f64;
    // Row j of `columns` is column j of x, contiguous for the coordinate sweeps.
    let columns = x.t().as_standard_layout().into_owned();

    let (mut intercept, mut beta) = match warm_start {
        Some(fit) if fit.coefficients.len() == p => (fit.intercept, fit.coefficients.clone()),
        _ => (logit_of_mean(y), Array1::zeros(p)),
    };

    for outer in 1..=options.max_iterations {
        let eta = x.dot(&beta) + intercept;
        let (_, weights, z) = glm_working_vectors(y, &eta);
        let mut residual = &z - &eta;
        let weight_sum = weights.sum();
        let curvature: Vec<f64> = columns
            .axis_iter(Axis(0))
            .map(|col| Zip::from(&col).and(&weights).fold(0.0, |acc, &c, &w| acc + w * c * c) / nf)
            .collect();

        let beta_before = beta.clone();
        let intercept_before = intercept;

        for _ in 0..MAX_SWEEPS {
            let shift = weights.dot(&residual) / weight_sum;
            intercept += shift;
            residual -= shift;
            let mut max_delta = shift.abs();

            for (j, col) in columns.axis_iter(Axis(0)).enumerate() {
                if curvature[j] <= 0.0 {
                    continue;
                }
                let old = beta[j];
                let gradient = Zip::from(&col)
                    .and(&weights)
                    .and(&residual)
                    .fold(0.0, |acc, &c, &w, &r| acc + c * w * r)
                    / nf;
                let updated = soft_threshold(gradient + curvature[j] * old, lambda) / curvature[j];
                if updated != old {
                    residual.scaled_add(-(updated - old), &col);
                    beta[j] = updated;
                    max_delta = max_delta.max((updated - old).abs() * curvature[j].sqrt());
                }
            }

            if max_delta < options.tolerance {
                break;
            }
        }

        if !intercept.is_finite() || beta.iter().any(|b| !b.is_finite()) {
            return Err(FitError::NonConvergence {
                iterations: outer,
                reason: "coefficients became non-finite".to_string(),
            });
        }

        let shift = beta
            .iter()
            .zip(beta_before.iter())
            .fold((intercept - intercept_before).abs(), |m, (a, b)| {
                m.max((a - b).abs())
            });
        if shift < options.tolerance {
            let fitted = (x.dot(&beta) + intercept).mapv(sigmoid);
            return Ok(LogisticFit {
                intercept,
                coefficients: beta,
                log_likelihood: log_likelihood(y, &fitted),
                iterations: outer,
            });
        }
    }

    Err(FitError::NonConvergence {
        iterations: options.max_iterations,
        reason: format!("L1 path did not settle at lambda = {lambda:.4e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    /// Two informative columns and one noise column, labels drawn from a logistic model.
    fn noisy_logistic_data(n: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array2::from_shape_fn((n, 3), |_| rng.sample::<f64, _>(StandardNormal));
        let y = x
            .axis_iter(Axis(0))
            .map(|row| {
                let p = sigmoid(0.3 + 1.2 * row[0] - 0.8 * row[1]);
                if rng.gen_range(0.0..1.0) < p { 1.0 } else { 0.0 }
            })
            .collect();
        (x, y)
    }

    #[test]
    fn intercept_only_fit_recovers_log_odds() {
        let x = Array2::<f64>::zeros((8, 0));
        let y = array![1.0, 1.0, 1.0, 0.0, 1.0, 0.0, 1.0, 1.0];
        let fit = fit_ridge_logistic(x.view(), y.view(), 0.0, &IrlsOptions::default()).unwrap();
        assert_abs_diff_eq!(fit.intercept, (6.0_f64 / 2.0).ln(), epsilon = 1e-6);
    }

    #[test]
    fn maximum_likelihood_recovers_signs() {
        let (x, y) = noisy_logistic_data(400, 7);
        let fit = fit_ridge_logistic(x.view(), y.view(), 0.0, &IrlsOptions::default()).unwrap();
        assert!(fit.coefficients[0] > 0.5);
        assert!(fit.coefficients[1] < -0.3);
        assert!(fit.coefficients[2].abs() < 0.4);
    }

    #[test]
    fn ridge_penalty_shrinks_slopes() {
        let (x, y) = noisy_logistic_data(200, 11);
        let options = IrlsOptions::default();
        let loose = fit_ridge_logistic(x.view(), y.view(), 0.0, &options).unwrap();
        let tight = fit_ridge_logistic(x.view(), y.view(), 50.0, &options).unwrap();
        let norm = |f: &LogisticFit| f.coefficients.dot(&f.coefficients);
        assert!(norm(&tight) < norm(&loose));
    }

    #[test]
    fn separable_classes_do_not_converge() {
        let x = array![[-3.0], [-2.0], [-1.0], [1.0], [2.0], [3.0]];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let result = fit_ridge_logistic(x.view(), y.view(), 0.0, &IrlsOptions::default());
        assert!(matches!(result, Err(FitError::NonConvergence { .. })));

        // The same data is fine once the slopes are penalized.
        assert!(fit_ridge_logistic(x.view(), y.view(), 1.0, &IrlsOptions::default()).is_ok());
    }

    #[test]
    fn single_class_is_rejected() {
        let x = array![[1.0], [2.0]];
        let y = array![1.0, 1.0];
        assert_eq!(
            fit_ridge_logistic(x.view(), y.view(), 0.0, &IrlsOptions::default()).unwrap_err(),
            FitError::SingleClass
        );
    }

    #[test]
    fn lasso_at_lambda_max_is_empty() {
        let (x, y) = noisy_logistic_data(150, 3);
        let lambda_max = lasso_lambda_max(x.view(), y.view());
        let fit =
            fit_lasso_logistic(x.view(), y.view(), lambda_max * 1.0001, None, &IrlsOptions::default())
                .unwrap();
        assert!(fit.nonzero().is_empty());
        assert_abs_diff_eq!(fit.intercept, logit_of_mean(y.view()), epsilon = 1e-4);
    }

    #[test]
    fn lasso_with_vanishing_penalty_matches_maximum_likelihood() {
        let (x, y) = noisy_logistic_data(300, 5);
        let options = IrlsOptions {
            max_iterations: 200,
            tolerance: 1e-10,
        };
        let ml = fit_ridge_logistic(x.view(), y.view(), 0.0, &options).unwrap();
        let lasso = fit_lasso_logistic(x.view(), y.view(), 1e-9, None, &options).unwrap();
        for j in 0..3 {
            assert_abs_diff_eq!(ml.coefficients[j], lasso.coefficients[j], epsilon = 1e-3);
        }
    }

    #[test]
    fn soft_threshold_is_symmetric() {
        assert_eq!(soft_threshold(3.0, 1.0), 2.0);
        assert_eq!(soft_threshold(-3.0, 1.0), -2.0);
        assert_eq!(soft_threshold(0.5, 1.0), 0.0);
    }
}
