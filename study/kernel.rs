//! Kernel logistic regression with a Gaussian RBF kernel.
//!
//! The decision function is `f(x) = b + sum_j alpha_j k(x_j, x)` over the training
//! samples, with `k(u, v) = exp(-sigma * |u - v|^2)`. Coefficients minimize
//! `-logL + (n * lambda / 2) * alpha' K alpha` by Newton iterations.
//!
//! Each Newton step reduces to one SPD solve. With `M = K + n * lambda * W^-1`,
//! `u = M^-1 z` and `v = M^-1 1`, the update is `b = sum(u) / sum(v)` and
//! `alpha = u - b v`.

use crate::linalg::{FaerCholesky, LinalgError};
use crate::logistic::{FitError, IrlsOptions, check_response, glm_working_vectors, log_likelihood};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Squared Euclidean distances between the rows of `a` and the rows of `b`.
pub fn squared_distances(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
    let a_norms: Array1<f64> = a.axis_iter(Axis(0)).map(|r| r.dot(&r)).collect();
    let b_norms: Array1<f64> = b.axis_iter(Axis(0)).map(|r| r.dot(&r)).collect();
    let mut d = a.dot(&b.t());
    for ((i, j), v) in d.indexed_iter_mut() {
        *v = (a_norms[i] + b_norms[j] - 2.0 * *v).max(0.0);
    }
    d
}

pub fn rbf_kernel(a: ArrayView2<f64>, b: ArrayView2<f64>, sigma: f64) -> Array2<f64> {
    squared_distances(a, b).mapv(|d| (-sigma * d).exp())
}

/// A fitted kernel expansion. Keeps its own copy of the (standardized) training rows.
#[derive(Debug, Clone)]
pub struct KernelFit {
    pub support: Array2<f64>,
    pub alpha: Array1<f64>,
    pub intercept: f64,
    pub sigma: f64,
    pub log_likelihood: f64,
    pub iterations: usize,
}

impl KernelFit {
    pub fn decision_function(&self, x: ArrayView2<f64>) -> Array1<f64> {
        rbf_kernel(x, self.support.view(), self.sigma).dot(&self.alpha) + self.intercept
    }
}

fn newton_failure(iteration: usize, err: LinalgError) -> FitError {
    FitError::NonConvergence {
        iterations: iteration,
        reason: format!("kernel system is not positive definite ({err})"),
    }
}

pub fn fit_kernel_logistic(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    sigma: f64,
    lambda: f64,
    options: &IrlsOptions,
) -> Result<KernelFit, FitError> {
    check_response(x, y)?;
    for (name, value) in [("sigma", sigma), ("lambda", lambda)] {
        if !(value.is_finite() && value > 0.0) {
            return Err(FitError::InvalidHyperparameter {
                name: name.to_string(),
                value,
            });
        }
    }

    let n = x.nrows();
    let ridge = n as f64 * lambda;
    let gram = rbf_kernel(x, x, sigma);
    let ones = Array1::<f64>::ones(n);

    let objective_of = |alpha: &Array1<f64>, eta: &Array1<f64>| {
        let (mu, _, _) = glm_working_vectors(y, eta);
        -log_likelihood(y, &mu) + 0.5 * ridge * alpha.dot(&gram.dot(alpha))
    };

    let mut alpha = Array1::<f64>::zeros(n);
    let mut intercept = 0.0;
    let mut eta = Array1::<f64>::zeros(n);
    let mut objective = objective_of(&alpha, &eta);

    for iter in 1..=options.max_iterations {
        let (_, weights, z) = glm_working_vectors(y, &eta);
        let mut system = gram.clone();
        for i in 0..n {
            system[[i, i]] += ridge / weights[i];
        }
        let factor = system
            .cholesky(Side::Lower)
            .map_err(|e| newton_failure(iter, e))?;
        let u = factor.solve_vec(&z).map_err(|e| newton_failure(iter, e))?;
        let v = factor.solve_vec(&ones).map_err(|e| newton_failure(iter, e))?;
        let proposed_intercept = u.sum() / v.sum();
        let proposed_alpha = &u - &(&v * proposed_intercept);

        // Damp the step if the full Newton update overshoots.
        let mut step = 1.0;
        let (next_alpha, next_intercept, next_eta, next_objective) = loop {
            let a = &alpha + &((&proposed_alpha - &alpha) * step);
            let b = intercept + (proposed_intercept - intercept) * step;
            let e = gram.dot(&a) + b;
            let obj = objective_of(&a, &e);
            if (obj.is_finite() && obj <= objective + 1e-12 * objective.abs().max(1.0))
                || step < 1e-6
            {
                break (a, b, e, obj);
            }
            step *= 0.5;
        };

        if !next_objective.is_finite() {
            return Err(FitError::NonConvergence {
                iterations: iter,
                reason: "objective became non-finite".to_string(),
            });
        }

        let change = (objective - next_objective).abs();
        alpha = next_alpha;
        intercept = next_intercept;
        eta = next_eta;
        objective = next_objective;
        log::debug!("kernel Newton iteration {iter}: objective {objective:.6e}, change {change:.3e}");

        if change < options.tolerance * (objective.abs() + 0.1) {
            let (mu, _, _) = glm_working_vectors(y, &eta);
            return Ok(KernelFit {
                support: x.to_owned(),
                alpha,
                intercept,
                sigma,
                log_likelihood: log_likelihood(y, &mu),
                iterations: iter,
            });
        }
    }

    Err(FitError::NonConvergence {
        iterations: options.max_iterations,
        reason: format!("kernel fit (sigma = {sigma}, lambda = {lambda}) hit the iteration limit"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logistic::sigmoid;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn distances_match_direct_computation() {
        let a = array![[0.0, 0.0], [1.0, 2.0]];
        let b = array![[3.0, 4.0]];
        let d = squared_distances(a.view(), b.view());
        assert_abs_diff_eq!(d[[0, 0]], 25.0, epsilon = 1e-12);
        assert_abs_diff_eq!(d[[1, 0]], 8.0, epsilon = 1e-12);
    }

    #[test]
    fn learns_a_radial_boundary() {
        // Positives inside the unit circle, negatives on a ring of radius 2.5:
        // no linear boundary separates them.
        let n = 40;
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..n {
            let angle = i as f64 * std::f64::consts::TAU / n as f64;
            let radius = if i % 2 == 0 { 0.5 } else { 2.5 };
            rows.push([radius * angle.cos(), radius * angle.sin()]);
            labels.push(if i % 2 == 0 { 1.0 } else { 0.0 });
        }
        let x = Array2::from_shape_fn((n, 2), |(i, j)| rows[i][j]);
        let y = Array1::from(labels);

        let fit = fit_kernel_logistic(x.view(), y.view(), 0.5, 1e-3, &IrlsOptions::default())
            .unwrap();
        let probabilities = fit.decision_function(x.view()).mapv(sigmoid);
        let correct = probabilities
            .iter()
            .zip(y.iter())
            .filter(|(p, t)| (**p >= 0.5) == (**t > 0.5))
            .count();
        assert_eq!(correct, n);

        let centre = fit.decision_function(array![[0.0, 0.0]].view()).mapv(sigmoid);
        assert!(centre[0] > 0.5);
    }

    #[test]
    fn non_positive_hyperparameters_are_rejected() {
        let x = array![[0.0], [1.0]];
        let y = array![0.0, 1.0];
        let result = fit_kernel_logistic(x.view(), y.view(), 0.0, 1.0, &IrlsOptions::default());
        assert!(matches!(result, Err(FitError::InvalidHyperparameter { .. })));
    }
}
