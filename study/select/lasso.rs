//! Cross-validated L1 regularization path with the one-standard-error rule.
//!
//! The penalty grid runs geometrically from `lambda_max`, where every slope is zero,
//! down to `lambda_max * min_ratio`. Each fold walks the whole path with warm starts
//! on its own standardization; a path stops early once it explains almost all of
//! the null deviance, and the remaining penalties count as missing for that fold.

use super::{Selection, SelectionDiagnostics, SelectionError, StandardizedProblem, accuracy};
use crate::data::{Dataset, FeatureSet};
use crate::logistic::{
    FitError, IrlsOptions, LogisticFit, fit_lasso_logistic, lasso_lambda_max, log_likelihood,
};
use crate::model::{Configuration, FittedModel, Hyperparameter, Standardizer};
use crate::partition::FoldAssignment;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Paths stop once the fraction of null deviance explained passes this value.
const MAX_DEVIANCE_RATIO: f64 = 0.999;

#[derive(Debug, Clone, PartialEq)]
pub struct LassoSelector {
    pub path_length: usize,
    pub min_ratio: f64,
    pub folds: usize,
    pub seed: u64,
    pub options: IrlsOptions,
}

impl Default for LassoSelector {
    fn default() -> Self {
        Self {
            path_length: 100,
            min_ratio: 0.01,
            folds: 10,
            seed: 42,
            options: IrlsOptions::default(),
        }
    }
}

/// Cross-validation summary at one penalty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LassoPathPoint {
    pub penalty: f64,
    /// Mean held-out misclassification rate over the folds that reached this penalty.
    pub mean_error: Option<f64>,
    pub standard_error: Option<f64>,
    pub folds_completed: usize,
    /// Nonzero coefficients of the full-training fit at this penalty.
    pub nonzero: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LassoPath {
    pub points: Vec<LassoPathPoint>,
    pub min_error_penalty: f64,
    pub chosen_penalty: f64,
}

/// Geometric grid from `lambda_max` down to `lambda_max * min_ratio`.
pub fn penalty_grid(lambda_max: f64, min_ratio: f64, length: usize) -> Vec<f64> {
    match length {
        0 => Vec::new(),
        1 => vec![lambda_max],
        _ => {
            let step = min_ratio.ln() / (length - 1) as f64;
            (0..length)
                .map(|i| lambda_max * (step * i as f64).exp())
                .collect()
        }
    }
}

/// Fits the path with warm starts. Entries after the deviance-ratio stop, or after a
/// failed fit, are `None`.
fn fit_path(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    penalties: &[f64],
    options: &IrlsOptions,
) -> Vec<Option<LogisticFit>> {
    let ybar = y.mean().unwrap_or(0.5);
    let null_deviance = -2.0 * log_likelihood(y, &Array1::from_elem(y.len(), ybar));
    let mut path: Vec<Option<LogisticFit>> = Vec::with_capacity(penalties.len());
    let mut warm: Option<LogisticFit> = None;

    for &lambda in penalties {
        match fit_lasso_logistic(x, y, lambda, warm.as_ref(), options) {
            Ok(fit) => {
                let deviance_ratio = if null_deviance > 0.0 {
                    1.0 + 2.0 * fit.log_likelihood / null_deviance
                } else {
                    1.0
                };
                path.push(Some(fit.clone()));
                warm = Some(fit);
                if deviance_ratio > MAX_DEVIANCE_RATIO {
                    log::debug!("L1 path saturated at lambda = {lambda:.4e}");
                    break;
                }
            }
            Err(e) => {
                log::debug!("L1 path stopped at lambda = {lambda:.4e}: {e}");
                break;
            }
        }
    }
    path.resize(penalties.len(), None);
    path
}

/// Held-out error of fold `fold` at every penalty it reached.
fn fold_errors(
    raw: ArrayView2<f64>,
    y: ArrayView1<f64>,
    folds: &FoldAssignment,
    fold: usize,
    penalties: &[f64],
    options: &IrlsOptions,
) -> Vec<Option<f64>> {
    let fit_rows = folds.train_indices(fold);
    let held_rows = folds.validation_indices(fold);
    let fit_raw = raw.select(Axis(0), &fit_rows);
    let standardizer = Standardizer::fit(fit_raw.view());
    let fit_x = standardizer.transform(fit_raw.view());
    let fit_y = y.select(Axis(0), &fit_rows);
    let held_x = standardizer.transform(raw.select(Axis(0), &held_rows).view());
    let held_y = y.select(Axis(0), &held_rows);

    fit_path(fit_x.view(), fit_y.view(), penalties, options)
        .into_iter()
        .map(|fit| fit.map(|f| 1.0 - accuracy(&f.predict_proba(held_x.view()), &held_y)))
        .collect()
}

fn mean_and_standard_error(errors: &[f64]) -> (f64, f64) {
    let k = errors.len() as f64;
    let mean = errors.iter().sum::<f64>() / k;
    if errors.len() < 2 {
        return (mean, 0.0);
    }
    let variance = errors.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / (k - 1.0);
    (mean, (variance / k).sqrt())
}

impl LassoSelector {
    pub fn select(&self, train: &Dataset, candidates: &FeatureSet) -> Result<Selection, SelectionError> {
        if self.path_length == 0 {
            return Err(SelectionError::Fit(FitError::InvalidHyperparameter {
                name: "path_length".to_string(),
                value: 0.0,
            }));
        }
        if !(self.min_ratio > 0.0 && self.min_ratio < 1.0) {
            return Err(SelectionError::Fit(FitError::InvalidHyperparameter {
                name: "min_ratio".to_string(),
                value: self.min_ratio,
            }));
        }
        let problem = StandardizedProblem::new(train, candidates)?;
        let raw = train.design(candidates)?;
        let y = problem.y.view();

        let lambda_max = lasso_lambda_max(problem.x.view(), y);
        let penalties = penalty_grid(lambda_max, self.min_ratio, self.path_length);
        let folds = FoldAssignment::stratified(train.labels(), self.folds, self.seed)?;

        let per_fold: Vec<Vec<Option<f64>>> = (0..folds.k())
            .into_par_iter()
            .map(|fold| fold_errors(raw.view(), y, &folds, fold, &penalties, &self.options))
            .collect();

        let full_path = fit_path(problem.x.view(), y, &penalties, &self.options);

        let mut points = Vec::with_capacity(penalties.len());
        for (index, &penalty) in penalties.iter().enumerate() {
            let errors: Vec<f64> = per_fold.iter().filter_map(|f| f[index]).collect();
            let (mean_error, standard_error) = if errors.is_empty() {
                (None, None)
            } else {
                let (m, se) = mean_and_standard_error(&errors);
                (Some(m), Some(se))
            };
            points.push(LassoPathPoint {
                penalty,
                mean_error,
                standard_error,
                folds_completed: errors.len(),
                nonzero: full_path[index].as_ref().map(|f| f.nonzero().len()),
            });
        }

        // Only penalties reached by every fold and by the full fit are eligible.
        let eligible: Vec<usize> = (0..points.len())
            .filter(|&i| points[i].folds_completed == folds.k() && full_path[i].is_some())
            .collect();
        let mut best: Option<(usize, f64, f64)> = None;
        for &i in &eligible {
            if let (Some(err), Some(se)) = (points[i].mean_error, points[i].standard_error) {
                if best.is_none_or(|(_, best_err, _)| err < best_err) {
                    best = Some((i, err, se));
                }
            }
        }
        let (min_index, min_error, min_se) = best.ok_or(SelectionError::AllFoldsFailed {
            strategy: "lasso",
            reason: "no penalty was fitted on every fold".to_string(),
        })?;
        let threshold = min_error + min_se;
        let chosen = eligible
            .iter()
            .copied()
            .find(|&i| points[i].mean_error.is_some_and(|e| e <= threshold))
            .unwrap_or(min_index);
        log::info!(
            "Lasso CV: minimum error {:.4} at lambda {:.4e}; one-SE choice lambda {:.4e}",
            min_error,
            penalties[min_index],
            penalties[chosen]
        );

        let fit = full_path[chosen]
            .clone()
            .ok_or(SelectionError::DegenerateSelection { strategy: "lasso" })?;
        let kept = fit.nonzero();
        if kept.is_empty() {
            return Err(SelectionError::DegenerateSelection { strategy: "lasso" });
        }

        let features = candidates.subset(&kept);
        let reduced = LogisticFit {
            intercept: fit.intercept,
            coefficients: fit.coefficients.select(Axis(0), &kept),
            log_likelihood: fit.log_likelihood,
            iterations: fit.iterations,
        };
        let model = FittedModel::from_logistic(
            features.clone(),
            Configuration::new([(Hyperparameter::L1Penalty, penalties[chosen])]),
            problem.standardizer.select(&kept),
            reduced,
        );
        Ok(Selection {
            features,
            model,
            diagnostics: SelectionDiagnostics::Lasso(LassoPath {
                points,
                min_error_penalty: penalties[min_index],
                chosen_penalty: penalties[chosen],
            }),
        })
    }
}
