//! Backward stepwise elimination on the Akaike information criterion.

use super::{Selection, SelectionDiagnostics, SelectionError, StandardizedProblem};
use crate::data::{Dataset, FeatureSet};
use crate::logistic::{FitError, IrlsOptions, LogisticFit, fit_ridge_logistic};
use crate::model::{Configuration, FittedModel, Hyperparameter};
use ndarray::{ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Unpenalized logistic regression followed by greedy single-feature removals while
/// AIC improves.
#[derive(Debug, Clone, PartialEq)]
pub struct StepwiseSelector {
    /// Upper bound on the number of removals.
    pub max_steps: usize,
    /// Candidate sets larger than this are cut to their first `max_start_features`
    /// members before the full model is fitted.
    pub max_start_features: usize,
    pub options: IrlsOptions,
}

impl Default for StepwiseSelector {
    fn default() -> Self {
        Self {
            max_steps: 100,
            max_start_features: 25,
            options: IrlsOptions::default(),
        }
    }
}

/// One accepted removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepwiseStep {
    pub removed: String,
    pub aic: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepwiseTrace {
    pub initial_aic: f64,
    pub final_aic: f64,
    pub steps: Vec<StepwiseStep>,
}

/// AIC = 2k - 2 logL, with k counting the intercept.
fn aic(fit: &LogisticFit) -> f64 {
    2.0 * (fit.coefficients.len() + 1) as f64 - 2.0 * fit.log_likelihood
}

fn fit_columns(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    columns: &[usize],
    options: &IrlsOptions,
) -> Result<LogisticFit, FitError> {
    let design = x.select(Axis(1), columns);
    fit_ridge_logistic(design.view(), y, 0.0, options)
}

impl StepwiseSelector {
    pub fn select(&self, train: &Dataset, candidates: &FeatureSet) -> Result<Selection, SelectionError> {
        let start = if candidates.len() > self.max_start_features {
            log::warn!(
                "Stepwise selection starts from the first {} of {} candidates",
                self.max_start_features,
                candidates.len()
            );
            candidates.subset(&(0..self.max_start_features).collect::<Vec<_>>())
        } else {
            candidates.clone()
        };
        if start.is_empty() {
            return Err(SelectionError::DegenerateSelection { strategy: "stepwise" });
        }

        let problem = StandardizedProblem::new(train, &start)?;
        let (x, y) = (problem.x.view(), problem.y.view());

        let mut current: Vec<usize> = (0..start.len()).collect();
        let mut fit = fit_columns(x, y, &current, &self.options)?;
        let initial_aic = aic(&fit);
        let mut current_aic = initial_aic;
        let mut steps = Vec::new();
        log::debug!("Stepwise start: {} features, AIC {:.3}", current.len(), current_aic);

        for step in 1..=self.max_steps {
            if current.is_empty() {
                break;
            }
            let trials: Vec<(usize, Result<LogisticFit, FitError>)> = (0..current.len())
                .into_par_iter()
                .map(|slot| {
                    let reduced: Vec<usize> = current
                        .iter()
                        .enumerate()
                        .filter(|&(s, _)| s != slot)
                        .map(|(_, &c)| c)
                        .collect();
                    (slot, fit_columns(x, y, &reduced, &self.options))
                })
                .collect();

            let mut best: Option<(usize, LogisticFit, f64)> = None;
            for (slot, trial) in trials {
                match trial {
                    Ok(candidate) => {
                        let candidate_aic = aic(&candidate);
                        let improves_best = best
                            .as_ref()
                            .is_none_or(|(_, _, best_aic)| candidate_aic < *best_aic);
                        if improves_best {
                            best = Some((slot, candidate, candidate_aic));
                        }
                    }
                    Err(e) => log::warn!(
                        "Stepwise step {step}: dropping '{}' failed to fit: {e}",
                        start.names()[current[slot]]
                    ),
                }
            }

            match best {
                Some((slot, candidate, candidate_aic)) if candidate_aic < current_aic - 1e-9 => {
                    let removed = start.names()[current.remove(slot)].clone();
                    log::debug!("Stepwise step {step}: removed '{removed}', AIC {candidate_aic:.3}");
                    steps.push(StepwiseStep {
                        removed,
                        aic: candidate_aic,
                    });
                    fit = candidate;
                    current_aic = candidate_aic;
                }
                Some(_) => break,
                None => {
                    return Err(SelectionError::AllFoldsFailed {
                        strategy: "stepwise",
                        reason: format!("no reduced model could be fitted at step {step}"),
                    });
                }
            }
        }

        if current.is_empty() {
            return Err(SelectionError::DegenerateSelection { strategy: "stepwise" });
        }

        let features = start.subset(&current);
        let model = FittedModel::from_logistic(
            features.clone(),
            Configuration::new([(Hyperparameter::Lambda, 0.0)]),
            problem.standardizer.select(&current),
            fit,
        );
        Ok(Selection {
            features,
            model,
            diagnostics: SelectionDiagnostics::Stepwise(StepwiseTrace {
                initial_aic,
                final_aic: current_aic,
                steps,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ClassNames, Label};
    use crate::logistic::sigmoid;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    /// Four columns; only the first two drive the labels.
    fn noisy(n: usize, seed: u64) -> Dataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array2::from_shape_fn((n, 4), |_| rng.sample::<f64, _>(StandardNormal));
        let labels = x
            .axis_iter(Axis(0))
            .map(|row| {
                let p = sigmoid(1.5 * row[0] - 1.5 * row[1]);
                if rng.gen_range(0.0..1.0) < p {
                    Label::Positive
                } else {
                    Label::Negative
                }
            })
            .collect();
        Dataset::new(
            x,
            labels,
            vec!["g1".into(), "g2".into(), "noise1".into(), "noise2".into()],
            (0..n).map(|i| format!("s{i}")).collect(),
            ClassNames {
                negative: "A".into(),
                positive: "B".into(),
            },
        )
        .unwrap()
    }

    #[test]
    fn keeps_the_informative_features() {
        let ds = noisy(400, 21);
        let selection = StepwiseSelector::default()
            .select(&ds, &ds.feature_set())
            .unwrap();
        assert!(selection.features.contains("g1"));
        assert!(selection.features.contains("g2"));
        match &selection.diagnostics {
            SelectionDiagnostics::Stepwise(trace) => {
                assert!(trace.final_aic <= trace.initial_aic);
                assert_eq!(trace.steps.len(), 4 - selection.features.len());
            }
            other => panic!("unexpected diagnostics {other:?}"),
        }
        assert_eq!(selection.model.features(), &selection.features);
    }

    #[test]
    fn zero_steps_returns_the_full_model() {
        let ds = noisy(200, 4);
        let selector = StepwiseSelector {
            max_steps: 0,
            ..StepwiseSelector::default()
        };
        let selection = selector.select(&ds, &ds.feature_set()).unwrap();
        assert_eq!(selection.features.len(), 4);
    }

    #[test]
    fn separable_training_data_is_a_fit_error() {
        let x = Array2::from_shape_fn((10, 1), |(i, _)| i as f64);
        let labels = (0..10)
            .map(|i| if i < 5 { Label::Negative } else { Label::Positive })
            .collect();
        let ds = Dataset::new(
            x,
            labels,
            vec!["g".into()],
            (0..10).map(|i| format!("s{i}")).collect(),
            ClassNames {
                negative: "A".into(),
                positive: "B".into(),
            },
        )
        .unwrap();
        let result = StepwiseSelector::default().select(&ds, &ds.feature_set());
        assert!(matches!(
            result,
            Err(SelectionError::Fit(FitError::NonConvergence { .. }))
        ));
    }
}
