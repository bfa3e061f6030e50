//! # Cross-Validated Hyperparameter Search
//!
//! The search is an arena of independent `(configuration, fold)` tasks:
//!
//! - Tasks run on the rayon pool. Each one standardizes its k-1 training folds,
//!   fits, and returns its held-out accuracy or its error as a value.
//! - After the join, a pure reduction averages completed folds per configuration
//!   and records the failed ones.
//! - Configurations that completed every fold are preferred. Only when none did
//!   does the search fall back to incomplete ones.
//!
//! The winner is refitted on the whole training partition with its own
//! standardization.

use crate::data::{DataError, Dataset, FeatureSet};
use crate::logistic::{FitError, IrlsOptions};
use crate::model::{ClassifierFamily, Configuration, FittedModel, HyperparameterGrid};
use crate::partition::{FoldAssignment, PartitionError};
use crate::select::accuracy;
use itertools::Itertools;
use ndarray::{ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("The hyperparameter grid has no configurations.")]
    EmptyGrid,
    #[error("Every configuration failed on every fold ({configurations} configurations tried).")]
    AllConfigurationsFailed { configurations: usize },
    #[error("Error from fold assignment: {0}")]
    Partition(#[from] PartitionError),
    #[error("Error from the dataset: {0}")]
    Data(#[from] DataError),
    #[error("Refitting the winning configuration failed: {0}")]
    Fit(#[from] FitError),
}

/// One fold that did not produce a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldFailure {
    pub fold: usize,
    pub reason: String,
}

/// Cross-validation result of one configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationScore {
    pub configuration: Configuration,
    /// Mean over completed folds; `None` when every fold failed.
    pub mean_accuracy: Option<f64>,
    pub completed_folds: usize,
    pub failures: Vec<FoldFailure>,
}

impl ConfigurationScore {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct GridSearchOutcome {
    pub model: FittedModel,
    pub winner: usize,
    pub scores: Vec<ConfigurationScore>,
}

impl GridSearchOutcome {
    pub fn configuration(&self) -> &Configuration {
        &self.scores[self.winner].configuration
    }

    pub fn cv_accuracy(&self) -> Option<f64> {
        self.scores[self.winner].mean_accuracy
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridSearchTrainer {
    pub family: ClassifierFamily,
    pub grid: HyperparameterGrid,
    pub folds: usize,
    pub seed: u64,
    pub options: IrlsOptions,
}

impl GridSearchTrainer {
    pub fn new(family: ClassifierFamily, grid: HyperparameterGrid, folds: usize, seed: u64) -> Self {
        Self {
            family,
            grid,
            folds,
            seed,
            options: IrlsOptions::default(),
        }
    }

    fn run_task(
        &self,
        raw: ArrayView2<f64>,
        y: ArrayView1<f64>,
        features: &FeatureSet,
        folds: &FoldAssignment,
        configuration: &Configuration,
        fold: usize,
    ) -> Result<f64, FitError> {
        let fit_rows = folds.train_indices(fold);
        let held_rows = folds.validation_indices(fold);
        let model = FittedModel::fit(
            self.family,
            features.clone(),
            raw.select(Axis(0), &fit_rows).view(),
            y.select(Axis(0), &fit_rows).view(),
            configuration,
            &self.options,
        )?;
        let probabilities = model.predict_proba(raw.select(Axis(0), &held_rows).view());
        Ok(accuracy(&probabilities, &y.select(Axis(0), &held_rows)))
    }

    pub fn train(&self, train: &Dataset, features: &FeatureSet) -> Result<GridSearchOutcome, GridError> {
        let configurations = self.grid.configurations();
        if configurations.is_empty() {
            return Err(GridError::EmptyGrid);
        }
        let raw = train.design(features)?;
        let y = train.label_indicator();
        let folds = FoldAssignment::stratified(train.labels(), self.folds, self.seed)?;

        log::info!(
            "Grid search ({} family): {} configurations x {} folds on {} features",
            self.family,
            configurations.len(),
            folds.k(),
            features.len()
        );

        let tasks: Vec<(usize, usize)> = (0..configurations.len())
            .cartesian_product(0..folds.k())
            .collect();
        let results: Vec<(usize, usize, Result<f64, FitError>)> = tasks
            .into_par_iter()
            .map(|(config, fold)| {
                let outcome = self.run_task(
                    raw.view(),
                    y.view(),
                    features,
                    &folds,
                    &configurations[config],
                    fold,
                );
                (config, fold, outcome)
            })
            .collect();

        let scores = reduce_scores(&configurations, results);
        let winner = choose_winner(&scores)?;
        let configuration = &scores[winner].configuration;
        log::info!(
            "Grid search winner: {configuration} (mean CV accuracy {:.4})",
            scores[winner].mean_accuracy.unwrap_or(f64::NAN)
        );

        let model = FittedModel::fit(
            self.family,
            features.clone(),
            raw.view(),
            y.view(),
            configuration,
            &self.options,
        )?;
        Ok(GridSearchOutcome {
            model,
            winner,
            scores,
        })
    }
}

fn reduce_scores(
    configurations: &[Configuration],
    results: Vec<(usize, usize, Result<f64, FitError>)>,
) -> Vec<ConfigurationScore> {
    let mut accuracies: Vec<Vec<f64>> = vec![Vec::new(); configurations.len()];
    let mut failures: Vec<Vec<FoldFailure>> = vec![Vec::new(); configurations.len()];
    for (config, fold, outcome) in results {
        match outcome {
            Ok(acc) => accuracies[config].push(acc),
            Err(e) => failures[config].push(FoldFailure {
                fold,
                reason: e.to_string(),
            }),
        }
    }

    configurations
        .iter()
        .zip(accuracies)
        .zip(failures)
        .map(|((configuration, accs), fails)| {
            if !fails.is_empty() {
                log::warn!(
                    "Configuration {configuration}: {} of {} folds failed",
                    fails.len(),
                    fails.len() + accs.len()
                );
            }
            let mean_accuracy = if accs.is_empty() {
                None
            } else {
                Some(accs.iter().sum::<f64>() / accs.len() as f64)
            };
            ConfigurationScore {
                configuration: configuration.clone(),
                mean_accuracy,
                completed_folds: accs.len(),
                failures: fails,
            }
        })
        .collect()
}

/// Highest mean accuracy, first in enumeration order on ties. Complete
/// configurations are preferred over ones with failed folds.
fn choose_winner(scores: &[ConfigurationScore]) -> Result<usize, GridError> {
    let best_among = |complete_only: bool| {
        let mut best: Option<(usize, f64)> = None;
        for (index, score) in scores.iter().enumerate() {
            if complete_only && !score.is_complete() {
                continue;
            }
            if let Some(acc) = score.mean_accuracy {
                if best.is_none_or(|(_, best_acc)| acc > best_acc) {
                    best = Some((index, acc));
                }
            }
        }
        best.map(|(index, _)| index)
    };

    if let Some(index) = best_among(true) {
        return Ok(index);
    }
    match best_among(false) {
        Some(index) => {
            log::warn!("No configuration completed every fold; choosing among incomplete ones");
            Ok(index)
        }
        None => Err(GridError::AllConfigurationsFailed {
            configurations: scores.len(),
        }),
    }
}
