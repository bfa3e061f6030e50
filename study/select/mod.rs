//! # Feature Selection Strategies
//!
//! Every strategy shares one contract: given the training partition and the
//! candidate `FeatureSet` left by the pre-filters, return a `Selection` holding the
//! reduced set and a model fitted on it. All strategies standardize with training
//! statistics only, and the returned model carries those statistics.
//!
//! - `StepwiseSelector`: greedy backward elimination on AIC.
//! - `LassoSelector`: cross-validated L1 path with the one-standard-error rule.
//! - `RfeSelector`: recursive feature elimination scored by cross-validation.

pub mod lasso;
pub mod rfe;
pub mod stepwise;

pub use self::lasso::{LassoPath, LassoPathPoint, LassoSelector};
pub use self::rfe::{RfeProfile, RfeProfilePoint, RfeSelector};
pub use self::stepwise::{StepwiseSelector, StepwiseStep, StepwiseTrace};

use crate::data::{DataError, Dataset, FeatureSet, Label};
use crate::logistic::FitError;
use crate::model::{FittedModel, Standardizer};
use crate::partition::PartitionError;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("Error from the underlying model fit: {0}")]
    Fit(#[from] FitError),
    #[error("{strategy} selection kept no features.")]
    DegenerateSelection { strategy: &'static str },
    #[error("Error from the dataset: {0}")]
    Data(#[from] DataError),
    #[error("Error from fold assignment: {0}")]
    Partition(#[from] PartitionError),
    #[error("Every cross-validation fold of {strategy} selection failed: {reason}")]
    AllFoldsFailed {
        strategy: &'static str,
        reason: String,
    },
    #[error("Selection was given an empty candidate feature set.")]
    EmptyCandidates,
}

/// What a strategy learned on the way to its FeatureSet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionDiagnostics {
    Stepwise(StepwiseTrace),
    Lasso(LassoPath),
    Rfe(RfeProfile),
}

/// A reduced FeatureSet and the model the strategy fitted on it.
#[derive(Debug, Clone)]
pub struct Selection {
    pub features: FeatureSet,
    pub model: FittedModel,
    pub diagnostics: SelectionDiagnostics,
}

/// Enum dispatch over the selection strategies.
#[derive(Debug, Clone)]
pub enum FeatureSelector {
    Stepwise(StepwiseSelector),
    Lasso(LassoSelector),
    Rfe(RfeSelector),
}

impl FeatureSelector {
    pub fn name(&self) -> &'static str {
        match self {
            FeatureSelector::Stepwise(_) => "stepwise",
            FeatureSelector::Lasso(_) => "lasso",
            FeatureSelector::Rfe(_) => "rfe",
        }
    }

    pub fn select(&self, train: &Dataset, candidates: &FeatureSet) -> Result<Selection, SelectionError> {
        if candidates.is_empty() {
            return Err(SelectionError::EmptyCandidates);
        }
        log::info!(
            "Running {} selection over {} candidate features",
            self.name(),
            candidates.len()
        );
        let selection = match self {
            FeatureSelector::Stepwise(s) => s.select(train, candidates),
            FeatureSelector::Lasso(s) => s.select(train, candidates),
            FeatureSelector::Rfe(s) => s.select(train, candidates),
        }?;
        log::info!(
            "{} selection kept {} features",
            self.name(),
            selection.features.len()
        );
        Ok(selection)
    }
}

/// The standardized design of `features` over `train`, the statistics used, and the
/// 0/1 response.
pub(crate) struct StandardizedProblem {
    pub standardizer: Standardizer,
    pub x: Array2<f64>,
    pub y: Array1<f64>,
}

impl StandardizedProblem {
    pub fn new(train: &Dataset, features: &FeatureSet) -> Result<Self, DataError> {
        let raw = train.design(features)?;
        let standardizer = Standardizer::fit(raw.view());
        let x = standardizer.transform(raw.view());
        Ok(Self {
            standardizer,
            x,
            y: train.label_indicator(),
        })
    }
}

/// Fraction of samples whose thresholded probability matches the 0/1 response.
pub(crate) fn accuracy(probabilities: &Array1<f64>, y: &Array1<f64>) -> f64 {
    if y.is_empty() {
        return 0.0;
    }
    let correct = probabilities
        .iter()
        .zip(y.iter())
        .filter(|(p, t)| (Label::from_probability(**p).indicator() - **t).abs() < 0.5)
        .count();
    correct as f64 / y.len() as f64
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::data::Dataset;
    use crate::synthetic::SyntheticSpec;

    /// A small study with `informative` shifted features among `total`.
    pub fn study(samples: usize, total: usize, informative: usize, shift: f64, seed: u64) -> Dataset {
        SyntheticSpec {
            samples_per_class: samples / 2,
            features: total,
            informative,
            shift,
            correlated_copies: 0,
            seed,
        }
        .generate()
        .unwrap()
    }
}
