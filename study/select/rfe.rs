//! Recursive feature elimination scored by cross-validation.
//!
//! Work happens in two parallel phases:
//! 1. per fold, an elimination chain: fit on the current subset, rank, cut to the
//!    next smaller size, repeat;
//! 2. per (size, fold), fit the target classifier on that fold's subset of the given
//!    size and score it on the held-out rows.
//!
//! The size with the best mean held-out accuracy wins (ties go to the smaller size)
//! and the chain is rebuilt on the full training partition to pick the final subset.

use super::{Selection, SelectionDiagnostics, SelectionError, accuracy};
use crate::data::{Dataset, FeatureSet};
use crate::logistic::{FitError, IrlsOptions};
use crate::model::{ClassifierFamily, Configuration, FittedModel, Hyperparameter, Standardizer};
use crate::partition::FoldAssignment;
use ahash::AHashMap;
use itertools::Itertools;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub struct RfeSelector {
    /// Candidate subset sizes. The full candidate count is always evaluated as well.
    pub sizes: Vec<usize>,
    pub family: ClassifierFamily,
    pub configuration: Configuration,
    pub folds: usize,
    pub seed: u64,
    pub options: IrlsOptions,
}

impl Default for RfeSelector {
    fn default() -> Self {
        Self {
            sizes: vec![1, 2, 4, 8, 16, 32, 64],
            family: ClassifierFamily::Linear,
            configuration: Configuration::new([(Hyperparameter::Lambda, 1.0)]),
            folds: 10,
            seed: 42,
            options: IrlsOptions::default(),
        }
    }
}

/// Cross-validated accuracy at one subset size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfeProfilePoint {
    pub size: usize,
    pub mean_accuracy: Option<f64>,
    pub folds_completed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfeProfile {
    /// Points in descending size order.
    pub points: Vec<RfeProfilePoint>,
    pub best_size: usize,
}

/// |mean difference| / pooled sd per column of standardized `x`.
fn separation_scores(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Array1<f64> {
    let positives: Vec<usize> = (0..y.len()).filter(|&i| y[i] > 0.5).collect();
    let negatives: Vec<usize> = (0..y.len()).filter(|&i| y[i] <= 0.5).collect();
    let group_stats = |rows: &[usize]| {
        let group = x.select(Axis(0), rows);
        let mean = group
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(x.ncols()));
        let var = if rows.len() > 1 {
            group.var_axis(Axis(0), 1.0)
        } else {
            Array1::zeros(x.ncols())
        };
        (mean, var)
    };
    let (pos_mean, pos_var) = group_stats(&positives);
    let (neg_mean, neg_var) = group_stats(&negatives);
    let pooled = ((&pos_var + &neg_var) / 2.0).mapv(|v| v.sqrt().max(1e-12));
    (&pos_mean - &neg_mean).mapv(f64::abs) / pooled
}

impl RfeSelector {
    /// Requested sizes clipped to `1..=available`, descending, with `available` first.
    fn size_schedule(&self, available: usize) -> Vec<usize> {
        self.sizes
            .iter()
            .copied()
            .filter(|&s| s >= 1 && s < available)
            .chain(std::iter::once(available))
            .sorted_unstable_by(|a, b| b.cmp(a))
            .dedup()
            .collect()
    }

    /// Importance of each column of `x`, higher is more important.
    fn importance(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
    ) -> Result<Array1<f64>, FitError> {
        match self.family {
            ClassifierFamily::Linear => {
                let classifier = self.family.fit(x, y, &self.configuration, &self.options)?;
                Ok(classifier
                    .coefficient_magnitudes()
                    .unwrap_or_else(|| separation_scores(x, y)))
            }
            ClassifierFamily::Kernel => Ok(separation_scores(x, y)),
        }
    }

    /// Nested subsets (column positions, in input order) for every size of `schedule`.
    fn elimination_chain(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        schedule: &[usize],
    ) -> Result<AHashMap<usize, Vec<usize>>, FitError> {
        let mut chain = AHashMap::with_capacity(schedule.len());
        let mut current: Vec<usize> = (0..x.ncols()).collect();
        for &size in schedule {
            if size < current.len() {
                let scores = self.importance(x.select(Axis(1), &current).view(), y)?;
                let mut order: Vec<usize> = (0..current.len()).collect();
                // Stable: equal importance keeps the earlier feature.
                order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
                let mut kept: Vec<usize> = order[..size].iter().map(|&o| current[o]).collect();
                kept.sort_unstable();
                current = kept;
            }
            chain.insert(size, current.clone());
        }
        Ok(chain)
    }

    pub fn select(&self, train: &Dataset, candidates: &FeatureSet) -> Result<Selection, SelectionError> {
        let raw = train.design(candidates)?;
        let y = train.label_indicator();
        let schedule = self.size_schedule(candidates.len());
        let folds = FoldAssignment::stratified(train.labels(), self.folds, self.seed)?;

        // Phase 1: per-fold elimination chains on fold-local standardization.
        let chains: Vec<Result<AHashMap<usize, Vec<usize>>, FitError>> = (0..folds.k())
            .into_par_iter()
            .map(|fold| {
                let rows = folds.train_indices(fold);
                let fit_raw = raw.select(Axis(0), &rows);
                let x = Standardizer::fit(fit_raw.view()).transform(fit_raw.view());
                self.elimination_chain(x.view(), y.select(Axis(0), &rows).view(), &schedule)
            })
            .collect();

        // Phase 2: one task per (size, fold).
        let tasks: Vec<(usize, usize)> = schedule
            .iter()
            .copied()
            .cartesian_product(0..folds.k())
            .collect();
        let scores: Vec<(usize, usize, Result<f64, FitError>)> = tasks
            .into_par_iter()
            .map(|(size, fold)| {
                let outcome = match &chains[fold] {
                    Ok(chain) => {
                        let columns = chain.get(&size).cloned().unwrap_or_default();
                        self.score_fold(raw.view(), y.view(), &folds, fold, &columns)
                    }
                    Err(e) => Err(e.clone()),
                };
                (size, fold, outcome)
            })
            .collect();

        let mut points = Vec::with_capacity(schedule.len());
        for &size in &schedule {
            let mut completed = Vec::new();
            for (task_size, fold, outcome) in &scores {
                if *task_size != size {
                    continue;
                }
                match outcome {
                    Ok(acc) => completed.push(*acc),
                    Err(e) => log::warn!("RFE size {size}, fold {fold} failed: {e}"),
                }
            }
            let mean_accuracy = if completed.is_empty() {
                None
            } else {
                Some(completed.iter().sum::<f64>() / completed.len() as f64)
            };
            log::debug!("RFE size {size}: mean accuracy {mean_accuracy:?}");
            points.push(RfeProfilePoint {
                size,
                mean_accuracy,
                folds_completed: completed.len(),
            });
        }

        // Schedule is descending, so `>=` lets a smaller size take over on ties.
        let mut best: Option<(usize, f64)> = None;
        for point in &points {
            if let Some(acc) = point.mean_accuracy {
                if best.is_none_or(|(_, best_acc)| acc >= best_acc) {
                    best = Some((point.size, acc));
                }
            }
        }
        let (best_size, best_accuracy) = best.ok_or_else(|| SelectionError::AllFoldsFailed {
            strategy: "rfe",
            reason: "no subset size could be scored on any fold".to_string(),
        })?;
        log::info!("RFE chose {best_size} features (CV accuracy {best_accuracy:.4})");

        let standardizer = Standardizer::fit(raw.view());
        let x = standardizer.transform(raw.view());
        let final_chain = self.elimination_chain(x.view(), y.view(), &schedule)?;
        let kept = final_chain
            .get(&best_size)
            .cloned()
            .ok_or(SelectionError::DegenerateSelection { strategy: "rfe" })?;
        if kept.is_empty() {
            return Err(SelectionError::DegenerateSelection { strategy: "rfe" });
        }

        let features = candidates.subset(&kept);
        let model = FittedModel::fit(
            self.family,
            features.clone(),
            raw.select(Axis(1), &kept).view(),
            y.view(),
            &self.configuration,
            &self.options,
        )?;
        Ok(Selection {
            features,
            model,
            diagnostics: SelectionDiagnostics::Rfe(RfeProfile { points, best_size }),
        })
    }

    fn score_fold(
        &self,
        raw: ArrayView2<f64>,
        y: ArrayView1<f64>,
        folds: &FoldAssignment,
        fold: usize,
        columns: &[usize],
    ) -> Result<f64, FitError> {
        let fit_rows = folds.train_indices(fold);
        let held_rows = folds.validation_indices(fold);
        let subset = raw.select(Axis(1), columns);
        let fit_raw = subset.select(Axis(0), &fit_rows);
        let standardizer = Standardizer::fit(fit_raw.view());
        let classifier = self.family.fit(
            standardizer.transform(fit_raw.view()).view(),
            y.select(Axis(0), &fit_rows).view(),
            &self.configuration,
            &self.options,
        )?;
        let held_x = standardizer.transform(subset.select(Axis(0), &held_rows).view());
        let probabilities = classifier.predict_proba(held_x.view());
        Ok(accuracy(&probabilities, &y.select(Axis(0), &held_rows)))
    }
}
