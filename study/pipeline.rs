//! # Study Orchestration
//!
//! Runs the whole comparison on one dataset:
//!
//! 1. one seeded stratified split, shared by every strategy;
//! 2. variance filtering and correlation pruning fitted on the training partition;
//! 3. every selector, followed by a grid search for each classifier family and a
//!    held-out evaluation;
//! 4. optionally, a t-SNE embedding of all samples, re-split with the same indices
//!    and passed through the same grid search and evaluation.
//!
//! Stages before selection are shared, so their errors abort the study. After that
//! each strategy stands alone: a failure is logged, recorded in its report entry
//! with the stage that failed, and the remaining strategies still run.

use crate::config::{ConfigError, StudyConfig};
use crate::data::{ClassNames, DataError, Dataset, FeatureSet};
use crate::embed::{Embedding, EmbeddingError};
use crate::evaluate::{Evaluation, evaluate};
use crate::filter::{CorrelationPruner, FilterError, VarianceFilter};
use crate::grid::{ConfigurationScore, GridSearchTrainer};
use crate::model::{ClassifierFamily, Configuration};
use crate::partition::{DataPartitioner, PartitionError, SeedStream, Split, derive_seed};
use crate::select::{FeatureSelector, SelectionDiagnostics};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StudyError {
    #[error("Error in the study configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Error while partitioning samples: {0}")]
    Partition(#[from] PartitionError),
    #[error("Error from the dataset: {0}")]
    Data(#[from] DataError),
    #[error("Error while pre-filtering features: {0}")]
    Filter(#[from] FilterError),
    #[error("Error while embedding samples: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("Error while building the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// The pipeline stage a strategy failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Selection,
    Embedding,
    GridSearch,
    Evaluation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Selection => "selection",
            Stage::Embedding => "embedding",
            Stage::GridSearch => "grid search",
            Stage::Evaluation => "evaluation",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
}

/// Outcome of one (feature source x classifier family) combination.
///
/// Either `failure` is set, or `evaluation` and `configuration` are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyReport {
    /// `stepwise`, `lasso`, `rfe` or `embedding`.
    pub strategy: String,
    pub family: ClassifierFamily,
    pub features: Vec<String>,
    pub configuration: Option<Configuration>,
    pub cv_accuracy: Option<f64>,
    pub evaluation: Option<Evaluation>,
    pub failure: Option<StageFailure>,
    pub grid: Vec<ConfigurationScore>,
    pub diagnostics: Option<SelectionDiagnostics>,
}

impl StrategyReport {
    fn new(strategy: &str, family: ClassifierFamily) -> Self {
        Self {
            strategy: strategy.to_string(),
            family,
            features: Vec::new(),
            configuration: None,
            cv_accuracy: None,
            evaluation: None,
            failure: None,
            grid: Vec::new(),
            diagnostics: None,
        }
    }

    fn failed(mut self, stage: Stage, error: &dyn std::error::Error) -> Self {
        log::error!(
            "Strategy '{}' ({} family) failed during {stage}: {error}",
            self.strategy,
            self.family
        );
        self.failure = Some(StageFailure {
            stage,
            message: error.to_string(),
        });
        self
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitSummary {
    pub train: usize,
    pub test: usize,
    /// Negative, positive.
    pub train_class_counts: [usize; 2],
    pub test_class_counts: [usize; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyReport {
    pub seed: u64,
    pub samples: usize,
    pub features: usize,
    pub classes: ClassNames,
    pub split: SplitSummary,
    pub variance_filtered: usize,
    pub correlation_pruned: usize,
    pub strategies: Vec<StrategyReport>,
}

/// The report plus the values the outer harness writes to disk.
#[derive(Debug, Clone)]
pub struct StudyOutcome {
    pub report: StudyReport,
    pub split: Split,
    pub embedding: Option<Embedding>,
}

fn evaluate_features(
    mut report: StrategyReport,
    trainer: &GridSearchTrainer,
    train: &Dataset,
    test: &Dataset,
    features: &FeatureSet,
) -> StrategyReport {
    report.features = features.names().to_vec();
    let outcome = match trainer.train(train, features) {
        Ok(outcome) => outcome,
        Err(e) => return report.failed(Stage::GridSearch, &e),
    };
    report.configuration = Some(outcome.configuration().clone());
    report.cv_accuracy = outcome.cv_accuracy();
    report.grid = outcome.scores.clone();
    match evaluate(&outcome.model, test) {
        Ok(evaluation) => {
            report.evaluation = Some(evaluation);
            report
        }
        Err(e) => report.failed(Stage::Evaluation, &e),
    }
}

fn trainer_for(config: &StudyConfig, family: ClassifierFamily) -> GridSearchTrainer {
    GridSearchTrainer {
        family,
        grid: config.grids.for_family(family).clone(),
        folds: config.folds,
        seed: derive_seed(config.seed, SeedStream::GridFolds),
        options: config.irls,
    }
}

/// Runs every strategy of the study on `dataset`.
pub fn run_study(dataset: &Dataset, config: &StudyConfig) -> Result<StudyOutcome, StudyError> {
    config.validate()?;
    match config.threads {
        Some(threads) => {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
            log::info!("Running the study on {threads} worker threads");
            pool.install(|| run_study_inner(dataset, config))
        }
        None => run_study_inner(dataset, config),
    }
}

fn run_study_inner(dataset: &Dataset, config: &StudyConfig) -> Result<StudyOutcome, StudyError> {
    log::info!(
        "Starting study: {} samples x {} features, seed {}",
        dataset.n_samples(),
        dataset.n_features(),
        config.seed
    );

    // --- Shared stages ---
    let split = DataPartitioner::new(config.split_fraction, config.seed)?.split(dataset)?;
    let (train, test) = split.apply(dataset)?;
    let filtered = VarianceFilter::new(config.variance_top_n).filter(&train, &train.feature_set())?;
    let candidates = CorrelationPruner::new(config.correlation_cutoff)?.prune(&train, &filtered)?;

    let selectors = [
        FeatureSelector::Stepwise(config.stepwise_selector()),
        FeatureSelector::Lasso(config.lasso_selector(derive_seed(config.seed, SeedStream::LassoFolds))),
        FeatureSelector::Rfe(config.rfe_selector(derive_seed(config.seed, SeedStream::RfeFolds))),
    ];

    let mut strategies = Vec::new();

    // --- Selection strategies ---
    for selector in &selectors {
        match selector.select(&train, &candidates) {
            Ok(selection) => {
                for family in ClassifierFamily::ALL {
                    let mut report = StrategyReport::new(selector.name(), family);
                    report.diagnostics = Some(selection.diagnostics.clone());
                    strategies.push(evaluate_features(
                        report,
                        &trainer_for(config, family),
                        &train,
                        &test,
                        &selection.features,
                    ));
                }
            }
            Err(e) => {
                for family in ClassifierFamily::ALL {
                    strategies.push(
                        StrategyReport::new(selector.name(), family)
                            .failed(Stage::Selection, &e),
                    );
                }
            }
        }
    }

    // --- Embedding strategy ---
    let embedding = if config.embedding.enabled {
        let projector = config.embedding_projector(derive_seed(config.seed, SeedStream::Embedding));
        let projected = projector
            .project(dataset)
            .and_then(|embedding| {
                let coordinates = embedding.to_dataset(dataset).map_err(EmbeddingError::from)?;
                let (etrain, etest) = split.apply(&coordinates).map_err(EmbeddingError::from)?;
                Ok((embedding, etrain, etest))
            });
        match projected {
            Ok((embedding, etrain, etest)) => {
                let features = etrain.feature_set();
                for family in ClassifierFamily::ALL {
                    strategies.push(evaluate_features(
                        StrategyReport::new("embedding", family),
                        &trainer_for(config, family),
                        &etrain,
                        &etest,
                        &features,
                    ));
                }
                Some(embedding)
            }
            Err(e) => {
                for family in ClassifierFamily::ALL {
                    strategies.push(
                        StrategyReport::new("embedding", family).failed(Stage::Embedding, &e),
                    );
                }
                None
            }
        }
    } else {
        None
    };

    let succeeded = strategies.iter().filter(|s| s.succeeded()).count();
    log::info!(
        "Study finished: {succeeded} of {} strategies completed",
        strategies.len()
    );

    let report = StudyReport {
        seed: config.seed,
        samples: dataset.n_samples(),
        features: dataset.n_features(),
        classes: dataset.classes().clone(),
        split: SplitSummary {
            train: train.n_samples(),
            test: test.n_samples(),
            train_class_counts: train.class_counts(),
            test_class_counts: test.class_counts(),
        },
        variance_filtered: filtered.len(),
        correlation_pruned: candidates.len(),
        strategies,
    };
    Ok(StudyOutcome {
        report,
        split,
        embedding,
    })
}

/// Embeds `dataset` without running the selection strategies.
pub fn run_embedding(
    dataset: &Dataset,
    config: &StudyConfig,
) -> Result<(Split, Embedding), StudyError> {
    config.validate()?;
    let split = DataPartitioner::new(config.split_fraction, config.seed)?.split(dataset)?;
    let projector = config.embedding_projector(derive_seed(config.seed, SeedStream::Embedding));
    let embedding = projector.project(dataset)?;
    Ok((split, embedding))
}
