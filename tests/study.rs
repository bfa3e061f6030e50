use std::fs;
use std::process::Command;
use tempfile::tempdir;

use subtyper::config::StudyConfig;
use subtyper::grid::GridSearchTrainer;
use subtyper::model::{ClassifierFamily, Configuration, Hyperparameter, HyperparameterGrid};
use subtyper::pipeline::{Stage, StudyOutcome, run_study};
use subtyper::report::{write_embedding_csv, write_report_toml};
use subtyper::synthetic::{SyntheticSpec, write_tsv};

fn study_with_shift(shift: f64) -> subtyper::data::Dataset {
    SyntheticSpec {
        samples_per_class: 80,
        features: 40,
        informative: 4,
        shift,
        correlated_copies: 2,
        seed: 8,
    }
    .generate()
    .expect("synthetic study")
}

fn small_study() -> subtyper::data::Dataset {
    study_with_shift(1.5)
}

fn quick_config() -> StudyConfig {
    let mut config = StudyConfig {
        folds: 5,
        variance_top_n: 30,
        ..StudyConfig::default()
    };
    config.stepwise.max_start_features = 8;
    config.lasso.path_length = 20;
    config.lasso.folds = 5;
    config.rfe.sizes = vec![2, 4, 8];
    config.rfe.folds = 5;
    config.grids.linear = HyperparameterGrid::single(&Configuration::new([(
        Hyperparameter::Lambda,
        0.1,
    )]));
    config.grids.kernel = HyperparameterGrid::single(&Configuration::new([
        (Hyperparameter::Sigma, 0.05),
        (Hyperparameter::Lambda, 0.1),
    ]));
    config.embedding.perplexity = 10.0;
    config.embedding.iterations = 300;
    config
}

#[test]
fn full_study_reports_every_strategy_and_family() {
    let dataset = small_study();
    let config = quick_config();
    let outcome = run_study(&dataset, &config).expect("study runs");
    let report = &outcome.report;

    assert_eq!(report.strategies.len(), 8);
    assert_eq!(report.split.train, 120);
    assert_eq!(report.split.test, 40);
    assert_eq!(report.variance_filtered, 30);
    assert!(report.correlation_pruned <= report.variance_filtered);

    let names: Vec<&str> = report.strategies.iter().map(|s| s.strategy.as_str()).collect();
    assert_eq!(
        names,
        ["stepwise", "stepwise", "lasso", "lasso", "rfe", "rfe", "embedding", "embedding"]
    );
    for strategy in &report.strategies {
        let evaluation = strategy.evaluation.as_ref().unwrap_or_else(|| {
            panic!(
                "{} ({}) failed: {:?}",
                strategy.strategy, strategy.family, strategy.failure
            )
        });
        assert!(strategy.failure.is_none());
        assert!(!strategy.features.is_empty());
        assert!(strategy.configuration.is_some());
        assert_eq!(evaluation.confusion.total(), 40);
        assert!((0.0..=1.0).contains(&evaluation.metrics.accuracy));
    }
    let stepwise = &report.strategies[0];
    assert!(stepwise.features.len() <= config.stepwise.max_start_features);

    let best = report
        .strategies
        .iter()
        .filter_map(|s| s.evaluation.as_ref())
        .map(|e| e.metrics.accuracy)
        .fold(0.0, f64::max);
    assert!(best >= 0.7, "best held-out accuracy {best}");

    let embedding = outcome.embedding.as_ref().expect("embedding enabled");
    let dir = tempdir().expect("tempdir");
    let report_path = dir.path().join("study_report.toml");
    let embedding_path = dir.path().join("embedding.csv");
    write_report_toml(report, &report_path).expect("report written");
    write_embedding_csv(&embedding_path, &dataset, embedding, &outcome.split)
        .expect("embedding written");

    let text = fs::read_to_string(&report_path).expect("read report");
    assert!(text.contains("strategies"));
    let rows = fs::read_to_string(&embedding_path).expect("read embedding");
    assert_eq!(rows.lines().count(), dataset.n_samples() + 1);
    assert_eq!(rows.lines().filter(|l| l.ends_with(",test")).count(), 40);
}

#[test]
fn failed_selection_is_recorded_and_the_rest_continue() {
    // Classes this far apart are separable, so the unpenalized stepwise fit cannot converge.
    let dataset = study_with_shift(6.0);
    let mut config = quick_config();
    config.embedding.enabled = false;
    let outcome = run_study(&dataset, &config).expect("study runs");

    for strategy in &outcome.report.strategies {
        if strategy.strategy == "stepwise" {
            let failure = strategy.failure.as_ref().expect("stepwise failure recorded");
            assert_eq!(failure.stage, Stage::Selection);
            assert!(!failure.message.is_empty());
            assert!(strategy.evaluation.is_none());
            assert!(!strategy.succeeded());
        } else {
            assert!(strategy.succeeded(), "{} failed: {:?}", strategy.strategy, strategy.failure);
        }
    }
    assert_eq!(outcome.report.strategies.len(), 6);
}

#[test]
fn worker_count_does_not_change_results() {
    let dataset = small_study();
    let run_with = |threads: usize| {
        let config = StudyConfig {
            threads: Some(threads),
            ..quick_config()
        };
        run_study(&dataset, &config).expect("study runs")
    };
    let single = run_with(1);
    let pooled = run_with(4);

    assert_eq!(single.split, pooled.split);
    assert_eq!(single.report.strategies.len(), pooled.report.strategies.len());
    for (a, b) in single.report.strategies.iter().zip(&pooled.report.strategies) {
        assert_eq!(a.strategy, b.strategy);
        assert_eq!(a.features, b.features);
        assert_eq!(a.configuration, b.configuration);
        assert_eq!(a.cv_accuracy, b.cv_accuracy);
        assert_eq!(
            a.evaluation.as_ref().map(|e| e.confusion),
            b.evaluation.as_ref().map(|e| e.confusion)
        );
    }
    let coordinates = |o: &StudyOutcome| o.embedding.as_ref().map(|e| e.coordinates.clone());
    assert_eq!(coordinates(&single), coordinates(&pooled));
}

#[test]
fn repeated_runs_are_identical() {
    let dataset = small_study();
    let mut config = quick_config();
    config.embedding.enabled = false;
    let first = run_study(&dataset, &config).expect("study runs");
    let second = run_study(&dataset, &config).expect("study runs");

    assert_eq!(first.split, second.split);
    let summary = |o: &StudyOutcome| {
        o.report
            .strategies
            .iter()
            .map(|s| (s.features.clone(), s.evaluation.as_ref().map(|e| e.confusion)))
            .collect::<Vec<_>>()
    };
    assert_eq!(summary(&first), summary(&second));
    assert!(first.embedding.is_none());
    assert_eq!(first.report.strategies.len(), 6);
}

#[test]
fn single_configuration_grid_selects_it() {
    let dataset = small_study();
    let features = dataset.feature_set();
    let only = Configuration::new([(Hyperparameter::Lambda, 0.5)]);
    let trainer = GridSearchTrainer::new(
        ClassifierFamily::Linear,
        HyperparameterGrid::single(&only),
        5,
        17,
    );
    let outcome = trainer.train(&dataset, &features).expect("grid search");
    assert_eq!(outcome.scores.len(), 1);
    assert_eq!(outcome.configuration(), &only);
    assert_eq!(outcome.model.configuration(), &only);
    assert!(outcome.cv_accuracy().is_some());
}

#[test]
fn cli_simulates_then_runs_a_study() {
    let dir = tempdir().expect("tempdir");
    let matrix = dir.path().join("matrix.tsv");
    let config_path = dir.path().join("study.toml");
    let report_path = dir.path().join("report.toml");
    let embedding_path = dir.path().join("embedding.csv");

    let dataset = small_study();
    write_tsv(&dataset, &matrix).expect("matrix written");
    let config = quick_config();
    fs::write(
        &config_path,
        toml::to_string(&config).expect("config serializes"),
    )
    .expect("config written");

    let exe = env!("CARGO_BIN_EXE_subtyper");
    let status = Command::new(exe)
        .arg("run")
        .arg(&matrix)
        .arg("--config")
        .arg(&config_path)
        .arg("--report")
        .arg(&report_path)
        .arg("--embedding")
        .arg(&embedding_path)
        .arg("--threads")
        .arg("2")
        .status()
        .expect("run subtyper");
    assert!(status.success());
    assert!(report_path.exists());
    assert!(embedding_path.exists());

    let status = Command::new(exe)
        .arg("run")
        .arg(dir.path().join("missing.tsv"))
        .status()
        .expect("run subtyper");
    assert!(!status.success());
}
