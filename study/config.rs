//! Study configuration, read from TOML.
//!
//! Every field has a default, so a file only needs the settings it changes.

use crate::data::LoadOptions;
use crate::embed::EmbeddingProjector;
use crate::logistic::IrlsOptions;
use crate::model::{ClassifierFamily, Configuration, GridAxis, Hyperparameter, HyperparameterGrid};
use crate::select::{LassoSelector, RfeSelector, StepwiseSelector};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read the configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepwiseConfig {
    pub max_steps: usize,
    pub max_start_features: usize,
}

impl Default for StepwiseConfig {
    fn default() -> Self {
        let selector = StepwiseSelector::default();
        Self {
            max_steps: selector.max_steps,
            max_start_features: selector.max_start_features,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LassoConfig {
    pub path_length: usize,
    pub min_ratio: f64,
    pub folds: usize,
}

impl Default for LassoConfig {
    fn default() -> Self {
        let selector = LassoSelector::default();
        Self {
            path_length: selector.path_length,
            min_ratio: selector.min_ratio,
            folds: selector.folds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RfeConfig {
    pub sizes: Vec<usize>,
    pub folds: usize,
    /// Classifier used to rank and score subsets.
    pub family: ClassifierFamily,
    pub lambda: f64,
    /// Only read when `family` is `kernel`.
    pub sigma: f64,
}

impl Default for RfeConfig {
    fn default() -> Self {
        let selector = RfeSelector::default();
        Self {
            sizes: selector.sizes,
            folds: selector.folds,
            family: ClassifierFamily::Linear,
            lambda: 1.0,
            sigma: 0.01,
        }
    }
}

impl RfeConfig {
    pub fn configuration(&self) -> Configuration {
        match self.family {
            ClassifierFamily::Linear => Configuration::new([(Hyperparameter::Lambda, self.lambda)]),
            ClassifierFamily::Kernel => Configuration::new([
                (Hyperparameter::Sigma, self.sigma),
                (Hyperparameter::Lambda, self.lambda),
            ]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridsConfig {
    pub linear: HyperparameterGrid,
    pub kernel: HyperparameterGrid,
}

impl Default for GridsConfig {
    fn default() -> Self {
        Self {
            linear: HyperparameterGrid::default_for(ClassifierFamily::Linear),
            kernel: HyperparameterGrid::default_for(ClassifierFamily::Kernel),
        }
    }
}

impl GridsConfig {
    pub fn for_family(&self, family: ClassifierFamily) -> &HyperparameterGrid {
        match family {
            ClassifierFamily::Linear => &self.linear,
            ClassifierFamily::Kernel => &self.kernel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    pub perplexity: f64,
    pub iterations: usize,
    pub learning_rate: f64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let projector = EmbeddingProjector::default();
        Self {
            enabled: true,
            perplexity: projector.perplexity,
            iterations: projector.iterations,
            learning_rate: projector.learning_rate,
        }
    }
}

/// Every tunable of a study run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    pub seed: u64,
    pub split_fraction: f64,
    /// Folds of the hyperparameter search.
    pub folds: usize,
    pub variance_top_n: usize,
    pub correlation_cutoff: f64,
    pub label_column: String,
    pub positive_class: Option<String>,
    /// Worker threads; the global rayon pool when unset.
    pub threads: Option<usize>,
    pub irls: IrlsOptions,
    pub stepwise: StepwiseConfig,
    pub lasso: LassoConfig,
    pub rfe: RfeConfig,
    pub grids: GridsConfig,
    pub embedding: EmbeddingConfig,
}

impl Default for StudyConfig {
    fn default() -> Self {
        let load = LoadOptions::default();
        Self {
            seed: 42,
            split_fraction: 0.75,
            folds: 10,
            variance_top_n: 500,
            correlation_cutoff: 0.9,
            label_column: load.label_column,
            positive_class: load.positive_class,
            threads: None,
            irls: IrlsOptions::default(),
            stepwise: StepwiseConfig::default(),
            lasso: LassoConfig::default(),
            rfe: RfeConfig::default(),
            grids: GridsConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

fn check_grid(name: &str, grid: &HyperparameterGrid) -> Result<(), ConfigError> {
    for GridAxis { parameter, values } in &grid.axes {
        if let Some(bad) = values.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
            return Err(ConfigError::Invalid(format!(
                "grid '{name}' has non-positive {} value {bad}",
                parameter.name()
            )));
        }
    }
    Ok(())
}

impl StudyConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: StudyConfig = toml::from_str(&text)?;
        config.validate()?;
        log::info!("Loaded study configuration from '{}'", path.display());
        Ok(config)
    }

    /// Rejects values no stage could run with. Per-stage errors still apply to
    /// anything that depends on the data, such as a fold count above the sample count.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if !(self.split_fraction > 0.0 && self.split_fraction < 1.0) {
            return invalid(format!("split_fraction must be in (0, 1), got {}", self.split_fraction));
        }
        for (name, folds) in [
            ("folds", self.folds),
            ("lasso.folds", self.lasso.folds),
            ("rfe.folds", self.rfe.folds),
        ] {
            if folds < 2 {
                return invalid(format!("{name} must be at least 2, got {folds}"));
            }
        }
        if !(0.0..=1.0).contains(&self.correlation_cutoff) {
            return invalid(format!(
                "correlation_cutoff must be in [0, 1], got {}",
                self.correlation_cutoff
            ));
        }
        if self.variance_top_n == 0 {
            return invalid("variance_top_n must be positive".to_string());
        }
        if self.threads == Some(0) {
            return invalid("threads must be positive when set".to_string());
        }
        check_grid("linear", &self.grids.linear)?;
        check_grid("kernel", &self.grids.kernel)?;
        Ok(())
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            label_column: self.label_column.clone(),
            positive_class: self.positive_class.clone(),
        }
    }

    pub fn stepwise_selector(&self) -> StepwiseSelector {
        StepwiseSelector {
            max_steps: self.stepwise.max_steps,
            max_start_features: self.stepwise.max_start_features,
            options: self.irls,
        }
    }

    pub fn lasso_selector(&self, seed: u64) -> LassoSelector {
        LassoSelector {
            path_length: self.lasso.path_length,
            min_ratio: self.lasso.min_ratio,
            folds: self.lasso.folds,
            seed,
            options: self.irls,
        }
    }

    pub fn rfe_selector(&self, seed: u64) -> RfeSelector {
        RfeSelector {
            sizes: self.rfe.sizes.clone(),
            family: self.rfe.family,
            configuration: self.rfe.configuration(),
            folds: self.rfe.folds,
            seed,
            options: self.irls,
        }
    }

    pub fn embedding_projector(&self, seed: u64) -> EmbeddingProjector {
        EmbeddingProjector {
            perplexity: self.embedding.perplexity,
            iterations: self.embedding.iterations,
            learning_rate: self.embedding.learning_rate,
            seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "seed = 7").unwrap();
        writeln!(file, "[lasso]").unwrap();
        writeln!(file, "folds = 5").unwrap();
        writeln!(file, "[[grids.linear.axes]]").unwrap();
        writeln!(file, "parameter = \"lambda\"").unwrap();
        writeln!(file, "values = [0.5]").unwrap();
        file.flush().unwrap();

        let config = StudyConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.lasso.folds, 5);
        assert_eq!(config.lasso.path_length, 100);
        assert_eq!(config.split_fraction, 0.75);
        assert_eq!(config.grids.linear.configurations().len(), 1);
        assert_eq!(config.grids.kernel.configurations().len(), 16);
    }

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = StudyConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: StudyConfig = toml::from_str(&text).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let config = StudyConfig {
            split_fraction: 1.2,
            ..StudyConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = StudyConfig::default();
        config.grids.kernel.axes[0].values.push(-1.0);
        assert!(config.validate().is_err());
    }
}
