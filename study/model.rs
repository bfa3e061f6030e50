use crate::data::{DataError, Dataset, FeatureSet, Label};
use crate::kernel::{KernelFit, fit_kernel_logistic};
use crate::logistic::{FitError, IrlsOptions, LogisticFit, fit_ridge_logistic, sigmoid};
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;

// --- Hyperparameters ---

/// The named hyperparameters a Configuration can bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hyperparameter {
    /// L2 penalty strength (linear family) or kernel ridge strength (kernel family).
    Lambda,
    /// RBF kernel width, `k(u, v) = exp(-sigma |u - v|^2)`.
    Sigma,
    /// L1 penalty of a lasso selection model.
    L1Penalty,
}

impl Hyperparameter {
    pub fn name(self) -> &'static str {
        match self {
            Hyperparameter::Lambda => "lambda",
            Hyperparameter::Sigma => "sigma",
            Hyperparameter::L1Penalty => "l1_penalty",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterValue {
    pub parameter: Hyperparameter,
    pub value: f64,
}

/// One point of a hyperparameter grid.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Configuration {
    values: Vec<ParameterValue>,
}

impl Configuration {
    pub fn new(values: impl IntoIterator<Item = (Hyperparameter, f64)>) -> Self {
        Self {
            values: values
                .into_iter()
                .map(|(parameter, value)| ParameterValue { parameter, value })
                .collect(),
        }
    }

    pub fn get(&self, parameter: Hyperparameter) -> Option<f64> {
        self.values
            .iter()
            .find(|pv| pv.parameter == parameter)
            .map(|pv| pv.value)
    }

    pub fn values(&self) -> &[ParameterValue] {
        &self.values
    }

    fn require(&self, parameter: Hyperparameter) -> Result<f64, FitError> {
        self.get(parameter)
            .ok_or_else(|| FitError::MissingHyperparameter(parameter.name().to_string()))
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .values
            .iter()
            .map(|pv| format!("{}={}", pv.parameter.name(), pv.value))
            .join(", ");
        f.write_str(&rendered)
    }
}

/// One named axis of a grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridAxis {
    pub parameter: Hyperparameter,
    pub values: Vec<f64>,
}

/// The Cartesian product of its axes. The first axis varies slowest.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HyperparameterGrid {
    pub axes: Vec<GridAxis>,
}

impl HyperparameterGrid {
    pub fn new(axes: Vec<GridAxis>) -> Self {
        Self { axes }
    }

    /// A grid holding exactly `configuration`.
    pub fn single(configuration: &Configuration) -> Self {
        Self {
            axes: configuration
                .values()
                .iter()
                .map(|pv| GridAxis {
                    parameter: pv.parameter,
                    values: vec![pv.value],
                })
                .collect(),
        }
    }

    /// Every configuration, in enumeration order. A grid without axes, or with an
    /// empty axis, has no configurations.
    pub fn configurations(&self) -> Vec<Configuration> {
        if self.axes.is_empty() || self.axes.iter().any(|a| a.values.is_empty()) {
            return Vec::new();
        }
        self.axes
            .iter()
            .map(|axis| axis.values.iter().map(move |&v| (axis.parameter, v)))
            .multi_cartesian_product()
            .map(Configuration::new)
            .collect()
    }

    pub fn len(&self) -> usize {
        if self.axes.is_empty() {
            0
        } else {
            self.axes.iter().map(|a| a.values.len()).product()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn default_for(family: ClassifierFamily) -> Self {
        match family {
            ClassifierFamily::Linear => Self::new(vec![GridAxis {
                parameter: Hyperparameter::Lambda,
                values: vec![1e-3, 1e-2, 1e-1, 1.0, 10.0],
            }]),
            ClassifierFamily::Kernel => Self::new(vec![
                GridAxis {
                    parameter: Hyperparameter::Sigma,
                    values: vec![0.001, 0.01, 0.1, 1.0],
                },
                GridAxis {
                    parameter: Hyperparameter::Lambda,
                    values: vec![1e-3, 1e-2, 1e-1, 1.0],
                },
            ]),
        }
    }
}

// --- Standardization ---

/// Column centers and scales learned from one training matrix.
///
/// Constant columns get a unit scale, so they map to zero rather than NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub centers: Array1<f64>,
    pub scales: Array1<f64>,
}

impl Standardizer {
    pub fn fit(x: ArrayView2<f64>) -> Self {
        let n = x.nrows();
        let centers = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(x.ncols()));
        let scales = if n < 2 {
            Array1::ones(x.ncols())
        } else {
            x.std_axis(Axis(0), 1.0)
                .mapv(|s| if s > 1e-12 && s.is_finite() { s } else { 1.0 })
        };
        Self { centers, scales }
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Array2<f64> {
        (&x - &self.centers) / &self.scales
    }

    /// The statistics of the columns at `positions`, in that order.
    pub fn select(&self, positions: &[usize]) -> Standardizer {
        Standardizer {
            centers: self.centers.select(Axis(0), positions),
            scales: self.scales.select(Axis(0), positions),
        }
    }
}

// --- Classifier families ---

/// The two model families compared by the study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierFamily {
    /// Ridge-penalized logistic regression, hyperparameter `lambda`.
    Linear,
    /// RBF kernel logistic regression, hyperparameters `sigma` and `lambda`.
    Kernel,
}

impl ClassifierFamily {
    pub const ALL: [ClassifierFamily; 2] = [ClassifierFamily::Linear, ClassifierFamily::Kernel];

    pub fn name(self) -> &'static str {
        match self {
            ClassifierFamily::Linear => "linear",
            ClassifierFamily::Kernel => "kernel",
        }
    }

    /// Fits this family on already-standardized inputs.
    pub fn fit(
        self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        configuration: &Configuration,
        options: &IrlsOptions,
    ) -> Result<Classifier, FitError> {
        match self {
            ClassifierFamily::Linear => {
                let lambda = configuration.require(Hyperparameter::Lambda)?;
                fit_ridge_logistic(x, y, lambda, options).map(Classifier::Logistic)
            }
            ClassifierFamily::Kernel => {
                let sigma = configuration.require(Hyperparameter::Sigma)?;
                let lambda = configuration.require(Hyperparameter::Lambda)?;
                fit_kernel_logistic(x, y, sigma, lambda, options).map(Classifier::Kernel)
            }
        }
    }
}

impl fmt::Display for ClassifierFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// A fitted classifier operating on standardized inputs.
#[derive(Debug, Clone)]
pub enum Classifier {
    Logistic(LogisticFit),
    Kernel(KernelFit),
}

impl Classifier {
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Array1<f64> {
        match self {
            Classifier::Logistic(fit) => fit.predict_proba(x),
            Classifier::Kernel(fit) => fit.decision_function(x).mapv(sigmoid),
        }
    }

    /// Per-feature |coefficient| for models that have one coefficient per feature.
    pub fn coefficient_magnitudes(&self) -> Option<Array1<f64>> {
        match self {
            Classifier::Logistic(fit) => Some(fit.coefficients.mapv(f64::abs)),
            Classifier::Kernel(_) => None,
        }
    }
}

/// A classifier bound to its FeatureSet, its Configuration and the standardization
/// learned from its training rows.
#[derive(Debug, Clone)]
pub struct FittedModel {
    family: ClassifierFamily,
    features: FeatureSet,
    configuration: Configuration,
    standardizer: Standardizer,
    classifier: Classifier,
}

impl FittedModel {
    /// Standardizes `x` (raw values, columns in `features` order) with its own
    /// statistics and fits `family` on the result.
    pub fn fit(
        family: ClassifierFamily,
        features: FeatureSet,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        configuration: &Configuration,
        options: &IrlsOptions,
    ) -> Result<Self, FitError> {
        let standardizer = Standardizer::fit(x);
        let standardized = standardizer.transform(x);
        let classifier = family.fit(standardized.view(), y, configuration, options)?;
        Ok(Self {
            family,
            features,
            configuration: configuration.clone(),
            standardizer,
            classifier,
        })
    }

    /// Wraps a logistic fit that was produced outside the family dispatch, such as
    /// the refit of a selection strategy.
    pub fn from_logistic(
        features: FeatureSet,
        configuration: Configuration,
        standardizer: Standardizer,
        fit: LogisticFit,
    ) -> Self {
        Self {
            family: ClassifierFamily::Linear,
            features,
            configuration,
            standardizer,
            classifier: Classifier::Logistic(fit),
        }
    }

    pub fn family(&self) -> ClassifierFamily {
        self.family
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn standardizer(&self) -> &Standardizer {
        &self.standardizer
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Positive-class probabilities for raw rows whose columns follow `features()`.
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let standardized = self.standardizer.transform(x);
        self.classifier.predict_proba(standardized.view())
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Vec<Label> {
        self.predict_proba(x)
            .iter()
            .map(|&p| Label::from_probability(p))
            .collect()
    }

    /// Predicts every sample of `dataset`, looking columns up by name.
    pub fn predict_dataset(&self, dataset: &Dataset) -> Result<Vec<Label>, DataError> {
        let x = dataset.design(&self.features)?;
        Ok(self.predict(x.view()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn grid_enumerates_first_axis_slowest() {
        let grid = HyperparameterGrid::default_for(ClassifierFamily::Kernel);
        let configs = grid.configurations();
        assert_eq!(configs.len(), 16);
        assert_eq!(grid.len(), 16);
        assert_eq!(configs[0].get(Hyperparameter::Sigma), Some(0.001));
        assert_eq!(configs[0].get(Hyperparameter::Lambda), Some(1e-3));
        assert_eq!(configs[1].get(Hyperparameter::Sigma), Some(0.001));
        assert_eq!(configs[1].get(Hyperparameter::Lambda), Some(1e-2));
        assert_eq!(configs[4].get(Hyperparameter::Sigma), Some(0.01));
    }

    #[test]
    fn empty_grids_have_no_configurations() {
        assert!(HyperparameterGrid::default().configurations().is_empty());
        let hollow = HyperparameterGrid::new(vec![GridAxis {
            parameter: Hyperparameter::Lambda,
            values: Vec::new(),
        }]);
        assert!(hollow.is_empty());
        assert!(hollow.configurations().is_empty());
    }

    #[test]
    fn single_grid_round_trips_its_configuration() {
        let config = Configuration::new([(Hyperparameter::Sigma, 0.1), (Hyperparameter::Lambda, 1.0)]);
        let configs = HyperparameterGrid::single(&config).configurations();
        assert_eq!(configs, vec![config.clone()]);
        assert_eq!(config.to_string(), "sigma=0.1, lambda=1");
    }

    #[test]
    fn standardizer_uses_training_statistics_only() {
        let train = array![[1.0, 5.0], [3.0, 5.0]];
        let standardizer = Standardizer::fit(train.view());
        assert_abs_diff_eq!(standardizer.centers[0], 2.0);
        assert_abs_diff_eq!(standardizer.scales[0], 2.0_f64.sqrt(), epsilon = 1e-12);
        // The constant column keeps a unit scale.
        assert_abs_diff_eq!(standardizer.scales[1], 1.0);

        let test = array![[2.0, 7.0]];
        let z = standardizer.transform(test.view());
        assert_abs_diff_eq!(z[[0, 0]], 0.0);
        assert_abs_diff_eq!(z[[0, 1]], 2.0);
    }

    #[test]
    fn missing_hyperparameter_is_reported() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = array![0.0, 1.0, 0.0, 1.0];
        let config = Configuration::new([(Hyperparameter::Lambda, 1.0)]);
        let result = ClassifierFamily::Kernel.fit(x.view(), y.view(), &config, &IrlsOptions::default());
        assert!(matches!(result, Err(FitError::MissingHyperparameter(name)) if name == "sigma"));
    }
}
