//! Held-out evaluation: confusion matrix and the metrics derived from it.

use crate::data::{DataError, Dataset, Label};
use crate::model::FittedModel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("The evaluation set has no samples.")]
    EmptyTestSet,
    #[error("Error from the dataset: {0}")]
    Data(#[from] DataError),
}

/// 2x2 counts over (predicted, actual).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_positive: usize,
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
}

impl ConfusionMatrix {
    pub fn from_predictions(predicted: &[Label], actual: &[Label]) -> Self {
        let mut matrix = Self::default();
        for (&p, &a) in predicted.iter().zip(actual) {
            match (p, a) {
                (Label::Positive, Label::Positive) => matrix.true_positive += 1,
                (Label::Positive, Label::Negative) => matrix.false_positive += 1,
                (Label::Negative, Label::Negative) => matrix.true_negative += 1,
                (Label::Negative, Label::Positive) => matrix.false_negative += 1,
            }
        }
        matrix
    }

    pub fn total(&self) -> usize {
        self.true_positive + self.false_positive + self.true_negative + self.false_negative
    }

    pub fn metrics(&self) -> Metrics {
        let ratio = |num: usize, den: usize| (den > 0).then(|| num as f64 / den as f64);
        let total = self.total();
        let accuracy = ratio(self.true_positive + self.true_negative, total).unwrap_or(0.0);
        let sensitivity = ratio(self.true_positive, self.true_positive + self.false_negative);
        let specificity = ratio(self.true_negative, self.true_negative + self.false_positive);

        let balanced_accuracy = match (sensitivity, specificity) {
            (Some(se), Some(sp)) => Some((se + sp) / 2.0),
            _ => None,
        };

        // Cohen's kappa against the chance agreement of the marginals.
        let kappa = (total > 0).then(|| {
            let n = total as f64;
            let predicted_pos = (self.true_positive + self.false_positive) as f64 / n;
            let actual_pos = (self.true_positive + self.false_negative) as f64 / n;
            let chance = predicted_pos * actual_pos + (1.0 - predicted_pos) * (1.0 - actual_pos);
            (chance, accuracy)
        });
        let kappa = kappa.and_then(|(chance, observed)| {
            (chance < 1.0).then(|| (observed - chance) / (1.0 - chance))
        });

        Metrics {
            accuracy,
            sensitivity,
            specificity,
            balanced_accuracy,
            positive_predictive_value: ratio(
                self.true_positive,
                self.true_positive + self.false_positive,
            ),
            negative_predictive_value: ratio(
                self.true_negative,
                self.true_negative + self.false_negative,
            ),
            kappa,
        }
    }
}

/// Rates derived from a ConfusionMatrix. A rate whose denominator is zero is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub accuracy: f64,
    pub sensitivity: Option<f64>,
    pub specificity: Option<f64>,
    pub balanced_accuracy: Option<f64>,
    pub positive_predictive_value: Option<f64>,
    pub negative_predictive_value: Option<f64>,
    pub kappa: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub confusion: ConfusionMatrix,
    pub metrics: Metrics,
}

/// Predicts `test` with `model` at the 0.5 threshold and scores the calls.
pub fn evaluate(model: &FittedModel, test: &Dataset) -> Result<Evaluation, EvaluationError> {
    if test.n_samples() == 0 {
        return Err(EvaluationError::EmptyTestSet);
    }
    let predicted = model.predict_dataset(test)?;
    let confusion = ConfusionMatrix::from_predictions(&predicted, test.labels());
    let metrics = confusion.metrics();
    log::info!(
        "Held-out evaluation on {} samples: accuracy {:.3}, sensitivity {}, specificity {}",
        confusion.total(),
        metrics.accuracy,
        format_rate(metrics.sensitivity),
        format_rate(metrics.specificity)
    );
    Ok(Evaluation { confusion, metrics })
}

/// Renders an optional rate for logs and tables; undefined rates print as `-`.
pub fn format_rate(rate: Option<f64>) -> String {
    rate.map_or_else(|| "-".to_string(), |r| format!("{r:.3}"))
}
