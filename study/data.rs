//! # Expression Matrix Model and Loading
//!
//! This module owns the in-memory representation of a two-class expression study
//! and is the exclusive entry point for user-provided matrices.
//!
//! - Immutable Dataset: once built, a `Dataset` is never mutated. Every stage that
//!   needs a different view (a row subset, a feature subset, an embedding) receives
//!   a new value.
//! - Named Features: columns are addressed through `FeatureSet`s of names, so a
//!   selection computed on one subset applies unchanged to another.
//! - Strict Input: the loader rejects missing, non-numeric and non-finite values and
//!   anything other than exactly two classes. Failures are assumed to be user-input
//!   errors and `DataError` says which column is at fault.

use ahash::{AHashMap, AHashSet};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Probability at or above which a sample is called for the positive class.
pub const DECISION_THRESHOLD: f64 = 0.5;

/// Name of the optional identifier column in input matrices.
pub const SAMPLE_ID_COLUMN: &str = "sample_id";

/// One of the two subtypes. The positive class is the one sensitivity refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Negative,
    Positive,
}

impl Label {
    pub const BOTH: [Label; 2] = [Label::Negative, Label::Positive];

    /// The 0/1 response used by the logistic models.
    pub fn indicator(self) -> f64 {
        match self {
            Label::Negative => 0.0,
            Label::Positive => 1.0,
        }
    }

    pub fn from_probability(probability: f64) -> Self {
        if probability >= DECISION_THRESHOLD {
            Label::Positive
        } else {
            Label::Negative
        }
    }
}

/// The user-facing names of the two classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassNames {
    pub negative: String,
    pub positive: String,
}

impl ClassNames {
    pub fn name(&self, label: Label) -> &str {
        match label {
            Label::Negative => &self.negative,
            Label::Positive => &self.positive,
        }
    }

    pub fn parse(&self, raw: &str) -> Option<Label> {
        if raw == self.positive {
            Some(Label::Positive)
        } else if raw == self.negative {
            Some(Label::Negative)
        } else {
            None
        }
    }
}

/// An ordered set of unique feature names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    names: Vec<String>,
}

impl FeatureSet {
    pub fn new(names: Vec<String>) -> Result<Self, DataError> {
        let mut seen = AHashSet::with_capacity(names.len());
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(DataError::DuplicateFeature(name.clone()));
            }
        }
        Ok(Self { names })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Keeps the members at `positions` (indices into this set), in the order given.
    /// Positions must be unique and in range.
    pub fn subset(&self, positions: &[usize]) -> FeatureSet {
        FeatureSet {
            names: positions.iter().map(|&i| self.names[i].clone()).collect(),
        }
    }
}

/// A borrowed view of one row of a `Dataset`.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    pub id: &'a str,
    pub features: ArrayView1<'a, f64>,
    pub label: Label,
}

/// Samples x features matrix with one label per sample.
///
/// Invariants, checked at construction: one label and one id per row, one unique
/// name per column, every value finite.
#[derive(Debug, Clone)]
pub struct Dataset {
    values: Array2<f64>,
    labels: Vec<Label>,
    feature_names: Vec<String>,
    sample_ids: Vec<String>,
    classes: ClassNames,
    feature_index: AHashMap<String, usize>,
}

impl Dataset {
    pub fn new(
        values: Array2<f64>,
        labels: Vec<Label>,
        feature_names: Vec<String>,
        sample_ids: Vec<String>,
        classes: ClassNames,
    ) -> Result<Self, DataError> {
        if labels.len() != values.nrows() {
            return Err(DataError::ShapeMismatch {
                what: "labels",
                expected: values.nrows(),
                found: labels.len(),
            });
        }
        if sample_ids.len() != values.nrows() {
            return Err(DataError::ShapeMismatch {
                what: "sample ids",
                expected: values.nrows(),
                found: sample_ids.len(),
            });
        }
        if feature_names.len() != values.ncols() {
            return Err(DataError::ShapeMismatch {
                what: "feature names",
                expected: values.ncols(),
                found: feature_names.len(),
            });
        }

        let mut feature_index = AHashMap::with_capacity(feature_names.len());
        for (j, name) in feature_names.iter().enumerate() {
            if feature_index.insert(name.clone(), j).is_some() {
                return Err(DataError::DuplicateFeature(name.clone()));
            }
        }

        if let Some(((_, col), _)) = values.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(feature_names[col].clone()));
        }

        Ok(Self {
            values,
            labels,
            feature_names,
            sample_ids,
            classes,
            feature_index,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.values.ncols()
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn classes(&self) -> &ClassNames {
        &self.classes
    }

    pub fn sample(&self, index: usize) -> Sample<'_> {
        Sample {
            id: &self.sample_ids[index],
            features: self.values.row(index),
            label: self.labels[index],
        }
    }

    pub fn samples(&self) -> impl Iterator<Item = Sample<'_>> + '_ {
        (0..self.n_samples()).map(move |i| self.sample(i))
    }

    /// The labels as a 0/1 response vector.
    pub fn label_indicator(&self) -> Array1<f64> {
        self.labels.iter().map(|l| l.indicator()).collect()
    }

    /// Sample counts indexed by `Label as usize`.
    pub fn class_counts(&self) -> [usize; 2] {
        let mut counts = [0usize; 2];
        for &label in &self.labels {
            counts[label as usize] += 1;
        }
        counts
    }

    /// Every feature of the dataset, in column order.
    pub fn feature_set(&self) -> FeatureSet {
        FeatureSet {
            names: self.feature_names.clone(),
        }
    }

    pub fn column_indices(&self, features: &FeatureSet) -> Result<Vec<usize>, DataError> {
        features
            .names()
            .iter()
            .map(|name| {
                self.feature_index
                    .get(name)
                    .copied()
                    .ok_or_else(|| DataError::UnknownFeature(name.clone()))
            })
            .collect()
    }

    /// The samples x features matrix restricted to `features`, columns in set order.
    pub fn design(&self, features: &FeatureSet) -> Result<Array2<f64>, DataError> {
        let columns = self.column_indices(features)?;
        Ok(self.values.select(Axis(1), &columns))
    }

    /// A new dataset holding only `rows`, in the order given.
    pub fn subset(&self, rows: &[usize]) -> Result<Dataset, DataError> {
        if let Some(&row) = rows.iter().find(|&&r| r >= self.n_samples()) {
            return Err(DataError::RowOutOfRange {
                row,
                samples: self.n_samples(),
            });
        }
        Ok(Dataset {
            values: self.values.select(Axis(0), rows),
            labels: rows.iter().map(|&r| self.labels[r]).collect(),
            feature_names: self.feature_names.clone(),
            sample_ids: rows.iter().map(|&r| self.sample_ids[r].clone()).collect(),
            classes: self.classes.clone(),
            feature_index: self.feature_index.clone(),
        })
    }

    /// The same samples described by a different feature matrix (for example an embedding).
    pub fn with_features(
        &self,
        values: Array2<f64>,
        feature_names: Vec<String>,
    ) -> Result<Dataset, DataError> {
        Dataset::new(
            values,
            self.labels.clone(),
            feature_names,
            self.sample_ids.clone(),
            self.classes.clone(),
        )
    }
}

/// Options controlling how an expression matrix is interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Column holding the class label of each sample.
    pub label_column: String,
    /// Which label value is the positive class. Defaults to the lexically larger one.
    pub positive_class: Option<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            label_column: "subtype".to_string(),
            positive_class: None,
        }
    }
}

/// A comprehensive error type for dataset construction and loading.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] polars::prelude::PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the column '{0}'.")]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Expected exactly two classes in the label column, found {found}: {labels:?}")]
    ClassCount { found: usize, labels: Vec<String> },
    #[error("The positive class '{0}' does not occur in the label column.")]
    UnknownPositiveClass(String),
    #[error("Expected {expected} {what}, found {found}.")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Feature '{0}' appears more than once.")]
    DuplicateFeature(String),
    #[error("Feature '{0}' is not part of the dataset.")]
    UnknownFeature(String),
    #[error("Row {row} is out of range for a dataset of {samples} samples.")]
    RowOutOfRange { row: usize, samples: usize },
    #[error("The input file has no feature columns.")]
    NoFeatures,
}

/// Loads a tab-separated expression matrix: one row per sample, a label column,
/// an optional `sample_id` column, and every remaining column a numeric feature.
pub fn load_expression_matrix(path: &Path, options: &LoadOptions) -> Result<Dataset, DataError> {
    loader::load(path, options)
}

/// Internal module for the polars-backed reader.
mod loader {
    use super::{ClassNames, DataError, Dataset, Label, LoadOptions, SAMPLE_ID_COLUMN};
    use ndarray::{Array2, ShapeBuilder};
    use polars::prelude::*;
    use std::collections::BTreeSet;
    use std::fs::File;
    use std::path::Path;

    pub(super) fn load(path: &Path, options: &LoadOptions) -> Result<Dataset, DataError> {
        log::info!("Loading expression matrix from '{}'", path.display());

        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;

        let column_names: Vec<String> = df
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();
        if !column_names.iter().any(|c| c == &options.label_column) {
            return Err(DataError::ColumnNotFound(options.label_column.clone()));
        }

        let n = df.height();
        let raw_labels = extract_text_column(&df, &options.label_column)?;
        let sample_ids = if column_names.iter().any(|c| c == SAMPLE_ID_COLUMN) {
            extract_text_column(&df, SAMPLE_ID_COLUMN)?
        } else {
            (1..=n).map(|i| format!("sample{i}")).collect()
        };

        let feature_names: Vec<String> = column_names
            .into_iter()
            .filter(|c| c != &options.label_column && c != SAMPLE_ID_COLUMN)
            .collect();
        if feature_names.is_empty() {
            return Err(DataError::NoFeatures);
        }

        let classes = resolve_classes(&raw_labels, options)?;
        let labels: Vec<Label> = raw_labels
            .iter()
            .map(|raw| {
                classes
                    .parse(raw)
                    .ok_or_else(|| DataError::UnknownPositiveClass(raw.clone()))
            })
            .collect::<Result<_, _>>()?;

        let p = feature_names.len();
        let mut buffer = Vec::with_capacity(n * p);
        for name in &feature_names {
            let mut column = extract_numeric_column(&df, name)?;
            buffer.append(&mut column);
        }
        let values = Array2::from_shape_vec((n, p).f(), buffer).map_err(|_| {
            DataError::ShapeMismatch {
                what: "matrix cells",
                expected: n * p,
                found: 0,
            }
        })?;

        log::info!(
            "Loaded {} samples x {} features (classes: '{}' negative, '{}' positive)",
            n,
            p,
            classes.negative,
            classes.positive
        );

        Dataset::new(values, labels, feature_names, sample_ids, classes)
    }

    fn resolve_classes(raw_labels: &[String], options: &LoadOptions) -> Result<ClassNames, DataError> {
        let distinct: BTreeSet<&str> = raw_labels.iter().map(String::as_str).collect();
        if distinct.len() != 2 {
            return Err(DataError::ClassCount {
                found: distinct.len(),
                labels: distinct.iter().map(|s| s.to_string()).collect(),
            });
        }
        let sorted: Vec<&str> = distinct.into_iter().collect();
        let (negative, positive) = match &options.positive_class {
            Some(wanted) if wanted == sorted[0] => (sorted[1], sorted[0]),
            Some(wanted) if wanted == sorted[1] => (sorted[0], sorted[1]),
            Some(wanted) => return Err(DataError::UnknownPositiveClass(wanted.clone())),
            None => (sorted[0], sorted[1]),
        };
        Ok(ClassNames {
            negative: negative.to_string(),
            positive: positive.to_string(),
        })
    }

    fn extract_text_column(df: &DataFrame, column_name: &str) -> Result<Vec<String>, DataError> {
        let column = df.column(column_name)?;
        if column.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }
        let casted = column.cast(&DataType::String)?;
        let chunked = casted.str()?;
        Ok(chunked
            .into_iter()
            .map(|value| value.unwrap_or_default().trim().to_string())
            .collect())
    }

    fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let wrong_type = || DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        };
        let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
        if casted.null_count() > 0 {
            return Err(wrong_type());
        }

        let chunked = casted.f64()?.rechunk();
        let values: Vec<f64> = chunked.into_no_null_iter().collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }
}
