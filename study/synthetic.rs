//! Seeded synthetic expression studies with a known informative subset.
//!
//! Features are named `gene0001`, `gene0002`, ... The first `informative` of them
//! have their mean shifted by `shift` in the positive class. The next
//! `correlated_copies` are noisy copies of the informative ones, and every remaining
//! feature is standard normal noise.

use crate::data::{ClassNames, DataError, Dataset, Label, LoadOptions, SAMPLE_ID_COLUMN};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, StandardNormal};
use std::path::Path;
use thiserror::Error;

/// Noise added to a correlated copy of an informative feature.
const COPY_NOISE_SD: f64 = 0.1;

#[derive(Error, Debug)]
pub enum SyntheticError {
    #[error("Invalid synthetic study: {0}")]
    Invalid(String),
    #[error("Error from the dataset: {0}")]
    Data(#[from] DataError),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticSpec {
    pub samples_per_class: usize,
    pub features: usize,
    pub informative: usize,
    pub shift: f64,
    pub correlated_copies: usize,
    pub seed: u64,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            samples_per_class: 150,
            features: 200,
            informative: 5,
            shift: 1.0,
            correlated_copies: 0,
            seed: 42,
        }
    }
}

pub fn feature_name(index: usize) -> String {
    format!("gene{:04}", index + 1)
}

impl SyntheticSpec {
    pub fn generate(&self) -> Result<Dataset, SyntheticError> {
        if self.samples_per_class < 2 {
            return Err(SyntheticError::Invalid(
                "each class needs at least two samples".to_string(),
            ));
        }
        if self.informative + self.correlated_copies > self.features {
            return Err(SyntheticError::Invalid(format!(
                "{} informative features and {} copies do not fit in {} features",
                self.informative, self.correlated_copies, self.features
            )));
        }
        if self.correlated_copies > 0 && self.informative == 0 {
            return Err(SyntheticError::Invalid(
                "correlated copies need at least one informative feature".to_string(),
            ));
        }
        let copy_noise = Normal::new(0.0, COPY_NOISE_SD)
            .map_err(|e| SyntheticError::Invalid(e.to_string()))?;

        let n = 2 * self.samples_per_class;
        let labels: Vec<Label> = (0..n)
            .map(|i| {
                if i < self.samples_per_class {
                    Label::Negative
                } else {
                    Label::Positive
                }
            })
            .collect();

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut values = Array2::<f64>::zeros((n, self.features));
        for (i, mut row) in values.rows_mut().into_iter().enumerate() {
            let offset = if labels[i] == Label::Positive { self.shift } else { 0.0 };
            for j in 0..self.features {
                let noise: f64 = StandardNormal.sample(&mut rng);
                row[j] = if j < self.informative {
                    offset + noise
                } else if j < self.informative + self.correlated_copies {
                    row[(j - self.informative) % self.informative] + copy_noise.sample(&mut rng)
                } else {
                    noise
                };
            }
        }

        log::info!(
            "Generated synthetic study: {n} samples, {} features ({} informative, shift {})",
            self.features,
            self.informative,
            self.shift
        );
        Ok(Dataset::new(
            values,
            labels,
            (0..self.features).map(feature_name).collect(),
            (0..n).map(|i| format!("sample{:04}", i + 1)).collect(),
            ClassNames {
                negative: "SubtypeA".to_string(),
                positive: "SubtypeB".to_string(),
            },
        )?)
    }
}

/// Writes `dataset` in the tab-separated layout the loader reads.
pub fn write_tsv(dataset: &Dataset, path: &Path) -> Result<(), SyntheticError> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    let label_column = LoadOptions::default().label_column;
    let mut header = vec![SAMPLE_ID_COLUMN.to_string(), label_column];
    header.extend(dataset.feature_names().iter().cloned());
    writer.write_record(&header)?;

    for sample in dataset.samples() {
        let mut record = Vec::with_capacity(dataset.n_features() + 2);
        record.push(sample.id.to_string());
        record.push(dataset.classes().name(sample.label).to_string());
        record.extend(sample.features.iter().map(|v| v.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    log::info!("Synthetic matrix written to '{}'", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::load_expression_matrix;

    #[test]
    fn informative_features_are_shifted() {
        let ds = SyntheticSpec {
            samples_per_class: 200,
            features: 10,
            informative: 2,
            shift: 2.0,
            correlated_copies: 1,
            seed: 1,
        }
        .generate()
        .unwrap();
        assert_eq!(ds.class_counts(), [200, 200]);
        let x = ds.values();
        let mean = |j: usize, rows: std::ops::Range<usize>| {
            rows.clone().map(|i| x[[i, j]]).sum::<f64>() / rows.len() as f64
        };
        assert!(mean(0, 200..400) - mean(0, 0..200) > 1.5);
        assert!((mean(5, 200..400) - mean(5, 0..200)).abs() < 0.4);
        // gene0003 copies gene0001.
        assert!((mean(2, 200..400) - mean(2, 0..200)) > 1.5);
    }

    #[test]
    fn same_seed_same_values() {
        let spec = SyntheticSpec {
            samples_per_class: 5,
            features: 4,
            informative: 1,
            ..SyntheticSpec::default()
        };
        assert_eq!(spec.generate().unwrap().values(), spec.generate().unwrap().values());
    }

    #[test]
    fn written_matrix_loads_back() {
        let ds = SyntheticSpec {
            samples_per_class: 4,
            features: 3,
            informative: 1,
            ..SyntheticSpec::default()
        }
        .generate()
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.tsv");
        write_tsv(&ds, &path).unwrap();

        let loaded = load_expression_matrix(&path, &LoadOptions::default()).unwrap();
        assert_eq!(loaded.sample_ids(), ds.sample_ids());
        assert_eq!(loaded.labels(), ds.labels());
        assert_eq!(loaded.feature_names(), ds.feature_names());
        for (a, b) in loaded.values().iter().zip(ds.values().iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn oversubscribed_features_are_rejected() {
        let spec = SyntheticSpec {
            features: 3,
            informative: 2,
            correlated_copies: 2,
            ..SyntheticSpec::default()
        };
        assert!(matches!(spec.generate(), Err(SyntheticError::Invalid(_))));
    }
}
