//! Writers for the study outputs consumed by external reporting and plotting.

use crate::data::Dataset;
use crate::embed::Embedding;
use crate::partition::Split;
use crate::pipeline::StudyReport;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to serialize report to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Embedding has {coordinates} rows but the dataset has {samples} samples.")]
    RowMismatch { coordinates: usize, samples: usize },
}

pub fn write_report_toml(report: &StudyReport, path: &Path) -> Result<(), ReportError> {
    let toml_string = toml::to_string_pretty(report)?;
    let mut file = BufWriter::new(fs::File::create(path)?);
    file.write_all(toml_string.as_bytes())?;
    file.flush()?;
    log::info!("Study report written to '{}'", path.display());
    Ok(())
}

/// One row per sample: `sample_id,label,dim1,dim2,partition`.
pub fn write_embedding_csv(
    path: &Path,
    dataset: &Dataset,
    embedding: &Embedding,
    split: &Split,
) -> Result<(), ReportError> {
    if embedding.coordinates.nrows() != dataset.n_samples() {
        return Err(ReportError::RowMismatch {
            coordinates: embedding.coordinates.nrows(),
            samples: dataset.n_samples(),
        });
    }
    let mut in_train = vec![false; dataset.n_samples()];
    for &row in &split.train {
        if let Some(flag) = in_train.get_mut(row) {
            *flag = true;
        }
    }

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["sample_id", "label", "dim1", "dim2", "partition"])?;
    for (i, sample) in dataset.samples().enumerate() {
        let coordinates = embedding.coordinates.row(i);
        writer.write_record([
            sample.id.to_string(),
            dataset.classes().name(sample.label).to_string(),
            coordinates[0].to_string(),
            coordinates[1].to_string(),
            if in_train[i] { "train" } else { "test" }.to_string(),
        ])?;
    }
    writer.flush()?;
    log::info!("Embedding coordinates written to '{}'", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ClassNames, Label};
    use ndarray::array;

    #[test]
    fn embedding_csv_marks_partitions() {
        let ds = Dataset::new(
            array![[1.0], [2.0], [3.0]],
            vec![Label::Negative, Label::Positive, Label::Negative],
            vec!["g".into()],
            vec!["a".into(), "b".into(), "c".into()],
            ClassNames {
                negative: "LumA".into(),
                positive: "Basal".into(),
            },
        )
        .unwrap();
        let embedding = Embedding {
            coordinates: array![[0.5, -1.0], [1.5, 2.0], [0.0, 0.0]],
            kl_divergence: 0.1,
        };
        let split = Split {
            train: vec![0, 2],
            test: vec![1],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embedding.csv");
        write_embedding_csv(&path, &ds, &embedding, &split).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "sample_id,label,dim1,dim2,partition");
        assert_eq!(lines[1], "a,LumA,0.5,-1,train");
        assert_eq!(lines[2], "b,Basal,1.5,2,test");
        assert_eq!(lines.len(), 4);
    }
}
