//! Seeded, class-stratified partitioning of samples.
//!
//! Every random draw in a study derives from one base seed through `derive_seed`, one
//! stream per consumer, so results do not depend on thread count or on the order in
//! which stages run.

use crate::data::{DataError, Dataset, Label};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PartitionError {
    #[error("Split fraction must lie strictly between 0 and 1, got {0}.")]
    InvalidFraction(f64),
    #[error("Class {class:?} has {count} samples; at least {required} are needed.")]
    InsufficientSamples {
        class: Label,
        count: usize,
        required: usize,
    },
    #[error("Cannot build {folds} folds from {samples} samples.")]
    InvalidFoldCount { folds: usize, samples: usize },
}

/// Independent random streams drawn from one study seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedStream {
    Split,
    GridFolds,
    LassoFolds,
    RfeFolds,
    Embedding,
}

impl SeedStream {
    fn index(self) -> u64 {
        match self {
            SeedStream::Split => 0,
            SeedStream::GridFolds => 1,
            SeedStream::LassoFolds => 2,
            SeedStream::RfeFolds => 3,
            SeedStream::Embedding => 4,
        }
    }
}

/// SplitMix64 finalizer over `base` offset by the stream index.
pub fn derive_seed(base: u64, stream: SeedStream) -> u64 {
    let mut z = base.wrapping_add((stream.index() + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Row indices of each class, in dataset order.
fn indices_by_class(labels: &[Label]) -> [Vec<usize>; 2] {
    let mut by_class = [Vec::new(), Vec::new()];
    for (i, &label) in labels.iter().enumerate() {
        by_class[label as usize].push(i);
    }
    by_class
}

/// Disjoint, sorted train and test row indices covering a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

impl Split {
    /// Materializes the two partitions of `dataset`. Works for any dataset whose
    /// rows correspond to the partitioned one, such as an embedding of it.
    pub fn apply(&self, dataset: &Dataset) -> Result<(Dataset, Dataset), DataError> {
        Ok((dataset.subset(&self.train)?, dataset.subset(&self.test)?))
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stratified train/test splitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPartitioner {
    fraction: f64,
    seed: u64,
}

impl DataPartitioner {
    pub fn new(fraction: f64, seed: u64) -> Result<Self, PartitionError> {
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(PartitionError::InvalidFraction(fraction));
        }
        Ok(Self { fraction, seed })
    }

    /// Per-class train counts. The total is `round(n * fraction)`, distributed by
    /// largest remainder with ties going to the negative class, and every class
    /// keeps at least one sample on each side.
    fn train_quotas(&self, counts: [usize; 2]) -> [usize; 2] {
        let n: usize = counts.iter().sum();
        let target = (n as f64 * self.fraction).round() as usize;
        let exact = counts.map(|c| c as f64 * self.fraction);
        let mut quotas = exact.map(|e| e.floor() as usize);

        let mut order = [0usize, 1];
        // Stable sort keeps the negative class first on equal remainders.
        order.sort_by(|&a, &b| {
            let ra = exact[a] - exact[a].floor();
            let rb = exact[b] - exact[b].floor();
            rb.total_cmp(&ra)
        });
        let mut remaining = target.saturating_sub(quotas.iter().sum());
        for &class in order.iter().cycle().take(2 * order.len()) {
            if remaining == 0 {
                break;
            }
            if quotas[class] < counts[class] {
                quotas[class] += 1;
                remaining -= 1;
            }
        }

        for (quota, &count) in quotas.iter_mut().zip(counts.iter()) {
            *quota = (*quota).clamp(1, count - 1);
        }
        quotas
    }

    pub fn split(&self, dataset: &Dataset) -> Result<Split, PartitionError> {
        let by_class = indices_by_class(dataset.labels());
        for label in Label::BOTH {
            let count = by_class[label as usize].len();
            if count < 2 {
                return Err(PartitionError::InsufficientSamples {
                    class: label,
                    count,
                    required: 2,
                });
            }
        }

        let quotas = self.train_quotas([by_class[0].len(), by_class[1].len()]);
        let mut rng = StdRng::seed_from_u64(derive_seed(self.seed, SeedStream::Split));
        let mut train = Vec::with_capacity(quotas.iter().sum());
        let mut test = Vec::with_capacity(dataset.n_samples());
        for (mut members, quota) in by_class.into_iter().zip(quotas) {
            members.shuffle(&mut rng);
            let (chosen, rest) = members.split_at(quota);
            train.extend_from_slice(chosen);
            test.extend_from_slice(rest);
        }
        train.sort_unstable();
        test.sort_unstable();

        log::info!(
            "Stratified split (fraction {}): {} train / {} test samples",
            self.fraction,
            train.len(),
            test.len()
        );
        Ok(Split { train, test })
    }
}

/// Maps every sample of a training set to one of `k` folds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldAssignment {
    folds: Vec<usize>,
    k: usize,
}

impl FoldAssignment {
    /// Shuffles each class, lays the classes end to end and deals the sequence
    /// round-robin, so fold sizes differ by at most one and each fold sees both
    /// classes in roughly their overall proportion.
    pub fn stratified(labels: &[Label], k: usize, seed: u64) -> Result<Self, PartitionError> {
        if k < 2 || k > labels.len() {
            return Err(PartitionError::InvalidFoldCount {
                folds: k,
                samples: labels.len(),
            });
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut folds = vec![0; labels.len()];
        let mut position = 0;
        for mut members in indices_by_class(labels) {
            members.shuffle(&mut rng);
            for index in members {
                folds[index] = position % k;
                position += 1;
            }
        }
        Ok(Self { folds, k })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn fold_of(&self, index: usize) -> usize {
        self.folds[index]
    }

    pub fn validation_indices(&self, fold: usize) -> Vec<usize> {
        (0..self.folds.len())
            .filter(|&i| self.folds[i] == fold)
            .collect()
    }

    pub fn train_indices(&self, fold: usize) -> Vec<usize> {
        (0..self.folds.len())
            .filter(|&i| self.folds[i] != fold)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ClassNames;
    use ndarray::Array2;

    fn balanced(per_class: usize) -> Dataset {
        let n = 2 * per_class;
        let labels = (0..n)
            .map(|i| if i < per_class { Label::Negative } else { Label::Positive })
            .collect();
        Dataset::new(
            Array2::from_shape_fn((n, 1), |(i, _)| i as f64),
            labels,
            vec!["g".into()],
            (0..n).map(|i| format!("s{i}")).collect(),
            ClassNames {
                negative: "A".into(),
                positive: "B".into(),
            },
        )
        .unwrap()
    }

    #[test]
    fn three_hundred_balanced_samples_split_225_75() {
        let ds = balanced(150);
        let split = DataPartitioner::new(0.75, 42).unwrap().split(&ds).unwrap();
        assert_eq!(split.train.len(), 225);
        assert_eq!(split.test.len(), 75);
        let (train, test) = split.apply(&ds).unwrap();
        assert_eq!(train.class_counts(), [113, 112]);
        assert_eq!(test.class_counts(), [37, 38]);
    }

    #[test]
    fn partitions_are_disjoint_and_cover_the_dataset() {
        let ds = balanced(20);
        let split = DataPartitioner::new(0.6, 3).unwrap().split(&ds).unwrap();
        let mut all: Vec<usize> = split.train.iter().chain(&split.test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn same_seed_reproduces_the_split() {
        let ds = balanced(30);
        let a = DataPartitioner::new(0.7, 9).unwrap().split(&ds).unwrap();
        let b = DataPartitioner::new(0.7, 9).unwrap().split(&ds).unwrap();
        let c = DataPartitioner::new(0.7, 10).unwrap().split(&ds).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(matches!(
            DataPartitioner::new(1.0, 0),
            Err(PartitionError::InvalidFraction(_))
        ));
        assert!(DataPartitioner::new(0.0, 0).is_err());
        assert!(DataPartitioner::new(f64::NAN, 0).is_err());

        let tiny = balanced(1);
        assert!(matches!(
            DataPartitioner::new(0.5, 0).unwrap().split(&tiny),
            Err(PartitionError::InsufficientSamples { count: 1, .. })
        ));
    }

    #[test]
    fn extreme_fractions_keep_both_sides_nonempty() {
        let ds = balanced(3);
        let split = DataPartitioner::new(0.01, 1).unwrap().split(&ds).unwrap();
        let (train, test) = split.apply(&ds).unwrap();
        assert_eq!(train.class_counts(), [1, 1]);
        assert_eq!(test.class_counts(), [2, 2]);
    }

    #[test]
    fn folds_partition_with_balanced_sizes() {
        let labels: Vec<Label> = (0..23)
            .map(|i| if i % 3 == 0 { Label::Positive } else { Label::Negative })
            .collect();
        let folds = FoldAssignment::stratified(&labels, 5, 7).unwrap();
        let sizes: Vec<usize> = (0..5).map(|f| folds.validation_indices(f).len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 23);
        assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);
        for f in 0..5 {
            assert_eq!(
                folds.train_indices(f).len() + folds.validation_indices(f).len(),
                23
            );
        }
        assert!(FoldAssignment::stratified(&labels, 1, 0).is_err());
        assert!(FoldAssignment::stratified(&labels, 24, 0).is_err());
    }

    #[test]
    fn derived_streams_differ() {
        assert_ne!(
            derive_seed(42, SeedStream::Split),
            derive_seed(42, SeedStream::GridFolds)
        );
        assert_eq!(
            derive_seed(42, SeedStream::Embedding),
            derive_seed(42, SeedStream::Embedding)
        );
    }
}
