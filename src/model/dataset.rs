use anyhow::{Result, bail};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Feature matrix and regression targets, one row per sample.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub features: Vec<Vec<f64>>,
    pub labels: Vec<f64>,
    pub feature_names: Vec<String>,
}

pub struct Split {
    pub train: Dataset,
    pub test: Dataset,
}

impl Dataset {
    pub fn new(feature_names: Vec<String>) -> Self {
        Self {
            features: Vec::new(),
            labels: Vec::new(),
            feature_names,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn push(&mut self, features: Vec<f64>, label: f64) -> Result<()> {
        if features.len() != self.n_features() {
            bail!(
                "sample has {} features, dataset expects {}",
                features.len(),
                self.n_features()
            );
        }
        self.features.push(features);
        self.labels.push(label);
        Ok(())
    }

    /// Appends every sample of `other`; both must share feature names.
    pub fn extend(&mut self, other: Dataset) -> Result<()> {
        if other.feature_names != self.feature_names {
            bail!("cannot concatenate datasets with different features");
        }
        self.features.extend(other.features);
        self.labels.extend(other.labels);
        Ok(())
    }

    pub fn subset(&self, indices: &[usize]) -> Dataset {
        Dataset {
            features: indices.iter().map(|&i| self.features[i].clone()).collect(),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
            feature_names: self.feature_names.clone(),
        }
    }

    /// Shuffled split. The test side gets `ceil(test_size * n)` samples and
    /// both sides must end up non-empty.
    pub fn train_test_split(&self, test_size: f64, seed: u64) -> Result<Split> {
        if !(0.0..1.0).contains(&test_size) || test_size == 0.0 {
            bail!("test_size must be in (0, 1), got {}", test_size);
        }
        let n = self.len();
        let n_test = (test_size * n as f64).ceil() as usize;
        if n_test == 0 || n_test >= n {
            bail!("{} samples are too few for a {} test split", n, test_size);
        }

        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
        let (test, train) = indices.split_at(n_test);

        Ok(Split {
            train: self.subset(train),
            test: self.subset(test),
        })
    }

    /// Contiguous, unshuffled folds as `(train, validation)` index pairs.
    /// The first `n % k` folds hold one extra sample.
    pub fn k_fold(&self, k: usize) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
        let n = self.len();
        if k < 2 || k > n {
            bail!("cannot make {} folds from {} samples", k, n);
        }
        let mut folds = Vec::with_capacity(k);
        let mut start = 0;
        for fold in 0..k {
            let size = n / k + usize::from(fold < n % k);
            let validation: Vec<usize> = (start..start + size).collect();
            let train: Vec<usize> = (0..start).chain(start + size..n).collect();
            folds.push((train, validation));
            start += size;
        }
        Ok(folds)
    }

    /// `len()` draws with replacement.
    pub fn bootstrap_indices(&self, seed: u64) -> Vec<usize> {
        let n = self.len();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen_range(0..n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize) -> Dataset {
        let mut data = Dataset::new(vec!["x".to_string()]);
        for i in 0..n {
            data.push(vec![i as f64], 2.0 * i as f64).unwrap();
        }
        data
    }

    #[test]
    fn split_is_seeded_and_disjoint() {
        let data = line(10);
        let a = data.train_test_split(0.2, 42).unwrap();
        let b = data.train_test_split(0.2, 42).unwrap();

        assert_eq!(a.train.len(), 8);
        assert_eq!(a.test.len(), 2);
        assert_eq!(a.test.labels, b.test.labels);

        let mut all: Vec<f64> = a.train.labels.iter().chain(&a.test.labels).copied().collect();
        all.sort_by(f64::total_cmp);
        assert_eq!(all, data.labels);
    }

    #[test]
    fn split_rejects_tiny_datasets() {
        assert!(line(1).train_test_split(0.2, 42).is_err());
        assert!(line(10).train_test_split(1.5, 42).is_err());
    }

    #[test]
    fn folds_cover_every_sample_once() {
        let folds = line(10).k_fold(3).unwrap();
        let sizes: Vec<usize> = folds.iter().map(|(_, v)| v.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(folds[1].1, vec![4, 5, 6]);
        assert_eq!(folds[1].0.len(), 7);
        assert!(line(2).k_fold(3).is_err());
    }

    #[test]
    fn push_checks_width() {
        let mut data = Dataset::new(vec!["a".to_string(), "b".to_string()]);
        assert!(data.push(vec![1.0], 0.0).is_err());
        assert!(data.extend(line(3)).is_err());
    }

    #[test]
    fn bootstrap_is_reproducible() {
        let data = line(50);
        assert_eq!(data.bootstrap_indices(7), data.bootstrap_indices(7));
        assert!(data.bootstrap_indices(7).iter().all(|&i| i < 50));
    }
}
