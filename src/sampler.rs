//! Seeded selection of the active knowledge base for one trial
//!
//! Each trial owns its own [`KbSampler`]; two samplers built from the same
//! seed replay the same draws in the same order.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashSet;

use crate::EvalError;

/// Per-trial random source for KB selection
#[derive(Debug, Clone)]
pub struct KbSampler {
    rng: StdRng,
}

/// Question rows of a refusal trial: answerable rows first, outliers last
#[derive(Debug, Clone, Serialize)]
pub struct OutlierSplit {
    /// Active KB row indices (with replacement, size `kb_size`)
    pub kb_indices: Vec<usize>,
    /// Leading active KB rows that are asked about
    pub in_distribution: Vec<usize>,
    /// Rows outside the active KB
    pub outliers: Vec<usize>,
    /// Position of the first outlier in the question order
    pub change_point: usize,
}

impl OutlierSplit {
    /// Dataset indices of all questions, in label order
    pub fn question_indices(&self) -> Vec<usize> {
        self.in_distribution
            .iter()
            .chain(self.outliers.iter())
            .copied()
            .collect()
    }

    /// 0 for answerable questions, 1 for outliers
    pub fn labels(&self) -> Vec<u8> {
        std::iter::repeat(0)
            .take(self.in_distribution.len())
            .chain(std::iter::repeat(1).take(self.outliers.len()))
            .collect()
    }
}

impl KbSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw `kb_size` row indices with replacement from `[0, dataset_len)`
    pub fn sample(&mut self, dataset_len: usize, kb_size: usize) -> Result<Vec<usize>> {
        if dataset_len == 0 && kb_size > 0 {
            return Err(EvalError::KbSizeExceeded {
                kb_size,
                dataset_len,
            }
            .into());
        }
        Ok((0..kb_size)
            .map(|_| self.rng.gen_range(0..dataset_len))
            .collect())
    }

    /// Draw `kb_size` distinct row indices.
    ///
    /// A KB as large as the dataset is the whole dataset in order; a larger
    /// one is rejected before any generation work starts.
    pub fn sample_distinct(&mut self, dataset_len: usize, kb_size: usize) -> Result<Vec<usize>> {
        if kb_size > dataset_len {
            return Err(EvalError::KbSizeExceeded {
                kb_size,
                dataset_len,
            }
            .into());
        }
        if kb_size == dataset_len {
            return Ok((0..dataset_len).collect());
        }
        Ok(rand::seq::index::sample(&mut self.rng, dataset_len, kb_size).into_vec())
    }

    /// Build the mixed question set of a refusal trial.
    ///
    /// `question_size` is capped at `kb_size`. Outliers are drawn without
    /// replacement from rows absent from the active KB.
    pub fn sample_with_outliers(
        &mut self,
        dataset_len: usize,
        kb_size: usize,
        question_size: usize,
        outlier_ratio: f64,
    ) -> Result<OutlierSplit> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&outlier_ratio),
            "outlier ratio {outlier_ratio} outside [0, 1]"
        );
        let kb_indices = self.sample(dataset_len, kb_size)?;

        let active: HashSet<usize> = kb_indices.iter().copied().collect();
        let mut pool: Vec<usize> = (0..dataset_len).filter(|i| !active.contains(i)).collect();
        pool.shuffle(&mut self.rng);

        let question_size = question_size.min(kb_size);
        let n_outliers = (question_size as f64 * outlier_ratio) as usize;
        let change_point = (question_size as f64 * (1.0 - outlier_ratio)) as usize;

        pool.truncate(n_outliers);
        let in_distribution = kb_indices[..change_point.min(kb_indices.len())].to_vec();

        Ok(OutlierSplit {
            kb_indices,
            in_distribution,
            outliers: pool,
            change_point,
        })
    }

    /// `n` positions into a list of length `len`, with replacement
    pub fn pick(&mut self, len: usize, n: usize) -> Vec<usize> {
        if len == 0 {
            return Vec::new();
        }
        (0..n).map(|_| self.rng.gen_range(0..len)).collect()
    }

    /// Index of a question template out of `n_templates`
    pub fn choose_template(&mut self, n_templates: usize) -> usize {
        self.rng.gen_range(0..n_templates.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_deterministic() {
        for seed in [0, 1, 42, 1234] {
            let a = KbSampler::new(seed).sample(500, 50).unwrap();
            let b = KbSampler::new(seed).sample(500, 50).unwrap();
            assert_eq!(a, b);
            assert!(a.iter().all(|&i| i < 500));
        }
    }

    #[test]
    fn test_sample_full_size_does_not_fail() {
        let idx = KbSampler::new(3).sample(20, 20).unwrap();
        assert_eq!(idx.len(), 20);
    }

    #[test]
    fn test_sample_distinct_full_range() {
        let idx = KbSampler::new(3).sample_distinct(20, 20).unwrap();
        assert_eq!(idx, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_sample_distinct_exceeds() {
        let err = KbSampler::new(3).sample_distinct(20, 21).unwrap_err();
        assert_eq!(
            err.downcast_ref::<EvalError>(),
            Some(&EvalError::KbSizeExceeded {
                kb_size: 21,
                dataset_len: 20
            })
        );
    }

    #[test]
    fn test_sample_distinct_unique() {
        let idx = KbSampler::new(9).sample_distinct(100, 40).unwrap();
        let unique: HashSet<usize> = idx.iter().copied().collect();
        assert_eq!(unique.len(), 40);
    }

    #[test]
    fn test_outliers_disjoint_from_kb() {
        for seed in 0..10 {
            let split = KbSampler::new(seed)
                .sample_with_outliers(1000, 250, 100, 0.2)
                .unwrap();
            let active: HashSet<usize> = split.kb_indices.iter().copied().collect();
            assert!(split.outliers.iter().all(|o| !active.contains(o)));
        }
    }

    #[test]
    fn test_refusal_labels_change_point() {
        let split = KbSampler::new(1)
            .sample_with_outliers(1000, 250, 100, 0.2)
            .unwrap();
        assert_eq!(split.change_point, 80);
        let mut expected = vec![0u8; 80];
        expected.extend(vec![1u8; 20]);
        assert_eq!(split.labels(), expected);
        assert_eq!(split.question_indices()[..80], split.kb_indices[..80]);
    }

    #[test]
    fn test_question_size_capped_by_kb_size() {
        let split = KbSampler::new(1)
            .sample_with_outliers(1000, 50, 100, 0.2)
            .unwrap();
        assert_eq!(split.in_distribution.len(), 40);
        assert_eq!(split.outliers.len(), 10);
    }
}
