use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{thread_rng, SeedableRng};

use crate::corpus::TranslationPair;

/// Disjoint training/evaluation partition of the corpus, derived from a
/// single shuffle of the full pair list.
#[derive(Debug)]
pub struct Dataset {
    pub training: Vec<TranslationPair>,
    pub evaluation: Vec<TranslationPair>,
}

impl Dataset {
    /// Shuffle once, take the first `eval_fraction * N` pairs (capped at
    /// `eval_cap`) as the evaluation set and the remainder (capped at
    /// `train_cap`) as the training set.
    pub fn split(
        mut pairs: Vec<TranslationPair>,
        eval_fraction: f32,
        train_cap: usize,
        eval_cap: usize,
        seed: Option<u64>,
    ) -> Self {
        match seed {
            Some(seed) => pairs.shuffle(&mut StdRng::seed_from_u64(seed)),
            None => pairs.shuffle(&mut thread_rng()),
        }

        let held_out = (pairs.len() as f32 * eval_fraction) as usize;
        let mut training = pairs.split_off(held_out);
        training.truncate(train_cap);
        let mut evaluation = pairs;
        evaluation.truncate(eval_cap);

        tracing::debug!(
            "dataset split: {} training, {} evaluation",
            training.len(),
            evaluation.len()
        );
        Dataset {
            training,
            evaluation,
        }
    }

    pub fn train_batcher(&self, batch_size: usize, shuffle: bool) -> PairBatcher {
        PairBatcher::new(&self.training, batch_size, shuffle)
    }

    pub fn eval_batcher(&self, batch_size: usize) -> PairBatcher {
        PairBatcher::new(&self.evaluation, batch_size, false)
    }
}

/// Finite batch iterator over one dataset partition. Built fresh each epoch;
/// re-shuffles when the flag is set. The last batch may be smaller than
/// `batch_size`.
pub struct PairBatcher<'a> {
    pairs: Vec<&'a TranslationPair>,
    batch_size: usize,
    current_idx: usize,
}

impl<'a> PairBatcher<'a> {
    pub fn new(pairs: &'a [TranslationPair], batch_size: usize, shuffle: bool) -> Self {
        let mut pairs = pairs.iter().collect::<Vec<_>>();
        if shuffle {
            pairs.shuffle(&mut thread_rng());
        }
        Self {
            pairs,
            batch_size,
            current_idx: 0,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.pairs.len().div_ceil(self.batch_size)
    }
}

impl<'a> Iterator for PairBatcher<'a> {
    type Item = Vec<&'a TranslationPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_idx >= self.pairs.len() {
            return None;
        }
        let end_idx = (self.current_idx + self.batch_size).min(self.pairs.len());
        let batch = self.pairs[self.current_idx..end_idx].to_vec();
        self.current_idx = end_idx;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(n: usize) -> Vec<TranslationPair> {
        (0..n)
            .map(|i| TranslationPair {
                source: format!(">>pt_br<< sentence {i}"),
                target: format!("frase {i}"),
            })
            .collect()
    }

    #[test]
    fn test_split_sizes_and_caps() {
        let dataset = Dataset::split(pairs(100), 0.2, 1000, 1000, Some(7));
        assert_eq!(dataset.evaluation.len(), 20);
        assert_eq!(dataset.training.len(), 80);

        let capped = Dataset::split(pairs(100), 0.2, 50, 5, Some(7));
        assert_eq!(capped.evaluation.len(), 5);
        assert_eq!(capped.training.len(), 50);
    }

    #[test]
    fn test_split_is_disjoint() {
        let dataset = Dataset::split(pairs(50), 0.3, 1000, 1000, Some(1));
        for pair in &dataset.evaluation {
            assert!(!dataset.training.contains(pair));
        }
    }

    #[test]
    fn test_split_is_deterministic_with_seed() {
        let a = Dataset::split(pairs(40), 0.25, 1000, 1000, Some(99));
        let b = Dataset::split(pairs(40), 0.25, 1000, 1000, Some(99));
        assert_eq!(a.training, b.training);
        assert_eq!(a.evaluation, b.evaluation);
    }

    #[test]
    fn test_batcher_sizes() {
        let set = pairs(10);
        let batcher = PairBatcher::new(&set, 4, false);
        assert_eq!(batcher.num_batches(), 3);
        let sizes = batcher.map(|b| b.len()).collect::<Vec<_>>();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_batcher_covers_every_pair_once() {
        let set = pairs(17);
        let seen = PairBatcher::new(&set, 5, true)
            .flatten()
            .collect::<Vec<_>>();
        assert_eq!(seen.len(), 17);
        for pair in &set {
            assert!(seen.contains(&pair));
        }
    }

    #[test]
    fn test_empty_partition() {
        let set = pairs(0);
        let mut batcher = PairBatcher::new(&set, 4, false);
        assert_eq!(batcher.num_batches(), 0);
        assert!(batcher.next().is_none());
    }
}
