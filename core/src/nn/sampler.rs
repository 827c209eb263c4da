//! Log-uniform (Zipfian) candidate sampler for the sampled softmax.
//!
//! Word ids are assumed to be sorted by decreasing frequency, so the probability of id `k`
//! in a vocabulary of `V` words is taken to be
//! `P(k) = (ln(k + 2) - ln(k + 1)) / ln(V + 1)`.

use rand::Rng;
use std::collections::HashSet;

/// A set of distinct candidate ids and the number of draws it took to collect them.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidates {
    pub ids: Vec<usize>,
    pub tries: usize,
}

#[derive(Clone, Debug)]
pub struct LogUniformSampler {
    range: usize,
    log_range: f64,
}

impl LogUniformSampler {
    pub fn new(range: usize) -> Self {
        Self {
            range,
            log_range: (range as f64).ln_1p(),
        }
    }

    pub fn range(&self) -> usize {
        self.range
    }

    pub fn probability(&self, k: usize) -> f64 {
        ((k as f64 + 2.0) / (k as f64 + 1.0)).ln() / self.log_range
    }

    /// Draws one id by inverting the CDF.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> usize {
        let u: f64 = rng.random();
        let k = ((u * self.log_range).exp() as usize).saturating_sub(1);
        k.min(self.range.saturating_sub(1))
    }

    /// Draws until `num` distinct ids are collected. `num` must not exceed the range.
    pub fn sample_unique<R: Rng>(&self, num: usize, rng: &mut R) -> Candidates {
        let num = num.min(self.range);
        let mut seen = HashSet::with_capacity(num);
        let mut ids = Vec::with_capacity(num);
        let mut tries = 0;
        while ids.len() < num {
            tries += 1;
            let id = self.sample(rng);
            if seen.insert(id) {
                ids.push(id);
            }
        }
        Candidates { ids, tries }
    }

    /// Expected number of times `k` shows up in `tries` draws when sampling without
    /// replacement: `1 - (1 - P(k))^tries`.
    pub fn expected_count(&self, k: usize, tries: usize) -> f64 {
        -((tries as f64) * (-self.probability(k)).ln_1p()).exp_m1()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_probabilities_sum_to_one() {
        let sampler = LogUniformSampler::new(50);
        let total: f64 = (0..50).map(|k| sampler.probability(k)).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(sampler.probability(0) > sampler.probability(49));
    }

    #[test]
    fn test_unique_candidates_in_range() {
        let sampler = LogUniformSampler::new(20);
        let mut rng = StdRng::seed_from_u64(11);
        let c = sampler.sample_unique(8, &mut rng);
        assert_eq!(c.ids.len(), 8);
        assert!(c.tries >= 8);
        assert!(c.ids.iter().all(|&id| id < 20));
        let distinct: HashSet<_> = c.ids.iter().collect();
        assert_eq!(distinct.len(), 8);
    }

    #[test]
    fn test_expected_count_bounds() {
        let sampler = LogUniformSampler::new(20);
        for k in [0, 5, 19] {
            let q = sampler.expected_count(k, 12);
            assert!(q > 0.0 && q <= 1.0, "{k}: {q}");
        }
        // A single draw: expected count equals the probability.
        assert!((sampler.expected_count(3, 1) - sampler.probability(3)).abs() < 1e-12);
    }
}
