//! Output layer: full or sampled softmax over a sharded weight matrix.

use super::sampler::LogUniformSampler;
use super::sharded::ShardedParameter;
use crate::autograd::Variable;
use crate::error::{config_err, Result};
use crate::params::{Initializer, ParamId, ParamSpec, ParameterStore, Reuse, Role};
use crate::tensor::Tensor;
use rand::Rng;

/// Added to the logit of a sampled candidate that equals the row's true label.
pub const ACCIDENTAL_HIT_LOGIT: f32 = -1e30;

#[derive(Clone, Debug)]
pub struct SoftmaxHead {
    /// `softmax_w`: `[vocab, projected]`, sharded by rows.
    pub w: ShardedParameter,
    /// `softmax_b`: `[vocab, 1]`, so that its rows can be gathered like `w`'s.
    pub b: ParamId,
    pub vocab_size: usize,
    pub num_sampled: usize,
    sampler: LogUniformSampler,
}

impl SoftmaxHead {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng>(
        store: &mut ParameterStore,
        vocab_size: usize,
        input_size: usize,
        num_shards: usize,
        num_sampled: usize,
        device: &str,
        reuse: Reuse,
        rng: &mut R,
    ) -> Result<Self> {
        if num_sampled >= vocab_size && num_sampled > 0 {
            return config_err!(
                "num_sampled ({num_sampled}) must be smaller than vocab_size ({vocab_size})"
            );
        }
        let w = ShardedParameter::new(
            store,
            "softmax_w",
            [vocab_size, input_size],
            num_shards,
            Role::Softmax,
            device,
            reuse,
            rng,
        )?;
        let b = store.get_or_create(
            ParamSpec {
                name: "softmax_b",
                shape: [vocab_size, 1],
                role: Role::Softmax,
                init: Initializer::Zeros,
                device,
            },
            reuse,
            rng,
        )?;
        Ok(Self {
            w,
            b,
            vocab_size,
            num_sampled,
            sampler: LogUniformSampler::new(vocab_size),
        })
    }

    /// Per-row cross-entropy `[n, 1]` of `inputs` (`[n, input_size]`) against `targets`.
    ///
    /// Uses the exact softmax when `num_sampled == 0`, the sampled approximation otherwise.
    pub fn loss<R: Rng>(
        &self,
        leaves: &[Variable<f32>],
        inputs: &Variable<f32>,
        targets: &[usize],
        rng: &mut R,
    ) -> Result<Variable<f32>> {
        if self.num_sampled == 0 {
            self.full_loss(leaves, inputs, targets)
        } else {
            self.sampled_loss(leaves, inputs, targets, rng)
        }
    }

    /// Exact softmax over the whole vocabulary. The weight shards are concatenated and
    /// trimmed to `vocab_size` rows.
    pub fn full_loss(
        &self,
        leaves: &[Variable<f32>],
        inputs: &Variable<f32>,
        targets: &[usize],
    ) -> Result<Variable<f32>> {
        let w = self.w.concat_var(leaves)?;
        let b = leaves[self.b].transpose()?;
        let logits = inputs.matmul_nt(&w)?.add_row(&b)?;
        Ok(logits.softmax_cross_entropy(targets)?)
    }

    /// Sampled softmax: the true class plus `num_sampled` log-uniform negatives shared by
    /// the batch. Logits are corrected by `-ln Q` with `Q` the expected sample count, and
    /// negatives that coincide with the row's label are masked out.
    pub fn sampled_loss<R: Rng>(
        &self,
        leaves: &[Variable<f32>],
        inputs: &Variable<f32>,
        targets: &[usize],
        rng: &mut R,
    ) -> Result<Variable<f32>> {
        let rows = targets.len();
        let candidates = self.sampler.sample_unique(self.num_sampled, rng);
        let sampled = &candidates.ids;
        let log_q = |k: usize| self.sampler.expected_count(k, candidates.tries).ln() as f32;
        let bias = &leaves[self.b];

        // True logits: row-wise dot products, [n, 1].
        let true_w = self.w.lookup(leaves, targets)?;
        let true_b = Variable::gather(&[bias], self.vocab_size, targets)?;
        let true_correction = Tensor::from_fn([rows, 1], {
            let mut it = targets.iter();
            move || it.next().map_or(0.0, |&y| -log_q(y))
        });
        let true_logits = inputs
            .mul(&true_w)?
            .sum_cols()?
            .add(&true_b)?
            .add(&Variable::new(true_correction))?;

        // Sampled logits: [n, num_sampled].
        let sampled_w = self.w.lookup(leaves, sampled)?;
        let sampled_b = Variable::gather(&[bias], self.vocab_size, sampled)?.transpose()?;
        let sampled_correction =
            Tensor::new(sampled.iter().map(|&s| -log_q(s)).collect(), [1, sampled.len()])?;
        let mut hits = Tensor::zeros([rows, sampled.len()]);
        for (r, &y) in targets.iter().enumerate() {
            for (k, &s) in sampled.iter().enumerate() {
                if s == y {
                    hits.data_mut()[r * sampled.len() + k] = ACCIDENTAL_HIT_LOGIT;
                }
            }
        }
        let sampled_logits = inputs
            .matmul_nt(&sampled_w)?
            .add_row(&sampled_b)?
            .add_row(&Variable::new(sampled_correction))?
            .add(&Variable::new(hits))?;

        let logits = Variable::concat_cols(&[&true_logits, &sampled_logits])?;
        Ok(logits.softmax_cross_entropy(&vec![0; rows])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{Gradient, GradientEngine, TapeEngine};
    use rand::{rngs::StdRng, SeedableRng};

    fn head(num_sampled: usize) -> (ParameterStore, SoftmaxHead) {
        let mut rng = StdRng::seed_from_u64(5);
        let mut store = ParameterStore::new();
        let head =
            SoftmaxHead::new(&mut store, 10, 3, 3, num_sampled, "cpu:0", Reuse::Create, &mut rng)
                .unwrap();
        (store, head)
    }

    #[test]
    fn test_full_loss_uniform_logits() {
        let (mut store, head) = head(0);
        for &id in &head.w.shards {
            *store.value_mut(id) = Tensor::zeros([4, 3]);
        }
        let leaves = store.leaves();
        let inputs = Variable::new(Tensor::ones([2, 3]));
        let losses = head.full_loss(&leaves, &inputs, &[1, 9]).unwrap();
        let ln10 = 10.0f32.ln();
        assert!(losses.data.data().iter().all(|l| (l - ln10).abs() < 1e-5));
    }

    #[test]
    fn test_full_loss_dense_gradients_on_shards() {
        let (store, head) = head(0);
        let leaves = store.leaves();
        let inputs = Variable::new(Tensor::ones([2, 3]));
        let loss = head.full_loss(&leaves, &inputs, &[0, 5]).unwrap().mean().unwrap();
        let params: Vec<&Variable<f32>> = head.w.shards.iter().map(|&id| &leaves[id]).collect();
        let grads = TapeEngine.gradients(&loss, &params).unwrap();
        assert!(grads.iter().all(|g| matches!(g, Some(Gradient::Dense(_)))));
    }

    #[test]
    fn test_sampled_loss_is_finite_and_sparse() {
        let (store, head) = head(4);
        let leaves = store.leaves();
        let mut rng = StdRng::seed_from_u64(9);
        let inputs = Variable::new(Tensor::from_fn([3, 3], || 0.5));
        let losses = head.sampled_loss(&leaves, &inputs, &[0, 1, 7], &mut rng).unwrap();
        assert_eq!(losses.shape(), [3, 1]);
        assert!(losses.data.data().iter().all(|l| l.is_finite() && *l >= 0.0));

        let loss = losses.mean().unwrap();
        let params: Vec<&Variable<f32>> = head.w.shards.iter().map(|&id| &leaves[id]).collect();
        let grads = TapeEngine.gradients(&loss, &params).unwrap();
        assert!(grads.iter().all(|g| matches!(g, Some(Gradient::Sparse(_)))));
    }

    #[test]
    fn test_num_sampled_must_be_below_vocab() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut store = ParameterStore::new();
        assert!(SoftmaxHead::new(&mut store, 10, 3, 1, 10, "cpu:0", Reuse::Create, &mut rng).is_err());
    }
}
