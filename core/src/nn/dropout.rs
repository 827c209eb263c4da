use crate::autograd::Variable;
use crate::error::Result;
use crate::tensor::Tensor;
use rand::Rng;

/// Inverted dropout: keeps each element with probability `keep_prob` and scales kept
/// elements by `1 / keep_prob`. A `keep_prob` of 1 returns `x` untouched and draws
/// nothing from `rng`.
pub fn dropout<R: Rng>(x: &Variable<f32>, keep_prob: f32, rng: &mut R) -> Result<Variable<f32>> {
    if keep_prob >= 1.0 {
        return Ok(x.clone());
    }
    let scale = 1.0 / keep_prob;
    let mask = Tensor::from_fn(x.shape(), || {
        if rng.random::<f32>() < keep_prob {
            scale
        } else {
            0.0
        }
    });
    Ok(x.mul(&Variable::new(mask))?)
}
