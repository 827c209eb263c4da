//! Parameter updates: Adagrad, gradient clipping and the moving average of weights.

pub mod adagrad;
pub mod clip;
pub mod ema;

pub use adagrad::Adagrad;
pub use clip::{clip_by_global_norm, global_norm};
pub use ema::ExponentialMovingAverage;

use crate::error::Result;
use crate::params::{GradVar, ParameterStore};

/// Applies gradients to the parameters in a [`ParameterStore`].
pub trait Optimizer {
    /// Updates every parameter with a gradient and increments the store's global step in
    /// the same call. Returns the new global step.
    fn apply(&mut self, store: &mut ParameterStore, grads: &[GradVar]) -> Result<u64>;
}
