//! Projected LSTM cell.
//!
//! One step maps `(x, [c_prev, m_prev])` to `(m, [c, m])`:
//!
//! ```text
//! z       = [x, m_prev] · W + B          split into i, j, f, o
//! c       = σ(f + 1) ⊙ c_prev + σ(i) ⊙ tanh(j)
//! m       = (σ(o) ⊙ tanh(c)) · W_P
//! ```
//!
//! The projection `W_P` keeps the recurrent width (and the softmax input) at
//! `projected_size` while the cell state stays `state_size` wide. Every operation acts on
//! batch rows independently.

use crate::autograd::Variable;
use crate::error::Result;
use crate::params::{Initializer, ParamId, ParamSpec, ParameterStore, Reuse, Role};
use crate::tensor::Tensor;
use rand::Rng;

/// Added to the forget-gate pre-activation so new cells start out remembering.
pub const FORGET_BIAS: f32 = 1.0;

#[derive(Clone, Debug, PartialEq)]
pub struct LstmCell {
    pub w: ParamId,
    pub b: ParamId,
    pub w_p: ParamId,
    pub input_size: usize,
    pub state_size: usize,
    pub projected_size: usize,
}

impl LstmCell {
    /// Creates or binds the parameters of layer `layer`: `lstm_<layer>/{W, B, W_P}`.
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng>(
        store: &mut ParameterStore,
        layer: usize,
        input_size: usize,
        state_size: usize,
        projected_size: usize,
        device: &str,
        reuse: Reuse,
        rng: &mut R,
    ) -> Result<Self> {
        let mut param = |suffix: &str, shape: [usize; 2], init: Initializer| {
            store.get_or_create(
                ParamSpec {
                    name: &format!("lstm_{layer}/{suffix}"),
                    shape,
                    role: Role::Recurrent,
                    init,
                    device,
                },
                reuse,
                rng,
            )
        };
        let w = param(
            "W",
            [input_size + projected_size, 4 * state_size],
            Initializer::UniformUnitScaling,
        )?;
        let b = param("B", [1, 4 * state_size], Initializer::Zeros)?;
        let w_p = param(
            "W_P",
            [state_size, projected_size],
            Initializer::UniformUnitScaling,
        )?;

        Ok(Self {
            w,
            b,
            w_p,
            input_size,
            state_size,
            projected_size,
        })
    }

    /// Width of the combined `[c, m]` state.
    pub fn state_width(&self) -> usize {
        self.state_size + self.projected_size
    }

    pub fn zero_state(&self, batch_size: usize) -> Tensor<f32, 2> {
        Tensor::zeros([batch_size, self.state_width()])
    }

    /// Runs one timestep. Returns the projected output and the new combined state.
    pub fn step(
        &self,
        leaves: &[Variable<f32>],
        x: &Variable<f32>,
        state: &Variable<f32>,
    ) -> Result<(Variable<f32>, Variable<f32>)> {
        let s = self.state_size;
        let c_prev = state.slice_cols(0, s)?;
        let m_prev = state.slice_cols(s, s + self.projected_size)?;

        let z = Variable::concat_cols(&[x, &m_prev])?
            .matmul(&leaves[self.w])?
            .add_row(&leaves[self.b])?;
        let i = z.slice_cols(0, s)?;
        let j = z.slice_cols(s, 2 * s)?;
        let f = z.slice_cols(2 * s, 3 * s)?;
        let o = z.slice_cols(3 * s, 4 * s)?;

        let c = f
            .add_scalar(FORGET_BIAS)
            .sigmoid()
            .mul(&c_prev)?
            .add(&i.sigmoid().mul(&j.tanh())?)?;
        let m = o.sigmoid().mul(&c.tanh())?.matmul(&leaves[self.w_p])?;

        let new_state = Variable::concat_cols(&[&c, &m])?;
        Ok((m, new_state))
    }
}
