//! One device's copy of the model.
//!
//! A [`Tower`] owns the recurrent state of its device and the handles of the parameters it
//! reads. Every call to [`Tower::run`] builds a fresh tape from the shared
//! [`ParameterStore`], unrolls the network, and, when training, turns the loss into an
//! ordered list of gradients. The state reached by the unroll is handed back in the
//! output and only becomes the tower's state once the caller commits it.

use super::{Batch, HParams, Mode};
use crate::autograd::{Gradient, GradientEngine, Variable};
use crate::distributed::Placement;
use crate::error::{config_err, Error, Result};
use crate::nn::{dropout, LstmCell, ShardedParameter, SoftmaxHead};
use crate::optim::clip::{clip_by_global_norm, clip_scale};
use crate::params::{GradVar, ParamId, ParameterStore, Reuse, Role};
use crate::tensor::{Tensor, TensorOps};
use rand::{rngs::StdRng, SeedableRng};

/// Recurrent-layer gradient statistics of one step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipDiagnostics {
    /// Global norm of the recurrent gradients before clipping.
    pub grad_norm: f32,
    /// `min(max_grad_norm / grad_norm, 1)`.
    pub grad_scale: f32,
    /// Global norm of the recurrent weights.
    pub weight_norm: f32,
}

/// What one tower hands back to the coordinator.
#[derive(Clone, Debug)]
pub struct TowerOutput {
    pub loss: f32,
    /// Empty in evaluation mode.
    pub grads: Vec<GradVar>,
    /// Reported by the last tower only.
    pub diagnostics: Option<ClipDiagnostics>,
    /// Recurrent state after this batch, not yet committed to the tower.
    pub states: Vec<Tensor<f32, 2>>,
}

#[derive(Debug)]
pub struct Tower {
    pub index: usize,
    pub device: String,
    hps: HParams,
    emb: ShardedParameter,
    cells: Vec<LstmCell>,
    softmax: SoftmaxHead,
    /// `[batch_size, state_size + projected_size]` per layer.
    states: Vec<Tensor<f32, 2>>,
    rng: StdRng,
}

impl Tower {
    /// Creates or binds the model parameters in `store` and allocates zero state.
    pub fn new(
        store: &mut ParameterStore,
        hps: &HParams,
        index: usize,
        placement: &Placement,
        reuse: Reuse,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let param_device = placement.param_device.as_str();
        let emb = ShardedParameter::new(
            store,
            "emb",
            [hps.vocab_size, hps.emb_size],
            hps.num_shards,
            Role::Embedding,
            param_device,
            reuse,
            rng,
        )?;
        let cells = (0..hps.num_layers)
            .map(|layer| {
                let input_size = if layer == 0 {
                    hps.emb_size
                } else {
                    hps.projected_size
                };
                LstmCell::new(
                    store,
                    layer,
                    input_size,
                    hps.state_size,
                    hps.projected_size,
                    param_device,
                    reuse,
                    rng,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let softmax = SoftmaxHead::new(
            store,
            hps.vocab_size,
            hps.projected_size,
            hps.num_shards,
            hps.num_sampled,
            param_device,
            reuse,
            rng,
        )?;
        let states = cells.iter().map(|c| c.zero_state(hps.batch_size)).collect();
        let device = placement.compute_device(index);

        tracing::debug!(index, %device, ?reuse, params = store.len(), "built tower");
        Ok(Self {
            index,
            device,
            hps: hps.clone(),
            emb,
            cells,
            softmax,
            states,
            rng: StdRng::seed_from_u64(hps.seed.wrapping_add(1 + index as u64)),
        })
    }

    /// Current recurrent state of every layer.
    pub fn states(&self) -> &[Tensor<f32, 2>] {
        &self.states
    }

    /// Replaces the recurrent state of every layer.
    pub fn set_states(&mut self, states: Vec<Tensor<f32, 2>>) -> Result<()> {
        if states.len() != self.states.len()
            || states.iter().zip(&self.states).any(|(new, old)| new.shape() != old.shape())
        {
            return config_err!("state layout does not match tower {}", self.index);
        }
        self.states = states;
        Ok(())
    }

    /// Zeroes the recurrent state of every layer.
    pub fn reset_states(&mut self) {
        for state in &mut self.states {
            state.data_mut().fill(0.0);
        }
    }

    /// Runs the forward pass and, in training mode, the backward pass.
    ///
    /// The tower's own state is left untouched; pass `output.states` to
    /// [`Tower::set_states`] once the step has gone through.
    pub fn run<E: GradientEngine<f32>>(
        &mut self,
        store: &ParameterStore,
        batch: &Batch,
        mode: Mode,
        engine: &E,
        report_diagnostics: bool,
    ) -> Result<TowerOutput> {
        let leaves = store.leaves();
        let (loss, states) = self.unroll(&leaves, batch, mode)?;
        let value = loss.data.data()[0];
        if mode == Mode::Eval {
            return Ok(TowerOutput {
                loss: value,
                grads: Vec::new(),
                diagnostics: None,
                states,
            });
        }
        let (grads, diagnostics) = self.backward(store, &leaves, &loss, engine)?;
        Ok(TowerOutput {
            loss: value,
            grads,
            diagnostics: report_diagnostics.then_some(diagnostics),
            states,
        })
    }

    /// Mean weighted cross-entropy of `batch` (`[batch_size, num_steps]` each).
    ///
    /// Every layer unrolls from its stored state. On success the final states are stored,
    /// so the following call on this tower continues where this one stopped; on error the
    /// state is unchanged. Stored state enters the graph as a constant.
    pub fn forward(
        &mut self,
        leaves: &[Variable<f32>],
        batch: &Batch,
        mode: Mode,
    ) -> Result<Variable<f32>> {
        let (loss, states) = self.unroll(leaves, batch, mode)?;
        self.states = states;
        Ok(loss)
    }

    /// The loss of `batch` and the per-layer state the unroll ends in.
    fn unroll(
        &mut self,
        leaves: &[Variable<f32>],
        batch: &Batch,
        mode: Mode,
    ) -> Result<(Variable<f32>, Vec<Tensor<f32, 2>>)> {
        let (bs, steps) = (self.hps.batch_size, self.hps.num_steps);
        let shape = batch.checked_shape()?;
        if shape != [bs, steps] {
            return config_err!(
                "tower {} expects [{bs}, {steps}] inputs, got {shape:?}",
                self.index
            );
        }
        let keep_prob = match mode {
            Mode::Train => self.hps.keep_prob,
            Mode::Eval => 1.0,
        };

        // Time-major: row t * bs + b holds (batch row b, timestep t).
        let x = batch.x.transpose()?.into_data();
        let y = batch.y.transpose()?.into_data();
        let w = batch.w.transpose()?.reshape([bs * steps, 1])?;

        let emb = self.emb.lookup(leaves, &x)?;
        let emb = dropout(&emb, keep_prob, &mut self.rng)?;
        let mut inputs = (0..steps)
            .map(|t| emb.slice_rows(t * bs, (t + 1) * bs))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut final_states = Vec::with_capacity(self.cells.len());
        for (cell, start) in self.cells.iter().zip(&self.states) {
            let mut state = Variable::new(start.clone());
            let mut outputs = Vec::with_capacity(steps);
            for input in &inputs {
                let (out, next) = cell.step(leaves, input, &state)?;
                outputs.push(dropout(&out, keep_prob, &mut self.rng)?);
                state = next;
            }
            final_states.push(state.data.clone());
            inputs = outputs;
        }

        let stacked = Variable::concat_rows(&inputs.iter().collect::<Vec<_>>())?;
        let per_token = self.softmax.loss(leaves, &stacked, &y, &mut self.rng)?;
        let loss = per_token.mul(&Variable::new(w))?.mean()?;
        Ok((loss, final_states))
    }

    /// Gradients of `loss * num_steps` in (embedding, recurrent, softmax) order.
    ///
    /// Embedding gradients must be indexed slices; their values are multiplied by
    /// `batch_size`. Recurrent gradients are clipped to `max_grad_norm` by global norm.
    fn backward<E: GradientEngine<f32>>(
        &self,
        store: &ParameterStore,
        leaves: &[Variable<f32>],
        loss: &Variable<f32>,
        engine: &E,
    ) -> Result<(Vec<GradVar>, ClipDiagnostics)> {
        let scaled = loss.scale(self.hps.num_steps as f32);

        let emb_ids = store.ids_by_role(Role::Embedding);
        let lstm_ids = store.ids_by_role(Role::Recurrent);
        let softmax_ids = store.ids_by_role(Role::Softmax);
        let all_ids: Vec<ParamId> = emb_ids
            .iter()
            .chain(&lstm_ids)
            .chain(&softmax_ids)
            .copied()
            .collect();
        let params: Vec<&Variable<f32>> = all_ids.iter().map(|&id| &leaves[id]).collect();

        let mut grads = engine.gradients(&scaled, &params)?;
        if grads.len() != params.len() {
            return config_err!(
                "expected {} gradients, got {}",
                params.len(),
                grads.len()
            );
        }
        let softmax_grads = grads.split_off(emb_ids.len() + lstm_ids.len());
        let lstm_grads = grads.split_off(emb_ids.len());
        let emb_grads = grads;

        let batch_size = self.hps.batch_size as f32;
        let emb_grads = emb_ids
            .iter()
            .zip(emb_grads)
            .map(|(&id, grad)| match grad {
                Some(g @ Gradient::Sparse(_)) => Ok(Some(g.scale(batch_size))),
                _ => Err(Error::DenseEmbeddingGradient {
                    param: store.get(id).name.clone(),
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        let max_norm = self.hps.max_grad_norm;
        let (lstm_grads, grad_norm) = clip_by_global_norm(&lstm_grads, max_norm);
        let diagnostics = ClipDiagnostics {
            grad_norm,
            grad_scale: clip_scale(grad_norm, max_norm),
            weight_norm: store.global_norm(&lstm_ids),
        };

        let combined = all_ids
            .into_iter()
            .zip(emb_grads.into_iter().chain(lstm_grads).chain(softmax_grads))
            .map(|(param, grad)| GradVar { param, grad })
            .collect();
        Ok((combined, diagnostics))
    }
}
