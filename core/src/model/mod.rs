//! The multi-device language model.
//!
//! [`LanguageModel`] owns the parameters, one [`Tower`] per device, the optimizer and the
//! moving average. A step splits the global batch by rows, runs every tower in parallel
//! against the same parameters, averages losses and gradients, and applies one update.

pub mod batch;
pub mod hparams;
pub mod tower;

pub use batch::Batch;
pub use hparams::HParams;
pub use tower::{ClipDiagnostics, Tower, TowerOutput};

use crate::autograd::{GradientEngine, TapeEngine};
use crate::checkpoint::SafetensorsCheckpoint;
use crate::distributed::{average_grads, Placement, Topology};
use crate::error::{config_err, Result};
use crate::optim::{Adagrad, ExponentialMovingAverage, Optimizer};
use crate::params::{GradVar, ParamId, ParameterStore, Reuse, Role};
use crate::summary::SummarySink;
use rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Decay of the moving average over recurrent weights.
pub const EMA_DECAY: f32 = 0.999;

/// Starting value of every Adagrad accumulator.
pub const INITIAL_ACCUMULATOR: f32 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Forward, backward and update.
    Train,
    /// Forward only, dropout disabled.
    Eval,
}

/// Result of one [`LanguageModel::step`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepOutput {
    /// Mean of the per-tower losses.
    pub loss: f32,
    /// Global step after the step; unchanged in evaluation mode.
    pub global_step: u64,
    /// Recurrent-gradient statistics of the last tower, training mode only.
    pub diagnostics: Option<ClipDiagnostics>,
}

#[derive(Debug)]
pub struct LanguageModel<E = TapeEngine> {
    hps: HParams,
    mode: Mode,
    store: ParameterStore,
    towers: Vec<Tower>,
    optimizer: Adagrad,
    ema: Option<ExponentialMovingAverage>,
    engine: E,
}

impl LanguageModel<TapeEngine> {
    pub fn new(hps: HParams, mode: Mode, placement: &Placement, topology: &Topology) -> Result<Self> {
        Self::with_engine(hps, mode, placement, topology, TapeEngine)
    }
}

impl<E: GradientEngine<f32> + Sync> LanguageModel<E> {
    /// Builds `num_gpus` towers over one parameter store.
    ///
    /// Tower 0 creates every parameter; the others bind to the same parameters by name.
    pub fn with_engine(
        hps: HParams,
        mode: Mode,
        placement: &Placement,
        topology: &Topology,
        engine: E,
    ) -> Result<Self> {
        hps.validate()?;
        topology.check(hps.num_gpus)?;

        let mut rng = StdRng::seed_from_u64(hps.seed);
        let mut store = ParameterStore::new();
        let towers = (0..hps.num_gpus)
            .map(|index| {
                let reuse = if index == 0 { Reuse::Create } else { Reuse::Share };
                Tower::new(&mut store, &hps, index, placement, reuse, &mut rng)
            })
            .collect::<Result<Vec<_>>>()?;

        let ema = hps.average_params.then(|| {
            ExponentialMovingAverage::new(EMA_DECAY, &store, &store.ids_by_role(Role::Recurrent))
        });

        tracing::info!(
            ?mode,
            num_gpus = hps.num_gpus,
            param_device = %placement.param_device,
            params = store.len(),
            averaged = ema.is_some(),
            "built language model"
        );
        for (id, param) in store.iter() {
            tracing::debug!(id, name = %param.name, device = %param.device, shape = ?param.value.shape(), "parameter");
        }

        Ok(Self {
            optimizer: Adagrad::new(hps.learning_rate, INITIAL_ACCUMULATOR),
            hps,
            mode,
            store,
            towers,
            ema,
            engine,
        })
    }

    /// Runs one step on a `[batch_size * num_gpus, num_steps]` batch.
    ///
    /// Tower `i` gets rows `i * batch_size .. (i + 1) * batch_size`. In training mode the
    /// averaged gradients are applied, the global step advances by one and the moving
    /// average is updated afterwards. Recurrent states advance only when the whole step
    /// succeeds.
    pub fn step(&mut self, batch: &Batch, sink: &mut dyn SummarySink) -> Result<StepOutput> {
        let hps = &self.hps;
        let expected = [hps.batch_size * hps.num_gpus, hps.num_steps];
        let shape = batch.checked_shape()?;
        if shape != expected {
            return config_err!("expected a {expected:?} batch, got {shape:?}");
        }
        batch.check_ids(hps.vocab_size)?;
        let parts = batch.split(hps.num_gpus)?;

        let started = Instant::now();
        let last = self.towers.len() - 1;
        let (store, engine, mode) = (&self.store, &self.engine, self.mode);
        let mut outputs = self
            .towers
            .par_iter_mut()
            .zip(parts.par_iter())
            .map(|(tower, part)| {
                let report = tower.index == last;
                tower.run(store, part, mode, engine, report)
            })
            .collect::<Result<Vec<_>>>()?;
        let towers_done = started.elapsed();

        let loss = outputs.iter().map(|o| o.loss).sum::<f32>() / outputs.len() as f32;
        let diagnostics = outputs.last().and_then(|o| o.diagnostics);

        let global_step = match self.mode {
            Mode::Eval => self.store.global_step(),
            Mode::Train => {
                let tower_grads: Vec<Vec<GradVar>> = outputs
                    .iter_mut()
                    .map(|o| std::mem::take(&mut o.grads))
                    .collect();
                let grads = average_grads(&tower_grads)?;
                let step = self.optimizer.apply(&mut self.store, &grads)?;
                if let Some(ema) = &mut self.ema {
                    ema.apply(&self.store)?;
                }
                step
            }
        };

        for (tower, output) in self.towers.iter_mut().zip(&mut outputs) {
            tower.set_states(std::mem::take(&mut output.states))?;
        }

        if self.hps.run_profiler {
            tracing::info!(
                global_step,
                towers_ms = towers_done.as_secs_f64() * 1e3,
                total_ms = started.elapsed().as_secs_f64() * 1e3,
                "step timing"
            );
        }

        sink.scalar("model/loss", loss, global_step);
        if let Some(d) = diagnostics {
            sink.scalar("model/lstm_grad_norm", d.grad_norm, global_step);
            sink.scalar("model/lstm_grad_scale", d.grad_scale, global_step);
            sink.scalar("model/lstm_weight_norm", d.weight_norm, global_step);
        }

        Ok(StepOutput {
            loss,
            global_step,
            diagnostics,
        })
    }
}

impl<E> LanguageModel<E> {
    pub fn hparams(&self) -> &HParams {
        &self.hps
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.store
    }

    pub fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.store
    }

    pub fn towers(&self) -> &[Tower] {
        &self.towers
    }

    pub fn optimizer(&self) -> &Adagrad {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut Adagrad {
        &mut self.optimizer
    }

    pub fn moving_average(&self) -> Option<&ExponentialMovingAverage> {
        self.ema.as_ref()
    }

    pub fn moving_average_mut(&mut self) -> Option<&mut ExponentialMovingAverage> {
        self.ema.as_mut()
    }

    pub fn global_step(&self) -> u64 {
        self.store.global_step()
    }

    /// Zeroes the recurrent state of every tower.
    pub fn reset_states(&mut self) {
        self.towers.iter_mut().for_each(Tower::reset_states);
    }

    /// A copy of the parameters with moving averages in place of the tracked values.
    ///
    /// Returns a plain copy when no average is kept.
    pub fn averaged_parameters(&self) -> ParameterStore {
        match &self.ema {
            Some(ema) => ema.averaged_store(&self.store),
            None => self.store.clone(),
        }
    }

    /// `(restore name, parameter)` pairs under which the averages are saved.
    pub fn moving_average_names(&self) -> Vec<(String, ParamId)> {
        self.ema
            .as_ref()
            .map(|ema| ema.names(&self.store))
            .unwrap_or_default()
    }

    /// Saves parameters, moving averages and optimizer state at the current global step.
    pub fn save(&self, checkpoints: &SafetensorsCheckpoint) -> Result<PathBuf> {
        checkpoints.save(&self.store, self.ema.as_ref(), Some(&self.optimizer))
    }

    /// Resumes training from the checkpoint at `path`.
    pub fn restore(&mut self, checkpoints: &SafetensorsCheckpoint, path: &Path) -> Result<u64> {
        checkpoints.restore_training(path, &mut self.store, self.ema.as_mut(), &mut self.optimizer)
    }

    /// Copies every parameter value and the global step from `source`, matching by name.
    pub fn load_parameters(&mut self, source: &ParameterStore) -> Result<()> {
        let ids: Vec<ParamId> = self.store.iter().map(|(id, _)| id).collect();
        for id in ids {
            let name = &self.store.get(id).name;
            let Some(src) = source.id(name) else {
                return config_err!("parameter `{name}` missing from source");
            };
            let value = source.value(src);
            if value.shape() != self.store.value(id).shape() {
                return config_err!(
                    "parameter `{name}` has shape {:?}, source has {:?}",
                    self.store.value(id).shape(),
                    value.shape()
                );
            }
            *self.store.value_mut(id) = value.clone();
        }
        self.store.set_global_step(source.global_step());
        Ok(())
    }
}
