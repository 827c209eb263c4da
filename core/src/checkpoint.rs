//! Checkpoints in the `safetensors` format.
//!
//! A checkpoint directory holds one `model.ckpt-<global_step>.safetensors` file per save.
//! Each file stores every parameter under its name, the moving averages under
//! `<name>/ExponentialMovingAverage`, the Adagrad accumulators under `<name>/Adagrad`,
//! and the global step as a one-element `I64` tensor named `global_step`.
//!
//! Evaluation jobs follow a training job through [`CheckpointLoader`], which blocks until
//! a checkpoint newer than the last one it returned shows up.

use crate::error::{Error, Result};
use crate::optim::{Adagrad, ExponentialMovingAverage};
use crate::params::{ParamId, ParameterStore};
use crate::tensor::Tensor;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CHECKPOINT_PREFIX: &str = "model.ckpt-";
pub const CHECKPOINT_EXTENSION: &str = "safetensors";
pub const GLOBAL_STEP_KEY: &str = "global_step";
pub const ADAGRAD_SUFFIX: &str = "Adagrad";

/// Default interval between two looks at the checkpoint directory.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Source of checkpoints for [`CheckpointLoader`].
pub trait CheckpointStore {
    /// Loads the most recent checkpoint. Returns `false` when there is none.
    fn load_latest(&mut self) -> Result<bool>;

    /// Global step of the last loaded checkpoint.
    fn global_step(&self) -> u64;
}

fn checkpoint_err<T>(msg: impl Into<String>) -> Result<T> {
    Err(Error::Checkpoint(msg.into()))
}

fn f32_bytes(t: &Tensor<f32, 2>) -> Vec<u8> {
    t.data().iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Reads `name` as an f32 matrix of shape `shape`.
fn read_matrix(file: &SafeTensors<'_>, name: &str, shape: [usize; 2]) -> Result<Tensor<f32, 2>> {
    let view = file.tensor(name)?;
    if view.dtype() != Dtype::F32 {
        return checkpoint_err(format!("`{name}` is {:?}, expected F32", view.dtype()));
    }
    if view.shape() != shape {
        return checkpoint_err(format!(
            "`{name}` has shape {:?}, expected {shape:?}",
            view.shape()
        ));
    }
    let data = view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Tensor::new(data, shape)?)
}

fn read_global_step(file: &SafeTensors<'_>) -> Result<u64> {
    let view = file.tensor(GLOBAL_STEP_KEY)?;
    match (view.dtype(), view.data()) {
        (Dtype::I64, &[a, b, c, d, e, f, g, h]) => {
            let step = i64::from_le_bytes([a, b, c, d, e, f, g, h]);
            u64::try_from(step)
                .or_else(|_| checkpoint_err(format!("negative global step {step}")))
        }
        (dtype, data) => checkpoint_err(format!(
            "`{GLOBAL_STEP_KEY}` must be one I64, got {dtype:?} with {} bytes",
            data.len()
        )),
    }
}

/// A directory of `safetensors` checkpoints.
#[derive(Clone, Debug)]
pub struct SafetensorsCheckpoint {
    dir: PathBuf,
}

impl SafetensorsCheckpoint {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, step: u64) -> PathBuf {
        self.dir
            .join(format!("{CHECKPOINT_PREFIX}{step}.{CHECKPOINT_EXTENSION}"))
    }

    /// Writes the state of `store` at its current global step.
    ///
    /// The file is written under a temporary name and renamed into place, so readers
    /// never see a partial checkpoint.
    pub fn save(
        &self,
        store: &ParameterStore,
        ema: Option<&ExponentialMovingAverage>,
        optimizer: Option<&Adagrad>,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let step = store.global_step();

        let mut entries: Vec<(String, [usize; 2], Vec<u8>)> = store
            .iter()
            .map(|(_, p)| (p.name.clone(), *p.value.shape(), f32_bytes(&p.value)))
            .collect();
        if let Some(ema) = ema {
            for (name, id) in ema.names(store) {
                if let Some(avg) = ema.average(id) {
                    entries.push((name, *avg.shape(), f32_bytes(avg)));
                }
            }
        }
        if let Some(optimizer) = optimizer {
            for (id, acc) in optimizer.accumulators() {
                let name = format!("{}/{ADAGRAD_SUFFIX}", store.get(id).name);
                entries.push((name, *acc.shape(), f32_bytes(acc)));
            }
        }
        let step_bytes = i64::try_from(step)
            .or_else(|_| checkpoint_err(format!("global step {step} does not fit in i64")))?
            .to_le_bytes();

        let mut views = Vec::with_capacity(entries.len() + 1);
        for (name, shape, bytes) in &entries {
            views.push((name.clone(), TensorView::new(Dtype::F32, shape.to_vec(), bytes)?));
        }
        views.push((
            GLOBAL_STEP_KEY.to_string(),
            TensorView::new(Dtype::I64, vec![1], &step_bytes)?,
        ));

        let path = self.path_for(step);
        let tmp = path.with_extension("tmp");
        safetensors::serialize_to_file(views, &None, &tmp)?;
        std::fs::rename(&tmp, &path)?;
        tracing::info!(step, path = %path.display(), tensors = entries.len() + 1, "saved checkpoint");
        Ok(path)
    }

    /// All checkpoints in the directory, oldest first. A missing directory has none.
    pub fn list(&self) -> Result<Vec<(u64, PathBuf)>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut found = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let step = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
                .and_then(|n| n.strip_suffix(CHECKPOINT_EXTENSION))
                .and_then(|n| n.strip_suffix('.'))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(step) = step {
                found.push((step, path));
            }
        }
        found.sort();
        Ok(found)
    }

    pub fn latest(&self) -> Result<Option<(u64, PathBuf)>> {
        Ok(self.list()?.pop())
    }

    /// Loads parameter values and the global step from `path` into `store`.
    ///
    /// With `use_averages`, parameters that have a moving average in the file get the
    /// average instead of the raw value. Every tensor is read and checked before `store`
    /// is touched, so a failed restore leaves it as it was. Returns the checkpoint's
    /// global step.
    pub fn restore(&self, path: &Path, store: &mut ParameterStore, use_averages: bool) -> Result<u64> {
        let bytes = std::fs::read(path)?;
        let file = SafeTensors::deserialize(&bytes)?;
        let step = read_global_step(&file)?;
        let values = read_parameters(&file, store, use_averages)?;

        for (id, value) in values {
            *store.value_mut(id) = value;
        }
        store.set_global_step(step);
        tracing::info!(step, path = %path.display(), use_averages, "restored checkpoint");
        Ok(step)
    }

    /// Restores parameters, moving averages and Adagrad accumulators for resuming
    /// training. Averages and accumulators missing from the file are left as they are.
    /// Nothing is modified unless the whole file reads back cleanly.
    pub fn restore_training(
        &self,
        path: &Path,
        store: &mut ParameterStore,
        ema: Option<&mut ExponentialMovingAverage>,
        optimizer: &mut Adagrad,
    ) -> Result<u64> {
        let bytes = std::fs::read(path)?;
        let file = SafeTensors::deserialize(&bytes)?;
        let step = read_global_step(&file)?;
        let values = read_parameters(&file, store, false)?;

        let mut averages = Vec::new();
        if let Some(ema) = ema.as_deref() {
            for (name, id) in ema.names(store) {
                if file.tensor(&name).is_ok() {
                    averages.push((id, read_matrix(&file, &name, *store.value(id).shape())?));
                }
            }
        }
        let mut accumulators = Vec::new();
        for (id, param) in store.iter() {
            let name = format!("{}/{ADAGRAD_SUFFIX}", param.name);
            if file.tensor(&name).is_ok() {
                accumulators.push((id, read_matrix(&file, &name, *param.value.shape())?));
            }
        }

        for (id, value) in values {
            *store.value_mut(id) = value;
        }
        store.set_global_step(step);
        if let Some(ema) = ema {
            for (id, value) in averages {
                ema.set_average(id, value);
            }
        }
        for (id, value) in accumulators {
            optimizer.set_accumulator(id, value);
        }
        tracing::info!(step, path = %path.display(), "restored training state");
        Ok(step)
    }
}

/// Reads a value for every parameter of `store`, checked against its shape.
fn read_parameters(
    file: &SafeTensors<'_>,
    store: &ParameterStore,
    use_averages: bool,
) -> Result<Vec<(ParamId, Tensor<f32, 2>)>> {
    store
        .iter()
        .map(|(id, param)| {
            let averaged = ExponentialMovingAverage::average_name(&param.name);
            let key = if use_averages && file.tensor(&averaged).is_ok() {
                averaged.as_str()
            } else {
                param.name.as_str()
            };
            Ok((id, read_matrix(file, key, *param.value.shape())?))
        })
        .collect()
}

/// A [`ParameterStore`] kept in sync with the newest checkpoint of a directory.
#[derive(Clone, Debug)]
pub struct ParameterRestorer {
    checkpoints: SafetensorsCheckpoint,
    store: ParameterStore,
    use_averages: bool,
}

impl ParameterRestorer {
    /// `store` supplies the names and shapes to read; its values are overwritten on load.
    pub fn new(checkpoints: SafetensorsCheckpoint, store: ParameterStore, use_averages: bool) -> Self {
        Self {
            checkpoints,
            store,
            use_averages,
        }
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.store
    }

    pub fn checkpoints(&self) -> &SafetensorsCheckpoint {
        &self.checkpoints
    }
}

impl CheckpointStore for ParameterRestorer {
    fn load_latest(&mut self) -> Result<bool> {
        let Some((_, path)) = self.checkpoints.latest()? else {
            return Ok(false);
        };
        self.checkpoints
            .restore(&path, &mut self.store, self.use_averages)?;
        Ok(true)
    }

    fn global_step(&self) -> u64 {
        self.store.global_step()
    }
}

/// Blocks until a checkpoint newer than the last returned one is available.
#[derive(Debug)]
pub struct CheckpointLoader<S> {
    store: S,
    last_step: u64,
    poll_interval: Duration,
}

impl<S: CheckpointStore> CheckpointLoader<S> {
    pub fn new(store: S) -> Self {
        Self::with_interval(store, POLL_INTERVAL)
    }

    pub fn with_interval(store: S, poll_interval: Duration) -> Self {
        Self {
            store,
            last_step: 0,
            poll_interval,
        }
    }

    /// Step of the last checkpoint returned, 0 before the first.
    pub fn last_step(&self) -> u64 {
        self.last_step
    }

    /// Polls until the store loads a checkpoint whose global step is strictly greater
    /// than the last one returned, then records and returns that step.
    ///
    /// A missing or stale checkpoint is retried forever; load errors are returned.
    pub fn await_new_checkpoint(&mut self) -> Result<u64> {
        loop {
            if self.store.load_latest()? {
                let step = self.store.global_step();
                if step > self.last_step {
                    tracing::info!(step, "loaded checkpoint");
                    self.last_step = step;
                    return Ok(step);
                }
                tracing::info!(step, last = self.last_step, "waiting for a newer checkpoint");
            } else {
                tracing::info!("no checkpoint found, waiting");
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }
}
