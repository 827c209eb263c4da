//! Parameter registry.
//!
//! Every trainable tensor lives in a [`ParameterStore`] under a unique name together with a
//! [`Role`] tag. Training code selects parameter groups by role, never by inspecting names.
//! Device towers share one store: the first tower creates parameters, later towers look
//! them up with [`Reuse::Share`].

use crate::autograd::{Gradient, Variable};
use crate::error::{config_err, Result};
use crate::tensor::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type ParamId = usize;

/// Group a parameter belongs to during the backward pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Embedding,
    Recurrent,
    Softmax,
}

/// Whether a tower builder creates its parameters or binds to existing ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reuse {
    Create,
    Share,
}

/// How a freshly created parameter is filled.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Initializer {
    Zeros,
    /// `U(-sqrt(3 / fan_in), sqrt(3 / fan_in))` with `fan_in = shape[0]`, which keeps
    /// the variance of `x · W` close to that of `x`.
    UniformUnitScaling,
}

impl Initializer {
    pub fn init<R: Rng>(&self, shape: [usize; 2], rng: &mut R) -> Tensor<f32, 2> {
        match self {
            Initializer::Zeros => Tensor::zeros(shape),
            Initializer::UniformUnitScaling => {
                let limit = (3.0 / shape[0].max(1) as f32).sqrt();
                Tensor::from_fn(shape, || rng.random_range(-limit..=limit))
            }
        }
    }
}

/// A gradient paired with the parameter it updates. `None` when the parameter did not
/// influence the loss.
#[derive(Clone, Debug, PartialEq)]
pub struct GradVar {
    pub param: ParamId,
    pub grad: Option<Gradient<f32>>,
}

#[derive(Clone, Debug)]
pub struct Parameter {
    pub name: String,
    pub role: Role,
    pub trainable: bool,
    /// Storage location the parameter is pinned to.
    pub device: String,
    pub value: Tensor<f32, 2>,
}

/// Specification of a parameter to create or bind.
#[derive(Clone, Debug)]
pub struct ParamSpec<'a> {
    pub name: &'a str,
    pub shape: [usize; 2],
    pub role: Role,
    pub init: Initializer,
    pub device: &'a str,
}

#[derive(Clone, Debug, Default)]
pub struct ParameterStore {
    params: Vec<Parameter>,
    by_name: HashMap<String, ParamId>,
    global_step: u64,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the parameter described by `spec` or, with [`Reuse::Share`], returns the
    /// existing one after checking its shape and role.
    pub fn get_or_create<R: Rng>(
        &mut self,
        spec: ParamSpec<'_>,
        reuse: Reuse,
        rng: &mut R,
    ) -> Result<ParamId> {
        match (reuse, self.by_name.get(spec.name).copied()) {
            (Reuse::Create, Some(_)) => {
                config_err!("parameter `{}` already exists", spec.name)
            }
            (Reuse::Create, None) => {
                let id = self.params.len();
                self.params.push(Parameter {
                    name: spec.name.to_string(),
                    role: spec.role,
                    trainable: true,
                    device: spec.device.to_string(),
                    value: spec.init.init(spec.shape, rng),
                });
                self.by_name.insert(spec.name.to_string(), id);
                Ok(id)
            }
            (Reuse::Share, None) => {
                config_err!("cannot share unknown parameter `{}`", spec.name)
            }
            (Reuse::Share, Some(id)) => {
                let existing = &self.params[id];
                if existing.value.shape() != &spec.shape || existing.role != spec.role {
                    return config_err!(
                        "parameter `{}` is {:?}/{:?}, requested {:?}/{:?}",
                        spec.name,
                        existing.value.shape(),
                        existing.role,
                        spec.shape,
                        spec.role
                    );
                }
                Ok(id)
            }
        }
    }

    pub fn id(&self, name: &str) -> Option<ParamId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: ParamId) -> &Parameter {
        &self.params[id]
    }

    pub fn value(&self, id: ParamId) -> &Tensor<f32, 2> {
        &self.params[id].value
    }

    pub fn value_mut(&mut self, id: ParamId) -> &mut Tensor<f32, 2> {
        &mut self.params[id].value
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Parameter)> {
        self.params.iter().enumerate()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Trainable parameters with `role`, in creation order.
    pub fn ids_by_role(&self, role: Role) -> Vec<ParamId> {
        self.iter()
            .filter(|(_, p)| p.trainable && p.role == role)
            .map(|(id, _)| id)
            .collect()
    }

    /// One fresh leaf variable per parameter, indexed by [`ParamId`].
    ///
    /// Leaves share their buffers with the store; nothing is copied.
    pub fn leaves(&self) -> Vec<Variable<f32>> {
        self.params
            .iter()
            .map(|p| Variable::new(p.value.clone()))
            .collect()
    }

    /// Global L2 norm over the values of `ids`.
    pub fn global_norm(&self, ids: &[ParamId]) -> f32 {
        ids.iter()
            .map(|&id| self.params[id].value.sum_squares())
            .sum::<f32>()
            .sqrt()
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn set_global_step(&mut self, step: u64) {
        self.global_step = step;
    }

    pub(crate) fn increment_global_step(&mut self) -> u64 {
        self.global_step += 1;
        self.global_step
    }
}
