use crate::error::{config_err, Result};
use crate::params::{ParamId, ParameterStore};
use crate::tensor::Tensor;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Suffix under which a parameter's moving average is stored.
pub const EMA_SUFFIX: &str = "ExponentialMovingAverage";

/// Exponential moving average of a fixed set of parameters.
///
/// `shadow = decay * shadow + (1 - decay) * value`, with shadows starting at the values
/// the parameters have when the average is created. Shadows are kept apart from the live
/// parameters and only swapped in on request.
#[derive(Clone, Debug)]
pub struct ExponentialMovingAverage {
    pub decay: f32,
    shadows: BTreeMap<ParamId, Tensor<f32, 2>>,
}

impl ExponentialMovingAverage {
    pub fn new(decay: f32, store: &ParameterStore, params: &[ParamId]) -> Self {
        let shadows = params
            .iter()
            .map(|&id| (id, store.value(id).clone()))
            .collect();
        Self { decay, shadows }
    }

    /// Restore name of `param_name`'s average.
    pub fn average_name(param_name: &str) -> String {
        format!("{param_name}/{EMA_SUFFIX}")
    }

    /// Folds the current parameter values into the shadows.
    pub fn apply(&mut self, store: &ParameterStore) -> Result<()> {
        let decay = self.decay;
        for (&id, shadow) in self.shadows.iter_mut() {
            let value = store.value(id);
            if value.shape() != shadow.shape() {
                return config_err!("parameter `{}` changed shape", store.get(id).name);
            }
            shadow
                .data_mut()
                .par_iter_mut()
                .zip(value.data().par_iter())
                .for_each(|(s, &v)| *s -= (1.0 - decay) * (*s - v));
        }
        Ok(())
    }

    pub fn average(&self, param: ParamId) -> Option<&Tensor<f32, 2>> {
        self.shadows.get(&param)
    }

    pub fn set_average(&mut self, param: ParamId, value: Tensor<f32, 2>) {
        self.shadows.insert(param, value);
    }

    pub fn tracked(&self) -> impl Iterator<Item = ParamId> + '_ {
        self.shadows.keys().copied()
    }

    /// `(restore name, parameter)` for every tracked parameter.
    pub fn names(&self, store: &ParameterStore) -> Vec<(String, ParamId)> {
        self.tracked()
            .map(|id| (Self::average_name(&store.get(id).name), id))
            .collect()
    }

    /// A copy of `store` with every tracked parameter replaced by its average.
    pub fn averaged_store(&self, store: &ParameterStore) -> ParameterStore {
        let mut averaged = store.clone();
        for (&id, shadow) in &self.shadows {
            *averaged.value_mut(id) = shadow.clone();
        }
        averaged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Initializer, ParamSpec, Reuse, Role};
    use rand::{rngs::StdRng, SeedableRng};

    fn store() -> ParameterStore {
        let mut rng = StdRng::seed_from_u64(0);
        let mut store = ParameterStore::new();
        for name in ["lstm_0/W", "emb_0"] {
            store
                .get_or_create(
                    ParamSpec {
                        name,
                        shape: [1, 2],
                        role: Role::Recurrent,
                        init: Initializer::Zeros,
                        device: "cpu:0",
                    },
                    Reuse::Create,
                    &mut rng,
                )
                .unwrap();
        }
        store
    }

    #[test]
    fn test_update_rule() {
        let mut store = store();
        let mut ema = ExponentialMovingAverage::new(0.9, &store, &[0]);
        *store.value_mut(0) = Tensor::new(vec![1.0, -1.0], [1, 2]).unwrap();
        ema.apply(&store).unwrap();

        let avg = ema.average(0).unwrap().data();
        assert!((avg[0] - 0.1).abs() < 1e-6);
        assert!((avg[1] + 0.1).abs() < 1e-6);
        assert!(ema.average(1).is_none());
    }

    #[test]
    fn test_averaged_store_leaves_live_values() {
        let mut store = store();
        let ema = ExponentialMovingAverage::new(0.999, &store, &[0]);
        *store.value_mut(0) = Tensor::ones([1, 2]);

        let averaged = ema.averaged_store(&store);
        assert_eq!(averaged.value(0).data(), &[0.0, 0.0]);
        assert_eq!(store.value(0).data(), &[1.0, 1.0]);
        assert_eq!(
            ema.names(&store),
            vec![("lstm_0/W/ExponentialMovingAverage".to_string(), 0)]
        );
    }
}
