use super::Optimizer;
use crate::autograd::Gradient;
use crate::error::{config_err, Result};
use crate::params::{GradVar, ParamId, ParameterStore};
use crate::tensor::Tensor;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Adagrad optimizer.
///
/// Keeps a per-element accumulator of squared gradients, started at
/// `initial_accumulator_value`:
///
/// ```text
/// acc   += g²
/// param -= lr * g / sqrt(acc)
/// ```
///
/// Sparse gradients only touch their rows. Rows that appear several times in one gradient
/// are summed before the update.
#[derive(Clone, Debug)]
pub struct Adagrad {
    pub learning_rate: f32,
    pub initial_accumulator_value: f32,
    accumulators: BTreeMap<ParamId, Tensor<f32, 2>>,
}

impl Adagrad {
    pub fn new(learning_rate: f32, initial_accumulator_value: f32) -> Self {
        Self {
            learning_rate,
            initial_accumulator_value,
            accumulators: BTreeMap::new(),
        }
    }

    /// Accumulator of `param`, if it has been created.
    pub fn accumulator(&self, param: ParamId) -> Option<&Tensor<f32, 2>> {
        self.accumulators.get(&param)
    }

    /// Replaces the accumulator of `param`, e.g. when resuming from a checkpoint.
    pub fn set_accumulator(&mut self, param: ParamId, value: Tensor<f32, 2>) {
        self.accumulators.insert(param, value);
    }

    pub fn accumulators(&self) -> impl Iterator<Item = (ParamId, &Tensor<f32, 2>)> {
        self.accumulators.iter().map(|(&id, t)| (id, t))
    }

    fn accumulator_mut(&mut self, param: ParamId, shape: [usize; 2]) -> &mut Tensor<f32, 2> {
        let init = self.initial_accumulator_value;
        self.accumulators
            .entry(param)
            .or_insert_with(|| Tensor::full(shape, init))
    }
}

fn update_row(param: &mut [f32], acc: &mut [f32], grad: &[f32], lr: f32) {
    for ((p, a), &g) in param.iter_mut().zip(acc.iter_mut()).zip(grad) {
        *a += g * g;
        *p -= lr * g / a.sqrt();
    }
}

impl Optimizer for Adagrad {
    /// Every gradient is checked against its parameter before the first update, so a
    /// rejected list leaves parameters, accumulators and the global step unchanged.
    fn apply(&mut self, store: &mut ParameterStore, grads: &[GradVar]) -> Result<u64> {
        for gv in grads {
            let Some(grad) = &gv.grad else { continue };
            let shape = *store.value(gv.param).shape();
            if grad.dense_shape() != shape {
                return config_err!(
                    "gradient shape {:?} does not match parameter `{}` {:?}",
                    grad.dense_shape(),
                    store.get(gv.param).name,
                    shape
                );
            }
            if let Gradient::Sparse(slices) = grad {
                if let Some(&bad) = slices.indices.iter().find(|&&r| r >= shape[0]) {
                    return config_err!("row {bad} out of range for {} rows", shape[0]);
                }
            }
        }

        let lr = self.learning_rate;
        for gv in grads {
            let Some(grad) = &gv.grad else { continue };
            let shape = *store.value(gv.param).shape();
            let cols = shape[1];
            let acc = self.accumulator_mut(gv.param, shape);
            let param = store.value_mut(gv.param);

            match grad {
                Gradient::Dense(g) => {
                    if cols == 0 {
                        continue;
                    }
                    param
                        .data_mut()
                        .par_chunks_mut(cols)
                        .zip(acc.data_mut().par_chunks_mut(cols))
                        .zip(g.data().par_chunks(cols))
                        .for_each(|((p, a), g)| update_row(p, a, g, lr));
                }
                Gradient::Sparse(slices) => {
                    let (rows, values) = slices.coalesce()?;
                    for (k, &row) in rows.iter().enumerate() {
                        let span = row * cols..(row + 1) * cols;
                        update_row(
                            &mut param.data_mut()[span.clone()],
                            &mut acc.data_mut()[span],
                            values.row(k),
                            lr,
                        );
                    }
                }
            }
        }
        Ok(store.increment_global_step())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::IndexedSlices;
    use crate::params::{Initializer, ParamSpec, Reuse, Role};
    use rand::{rngs::StdRng, SeedableRng};

    fn store_with(value: Vec<f32>, shape: [usize; 2]) -> ParameterStore {
        let mut rng = StdRng::seed_from_u64(0);
        let mut store = ParameterStore::new();
        let id = store
            .get_or_create(
                ParamSpec {
                    name: "p",
                    shape,
                    role: Role::Softmax,
                    init: Initializer::Zeros,
                    device: "cpu:0",
                },
                Reuse::Create,
                &mut rng,
            )
            .unwrap();
        *store.value_mut(id) = Tensor::new(value, shape).unwrap();
        store
    }

    #[test]
    fn test_dense_update() {
        let mut store = store_with(vec![1.0, 2.0], [1, 2]);
        let mut opt = Adagrad::new(0.1, 1.0);
        let grad = Tensor::new(vec![1.0, -2.0], [1, 2]).unwrap();
        let step = opt
            .apply(
                &mut store,
                &[GradVar {
                    param: 0,
                    grad: Some(Gradient::Dense(grad)),
                }],
            )
            .unwrap();

        assert_eq!(step, 1);
        // acc = 1 + g² = [2, 5]; p -= 0.1 * g / sqrt(acc)
        let p = store.value(0).data();
        assert!((p[0] - (1.0 - 0.1 / 2.0f32.sqrt())).abs() < 1e-6);
        assert!((p[1] - (2.0 + 0.2 / 5.0f32.sqrt())).abs() < 1e-6);
        assert_eq!(opt.accumulator(0).unwrap().data(), &[2.0, 5.0]);
    }

    #[test]
    fn test_sparse_update_sums_duplicates() {
        let mut store = store_with(vec![0.0; 6], [3, 2]);
        let mut opt = Adagrad::new(1.0, 1.0);
        let values = Tensor::new(vec![1.0, 1.0, 2.0, 2.0], [2, 2]).unwrap();
        let slices = IndexedSlices::new(vec![2, 2], values, [3, 2]).unwrap();
        opt.apply(
            &mut store,
            &[GradVar {
                param: 0,
                grad: Some(Gradient::Sparse(slices)),
            }],
        )
        .unwrap();

        // Row 2 sees g = 3: acc = 1 + 9 = 10, p = -3 / sqrt(10). Other rows untouched.
        let expected = -3.0 / 10.0f32.sqrt();
        let p = store.value(0).data();
        assert_eq!(&p[..4], &[0.0; 4]);
        assert!((p[4] - expected).abs() < 1e-6);
        assert!((p[5] - expected).abs() < 1e-6);
        assert_eq!(opt.accumulator(0).unwrap().data(), &[1.0, 1.0, 1.0, 1.0, 10.0, 10.0]);
    }

    #[test]
    fn test_missing_gradient_still_counts_step() {
        let mut store = store_with(vec![1.0], [1, 1]);
        let mut opt = Adagrad::new(0.1, 1.0);
        let step = opt
            .apply(&mut store, &[GradVar { param: 0, grad: None }])
            .unwrap();
        assert_eq!(step, 1);
        assert_eq!(store.value(0).data(), &[1.0]);
        assert!(opt.accumulator(0).is_none());
    }

    #[test]
    fn test_rejected_list_applies_nothing() {
        let mut store = store_with(vec![1.0, 2.0], [1, 2]);
        let mut rng = StdRng::seed_from_u64(0);
        let second = store
            .get_or_create(
                ParamSpec {
                    name: "q",
                    shape: [2, 1],
                    role: Role::Softmax,
                    init: Initializer::Zeros,
                    device: "cpu:0",
                },
                Reuse::Create,
                &mut rng,
            )
            .unwrap();
        let mut opt = Adagrad::new(0.1, 1.0);
        let grads = [
            GradVar {
                param: 0,
                grad: Some(Gradient::Dense(Tensor::ones([1, 2]))),
            },
            GradVar {
                param: second,
                grad: Some(Gradient::Dense(Tensor::ones([1, 2]))),
            },
        ];
        assert!(opt.apply(&mut store, &grads).is_err());
        assert_eq!(store.value(0).data(), &[1.0, 2.0]);
        assert!(opt.accumulator(0).is_none());
        assert_eq!(store.global_step(), 0);

        // Fields are public, so out-of-range rows can bypass `IndexedSlices::new`.
        let out_of_range = IndexedSlices {
            indices: vec![2],
            values: Tensor::ones([1, 1]),
            dense_shape: [2, 1],
        };
        let grads = [GradVar {
            param: second,
            grad: Some(Gradient::Sparse(out_of_range)),
        }];
        assert!(opt.apply(&mut store, &grads).is_err());
        assert_eq!(store.global_step(), 0);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut store = store_with(vec![1.0], [1, 1]);
        let mut opt = Adagrad::new(0.1, 1.0);
        let grad = Gradient::Dense(Tensor::zeros([2, 1]));
        assert!(opt
            .apply(&mut store, &[GradVar { param: 0, grad: Some(grad) }])
            .is_err());
    }
}
