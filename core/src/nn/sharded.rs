//! Row-partitioned parameter matrices.
//!
//! The embedding table and the softmax weight are `[vocab, features]` matrices that are
//! too large to keep as a single tensor. A [`ShardedParameter`] splits the rows into `N`
//! contiguous pieces of `ceil(rows / N)` rows each; the last piece is zero-padded when
//! `rows` is not a multiple of `N`. Logical row `r` lives in shard `r / shard_rows` at
//! local row `r % shard_rows`.

use crate::autograd::Variable;
use crate::error::{config_err, Result};
use crate::params::{Initializer, ParamId, ParamSpec, ParameterStore, Reuse, Role};
use crate::tensor::Tensor;
use rand::Rng;

#[derive(Clone, Debug, PartialEq)]
pub struct ShardedParameter {
    pub name: String,
    /// Logical `[rows, cols]`.
    pub shape: [usize; 2],
    /// Rows held by every shard.
    pub shard_rows: usize,
    /// Shard ids in row order.
    pub shards: Vec<ParamId>,
}

/// Rows per shard for `rows` split `num_shards` ways.
///
/// Fails when the split would produce zero-sized shards.
pub fn shard_rows(rows: usize, num_shards: usize) -> Result<usize> {
    if num_shards == 0 {
        return config_err!("num_shards must be at least 1");
    }
    if rows == 0 {
        return config_err!("cannot shard a matrix with zero rows");
    }
    Ok(rows.div_ceil(num_shards))
}

impl ShardedParameter {
    /// Creates (or, with [`Reuse::Share`], binds to) shards `"<name>_<i>"`.
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng>(
        store: &mut ParameterStore,
        name: &str,
        shape: [usize; 2],
        num_shards: usize,
        role: Role,
        device: &str,
        reuse: Reuse,
        rng: &mut R,
    ) -> Result<Self> {
        let [rows, cols] = shape;
        let shard_rows = shard_rows(rows, num_shards)?;
        if cols == 0 {
            return config_err!("sharded parameter `{name}` has zero columns");
        }

        let shards = (0..num_shards)
            .map(|i| {
                let shard_name = format!("{name}_{i}");
                store.get_or_create(
                    ParamSpec {
                        name: &shard_name,
                        shape: [shard_rows, cols],
                        role,
                        init: Initializer::UniformUnitScaling,
                        device,
                    },
                    reuse,
                    rng,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(name, rows, cols, num_shards, shard_rows, "sharded parameter");
        Ok(Self {
            name: name.to_string(),
            shape,
            shard_rows,
            shards,
        })
    }

    /// `(shard index, local row)` of logical row `row`.
    pub fn locate(&self, row: usize) -> (usize, usize) {
        (row / self.shard_rows, row % self.shard_rows)
    }

    /// Concatenates the shards' values and trims the padding.
    pub fn concat(&self, store: &ParameterStore) -> Result<Tensor<f32, 2>> {
        let parts: Vec<&Tensor<f32, 2>> = self.shards.iter().map(|&id| store.value(id)).collect();
        Ok(Tensor::concat_rows(&parts)?.slice_rows(0, self.shape[0])?)
    }

    fn variables<'a>(&self, leaves: &'a [Variable<f32>]) -> Vec<&'a Variable<f32>> {
        self.shards.iter().map(|&id| &leaves[id]).collect()
    }

    /// Differentiable counterpart of [`Self::concat`]. Gradients reach the shards densely.
    pub fn concat_var(&self, leaves: &[Variable<f32>]) -> Result<Variable<f32>> {
        let full = Variable::concat_rows(&self.variables(leaves))?;
        Ok(full.slice_rows(0, self.shape[0])?)
    }

    /// Rows `ids` in the given order, without materialising the logical matrix.
    /// Gradients reach the shards as indexed slices with shard-local indices.
    pub fn lookup(&self, leaves: &[Variable<f32>], ids: &[usize]) -> Result<Variable<f32>> {
        if let Some(&bad) = ids.iter().find(|&&id| id >= self.shape[0]) {
            return config_err!(
                "row {bad} out of range for `{}` with {} rows",
                self.name,
                self.shape[0]
            );
        }
        Ok(Variable::gather(&self.variables(leaves), self.shard_rows, ids)?)
    }
}
