//! Gradient values: dense tensors or row-sparse slices.
//!
//! Lookups into large tables only touch a handful of rows, so their gradients are carried
//! as [`IndexedSlices`] (row indices, the matching value rows and the shape of the dense
//! tensor they belong to). Everything else is a dense [`Tensor`].

use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use std::collections::BTreeMap;

/// Row-sparse representation of a `[rows, cols]` gradient.
///
/// Indices may repeat; a repeated index means the contributions add up.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexedSlices<T: TensorElem = f32> {
    pub indices: Vec<usize>,
    pub values: Tensor<T, 2>,
    pub dense_shape: [usize; 2],
}

impl<T: TensorElem> IndexedSlices<T> {
    /// Builds slices, checking that `values` has one row per index of width
    /// `dense_shape[1]` and that every index is in range.
    pub fn new(indices: Vec<usize>, values: Tensor<T, 2>, dense_shape: [usize; 2]) -> Result<Self> {
        if values.shape() != &[indices.len(), dense_shape[1]] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![indices.len(), dense_shape[1]],
                got: values.shape().to_vec(),
            });
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= dense_shape[0]) {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![bad],
                shape: dense_shape.to_vec(),
            });
        }
        Ok(Self {
            indices,
            values,
            dense_shape,
        })
    }

    /// Number of stored rows (counting duplicates).
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Scatters the rows into a zero tensor of `dense_shape`, summing duplicates.
    pub fn to_dense(&self) -> Result<Tensor<T, 2>> {
        let mut out = Tensor::zeros(self.dense_shape);
        out.scatter_add_rows(&self.indices, &self.values)?;
        Ok(out)
    }

    /// Concatenates indices and values of several slices over the same dense shape.
    ///
    /// Repeated indices are kept as they are.
    pub fn concat(parts: &[&Self]) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Err(TensorError::Unsupported(
                "concat of zero IndexedSlices".into(),
            ));
        };
        let dense_shape = first.dense_shape;
        if let Some(other) = parts.iter().find(|p| p.dense_shape != dense_shape) {
            return Err(TensorError::ShapeMismatch {
                expected: dense_shape.to_vec(),
                got: other.dense_shape.to_vec(),
            });
        }
        let indices = parts
            .iter()
            .flat_map(|p| p.indices.iter().copied())
            .collect();
        let values: Vec<&Tensor<T, 2>> = parts.iter().map(|p| &p.values).collect();
        Ok(Self {
            indices,
            values: Tensor::concat_rows(&values)?,
            dense_shape,
        })
    }

    /// Sums rows that share an index. Returns the unique indices in ascending order and
    /// their summed rows.
    pub fn coalesce(&self) -> Result<(Vec<usize>, Tensor<T, 2>)> {
        let mut slot = BTreeMap::new();
        for &index in &self.indices {
            let next = slot.len();
            slot.entry(index).or_insert(next);
        }
        let cols = self.dense_shape[1];
        let mut summed = Tensor::zeros([slot.len(), cols]);
        let positions: Vec<usize> = self.indices.iter().map(|i| slot[i]).collect();
        summed.scatter_add_rows(&positions, &self.values)?;

        // BTreeMap iterates in index order; `slot` maps each index to its row in `summed`.
        let order: Vec<usize> = slot.values().copied().collect();
        let unique: Vec<usize> = slot.keys().copied().collect();
        Ok((unique, summed.gather_rows(&order)?))
    }
}

/// Gradient of a rank-2 parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum Gradient<T: TensorElem = f32> {
    Dense(Tensor<T, 2>),
    Sparse(IndexedSlices<T>),
}

impl<T: TensorElem> Gradient<T> {
    /// Shape of the parameter this gradient belongs to.
    pub fn dense_shape(&self) -> [usize; 2] {
        match self {
            Gradient::Dense(t) => *t.shape(),
            Gradient::Sparse(s) => s.dense_shape,
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Gradient::Sparse(_))
    }

    pub fn to_dense(&self) -> Result<Tensor<T, 2>> {
        match self {
            Gradient::Dense(t) => Ok(t.clone()),
            Gradient::Sparse(s) => s.to_dense(),
        }
    }

    /// Multiplies the values by `factor`, keeping the representation.
    pub fn scale(&self, factor: T) -> Self {
        match self {
            Gradient::Dense(t) => Gradient::Dense(t.scale(factor)),
            Gradient::Sparse(s) => Gradient::Sparse(IndexedSlices {
                indices: s.indices.clone(),
                values: s.values.scale(factor),
                dense_shape: s.dense_shape,
            }),
        }
    }

    /// Sum of squares of the stored values. For sparse gradients this is taken over the
    /// value rows as stored, without coalescing duplicates.
    pub fn sum_squares(&self) -> T {
        match self {
            Gradient::Dense(t) => t.sum_squares(),
            Gradient::Sparse(s) => s.values.sum_squares(),
        }
    }

    /// Adds two gradients of the same parameter.
    ///
    /// Dense plus dense adds element-wise, sparse plus sparse concatenates and a mixed
    /// pair is densified.
    pub fn accumulate(self, other: Gradient<T>) -> Result<Gradient<T>> {
        if self.dense_shape() != other.dense_shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.dense_shape().to_vec(),
                got: other.dense_shape().to_vec(),
            });
        }
        match (self, other) {
            (Gradient::Dense(mut a), Gradient::Dense(b)) => {
                a.add_assign(&b)?;
                Ok(Gradient::Dense(a))
            }
            (Gradient::Sparse(a), Gradient::Sparse(b)) => {
                Ok(Gradient::Sparse(IndexedSlices::concat(&[&a, &b])?))
            }
            (Gradient::Dense(mut a), Gradient::Sparse(b))
            | (Gradient::Sparse(b), Gradient::Dense(mut a)) => {
                a.scatter_add_rows(&b.indices, &b.values)?;
                Ok(Gradient::Dense(a))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slices(indices: Vec<usize>, values: Vec<f32>) -> IndexedSlices<f32> {
        let n = indices.len();
        IndexedSlices::new(indices, Tensor::new(values, [n, 2]).unwrap(), [4, 2]).unwrap()
    }

    #[test]
    fn test_indexed_slices_validation() {
        let values = Tensor::<f32, 2>::zeros([1, 2]);
        assert!(IndexedSlices::new(vec![4], values.clone(), [4, 2]).is_err());
        assert!(IndexedSlices::new(vec![0, 1], values, [4, 2]).is_err());
    }

    #[test]
    fn test_to_dense_sums_duplicates() {
        let s = slices(vec![1, 3, 1], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let dense = s.to_dense().unwrap();
        assert_eq!(dense.data(), &[0.0, 0.0, 6.0, 8.0, 0.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn test_concat_keeps_duplicates() {
        let a = slices(vec![1], vec![1.0, 1.0]);
        let b = slices(vec![1, 2], vec![2.0, 2.0, 3.0, 3.0]);
        let c = IndexedSlices::concat(&[&a, &b]).unwrap();
        assert_eq!(c.indices, vec![1, 1, 2]);
        assert_eq!(c.values.shape(), &[3, 2]);
    }

    #[test]
    fn test_coalesce() {
        let s = slices(vec![3, 1, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let (indices, values) = s.coalesce().unwrap();
        assert_eq!(indices, vec![1, 3]);
        assert_eq!(values.data(), &[3.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_accumulate_mixed_densifies() {
        let dense = Gradient::Dense(Tensor::<f32, 2>::ones([4, 2]));
        let sparse = Gradient::Sparse(slices(vec![0], vec![1.0, 2.0]));
        let sum = dense.accumulate(sparse).unwrap();
        assert!(!sum.is_sparse());
        assert_eq!(&sum.to_dense().unwrap().data()[..4], &[2.0, 3.0, 1.0, 1.0]);
    }

    #[test]
    fn test_scale_and_norm() {
        let g = Gradient::Sparse(slices(vec![0, 0], vec![1.0, 1.0, 1.0, 1.0]));
        assert_eq!(g.sum_squares(), 4.0);
        let scaled = g.scale(3.0);
        assert!(scaled.is_sparse());
        assert_eq!(scaled.sum_squares(), 36.0);
    }
}
