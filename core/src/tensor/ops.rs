//! Tensor operations.
//!
//! - **Element-wise arithmetic**: `+`, `-`, `*`, `/` on `&Tensor` with strict shape checks.
//! - **Matrix multiplication**: delegated to `towerlm_kernels`.
//! - **Row/column plumbing** for rank-2 tensors: slicing, concatenation, gathering and
//!   broadcasting a bias row. The recurrent cell and the softmax layers are written
//!   entirely in terms of these.
//!
//! Operations are parallelised with `rayon`.
//!
//! ```rust
//! use towerlm::tensor::Tensor;
//!
//! let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
//! let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();
//!
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[4.0, 6.0]);
//! ```

use super::{compute_strides, Cpu, Device, Result, Tensor, TensorElem, TensorError};

use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};
use std::sync::Arc;

/// Implements a binary arithmetic operation trait (e.g., `Add`, `Sub`) for `&Tensor`.
///
/// Shapes must match exactly; the result is computed element-wise in parallel.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK, Cpu>
        where
            T: TensorElem,
        {
            type Output = crate::tensor::Result<Tensor<T, RANK, Cpu>>;

            fn $method(self, rhs: Self) -> Self::Output {
                if self.shape != rhs.shape {
                    return Err(TensorError::ShapeMismatch {
                        expected: self.shape.to_vec(),
                        got: rhs.shape.to_vec(),
                    });
                }

                let mut out = Tensor::zeros(self.shape);
                out.data_mut()
                    .par_iter_mut()
                    .zip(self.data().par_iter())
                    .zip(rhs.data().par_iter())
                    .for_each(|((o, a), b)| {
                        *o = a.$method(*b);
                    });

                Ok(out)
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

/// Tensor operations that depend on the device implementation.
pub trait TensorOps<T: TensorElem, const RANK: usize, D: Device> {
    /// Swaps the two innermost axes.
    fn transpose(&self) -> Result<Tensor<T, RANK, D>>;
}

impl<T, const RANK: usize, D: Device> TensorOps<T, RANK, D> for Tensor<T, RANK, D>
where
    T: TensorElem,
{
    fn transpose(&self) -> Result<Tensor<T, RANK, D>> {
        let out_data = D::transpose(self.data(), &self.shape)?;

        let mut new_shape = self.shape;
        if RANK >= 2 {
            new_shape.swap(RANK - 1, RANK - 2);
        }

        Ok(Tensor {
            shape: new_shape,
            strides: compute_strides(&new_shape),
            data: out_data,
            device: self.device.clone(),
        })
    }
}

impl<T, const RANK: usize> Tensor<T, RANK, Cpu>
where
    T: TensorElem,
{
    /// Applies a function element-wise to the tensor.
    ///
    /// ```rust
    /// use towerlm::tensor::Tensor;
    /// let t = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
    /// let squared = t.map(|x| x * x);
    /// assert_eq!(squared.data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = Tensor::zeros(self.shape);
        out.data_mut()
            .par_iter_mut()
            .zip(self.data().par_iter())
            .for_each(|(o, i)| *o = f(*i));
        out
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&self, factor: T) -> Self {
        self.map(|x| x * factor)
    }

    /// Sum of all elements.
    pub fn sum(&self) -> T {
        self.data()
            .par_iter()
            .copied()
            .reduce(|| T::zero(), |a, b| a + b)
    }

    /// Sum of squared elements.
    pub fn sum_squares(&self) -> T {
        towerlm_kernels::cpu_sum_squares(self.data())
    }

    /// Adds `rhs` into `self` in place.
    pub fn add_assign(&mut self, rhs: &Self) -> Result<()> {
        if self.shape != rhs.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }
        self.data_mut()
            .par_iter_mut()
            .zip(rhs.data().par_iter())
            .for_each(|(a, b)| *a += *b);
        Ok(())
    }

    /// Batched matrix multiplication on the last two dimensions.
    ///
    /// - **Rank 2**: `[M, K] x [K, N] -> [M, N]`
    /// - **Rank 3**: `[B, M, K] x [B, K, N] -> [B, M, N]`
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };
        self.check_batch_dims(rhs)?;

        let mut out_shape = self.shape;
        out_shape[RANK - 1] = rhs.shape[RANK - 1];

        let out_data = towerlm_kernels::cpu_matmul(
            self.data(),
            rhs.data(),
            &self.shape,
            &rhs.shape,
        )?;

        Tensor::new(out_data, out_shape)
    }

    /// Matrix multiplication against the transpose of `rhs`:
    /// `[..., M, K] x [..., N, K]ᵀ -> [..., M, N]`.
    pub fn matmul_nt(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };
        self.check_batch_dims(rhs)?;

        let mut out_shape = self.shape;
        out_shape[RANK - 1] = rhs.shape[RANK - 2];

        let out_data = towerlm_kernels::cpu_matmul_nt(
            self.data(),
            rhs.data(),
            &self.shape,
            &rhs.shape,
        )?;

        Tensor::new(out_data, out_shape)
    }

    fn check_batch_dims(&self, rhs: &Self) -> Result<()> {
        if self.shape[..RANK - 2] != rhs.shape[..RANK - 2] {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }
        Ok(())
    }
}

impl<T> Tensor<T, 2, Cpu>
where
    T: TensorElem,
{
    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.shape[1]
    }

    /// Borrows row `r` as a slice.
    pub fn row(&self, r: usize) -> &[T] {
        let cols = self.shape[1];
        &self.data()[r * cols..(r + 1) * cols]
    }

    /// Rows `[start, end)` as a new tensor.
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Self> {
        if start > end || end > self.shape[0] {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![start, end],
                shape: self.shape.to_vec(),
            });
        }
        let cols = self.shape[1];
        Tensor::new(
            self.data()[start * cols..end * cols].to_vec(),
            [end - start, cols],
        )
    }

    /// Columns `[start, end)` as a new tensor.
    pub fn slice_cols(&self, start: usize, end: usize) -> Result<Self> {
        let [rows, cols] = self.shape;
        if start > end || end > cols {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![start, end],
                shape: self.shape.to_vec(),
            });
        }
        let width = end - start;
        let mut out = Tensor::zeros([rows, width]);
        if width > 0 {
            out.data_mut()
                .par_chunks_mut(width)
                .zip(self.data().par_chunks(cols.max(1)))
                .for_each(|(dst, src)| dst.copy_from_slice(&src[start..end]));
        }
        Ok(out)
    }

    /// Stacks tensors with equal column counts on top of each other.
    pub fn concat_rows(parts: &[&Self]) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Err(TensorError::Unsupported(
                "concat_rows of zero tensors".into(),
            ));
        };
        let cols = first.shape[1];
        let mut data = Vec::with_capacity(parts.iter().map(|p| p.size()).sum());
        let mut rows = 0;
        for part in parts {
            if part.shape[1] != cols {
                return Err(TensorError::ShapeMismatch {
                    expected: vec![part.shape[0], cols],
                    got: part.shape.to_vec(),
                });
            }
            data.extend_from_slice(part.data());
            rows += part.shape[0];
        }
        Tensor::new(data, [rows, cols])
    }

    /// Places tensors with equal row counts side by side.
    pub fn concat_cols(parts: &[&Self]) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Err(TensorError::Unsupported(
                "concat_cols of zero tensors".into(),
            ));
        };
        let rows = first.shape[0];
        for part in parts {
            if part.shape[0] != rows {
                return Err(TensorError::ShapeMismatch {
                    expected: vec![rows, part.shape[1]],
                    got: part.shape.to_vec(),
                });
            }
        }
        let cols: usize = parts.iter().map(|p| p.shape[1]).sum();
        let mut out = Tensor::zeros([rows, cols]);
        if cols > 0 {
            out.data_mut()
                .par_chunks_mut(cols)
                .enumerate()
                .for_each(|(r, dst)| {
                    let mut offset = 0;
                    for part in parts {
                        let width = part.shape[1];
                        dst[offset..offset + width].copy_from_slice(part.row(r));
                        offset += width;
                    }
                });
        }
        Ok(out)
    }

    /// Selects rows `ids` in order, producing `[ids.len(), cols]`.
    pub fn gather_rows(&self, ids: &[usize]) -> Result<Self> {
        let cols = self.shape[1];
        let data = towerlm_kernels::cpu_gather_rows(self.data(), cols, ids)?;
        Tensor::new(data, [ids.len(), cols])
    }

    /// Adds `values` (`[indices.len(), cols]`) into the listed rows. Repeated indices accumulate.
    pub fn scatter_add_rows(&mut self, indices: &[usize], values: &Self) -> Result<()> {
        let cols = self.shape[1];
        if values.shape[1] != cols {
            return Err(TensorError::ShapeMismatch {
                expected: vec![indices.len(), cols],
                got: values.shape.to_vec(),
            });
        }
        towerlm_kernels::cpu_scatter_add_rows(self.data_mut(), cols, indices, values.data())?;
        Ok(())
    }

    /// Adds the `[1, cols]` row `bias` to every row.
    pub fn add_row(&self, bias: &Self) -> Result<Self> {
        let cols = self.shape[1];
        if bias.shape != [1, cols] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![1, cols],
                got: bias.shape.to_vec(),
            });
        }
        let mut out = self.clone();
        if cols > 0 {
            out.data_mut().par_chunks_mut(cols).for_each(|row| {
                for (x, b) in row.iter_mut().zip(bias.data().iter()) {
                    *x += *b;
                }
            });
        }
        Ok(out)
    }

    /// Column sums as a `[1, cols]` row.
    pub fn sum_rows(&self) -> Self {
        let cols = self.shape[1];
        let mut out = vec![T::zero(); cols];
        if cols > 0 {
            for row in self.data().chunks(cols) {
                for (o, x) in out.iter_mut().zip(row) {
                    *o += *x;
                }
            }
        }
        Tensor {
            shape: [1, cols],
            strides: [cols, 1],
            data: Arc::new(out),
            device: Cpu,
        }
    }
}
