use crate::error::{config_err, Result};
use crate::tensor::Tensor;

/// Inputs `x`, targets `y` and per-token weights `w`, all `[rows, num_steps]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub x: Tensor<usize, 2>,
    pub y: Tensor<usize, 2>,
    pub w: Tensor<f32, 2>,
}

impl Batch {
    pub fn new(x: Tensor<usize, 2>, y: Tensor<usize, 2>, w: Tensor<f32, 2>) -> Result<Self> {
        let batch = Self { x, y, w };
        batch.checked_shape()?;
        Ok(batch)
    }

    /// Shape of `x`. See [`Batch::checked_shape`] for a batch built from its fields.
    pub fn shape(&self) -> [usize; 2] {
        *self.x.shape()
    }

    /// The common shape of `x`, `y` and `w`, or a configuration error if they differ.
    pub fn checked_shape(&self) -> Result<[usize; 2]> {
        let (x, y, w) = (self.x.shape(), self.y.shape(), self.w.shape());
        if x != y || x != w {
            return config_err!("x, y and w must share a shape, got {x:?}, {y:?} and {w:?}");
        }
        Ok(*x)
    }

    /// Fails when any input or target id is not below `vocab_size`.
    pub fn check_ids(&self, vocab_size: usize) -> Result<()> {
        let ids = self.x.data().iter().chain(self.y.data());
        if let Some(bad) = ids.copied().find(|&id| id >= vocab_size) {
            return config_err!("token id {bad} out of range for vocabulary of {vocab_size}");
        }
        Ok(())
    }

    /// Splits the rows into `parts` equal, consecutive blocks.
    pub fn split(&self, parts: usize) -> Result<Vec<Batch>> {
        let rows = self.shape()[0];
        if parts == 0 || rows % parts != 0 {
            return config_err!("cannot split {rows} rows into {parts} equal parts");
        }
        let per = rows / parts;
        (0..parts)
            .map(|i| {
                let (start, end) = (i * per, (i + 1) * per);
                Ok(Batch {
                    x: self.x.slice_rows(start, end)?,
                    y: self.y.slice_rows(start, end)?,
                    w: self.w.slice_rows(start, end)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(rows: usize) -> Batch {
        let x = Tensor::new((0..rows * 2).collect(), [rows, 2]).unwrap();
        let y = Tensor::new((1..=rows * 2).collect(), [rows, 2]).unwrap();
        Batch::new(x, y, Tensor::ones([rows, 2])).unwrap()
    }

    #[test]
    fn test_shape_mismatch() {
        let x = Tensor::<usize, 2>::zeros([2, 3]);
        let y = Tensor::<usize, 2>::zeros([2, 3]);
        assert!(Batch::new(x, y, Tensor::ones([2, 2])).is_err());
    }

    #[test]
    fn test_checked_shape_sees_every_field() {
        let mut b = batch(2);
        assert_eq!(b.checked_shape().unwrap(), [2, 2]);
        b.y = Tensor::zeros([2, 3]);
        assert_eq!(b.shape(), [2, 2]);
        assert!(b.checked_shape().is_err());
    }

    #[test]
    fn test_split_rows() {
        let parts = batch(4).split(2).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].x.data(), &[4, 5, 6, 7]);
        assert!(batch(3).split(2).is_err());
        assert!(batch(3).split(0).is_err());
    }

    #[test]
    fn test_check_ids() {
        assert!(batch(2).check_ids(5).is_ok());
        assert!(batch(2).check_ids(4).is_err());
    }
}
