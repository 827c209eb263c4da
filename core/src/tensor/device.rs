//! Device abstraction for Tensor storage.
//!
//! A `Device` decides where tensor data lives and which kernels run on it. Training towers
//! are logical compute devices (see `distributed::placement`); each tower's arithmetic is
//! executed on the host through the `Cpu` device, whose kernels fan out over `rayon`.

use crate::tensor::{Storage, TensorElem};
use std::fmt::Debug;
use std::sync::Arc;

/// A trait representing the underlying storage device for a Tensor.
///
/// The `Storage` associated type lets each device choose its memory container
/// (a shared `Arc<Vec<T>>` for the host).
pub trait Device: Clone + Debug + PartialEq + Send + Sync {
    /// The type of storage used by this device.
    type Storage<T>: Storage<T>
    where
        T: TensorElem;

    /// Returns the name of the device.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use towerlm::tensor::{Cpu, Device};
    /// let device = Cpu;
    /// assert_eq!(device.name(), "CPU");
    /// ```
    fn name(&self) -> &'static str;

    /// Swaps the two innermost axes of `data`.
    fn transpose<T: TensorElem, const RANK: usize>(
        data: &[T],
        shape: &[usize; RANK],
    ) -> crate::tensor::Result<Self::Storage<T>>;
}

/// The host device. Data is stored in system RAM behind an `Arc`, so clones share the
/// buffer until one of them is written to.
#[derive(Clone, Debug, PartialEq)]
pub struct Cpu;

impl Device for Cpu {
    type Storage<T>
        = Arc<Vec<T>>
    where
        T: TensorElem;

    fn name(&self) -> &'static str {
        "CPU"
    }

    fn transpose<T: TensorElem, const RANK: usize>(
        data: &[T],
        shape: &[usize; RANK],
    ) -> crate::tensor::Result<Self::Storage<T>> {
        if RANK < 2 {
            return Err(crate::tensor::TensorError::Unsupported(
                "Transpose requires rank >= 2".into(),
            ));
        }
        Ok(Arc::new(towerlm_kernels::cpu_transpose(data, shape)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_device_name() {
        assert_eq!(Cpu.name(), "CPU");
        assert_eq!(format!("{:?}", Cpu), "Cpu");
    }

    #[test]
    fn test_cpu_transpose() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let out = Cpu::transpose(&data, &[2, 3]).unwrap();
        assert_eq!(out.as_slice(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_cpu_transpose_rank_one() {
        let result = Cpu::transpose(&[1.0], &[1]);
        assert!(matches!(
            result,
            Err(crate::tensor::TensorError::Unsupported(_))
        ));
    }

    #[test]
    fn test_cpu_transpose_mismatch() {
        // Size 4 declared, 2 elements stored.
        let result = Cpu::transpose(&[1.0, 2.0], &[2, 2]);
        assert!(matches!(
            result,
            Err(crate::tensor::TensorError::ShapeMismatch { .. })
        ));
    }
}
