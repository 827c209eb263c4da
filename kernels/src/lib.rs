//! CPU kernels for `towerlm`.
//!
//! Every kernel works on flat row-major slices plus explicit shapes so that the tensor
//! layer in the main crate can stay a thin wrapper. Kernels are parallelised with `rayon`.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_gather;
pub mod cpu_matmul;
pub mod cpu_reduce;
pub mod cpu_transpose;

pub use cpu_gather::{cpu_gather_rows, cpu_scatter_add_rows};
pub use cpu_matmul::{cpu_matmul, cpu_matmul_nt};
pub use cpu_reduce::cpu_sum_squares;
pub use cpu_transpose::cpu_transpose;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Row index {index} out of bounds for {rows} rows")]
    IndexOutOfBounds { index: usize, rows: usize },
    #[error("Rank {rank} is below the required {min}")]
    RankTooLow { rank: usize, min: usize },
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors `TensorElem` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}
