//! Crate-level error type.

use crate::tensor::TensorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid hyperparameters, batch shapes, shard layout or device request.
    #[error("configuration error: {0}")]
    Config(String),
    /// An embedding gradient arrived dense; the gradient engine must produce row slices.
    #[error("gradient for embedding parameter `{param}` is dense, expected indexed slices")]
    DenseEmbeddingGradient { param: String },
    /// A checkpoint file is present but unusable.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Safetensors(#[from] safetensors::SafeTensorError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Shorthand for `Err(Error::Config(..))`.
macro_rules! config_err {
    ($($arg:tt)*) => {
        Err($crate::error::Error::Config(format!($($arg)*)))
    };
}
pub(crate) use config_err;
