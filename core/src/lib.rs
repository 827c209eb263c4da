//! # towerlm
//!
//! Data-parallel training of a word-level language model built from stacked LSTM cells
//! with projection layers, a sharded embedding table and a sharded (optionally sampled)
//! softmax output layer.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: dense rank-N tensors on the CPU.
//! - [`autograd`]: tape-based reverse-mode differentiation with sparse row gradients.
//! - [`params`]: the named parameter registry shared by every device.
//! - [`nn`]: sharded tables, the projected LSTM cell, dropout and the softmax layer.
//! - [`model`]: hyperparameters, the per-device tower and the multi-device coordinator.
//! - [`distributed`]: device placement and cross-device gradient averaging.
//! - [`optim`]: Adagrad, global-norm clipping and the moving average of weights.
//! - [`checkpoint`]: `safetensors` checkpoints and the evaluation-side waiter.
//! - [`data`]: cutting token streams into consecutive batches.
//!
//! ## Example
//!
//! ```rust
//! use towerlm::{Batch, HParams, LanguageModel, Mode, Placement, Tensor, Topology};
//!
//! let hps = HParams::default()
//!     .parse("vocab_size=10,num_shards=1,num_layers=1,batch_size=2,num_steps=2,\
//!             emb_size=4,state_size=4,projected_size=4,num_sampled=0")
//!     .unwrap();
//! let mut model = LanguageModel::new(hps, Mode::Train, &Placement::default(), &Topology::new(1)).unwrap();
//!
//! let x = Tensor::new(vec![1, 2, 3, 4], [2, 2]).unwrap();
//! let y = Tensor::new(vec![2, 3, 4, 5], [2, 2]).unwrap();
//! let batch = Batch::new(x, y, Tensor::ones([2, 2])).unwrap();
//! let out = model.step(&batch, &mut ()).unwrap();
//! assert_eq!(out.global_step, 1);
//! ```

/// Macro for creating a Tensor with compile-time shape checking.
///
/// # Examples
///
/// ```rust
/// use towerlm::tensor;
/// use towerlm::tensor::Tensor;
///
/// // Works
/// let t = tensor!([1.0, 2.0, 3.0, 4.0], [2, 2]);
///
/// // Fails to compile:
/// // let t = tensor!([1.0, 2.0, 3.0], [2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($data:expr, $shape:expr) => {{
        // Constants to force compile-time evaluation
        const DATA_LEN: usize = (&$data as &[_]).len();
        const SHAPE: [usize; (&$shape as &[_]).len()] = $shape;
        const EXPECTED_SIZE: usize = {
            let mut size = 1;
            let mut i = 0;
            while i < (&SHAPE as &[_]).len() {
                size *= SHAPE[i];
                i += 1;
            }
            size
        };

        // This assertion triggers a compile-time error if false
        const _: () = assert!(
            DATA_LEN == EXPECTED_SIZE,
            "Shape mismatch: data length does not match shape product"
        );

        // Safe to unwrap because we checked at compile time
        $crate::tensor::Tensor::new($data.to_vec(), $shape).unwrap()
    }};
}

pub mod autograd;
pub mod checkpoint;
pub mod data;
pub mod distributed;
pub mod error;
pub mod model;
pub mod nn;
pub mod optim;
pub mod params;
pub mod summary;
pub mod tensor;

pub use autograd::Variable;
pub use distributed::{Placement, Topology};
pub use error::{Error, Result};
pub use model::{Batch, HParams, LanguageModel, Mode, StepOutput};
pub use params::{ParameterStore, Role};
pub use tensor::{Cpu, Device, Storage, Tensor, TensorElem, TensorError, TensorOps};
