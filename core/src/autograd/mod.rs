//! Reverse-mode automatic differentiation over rank-2 tensors.
//!
//! `towerlm` uses a **tape-based**, define-by-run scheme:
//!
//! 1. **Forward pass**: every operation on [`Variable`]s computes its result eagerly and
//!    records a [`GraphNode`] that knows how to push the output gradient back to its inputs.
//! 2. **Backward pass**: [`engine::backward`] orders the recorded nodes topologically and runs
//!    them in reverse, accumulating [`Gradient`]s into the inputs' gradient cells.
//!
//! Gradients are either dense tensors or [`IndexedSlices`]; row lookups into parameter
//! tables produce the sparse form so only touched rows travel to the optimizer.
//!
//! ```rust
//! use towerlm::autograd::{engine::TapeEngine, GradientEngine, Variable};
//! use towerlm::tensor::Tensor;
//!
//! // f(x) = mean(x * x) at x = [1, 2, 3]  ->  df/dx = 2x / 3
//! let x = Variable::new(Tensor::new(vec![1.0f32, 2.0, 3.0], [1, 3]).unwrap());
//! let loss = x.mul(&x).unwrap().mean().unwrap();
//!
//! let grads = TapeEngine.gradients(&loss, &[&x]).unwrap();
//! let dx = grads[0].as_ref().unwrap().to_dense().unwrap();
//! assert!((dx.data()[2] - 2.0).abs() < 1e-6);
//! ```
//!
//! The graph is built from `Rc`/`RefCell` and is therefore confined to the thread that
//! built it; multi-device training builds one tape per device task.

use crate::tensor::{Result, Tensor, TensorElem};
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;

pub mod engine;
pub mod gradient;
pub mod ops;

pub use engine::{GradientEngine, TapeEngine};
pub use gradient::{Gradient, IndexedSlices};

/// Shared slot holding the gradient accumulated for one variable.
pub type GradCell<T> = Rc<RefCell<Option<Gradient<T>>>>;

/// A node in the computation graph.
pub trait GraphNode: Debug {
    /// Reads the output gradient and accumulates the input gradients.
    fn backward(&self) -> Result<()>;
    /// Nodes that produced this node's inputs.
    fn parents(&self) -> Vec<Rc<dyn GraphNode>>;
}

/// A rank-2 value in the computation graph.
///
/// Cloning a `Variable` clones the value but shares the gradient cell and graph node, so
/// clones are the same variable as far as differentiation is concerned.
#[derive(Clone, Debug)]
pub struct Variable<T = f32>
where
    T: TensorElem,
{
    /// The value computed in the forward pass.
    pub data: Tensor<T, 2>,
    /// Gradient of the differentiated scalar with respect to this value.
    pub grad: GradCell<T>,
    /// The operation that produced this variable; `None` for leaves.
    pub node: Option<Rc<dyn GraphNode>>,
}

impl<T> Variable<T>
where
    T: TensorElem + 'static,
{
    /// Creates a leaf variable (a parameter, an input, or a constant).
    pub fn new(data: Tensor<T, 2>) -> Self {
        Self {
            data,
            grad: Rc::new(RefCell::new(None)),
            node: None,
        }
    }

    /// Creates an operation output.
    pub fn with_node(data: Tensor<T, 2>, grad: GradCell<T>, node: Rc<dyn GraphNode>) -> Self {
        Self {
            data,
            grad,
            node: Some(node),
        }
    }

    pub fn shape(&self) -> [usize; 2] {
        *self.data.shape()
    }

    /// Returns a copy of the accumulated gradient, if any.
    pub fn grad(&self) -> Option<Gradient<T>> {
        self.grad.borrow().clone()
    }

    /// Seeds this variable's gradient with ones and runs the backward pass.
    pub fn backward(&self) -> Result<()> {
        if self.grad.borrow().is_none() {
            *self.grad.borrow_mut() = Some(Gradient::Dense(Tensor::ones(self.shape())));
        }
        engine::backward(self.node.clone())
    }
}

/// Adds `grad` into the gradient slot `cell`.
pub(crate) fn accumulate<T: TensorElem>(cell: &GradCell<T>, grad: Gradient<T>) -> Result<()> {
    let mut slot = cell.borrow_mut();
    let next = match slot.take() {
        Some(prev) => prev.accumulate(grad)?,
        None => grad,
    };
    *slot = Some(next);
    Ok(())
}
