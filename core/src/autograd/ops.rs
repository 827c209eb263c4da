//! Differentiable operations on [`Variable`].
//!
//! Each operation computes its value eagerly and records a node holding whatever the
//! backward rule needs (operand values, output values, index maps) plus the operands'
//! gradient cells.

use super::{accumulate, GradCell, Gradient, GraphNode, IndexedSlices, Variable};
use crate::tensor::{Result, Tensor, TensorElem, TensorError, TensorOps};
use num_traits::Float;
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;

/// Reads a node's output gradient as a dense tensor.
fn dense_grad<T: TensorElem>(cell: &GradCell<T>) -> Result<Option<Tensor<T, 2>>> {
    cell.borrow().as_ref().map(Gradient::to_dense).transpose()
}

fn parents_of<T: TensorElem>(vars: &[&Variable<T>]) -> Vec<Rc<dyn GraphNode>> {
    vars.iter().filter_map(|v| v.node.clone()).collect()
}

fn new_cell<T: TensorElem>() -> GradCell<T> {
    Rc::new(RefCell::new(None))
}

fn cast<T: TensorElem>(n: usize) -> Result<T> {
    T::from_usize(n).ok_or_else(|| TensorError::Unsupported(format!("{n} is not representable")))
}

// --- Add / Sub ---

#[derive(Debug)]
struct AddNode<T: TensorElem> {
    lhs_grad: GradCell<T>,
    rhs_grad: GradCell<T>,
    out_grad: GradCell<T>,
    /// `-1` for subtraction.
    rhs_sign: T,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for AddNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = dense_grad(&self.out_grad)? else {
            return Ok(());
        };
        // d(x ± y)/dx = 1, d(x ± y)/dy = ±1
        accumulate(&self.rhs_grad, Gradient::Dense(grad.scale(self.rhs_sign)))?;
        accumulate(&self.lhs_grad, Gradient::Dense(grad))
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Mul ---

#[derive(Debug)]
struct MulNode<T: TensorElem> {
    lhs_data: Tensor<T, 2>,
    rhs_data: Tensor<T, 2>,
    lhs_grad: GradCell<T>,
    rhs_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for MulNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = dense_grad(&self.out_grad)? else {
            return Ok(());
        };
        // d(x*y)/dx = y, d(x*y)/dy = x
        accumulate(&self.lhs_grad, Gradient::Dense((&grad * &self.rhs_data)?))?;
        accumulate(&self.rhs_grad, Gradient::Dense((&grad * &self.lhs_data)?))
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- AddRow (bias broadcast) ---

#[derive(Debug)]
struct AddRowNode<T: TensorElem> {
    input_grad: GradCell<T>,
    bias_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for AddRowNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = dense_grad(&self.out_grad)? else {
            return Ok(());
        };
        accumulate(&self.bias_grad, Gradient::Dense(grad.sum_rows()))?;
        accumulate(&self.input_grad, Gradient::Dense(grad))
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Scale / AddScalar ---

#[derive(Debug)]
struct AffineNode<T: TensorElem> {
    /// Output is `factor * x + offset`; only the factor matters for the gradient.
    factor: T,
    input_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for AffineNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = dense_grad(&self.out_grad)? else {
            return Ok(());
        };
        accumulate(&self.input_grad, Gradient::Dense(grad.scale(self.factor)))
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- MatMul ---

#[derive(Debug)]
struct MatMulNode<T: TensorElem> {
    lhs_data: Tensor<T, 2>,
    rhs_data: Tensor<T, 2>,
    lhs_grad: GradCell<T>,
    rhs_grad: GradCell<T>,
    out_grad: GradCell<T>,
    /// `true` when the forward pass computed `lhs · rhsᵀ`.
    rhs_transposed: bool,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for MatMulNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = dense_grad(&self.out_grad)? else {
            return Ok(());
        };
        if self.rhs_transposed {
            // C = A · Bᵀ  ->  dA = G · B, dB = Gᵀ · A
            accumulate(&self.lhs_grad, Gradient::Dense(grad.matmul(&self.rhs_data)?))?;
            let grad_t = grad.transpose()?;
            accumulate(&self.rhs_grad, Gradient::Dense(grad_t.matmul(&self.lhs_data)?))
        } else {
            // C = A · B  ->  dA = G · Bᵀ, dB = Aᵀ · G
            accumulate(
                &self.lhs_grad,
                Gradient::Dense(grad.matmul_nt(&self.rhs_data)?),
            )?;
            let lhs_t = self.lhs_data.transpose()?;
            accumulate(&self.rhs_grad, Gradient::Dense(lhs_t.matmul(&grad)?))
        }
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Transpose ---

#[derive(Debug)]
struct TransposeNode<T: TensorElem> {
    input_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for TransposeNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = dense_grad(&self.out_grad)? else {
            return Ok(());
        };
        accumulate(&self.input_grad, Gradient::Dense(grad.transpose()?))
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Sigmoid / Tanh ---

#[derive(Debug, Clone, Copy)]
enum Activation {
    Sigmoid,
    Tanh,
}

#[derive(Debug)]
struct ActivationNode<T: TensorElem> {
    kind: Activation,
    out_data: Tensor<T, 2>,
    input_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem + Float> GraphNode for ActivationNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = dense_grad(&self.out_grad)? else {
            return Ok(());
        };
        let local = match self.kind {
            // σ' = σ (1 - σ)
            Activation::Sigmoid => self.out_data.map(|s| s * (T::one() - s)),
            // tanh' = 1 - tanh²
            Activation::Tanh => self.out_data.map(|t| T::one() - t * t),
        };
        accumulate(&self.input_grad, Gradient::Dense((&grad * &local)?))
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Slice / Concat ---

#[derive(Debug, Clone, Copy, PartialEq)]
enum Axis {
    Rows,
    Cols,
}

#[derive(Debug)]
struct SliceNode<T: TensorElem> {
    axis: Axis,
    start: usize,
    input_shape: [usize; 2],
    input_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for SliceNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = dense_grad(&self.out_grad)? else {
            return Ok(());
        };
        let [rows, cols] = self.input_shape;
        let padded = match self.axis {
            Axis::Rows => {
                let before = Tensor::zeros([self.start, cols]);
                let after = Tensor::zeros([rows - self.start - grad.rows(), cols]);
                Tensor::concat_rows(&[&before, &grad, &after])?
            }
            Axis::Cols => {
                let before = Tensor::zeros([rows, self.start]);
                let after = Tensor::zeros([rows, cols - self.start - grad.cols()]);
                Tensor::concat_cols(&[&before, &grad, &after])?
            }
        };
        accumulate(&self.input_grad, Gradient::Dense(padded))
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

#[derive(Debug)]
struct ConcatNode<T: TensorElem> {
    axis: Axis,
    /// Extent of each input along `axis`.
    extents: Vec<usize>,
    input_grads: Vec<GradCell<T>>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for ConcatNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = dense_grad(&self.out_grad)? else {
            return Ok(());
        };
        let mut offset = 0;
        for (cell, &extent) in self.input_grads.iter().zip(&self.extents) {
            let piece = match self.axis {
                Axis::Rows => grad.slice_rows(offset, offset + extent)?,
                Axis::Cols => grad.slice_cols(offset, offset + extent)?,
            };
            accumulate(cell, Gradient::Dense(piece))?;
            offset += extent;
        }
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Reductions ---

#[derive(Debug)]
struct SumColsNode<T: TensorElem> {
    input_shape: [usize; 2],
    input_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for SumColsNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = dense_grad(&self.out_grad)? else {
            return Ok(());
        };
        let [rows, cols] = self.input_shape;
        let mut data = Vec::with_capacity(rows * cols);
        for &g in grad.data() {
            data.extend(std::iter::repeat_n(g, cols));
        }
        accumulate(&self.input_grad, Gradient::Dense(Tensor::new(data, [rows, cols])?))
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

#[derive(Debug)]
struct MeanNode<T: TensorElem> {
    input_shape: [usize; 2],
    input_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for MeanNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = dense_grad(&self.out_grad)? else {
            return Ok(());
        };
        let count: T = cast(self.input_shape[0] * self.input_shape[1])?;
        let share = grad.data()[0] / count;
        accumulate(
            &self.input_grad,
            Gradient::Dense(Tensor::full(self.input_shape, share)),
        )
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Gather over sharded tables ---

#[derive(Debug)]
struct GatherNode<T: TensorElem> {
    /// For each table: positions in the output and the table-local row of each.
    routes: Vec<(Vec<usize>, Vec<usize>)>,
    table_shapes: Vec<[usize; 2]>,
    table_grads: Vec<GradCell<T>>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for GatherNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = dense_grad(&self.out_grad)? else {
            return Ok(());
        };
        // Every table receives a (possibly empty) sparse gradient.
        for (((positions, local), shape), cell) in self
            .routes
            .iter()
            .zip(&self.table_shapes)
            .zip(&self.table_grads)
        {
            let values = grad.gather_rows(positions)?;
            let slices = IndexedSlices::new(local.clone(), values, *shape)?;
            accumulate(cell, Gradient::Sparse(slices))?;
        }
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Softmax cross-entropy ---

#[derive(Debug)]
struct SoftmaxCrossEntropyNode<T: TensorElem> {
    probs: Tensor<T, 2>,
    labels: Vec<usize>,
    logits_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for SoftmaxCrossEntropyNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = dense_grad(&self.out_grad)? else {
            return Ok(());
        };
        // dL/dlogits = (softmax - onehot(label)) * upstream row gradient
        let mut local = self.probs.clone();
        let cols = local.cols();
        for (r, &label) in self.labels.iter().enumerate() {
            let g = grad.data()[r];
            let row = &mut local.data_mut()[r * cols..(r + 1) * cols];
            row[label] -= T::one();
            for x in row.iter_mut() {
                *x *= g;
            }
        }
        accumulate(&self.logits_grad, Gradient::Dense(local))
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

impl<T> Variable<T>
where
    T: TensorElem + Float + 'static,
{
    fn add_signed(&self, rhs: &Self, rhs_sign: T) -> Result<Self> {
        let data = if rhs_sign < T::zero() {
            (&self.data - &rhs.data)?
        } else {
            (&self.data + &rhs.data)?
        };
        let out_grad = new_cell();
        let node = Rc::new(AddNode {
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            rhs_sign,
            parents: parents_of(&[self, rhs]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Element-wise `self + rhs`.
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.add_signed(rhs, T::one())
    }

    /// Element-wise `self - rhs`.
    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.add_signed(rhs, -T::one())
    }

    /// Element-wise `self * rhs`.
    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        let data = (&self.data * &rhs.data)?;
        let out_grad = new_cell();
        let node = Rc::new(MulNode {
            lhs_data: self.data.clone(),
            rhs_data: rhs.data.clone(),
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self, rhs]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Adds the `[1, cols]` row `bias` to every row.
    pub fn add_row(&self, bias: &Self) -> Result<Self> {
        let data = self.data.add_row(&bias.data)?;
        let out_grad = new_cell();
        let node = Rc::new(AddRowNode {
            input_grad: self.grad.clone(),
            bias_grad: bias.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self, bias]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    fn affine(&self, factor: T, offset: T) -> Self {
        let data = self.data.map(|x| x * factor + offset);
        let out_grad = new_cell();
        let node = Rc::new(AffineNode {
            factor,
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self]),
        });
        Variable::with_node(data, out_grad, node)
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&self, factor: T) -> Self {
        self.affine(factor, T::zero())
    }

    /// Adds the constant `offset` to every element.
    pub fn add_scalar(&self, offset: T) -> Self {
        self.affine(T::one(), offset)
    }

    fn matmul_impl(&self, rhs: &Self, rhs_transposed: bool) -> Result<Self> {
        let data = if rhs_transposed {
            self.data.matmul_nt(&rhs.data)?
        } else {
            self.data.matmul(&rhs.data)?
        };
        let out_grad = new_cell();
        let node = Rc::new(MatMulNode {
            lhs_data: self.data.clone(),
            rhs_data: rhs.data.clone(),
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            rhs_transposed,
            parents: parents_of(&[self, rhs]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// `[M, K] · [K, N] -> [M, N]`.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        self.matmul_impl(rhs, false)
    }

    /// `[M, K] · [N, K]ᵀ -> [M, N]`.
    pub fn matmul_nt(&self, rhs: &Self) -> Result<Self> {
        self.matmul_impl(rhs, true)
    }

    pub fn transpose(&self) -> Result<Self> {
        let data = self.data.transpose()?;
        let out_grad = new_cell();
        let node = Rc::new(TransposeNode {
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    fn activation(&self, kind: Activation) -> Self {
        let data = match kind {
            Activation::Sigmoid => self.data.map(|x| T::one() / (T::one() + (-x).exp())),
            Activation::Tanh => self.data.map(Float::tanh),
        };
        let out_grad = new_cell();
        let node = Rc::new(ActivationNode {
            kind,
            out_data: data.clone(),
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self]),
        });
        Variable::with_node(data, out_grad, node)
    }

    pub fn sigmoid(&self) -> Self {
        self.activation(Activation::Sigmoid)
    }

    pub fn tanh(&self) -> Self {
        self.activation(Activation::Tanh)
    }

    fn slice(&self, axis: Axis, start: usize, end: usize) -> Result<Self> {
        let data = match axis {
            Axis::Rows => self.data.slice_rows(start, end)?,
            Axis::Cols => self.data.slice_cols(start, end)?,
        };
        let out_grad = new_cell();
        let node = Rc::new(SliceNode {
            axis,
            start,
            input_shape: self.shape(),
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Rows `[start, end)`.
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Self> {
        self.slice(Axis::Rows, start, end)
    }

    /// Columns `[start, end)`.
    pub fn slice_cols(&self, start: usize, end: usize) -> Result<Self> {
        self.slice(Axis::Cols, start, end)
    }

    fn concat(parts: &[&Self], axis: Axis) -> Result<Self> {
        let tensors: Vec<&Tensor<T, 2>> = parts.iter().map(|p| &p.data).collect();
        let (data, extents) = match axis {
            Axis::Rows => (
                Tensor::concat_rows(&tensors)?,
                parts.iter().map(|p| p.shape()[0]).collect(),
            ),
            Axis::Cols => (
                Tensor::concat_cols(&tensors)?,
                parts.iter().map(|p| p.shape()[1]).collect(),
            ),
        };
        let out_grad = new_cell();
        let node = Rc::new(ConcatNode {
            axis,
            extents,
            input_grads: parts.iter().map(|p| p.grad.clone()).collect(),
            out_grad: out_grad.clone(),
            parents: parents_of(parts),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Stacks variables with equal widths vertically.
    pub fn concat_rows(parts: &[&Self]) -> Result<Self> {
        Self::concat(parts, Axis::Rows)
    }

    /// Joins variables with equal heights side by side.
    pub fn concat_cols(parts: &[&Self]) -> Result<Self> {
        Self::concat(parts, Axis::Cols)
    }

    /// Per-row sums, `[n, k] -> [n, 1]`.
    pub fn sum_cols(&self) -> Result<Self> {
        let [rows, cols] = self.shape();
        let data: Vec<T> = (0..rows)
            .map(|r| {
                self.data
                    .row(r)
                    .iter()
                    .fold(T::zero(), |acc, &x| acc + x)
            })
            .collect();
        let out_grad = new_cell();
        let node = Rc::new(SumColsNode {
            input_shape: [rows, cols],
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self]),
        });
        Ok(Variable::with_node(Tensor::new(data, [rows, 1])?, out_grad, node))
    }

    /// Mean of all elements as a `[1, 1]` variable.
    pub fn mean(&self) -> Result<Self> {
        let count: T = cast(self.data.size())?;
        let data = Tensor::new(vec![self.data.sum() / count], [1, 1])?;
        let out_grad = new_cell();
        let node = Rc::new(MeanNode {
            input_shape: self.shape(),
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Looks up rows of a row-partitioned table.
    ///
    /// Logical row `id` lives in `tables[id / shard_rows]` at local row `id % shard_rows`.
    /// Output rows follow the order of `ids`. Each table receives a sparse gradient holding
    /// its local row indices.
    pub fn gather(tables: &[&Self], shard_rows: usize, ids: &[usize]) -> Result<Self> {
        let Some(first) = tables.first() else {
            return Err(TensorError::Unsupported("gather from zero tables".into()));
        };
        let cols = first.shape()[1];
        let mut routes: Vec<(Vec<usize>, Vec<usize>)> = vec![(Vec::new(), Vec::new()); tables.len()];
        let mut data = Vec::with_capacity(ids.len() * cols);

        for (pos, &id) in ids.iter().enumerate() {
            let (shard, local) = match shard_rows {
                0 => (tables.len(), 0),
                n => (id / n, id % n),
            };
            let Some(table) = tables.get(shard).filter(|t| local < t.shape()[0]) else {
                return Err(TensorError::IndexOutOfBounds {
                    index: vec![id],
                    shape: vec![shard_rows * tables.len(), cols],
                });
            };
            data.extend_from_slice(table.data.row(local));
            routes[shard].0.push(pos);
            routes[shard].1.push(local);
        }

        let out_grad = new_cell();
        let node = Rc::new(GatherNode {
            routes,
            table_shapes: tables.iter().map(|t| t.shape()).collect(),
            table_grads: tables.iter().map(|t| t.grad.clone()).collect(),
            out_grad: out_grad.clone(),
            parents: parents_of(tables),
        });
        Ok(Variable::with_node(
            Tensor::new(data, [ids.len(), cols])?,
            out_grad,
            node,
        ))
    }

    /// Per-row softmax cross-entropy of logits `[n, classes]` against integer labels,
    /// returned as `[n, 1]`.
    pub fn softmax_cross_entropy(&self, labels: &[usize]) -> Result<Self> {
        let [rows, classes] = self.shape();
        if labels.len() != rows {
            return Err(TensorError::ShapeMismatch {
                expected: vec![rows],
                got: vec![labels.len()],
            });
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= classes) {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![bad],
                shape: vec![classes],
            });
        }

        let mut probs = self.data.clone();
        let mut losses = Vec::with_capacity(rows);
        for (r, &label) in labels.iter().enumerate() {
            let row = &mut probs.data_mut()[r * classes..(r + 1) * classes];
            let max = row.iter().copied().fold(T::neg_infinity(), Float::max);
            let mut total = T::zero();
            for x in row.iter_mut() {
                *x = (*x - max).exp();
                total += *x;
            }
            for x in row.iter_mut() {
                *x /= total;
            }
            // -log softmax(label) = logsumexp - logit[label]
            losses.push(total.ln() + max - self.data.row(r)[label]);
        }

        let out_grad = new_cell();
        let node = Rc::new(SoftmaxCrossEntropyNode {
            probs,
            labels: labels.to_vec(),
            logits_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self]),
        });
        Ok(Variable::with_node(
            Tensor::new(losses, [rows, 1])?,
            out_grad,
            node,
        ))
    }
}
