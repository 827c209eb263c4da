//! Backward traversal and the gradient-engine seam.

use super::{Gradient, GraphNode, Variable};
use crate::tensor::{Result, TensorElem, TensorError};
use std::collections::HashSet;
use std::rc::Rc;

/// Computes gradients of a scalar loss with respect to a list of parameters.
///
/// The training code only relies on this contract; how the derivatives are obtained is
/// up to the implementation. Parameters that do not influence the loss get `None`.
pub trait GradientEngine<T: TensorElem> {
    fn gradients(
        &self,
        loss: &Variable<T>,
        params: &[&Variable<T>],
    ) -> Result<Vec<Option<Gradient<T>>>>;
}

/// [`GradientEngine`] backed by the define-by-run tape in this module.
#[derive(Clone, Copy, Debug, Default)]
pub struct TapeEngine;

impl<T: TensorElem + 'static> GradientEngine<T> for TapeEngine {
    fn gradients(
        &self,
        loss: &Variable<T>,
        params: &[&Variable<T>],
    ) -> Result<Vec<Option<Gradient<T>>>> {
        if loss.shape() != [1, 1] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![1, 1],
                got: loss.shape().to_vec(),
            });
        }
        loss.backward()?;
        Ok(params.iter().map(|p| p.grad.borrow_mut().take()).collect())
    }
}

/// Runs every node reachable from `root` in reverse topological order.
pub fn backward(root: Option<Rc<dyn GraphNode>>) -> Result<()> {
    let Some(root) = root else { return Ok(()) };

    for node in topo_order(root).into_iter().rev() {
        node.backward()?;
    }
    Ok(())
}

/// Post-order DFS over parents, iterative so long unrolls do not exhaust the stack.
fn topo_order(root: Rc<dyn GraphNode>) -> Vec<Rc<dyn GraphNode>> {
    let mut topo = Vec::new();
    let mut visited: HashSet<*const ()> = HashSet::new();
    // (node, parents already expanded)
    let mut stack: Vec<(Rc<dyn GraphNode>, bool)> = vec![(root, false)];

    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            topo.push(node);
            continue;
        }
        let ptr = Rc::as_ptr(&node) as *const ();
        if !visited.insert(ptr) {
            continue;
        }
        let parents = node.parents();
        stack.push((node, true));
        for parent in parents {
            if !visited.contains(&(Rc::as_ptr(&parent) as *const ())) {
                stack.push((parent, false));
            }
        }
    }
    topo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn test_unreachable_parameter_gets_none() {
        let x = Variable::new(Tensor::new(vec![2.0f32], [1, 1]).unwrap());
        let unused = Variable::new(Tensor::new(vec![5.0f32], [1, 1]).unwrap());
        let loss = x.mul(&x).unwrap();

        let grads = TapeEngine.gradients(&loss, &[&x, &unused]).unwrap();
        assert_eq!(grads[0].as_ref().unwrap().to_dense().unwrap().data(), &[4.0]);
        assert!(grads[1].is_none());
    }

    #[test]
    fn test_diamond_graph_visits_shared_node_once() {
        // y = x + x; loss = y * y  ->  d/dx = 2 * (2x) * 2 = 8x
        let x = Variable::new(Tensor::new(vec![1.5f32], [1, 1]).unwrap());
        let y = x.add(&x).unwrap();
        let loss = y.mul(&y).unwrap();

        let grads = TapeEngine.gradients(&loss, &[&x]).unwrap();
        assert_eq!(grads[0].as_ref().unwrap().to_dense().unwrap().data(), &[12.0]);
    }

    #[test]
    fn test_non_scalar_loss_rejected() {
        let x = Variable::new(Tensor::<f32, 2>::zeros([2, 1]));
        assert!(TapeEngine.gradients(&x, &[&x]).is_err());
    }
}
