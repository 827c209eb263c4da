use crate::autograd::{Gradient, IndexedSlices};
use crate::error::{config_err, Result};
use crate::params::GradVar;

/// Averages per-tower gradient lists position by position.
///
/// * Dense gradients are summed and divided by the number of towers.
/// * Sparse gradients are concatenated: indices and values of all towers are kept
///   side by side without merging repeated rows and without dividing by the tower count.
///   The optimizer then adds up duplicate rows, so a sparse row touched on `K` towers
///   receives the sum of their contributions rather than their mean.
/// * When the first tower has no gradient for a parameter, the result has none either.
///
/// All towers must list the same parameters in the same order.
pub fn average_grads(tower_grads: &[Vec<GradVar>]) -> Result<Vec<GradVar>> {
    let Some(first) = tower_grads.first() else {
        return Ok(Vec::new());
    };
    if let Some(bad) = tower_grads.iter().find(|g| g.len() != first.len()) {
        return config_err!(
            "towers produced {} and {} gradients",
            first.len(),
            bad.len()
        );
    }

    (0..first.len())
        .map(|i| {
            let param = first[i].param;
            if tower_grads.iter().any(|t| t[i].param != param) {
                return config_err!("towers disagree on the parameter at position {i}");
            }
            let grad = match &first[i].grad {
                None => None,
                Some(_) => Some(average_one(tower_grads.iter().filter_map(|t| t[i].grad.as_ref()))?),
            };
            Ok(GradVar { param, grad })
        })
        .collect()
}

fn average_one<'a>(grads: impl Iterator<Item = &'a Gradient<f32>>) -> Result<Gradient<f32>> {
    let grads: Vec<&Gradient<f32>> = grads.collect();
    if grads.iter().all(|g| g.is_sparse()) {
        let slices: Vec<&IndexedSlices<f32>> = grads
            .iter()
            .filter_map(|g| match g {
                Gradient::Sparse(s) => Some(s),
                Gradient::Dense(_) => None,
            })
            .collect();
        return Ok(Gradient::Sparse(IndexedSlices::concat(&slices)?));
    }

    let mut total = grads[0].to_dense()?;
    for g in &grads[1..] {
        total.add_assign(&g.to_dense()?)?;
    }
    Ok(Gradient::Dense(total.scale(1.0 / grads.len() as f32)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn dense(param: usize, values: Vec<f32>) -> GradVar {
        let n = values.len();
        GradVar {
            param,
            grad: Some(Gradient::Dense(Tensor::new(values, [1, n]).unwrap())),
        }
    }

    fn sparse(param: usize, indices: Vec<usize>) -> GradVar {
        let n = indices.len();
        let values = Tensor::ones([n, 2]);
        GradVar {
            param,
            grad: Some(Gradient::Sparse(
                IndexedSlices::new(indices, values, [5, 2]).unwrap(),
            )),
        }
    }

    #[test]
    fn test_dense_mean() {
        let avg = average_grads(&[vec![dense(0, vec![1.0, 2.0])], vec![dense(0, vec![3.0, 6.0])]])
            .unwrap();
        let g = avg[0].grad.as_ref().unwrap().to_dense().unwrap();
        assert_eq!(g.data(), &[2.0, 4.0]);
    }

    #[test]
    fn test_sparse_concatenates() {
        let avg = average_grads(&[vec![sparse(1, vec![0, 3])], vec![sparse(1, vec![3])]]).unwrap();
        match &avg[0].grad {
            Some(Gradient::Sparse(s)) => {
                assert_eq!(s.indices, vec![0, 3, 3]);
                assert_eq!(s.values.shape(), &[3, 2]);
            }
            other => panic!("expected sparse, got {:?}", other),
        }
    }

    #[test]
    fn test_none_passthrough_and_mismatch() {
        let none = GradVar { param: 2, grad: None };
        let avg = average_grads(&[vec![none.clone()], vec![none.clone()]]).unwrap();
        assert_eq!(avg, vec![none.clone()]);

        assert!(average_grads(&[vec![none.clone()], vec![]]).is_err());
        assert!(average_grads(&[vec![none], vec![GradVar { param: 3, grad: None }]]).is_err());
    }
}
