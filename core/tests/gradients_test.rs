use rand::{rngs::StdRng, Rng, SeedableRng};
use towerlm::autograd::{Gradient, IndexedSlices};
use towerlm::distributed::average_grads;
use towerlm::optim::clip::{clip_by_global_norm, clip_scale, global_norm};
use towerlm::params::GradVar;
use towerlm::tensor::Tensor;

fn random_dense(rng: &mut StdRng, shape: [usize; 2], magnitude: f32) -> Gradient<f32> {
    Gradient::Dense(Tensor::from_fn(shape, || rng.random_range(-magnitude..magnitude)))
}

fn random_sparse(rng: &mut StdRng, rows: usize, len: usize) -> Gradient<f32> {
    let indices = (0..len).map(|_| rng.random_range(0..rows)).collect();
    let values = Tensor::from_fn([len, 3], || rng.random_range(-5.0..5.0));
    Gradient::Sparse(IndexedSlices::new(indices, values, [rows, 3]).unwrap())
}

#[test]
fn test_clipped_norm_is_bounded() {
    let mut rng = StdRng::seed_from_u64(11);
    for trial in 0..50 {
        let magnitude = if trial % 2 == 0 { 0.01 } else { 20.0 };
        let grads = vec![
            Some(random_dense(&mut rng, [4, 8], magnitude)),
            None,
            Some(random_dense(&mut rng, [1, 8], magnitude)),
            Some(random_sparse(&mut rng, 6, 3)),
        ];
        let max_norm = 10.0;
        let (clipped, norm) = clip_by_global_norm(&grads, max_norm);

        assert!((norm - global_norm(&grads)).abs() <= 1e-3 * norm.max(1.0));
        assert!(global_norm(&clipped) <= max_norm * (1.0 + 1e-5));
        assert!(clipped[1].is_none());
        if norm <= max_norm {
            assert_eq!(clipped, grads);
            assert_eq!(clip_scale(norm, max_norm), 1.0);
        } else {
            assert!(clip_scale(norm, max_norm) < 1.0);
        }
    }
}

#[test]
fn test_dense_average_of_identical_grads() {
    let mut rng = StdRng::seed_from_u64(3);
    let g = random_dense(&mut rng, [3, 4], 1.0);
    for towers in 1..=4 {
        let tower_grads: Vec<Vec<GradVar>> = (0..towers)
            .map(|_| vec![GradVar { param: 0, grad: Some(g.clone()) }])
            .collect();
        let averaged = average_grads(&tower_grads).unwrap();
        let got = averaged[0].grad.as_ref().unwrap().to_dense().unwrap();
        let want = g.to_dense().unwrap();
        for (a, b) in got.data().iter().zip(want.data()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}

#[test]
fn test_dense_average_is_order_independent() {
    let mut rng = StdRng::seed_from_u64(5);
    let grads: Vec<Gradient<f32>> = (0..3).map(|_| random_dense(&mut rng, [2, 2], 1.0)).collect();
    let as_towers = |order: &[usize]| -> Vec<Vec<GradVar>> {
        order
            .iter()
            .map(|&i| vec![GradVar { param: 4, grad: Some(grads[i].clone()) }])
            .collect()
    };
    let forward = average_grads(&as_towers(&[0, 1, 2])).unwrap();
    let reversed = average_grads(&as_towers(&[2, 1, 0])).unwrap();
    let a = forward[0].grad.as_ref().unwrap().to_dense().unwrap();
    let b = reversed[0].grad.as_ref().unwrap().to_dense().unwrap();
    for (x, y) in a.data().iter().zip(b.data()) {
        assert!((x - y).abs() < 1e-6);
    }
}

#[test]
fn test_sparse_average_concatenates() {
    let mut rng = StdRng::seed_from_u64(9);
    let lens = [2, 5, 1];
    let tower_grads: Vec<Vec<GradVar>> = lens
        .iter()
        .map(|&len| vec![GradVar { param: 0, grad: Some(random_sparse(&mut rng, 8, len)) }])
        .collect();
    let averaged = average_grads(&tower_grads).unwrap();
    match averaged[0].grad.as_ref().unwrap() {
        Gradient::Sparse(slices) => {
            assert_eq!(slices.len(), lens.iter().sum::<usize>());
            assert_eq!(slices.indices.len(), slices.values.shape()[0]);
        }
        Gradient::Dense(_) => panic!("sparse gradients were densified"),
    }
}

#[test]
fn test_average_rejects_mismatched_towers() {
    let g = Some(Gradient::Dense(Tensor::<f32, 2>::ones([1, 1])));
    let a = vec![GradVar { param: 0, grad: g.clone() }];
    let b = vec![GradVar { param: 1, grad: g.clone() }];
    assert!(average_grads(&[a.clone(), b]).is_err());
    assert!(average_grads(&[a, Vec::new()]).is_err());
}
