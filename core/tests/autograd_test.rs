use rand::{rngs::StdRng, SeedableRng};
use towerlm::autograd::{GradientEngine, TapeEngine, Variable};
use towerlm::nn::{LstmCell, SoftmaxHead};
use towerlm::params::{ParamId, ParameterStore, Reuse};
use towerlm::tensor;

#[test]
fn test_scalar_autograd() {
    // f(x) = mean(x * x + 3x) at x = [2], f'(x) = 2x + 3 = 7
    let x = Variable::new(tensor!([2.0f32], [1, 1]));
    let y = x.mul(&x).unwrap().add(&x.scale(3.0)).unwrap().mean().unwrap();
    assert_eq!(y.data.data()[0], 10.0);

    let grads = TapeEngine.gradients(&y, &[&x]).unwrap();
    let dx = grads[0].as_ref().unwrap().to_dense().unwrap();
    assert_eq!(dx.data()[0], 7.0);
}

#[test]
fn test_unreachable_parameter_has_no_gradient() {
    let a = Variable::new(tensor!([1.0f32, 2.0], [1, 2]));
    let b = Variable::new(tensor!([3.0f32, 4.0], [1, 2]));
    let loss = a.sigmoid().mean().unwrap();
    let grads = TapeEngine.gradients(&loss, &[&a, &b]).unwrap();
    assert!(grads[0].is_some());
    assert!(grads[1].is_none());
}

/// Unrolls two LSTM steps and a softmax layer, then returns the mean cross-entropy.
fn lstm_loss(leaves: &[Variable<f32>], cell: &LstmCell, head: &SoftmaxHead) -> Variable<f32> {
    let x0 = Variable::new(tensor!([0.5f32, -1.0, 0.25, 1.5], [2, 2]));
    let x1 = Variable::new(tensor!([-0.3f32, 0.8, 1.1, -0.6], [2, 2]));
    let mut state = Variable::new(cell.zero_state(2));
    let mut outputs = Vec::new();
    for x in [&x0, &x1] {
        let (m, next) = cell.step(leaves, x, &state).unwrap();
        outputs.push(m);
        state = next;
    }
    let stacked = Variable::concat_rows(&outputs.iter().collect::<Vec<_>>()).unwrap();
    head.full_loss(leaves, &stacked, &[1, 4, 0, 2]).unwrap().mean().unwrap()
}

fn loss_value(store: &ParameterStore, cell: &LstmCell, head: &SoftmaxHead) -> f64 {
    lstm_loss(&store.leaves(), cell, head).data.data()[0] as f64
}

#[test]
fn test_gradients_match_finite_differences() {
    let mut rng = StdRng::seed_from_u64(21);
    let mut store = ParameterStore::new();
    let cell = LstmCell::new(&mut store, 0, 2, 3, 2, "/cpu:0", Reuse::Create, &mut rng).unwrap();
    let head = SoftmaxHead::new(&mut store, 5, 2, 2, 0, "/cpu:0", Reuse::Create, &mut rng).unwrap();

    let ids: Vec<ParamId> = store.iter().map(|(id, _)| id).collect();
    let leaves = store.leaves();
    let loss = lstm_loss(&leaves, &cell, &head);
    let params: Vec<&Variable<f32>> = ids.iter().map(|&id| &leaves[id]).collect();
    let grads = TapeEngine.gradients(&loss, &params).unwrap();

    let eps = 1e-2f32;
    for (k, &id) in ids.iter().enumerate() {
        let analytic = grads[k].as_ref().unwrap().to_dense().unwrap();
        for i in 0..store.value(id).size() {
            let original = store.value(id).data()[i];
            store.value_mut(id).data_mut()[i] = original + eps;
            let up = loss_value(&store, &cell, &head);
            store.value_mut(id).data_mut()[i] = original - eps;
            let down = loss_value(&store, &cell, &head);
            store.value_mut(id).data_mut()[i] = original;

            let numeric = (up - down) / (2.0 * eps as f64);
            let got = analytic.data()[i] as f64;
            assert!(
                (numeric - got).abs() < 2e-3 + 1e-2 * numeric.abs(),
                "{}[{i}]: analytic {got}, numeric {numeric}",
                store.get(id).name
            );
        }
    }
}
