use rand::{rngs::StdRng, SeedableRng};
use towerlm::nn::sharded::{shard_rows, ShardedParameter};
use towerlm::params::{ParameterStore, Reuse, Role};
use towerlm::tensor::Tensor;

fn sharded(rows: usize, cols: usize, num_shards: usize) -> (ParameterStore, ShardedParameter) {
    let mut rng = StdRng::seed_from_u64(7);
    let mut store = ParameterStore::new();
    let param = ShardedParameter::new(
        &mut store,
        "softmax_w",
        [rows, cols],
        num_shards,
        Role::Softmax,
        "/cpu:0",
        Reuse::Create,
        &mut rng,
    )
    .unwrap();
    (store, param)
}

#[test]
fn test_concat_reproduces_reference_rows() {
    for num_shards in 1..=6 {
        for rows in 1..=13 {
            let cols = 3;
            let (mut store, param) = sharded(rows, cols, num_shards);
            assert_eq!(param.shards.len(), num_shards);

            // Overwrite every shard so that logical row r holds r in each column.
            for (i, &id) in param.shards.iter().enumerate() {
                let shard_rows = param.shard_rows;
                *store.value_mut(id) = Tensor::from_fn([shard_rows, cols], {
                    let mut k = 0;
                    move || {
                        let v = (i * shard_rows + k / cols) as f32;
                        k += 1;
                        v
                    }
                });
            }

            let full = param.concat(&store).unwrap();
            assert_eq!(full.shape(), &[rows, cols], "rows={rows} shards={num_shards}");
            let reference = Tensor::from_fn([rows, cols], {
                let mut k = 0;
                move || {
                    let v = (k / cols) as f32;
                    k += 1;
                    v
                }
            });
            assert_eq!(full, reference, "rows={rows} shards={num_shards}");
        }
    }
}

#[test]
fn test_locate_matches_layout() {
    let (_, param) = sharded(10, 2, 3);
    assert_eq!(param.shard_rows, 4);
    assert_eq!(param.locate(0), (0, 0));
    assert_eq!(param.locate(5), (1, 1));
    assert_eq!(param.locate(9), (2, 1));
}

#[test]
fn test_lookup_matches_concat() {
    let (store, param) = sharded(11, 4, 3);
    let leaves = store.leaves();
    let ids = [10, 0, 4, 4, 7];
    let rows = param.lookup(&leaves, &ids).unwrap();
    let full = param.concat(&store).unwrap();
    for (i, &id) in ids.iter().enumerate() {
        assert_eq!(rows.data.row(i), full.row(id));
    }
    assert!(param.lookup(&leaves, &[11]).is_err());
}

#[test]
fn test_degenerate_layouts_rejected() {
    assert!(shard_rows(10, 0).is_err());
    assert!(shard_rows(0, 2).is_err());
    assert_eq!(shard_rows(10, 4).unwrap(), 3);
}

#[test]
fn test_shards_created_once() {
    let (mut store, _) = sharded(6, 2, 2);
    let mut rng = StdRng::seed_from_u64(0);
    let again = ShardedParameter::new(
        &mut store,
        "softmax_w",
        [6, 2],
        2,
        Role::Softmax,
        "/cpu:0",
        Reuse::Create,
        &mut rng,
    );
    assert!(again.is_err());
    let shared = ShardedParameter::new(
        &mut store,
        "softmax_w",
        [6, 2],
        2,
        Role::Softmax,
        "/cpu:0",
        Reuse::Share,
        &mut rng,
    )
    .unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(shared.shards, vec![0, 1]);
}
