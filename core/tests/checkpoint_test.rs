use std::thread;
use std::time::Duration;
use towerlm::checkpoint::{CheckpointLoader, ParameterRestorer, SafetensorsCheckpoint};
use towerlm::data::{StreamBatcher, SyntheticCorpus};
use towerlm::{HParams, LanguageModel, Mode, Placement, Topology};

fn hparams() -> HParams {
    HParams {
        batch_size: 2,
        num_steps: 3,
        num_shards: 2,
        num_layers: 1,
        vocab_size: 20,
        emb_size: 4,
        state_size: 4,
        projected_size: 3,
        num_sampled: 4,
        ..HParams::default()
    }
}

fn trained(steps: usize) -> LanguageModel {
    let hps = hparams();
    let mut model = LanguageModel::new(hps.clone(), Mode::Train, &Placement::default(), &Topology::new(1)).unwrap();
    let streams = (0..hps.batch_size as u64).map(|s| SyntheticCorpus::new(hps.vocab_size, s)).collect();
    let mut data = StreamBatcher::new(streams, hps.num_steps);
    for _ in 0..steps {
        model.step(&data.next().unwrap(), &mut ()).unwrap();
    }
    model
}

#[test]
fn test_training_state_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = SafetensorsCheckpoint::new(dir.path());
    let model = trained(3);
    let path = model.save(&checkpoints).unwrap();
    assert_eq!(checkpoints.latest().unwrap(), Some((3, path.clone())));

    let mut resumed = LanguageModel::new(hparams(), Mode::Train, &Placement::default(), &Topology::new(1)).unwrap();
    assert_eq!(resumed.restore(&checkpoints, &path).unwrap(), 3);
    assert_eq!(resumed.global_step(), 3);

    for (id, param) in model.parameters().iter() {
        assert_eq!(resumed.parameters().value(id), &param.value, "{}", param.name);
    }
    for (id, acc) in model.optimizer().accumulators() {
        assert_eq!(resumed.optimizer().accumulator(id), Some(acc));
    }
    let ema = model.moving_average().unwrap();
    for id in ema.tracked() {
        assert_eq!(resumed.moving_average().unwrap().average(id), ema.average(id));
    }
}

#[test]
fn test_eval_restores_averaged_weights() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = SafetensorsCheckpoint::new(dir.path());
    let model = trained(2);
    model.save(&checkpoints).unwrap();

    let mut eval = LanguageModel::new(hparams(), Mode::Eval, &Placement::default(), &Topology::new(1)).unwrap();
    let mut restorer = ParameterRestorer::new(checkpoints, eval.parameters().clone(), true);
    assert!(towerlm::checkpoint::CheckpointStore::load_latest(&mut restorer).unwrap());
    eval.load_parameters(restorer.parameters()).unwrap();

    let averaged = model.averaged_parameters();
    for (id, param) in averaged.iter() {
        assert_eq!(eval.parameters().value(id), &param.value, "{}", param.name);
    }
    assert_eq!(eval.global_step(), 2);
}

#[test]
fn test_waiter_returns_newer_checkpoints_only() {
    let dir = tempfile::tempdir().unwrap();
    let model = trained(1);
    let template = model.parameters().clone();
    let restorer = ParameterRestorer::new(SafetensorsCheckpoint::new(dir.path()), template, false);
    let mut loader = CheckpointLoader::with_interval(restorer, Duration::from_millis(5));

    let writer_dir = dir.path().to_path_buf();
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let checkpoints = SafetensorsCheckpoint::new(writer_dir);
        model.save(&checkpoints).unwrap();
        model
    });

    assert_eq!(loader.await_new_checkpoint().unwrap(), 1);
    let mut model = writer.join().unwrap();

    // Same step again must not satisfy the waiter; a later save must.
    let writer_dir = dir.path().to_path_buf();
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        model.parameters_mut().set_global_step(4);
        model.save(&SafetensorsCheckpoint::new(writer_dir)).unwrap();
    });
    assert_eq!(loader.await_new_checkpoint().unwrap(), 4);
    writer.join().unwrap();
    assert_eq!(loader.store().parameters().global_step(), 4);
}
