//! Trains the language model on synthetic text, or evaluates the checkpoints a training
//! job writes.
//!
//! ## Usage
//!
//! ```sh
//! towerlm-train --logdir /tmp/lm --hparams "vocab_size=1000,num_sampled=64,state_size=64"
//! towerlm-train --mode eval --logdir /tmp/lm --hparams "vocab_size=1000,num_sampled=64,state_size=64"
//! ```

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use towerlm::checkpoint::{CheckpointLoader, ParameterRestorer, SafetensorsCheckpoint};
use towerlm::data::{StreamBatcher, SyntheticCorpus};
use towerlm::distributed::{Placement, Topology};
use towerlm::model::{Batch, HParams, LanguageModel, Mode};
use towerlm::summary::{SummarySink, TracingSink};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum RunMode {
    Train,
    Eval,
}

#[derive(Parser, Debug)]
#[command(name = "towerlm-train")]
#[command(about = "Multi-device training of a sharded projected-LSTM language model")]
struct Args {
    #[arg(long, value_enum, default_value_t = RunMode::Train)]
    mode: RunMode,

    /// Checkpoint directory.
    #[arg(long)]
    logdir: PathBuf,

    /// Hyperparameter overrides, e.g. "batch_size=32,num_gpus=2".
    #[arg(long, default_value = "")]
    hparams: String,

    /// Training steps to run, or batches per evaluation.
    #[arg(long, default_value_t = 100)]
    num_iterations: u64,

    /// Save a checkpoint every this many training steps.
    #[arg(long, default_value_t = 50)]
    save_every: u64,

    /// Worker index; worker `t` starts once the global step reaches `t * num_delayed_steps`.
    #[arg(long, default_value_t = 0)]
    task: u64,

    /// Seconds between two looks at the checkpoint directory.
    #[arg(long, default_value_t = 60)]
    poll_secs: u64,

    /// Evaluate a single checkpoint and exit.
    #[arg(long)]
    once: bool,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))
}

/// One synthetic text stream per batch row.
fn batches(hps: &HParams, seed: u64) -> StreamBatcher<SyntheticCorpus> {
    let rows = hps.batch_size * hps.num_gpus;
    let streams = (0..rows as u64)
        .map(|row| SyntheticCorpus::new(hps.vocab_size, seed.wrapping_add(row)))
        .collect();
    StreamBatcher::new(streams, hps.num_steps)
}

fn next_batch(batches: &mut StreamBatcher<SyntheticCorpus>) -> anyhow::Result<Batch> {
    batches.next().context("synthetic corpus ended")
}

fn wait_for_turn(checkpoints: &SafetensorsCheckpoint, target: u64, poll: Duration) -> anyhow::Result<()> {
    loop {
        let step = checkpoints.latest()?.map_or(0, |(step, _)| step);
        if step >= target {
            return Ok(());
        }
        tracing::info!(step, target, "delaying worker start");
        std::thread::sleep(poll);
    }
}

fn train(args: &Args, hps: HParams) -> anyhow::Result<()> {
    let checkpoints = SafetensorsCheckpoint::new(&args.logdir);
    let poll = Duration::from_secs(args.poll_secs);
    if args.task > 0 {
        wait_for_turn(&checkpoints, args.task * hps.num_delayed_steps, poll)?;
    }

    let mut model = LanguageModel::new(hps.clone(), Mode::Train, &Placement::default(), &Topology::detect())?;
    if let Some((step, path)) = checkpoints.latest()? {
        model.restore(&checkpoints, &path)?;
        tracing::info!(step, "resumed training");
    }

    let mut data = batches(&hps, hps.seed.wrapping_add(args.task << 32));
    let mut sink = TracingSink;
    for _ in 0..args.num_iterations {
        let out = model.step(&next_batch(&mut data)?, &mut sink)?;
        if args.save_every > 0 && out.global_step % args.save_every == 0 {
            model.save(&checkpoints)?;
        }
    }
    model.save(&checkpoints)?;
    Ok(())
}

fn evaluate(args: &Args, hps: HParams) -> anyhow::Result<()> {
    let mut model = LanguageModel::new(hps.clone(), Mode::Eval, &Placement::default(), &Topology::detect())?;
    let restorer = ParameterRestorer::new(
        SafetensorsCheckpoint::new(&args.logdir),
        model.parameters().clone(),
        hps.average_params,
    );
    let mut loader = CheckpointLoader::with_interval(restorer, Duration::from_secs(args.poll_secs));
    let mut sink = TracingSink;

    loop {
        let step = loader.await_new_checkpoint()?;
        model.load_parameters(loader.store().parameters())?;
        model.reset_states();

        let mut data = batches(&hps, hps.seed.wrapping_add(u64::MAX / 2));
        let mut total = 0.0;
        for _ in 0..args.num_iterations {
            total += model.step(&next_batch(&mut data)?, &mut ())?.loss;
        }
        let loss = total / args.num_iterations.max(1) as f32;
        sink.scalar("eval/loss", loss, step);
        tracing::info!(step, loss, perplexity = loss.exp(), "evaluated checkpoint");

        if args.once {
            return Ok(());
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let hps = HParams::default()
        .parse(&args.hparams)
        .context("invalid --hparams")?;
    tracing::info!(hparams = %hps.to_json()?, "starting");

    match args.mode {
        RunMode::Train => train(&args, hps),
        RunMode::Eval => evaluate(&args, hps),
    }
}
