//! Hyperparameters.
//!
//! Defaults describe the 2048-unit LSTM with 512-wide projections used for the
//! one-billion-word benchmark. Overrides come as a comma-separated `key=value` list
//! (`"batch_size=64,num_gpus=2"`) or as JSON.

use crate::error::{config_err, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HParams {
    /// Rows per device.
    pub batch_size: usize,
    /// Unrolled timesteps per batch.
    pub num_steps: usize,
    /// Row partitions of the embedding and softmax matrices.
    pub num_shards: usize,
    pub num_layers: usize,
    pub learning_rate: f32,
    /// Global-norm bound for recurrent-layer gradients.
    pub max_grad_norm: f32,
    /// Steps worker `task` waits per task index before joining training.
    pub num_delayed_steps: u64,
    /// Dropout keep probability; 1 disables dropout.
    pub keep_prob: f32,
    pub vocab_size: usize,
    pub emb_size: usize,
    pub state_size: usize,
    pub projected_size: usize,
    /// Negative classes for the sampled softmax; 0 selects the full softmax.
    pub num_sampled: usize,
    pub num_gpus: usize,
    /// Keep an exponential moving average of the recurrent weights.
    pub average_params: bool,
    /// Log per-phase timings of every step.
    pub run_profiler: bool,
    /// Seed for initialisation, dropout and candidate sampling.
    pub seed: u64,
}

impl Default for HParams {
    fn default() -> Self {
        Self {
            batch_size: 128,
            num_steps: 20,
            num_shards: 8,
            num_layers: 3,
            learning_rate: 0.2,
            max_grad_norm: 10.0,
            num_delayed_steps: 150,
            keep_prob: 0.9,
            vocab_size: 793_470,
            emb_size: 512,
            state_size: 2048,
            projected_size: 512,
            num_sampled: 8192,
            num_gpus: 1,
            average_params: true,
            run_profiler: false,
            seed: 0,
        }
    }
}

impl HParams {
    /// Applies `key=value` overrides on top of `self`.
    ///
    /// Unknown keys and values that do not parse as the field's type are errors.
    pub fn parse(&self, overrides: &str) -> Result<Self> {
        let mut value = serde_json::to_value(self)?;
        let Value::Object(fields) = &mut value else {
            return config_err!("hyperparameters must serialize to an object");
        };

        for pair in overrides.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, raw)) = pair.split_once('=') else {
                return config_err!("expected key=value, got `{pair}`");
            };
            let (key, raw) = (key.trim(), raw.trim());
            let Some(slot) = fields.get_mut(key) else {
                return config_err!("unknown hyperparameter `{key}`");
            };
            *slot = parse_like(slot, raw)
                .ok_or_else(|| Error::Config(format!("bad value `{raw}` for `{key}`")))?;
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("num_steps", self.num_steps),
            ("num_shards", self.num_shards),
            ("num_layers", self.num_layers),
            ("vocab_size", self.vocab_size),
            ("emb_size", self.emb_size),
            ("state_size", self.state_size),
            ("projected_size", self.projected_size),
            ("num_gpus", self.num_gpus),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return config_err!("{name} must be positive");
        }
        if !(self.keep_prob > 0.0 && self.keep_prob <= 1.0) {
            return config_err!("keep_prob must be in (0, 1], got {}", self.keep_prob);
        }
        if !(self.learning_rate > 0.0) || !(self.max_grad_norm > 0.0) {
            return config_err!("learning_rate and max_grad_norm must be positive");
        }
        if self.num_sampled >= self.vocab_size {
            return config_err!(
                "num_sampled ({}) must be smaller than vocab_size ({})",
                self.num_sampled,
                self.vocab_size
            );
        }
        if self.num_shards > self.vocab_size {
            return config_err!(
                "num_shards ({}) exceeds vocab_size ({})",
                self.num_shards,
                self.vocab_size
            );
        }
        Ok(())
    }
}

/// Parses `raw` into a JSON value of the same kind as `current`.
fn parse_like(current: &Value, raw: &str) -> Option<Value> {
    match current {
        Value::Bool(_) => raw.parse::<bool>().ok().map(Value::Bool),
        Value::Number(n) if n.is_f64() => raw.parse::<f64>().ok().map(Value::from),
        Value::Number(_) => raw.parse::<u64>().ok().map(Value::from),
        _ => Some(Value::String(raw.to_string())),
    }
}
