//! Scalar summaries emitted by the training loop.

/// Receives named scalars tagged with the global step they belong to.
pub trait SummarySink {
    fn scalar(&mut self, name: &str, value: f32, step: u64);
}

/// Writes every scalar as a `tracing` event at info level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl SummarySink for TracingSink {
    fn scalar(&mut self, name: &str, value: f32, step: u64) {
        tracing::info!(target: "towerlm::summary", step, name, value, "scalar");
    }
}

/// Keeps every scalar in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    pub records: Vec<(String, f32, u64)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent value recorded under `name`.
    pub fn last(&self, name: &str) -> Option<f32> {
        self.records
            .iter()
            .rev()
            .find(|(n, _, _)| n == name)
            .map(|&(_, value, _)| value)
    }
}

impl SummarySink for MemorySink {
    fn scalar(&mut self, name: &str, value: f32, step: u64) {
        self.records.push((name.to_string(), value, step));
    }
}

/// Discards everything.
impl SummarySink for () {
    fn scalar(&mut self, _name: &str, _value: f32, _step: u64) {}
}
