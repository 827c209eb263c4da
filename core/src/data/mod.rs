//! Batching of token streams.
//!
//! A language model with carried-over recurrent state wants row `b` of batch `k + 1` to
//! continue the text of row `b` of batch `k`. [`StreamBatcher`] reads one token stream per
//! row and cuts consecutive `[rows, num_steps]` windows, with targets shifted one token
//! ahead of inputs.

use crate::model::Batch;
use crate::nn::LogUniformSampler;
use crate::tensor::Tensor;
use rand::{rngs::StdRng, SeedableRng};
use std::iter::Peekable;

/// Endless stream of token ids drawn from a Zipfian distribution over `[0, vocab_size)`.
#[derive(Clone, Debug)]
pub struct SyntheticCorpus {
    sampler: LogUniformSampler,
    rng: StdRng,
}

impl SyntheticCorpus {
    pub fn new(vocab_size: usize, seed: u64) -> Self {
        Self {
            sampler: LogUniformSampler::new(vocab_size),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Iterator for SyntheticCorpus {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        Some(self.sampler.sample(&mut self.rng))
    }
}

/// Cuts one stream per row into consecutive windows.
///
/// Exhausted rows are padded with id 0 and weight 0; iteration stops once every row is
/// exhausted.
#[derive(Debug)]
pub struct StreamBatcher<S: Iterator<Item = usize>> {
    streams: Vec<Peekable<S>>,
    /// Last token of the previous window per row; `None` once the row is exhausted.
    carry: Vec<Option<usize>>,
    num_steps: usize,
}

impl<S: Iterator<Item = usize>> StreamBatcher<S> {
    pub fn new(streams: Vec<S>, num_steps: usize) -> Self {
        let mut streams: Vec<_> = streams.into_iter().map(Iterator::peekable).collect();
        let carry = streams.iter_mut().map(Iterator::next).collect();
        Self {
            streams,
            carry,
            num_steps,
        }
    }
}

impl<S: Iterator<Item = usize>> Iterator for StreamBatcher<S> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let exhausted = self
            .streams
            .iter_mut()
            .zip(&self.carry)
            .all(|(stream, carry)| carry.is_none() || stream.peek().is_none());
        if self.num_steps == 0 || exhausted {
            return None;
        }
        let (rows, steps) = (self.streams.len(), self.num_steps);
        let mut x = Vec::with_capacity(rows * steps);
        let mut y = Vec::with_capacity(rows * steps);
        let mut w = Vec::with_capacity(rows * steps);

        for (stream, carry) in self.streams.iter_mut().zip(self.carry.iter_mut()) {
            for _ in 0..steps {
                let next = carry.and_then(|_| stream.next());
                match (*carry, next) {
                    (Some(input), Some(target)) => {
                        x.push(input);
                        y.push(target);
                        w.push(1.0);
                    }
                    _ => {
                        x.push(0);
                        y.push(0);
                        w.push(0.0);
                    }
                }
                *carry = next;
            }
        }

        let shape = [rows, steps];
        Batch::new(
            Tensor::new(x, shape).ok()?,
            Tensor::new(y, shape).ok()?,
            Tensor::new(w, shape).ok()?,
        )
        .ok()
    }
}
