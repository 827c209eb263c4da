//! Model building blocks: sharded tables, the projected LSTM cell, dropout and the
//! softmax output layer.

pub mod dropout;
pub mod lstm;
pub mod sampler;
pub mod sharded;
pub mod softmax;

pub use dropout::dropout;
pub use lstm::LstmCell;
pub use sampler::LogUniformSampler;
pub use sharded::ShardedParameter;
pub use softmax::SoftmaxHead;
