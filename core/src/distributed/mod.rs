//! # Data-parallel plumbing
//!
//! Every device ("tower") holds a full replica of the model graph but reads the same
//! parameter store. Each step the batch is split by rows, the towers run concurrently and
//! their gradients meet in [`average_grads`] before a single optimizer update.
//!
//! * [`Placement`] / [`Topology`]: where parameters live, which compute devices exist.
//! * [`average_grads`]: cross-tower reduction of gradient lists.

pub mod average;
pub mod placement;

pub use average::average_grads;
pub use placement::{Placement, Topology};
