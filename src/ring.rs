//! Cross-process ring of fixed-size buffers over System V shared memory.
//!
//! A [`SharedRing`] is a pool of equal-size buffers coordinated through
//! a shared-memory segment: one Creator initializes the segment, any
//! number of Attachers join it, and buffers move between handles
//! through a small per-slot state machine claimed with atomic
//! compare-and-swap. See [`handle`] for the protocol details.

pub mod handle;
pub mod layout;
mod segment;
pub(crate) mod teardown;

pub use handle::{RingConfig, RingError, SharedRing};
pub use layout::BufferState;
