//! Concurrency primitives for shuttling variable-size binary records
//! between producer and consumer threads and processes.
//!
//! Two independent subsystems:
//!
//! - [`BoundedQueue`] - an in-process FIFO bounded by both element count
//!   and aggregate memory, with a full-queue admission policy selected
//!   at the type level ([`FailIfFull`], [`KeepNewest`], [`RejectNewest`]).
//! - [`SharedRing`] - a cross-process pool of fixed-size buffers backed
//!   by a System V shared-memory segment, supporting destructive
//!   (single-consumer) and broadcast (multi-consumer) read modes, with
//!   stale-owner reclamation and signal-driven teardown.

mod clock;
pub mod queue;
pub mod ring;
pub mod trace;

pub use queue::{
    BoundedQueue, EnqPolicy, FailIfFull, FailIfFullQueue, Footprint, KeepNewest, KeepNewestQueue,
    QueueFull, RejectNewest, RejectNewestQueue,
};
pub use ring::{BufferState, RingConfig, RingError, SharedRing};
pub use trace::init_tracing;
