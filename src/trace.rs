//! Logging glue.
//!
//! The crate logs through `tracing`, but only when built with the
//! `tracing` cargo feature; default builds compile every log call to
//! nothing. Internal modules import the macros from here so call sites
//! look the same either way.

/// Installs a subscriber that prints this crate's log output.
///
/// Filtering honors `RUST_LOG` when set and defaults to
/// `conveyor=debug` otherwise. Safe to call more than once (later
/// calls lose and are ignored), so tests can each call it. A no-op
/// without the `tracing` feature.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::filter::EnvFilter;

    let filter = std::env::var("RUST_LOG")
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new("conveyor=debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, warn};

/// Swallows its arguments without evaluating them; stands in for every
/// log level when the `tracing` feature is off.
#[cfg(not(feature = "tracing"))]
macro_rules! noop {
    ($($ignored:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use noop as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use noop as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use noop as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use noop as warn;
