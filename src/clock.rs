//! Wall-clock timestamps shared across processes.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in microseconds since the Unix epoch.
///
/// Slot touch timestamps are compared between processes, so they must
/// come from a shared clock rather than a process-local monotonic one.
pub(crate) fn wall_clock_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_clock_is_nonzero_and_monotonic_enough() {
        let a = wall_clock_us();
        let b = wall_clock_us();
        assert!(a > 0);
        assert!(b >= a);
    }
}
