//! Wall-clock source for value timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Microseconds since the Unix epoch.
    fn now_micros(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        // Before the epoch reads as 0; past u64 range saturates.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_reads_microseconds_after_2020() {
        let clock = SystemClock;
        let first = clock.now_micros();
        let second = clock.now_micros();
        assert!(first > 1_577_836_800_000_000);
        assert!(second >= first);
    }
}
