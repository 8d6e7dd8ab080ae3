//! Transfer counters shared between sessions and the tracker client.

use std::sync::atomic::{AtomicU64, Ordering};

/// Payload byte counts accumulated across all peer sessions for the
/// lifetime of the engine. These feed the `uploaded`/`downloaded` announce
/// parameters.
#[derive(Debug, Default)]
pub(crate) struct ThruputCounters {
    up: AtomicU64,
    down: AtomicU64,
}

impl ThruputCounters {
    pub fn record_up(&self, bytes: u64) {
        self.up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_down(&self, bytes: u64) {
        self.down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn up(&self) -> u64 {
        self.up.load(Ordering::Relaxed)
    }

    pub fn down(&self) -> u64 {
        self.down.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let counters = ThruputCounters::default();
        counters.record_up(100);
        counters.record_up(24);
        counters.record_down(7);
        assert_eq!(counters.up(), 124);
        assert_eq!(counters.down(), 7);
    }
}
