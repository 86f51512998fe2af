//! A running tally of transferred bytes with an average-rate readout, used
//! for download statistics and checkpoints.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug)]
pub(crate) struct ThruputCounter {
    /// The total number of bytes registered so far.
    total: u64,
    /// When counting started.
    started_at: SystemTime,
    /// When a transfer was last registered.
    updated_at: SystemTime,
}

impl ThruputCounter {
    pub fn new() -> Self {
        let now = SystemTime::now();
        Self {
            total: 0,
            started_at: now,
            updated_at: now,
        }
    }

    /// Reconstructs a counter from checkpointed values. The start timestamp
    /// is in seconds since the Unix epoch.
    pub fn restore(total: u64, started_at_secs: f64) -> Self {
        Self {
            total,
            started_at: UNIX_EPOCH
                + Duration::from_secs_f64(started_at_secs.max(0.0)),
            updated_at: SystemTime::now(),
        }
    }

    /// Registers the transfer of `bytes`.
    pub fn register(&mut self, bytes: u64) {
        self.total += bytes;
        self.updated_at = SystemTime::now();
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Seconds elapsed since counting started.
    pub fn elapsed_secs(&self) -> f64 {
        SystemTime::now()
            .duration_since(self.started_at)
            .unwrap_or_default()
            .as_secs_f64()
    }

    /// The average rate in bytes per second over the counter's lifetime.
    pub fn avg_rate(&self) -> f64 {
        let elapsed = self.elapsed_secs();
        if elapsed > 0.0 {
            self.total as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn started_at_secs(&self) -> f64 {
        self.started_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    pub fn updated_at_secs(&self) -> f64 {
        self.updated_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_accumulates() {
        let mut counter = ThruputCounter::new();
        counter.register(100);
        counter.register(50);
        assert_eq!(counter.total(), 150);
        assert!(counter.updated_at_secs() >= counter.started_at_secs());
    }

    #[test]
    fn test_restore_keeps_total_and_start() {
        let counter = ThruputCounter::restore(4096, 1_000_000.0);
        assert_eq!(counter.total(), 4096);
        assert!((counter.started_at_secs() - 1_000_000.0).abs() < 1.0);
        // a counter restored with an old start time has a meaningful rate
        assert!(counter.avg_rate() > 0.0);
    }
}
