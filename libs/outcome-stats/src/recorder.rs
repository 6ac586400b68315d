//! Process-wide outcome accumulator.
use std::mem;

use parking_lot::Mutex;

use crate::{outcome::RequestOutcome, snapshot::StatsSnapshot};

/// Append-only accumulator shared by every simulated user of a process.
///
/// `record` and `flush` take the same lock, so an outcome lands either in the
/// snapshot a flush returns or in the fresh buffer behind it, never both.
/// The lock is only held for a counter update, never across an `.await`.
#[derive(Debug, Default)]
pub struct Recorder {
    active: Mutex<StatsSnapshot>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one outcome. Safe to call from any number of tasks or threads.
    pub fn record(&self, outcome: RequestOutcome) {
        self.active.lock().record(&outcome);
    }

    /// Swap the active buffer for an empty one and return what it held.
    pub fn flush(&self) -> StatsSnapshot {
        mem::take(&mut *self.active.lock())
    }

    /// Number of requests recorded since the last flush.
    pub fn pending(&self) -> u64 {
        self.active.lock().request_count()
    }
}
