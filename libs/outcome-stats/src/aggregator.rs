//! Global stats aggregation across flushes and workers.
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::snapshot::StatsSnapshot;

/// Fold `snapshot` into `into`.
pub fn merge(into: &mut StatsSnapshot, snapshot: &StatsSnapshot) {
    into.merge(snapshot);
}

/// A worker's flushed snapshot as sent to the master.
///
/// `epoch` increases by one per flush within one worker process, so a resent
/// report carries the same `(worker_id, incarnation, epoch)` as the original.
/// `incarnation` is fresh for every worker process; a worker restarted under
/// the same id starts its epochs over without colliding with its old ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsReport {
    pub worker_id: String,
    #[serde(default)]
    pub incarnation: String,
    pub epoch: u64,
    /// final report the worker sends after stopping its users
    #[serde(default)]
    pub last: bool,
    pub snapshot: StatsSnapshot,
}

/// Owns the global snapshot. Only ever grows through merges.
#[derive(Debug, Default)]
pub struct Aggregator {
    global: StatsSnapshot,
    /// epochs merged so far, per `(worker_id, incarnation)`
    seen: HashMap<(String, String), HashSet<u64>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a snapshot flushed from this process's own recorder.
    pub fn merge_local(&mut self, snapshot: &StatsSnapshot) {
        merge(&mut self.global, snapshot);
    }

    /// Merge a worker report. Returns `false` and leaves the global snapshot
    /// untouched when that `(worker_id, incarnation, epoch)` was already
    /// merged.
    pub fn merge_report(&mut self, report: &StatsReport) -> bool {
        let fresh = self
            .seen
            .entry((report.worker_id.clone(), report.incarnation.clone()))
            .or_default()
            .insert(report.epoch);
        if !fresh {
            debug!(
                worker_id = %report.worker_id,
                incarnation = %report.incarnation,
                epoch = report.epoch,
                "dropping duplicate stats report"
            );
            return false;
        }
        merge(&mut self.global, &report.snapshot);
        true
    }

    pub fn snapshot(&self) -> &StatsSnapshot {
        &self.global
    }

    pub fn into_snapshot(self) -> StatsSnapshot {
        self.global
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::outcome::RequestOutcome;

    fn report(worker: &str, epoch: u64, requests: usize) -> StatsReport {
        report_from(worker, "i-1", epoch, requests)
    }

    fn report_from(worker: &str, incarnation: &str, epoch: u64, requests: usize) -> StatsReport {
        let mut snapshot = StatsSnapshot::new();
        for _ in 0..requests {
            snapshot.record(&RequestOutcome::success(
                "health_check",
                Duration::from_millis(4),
                2,
            ));
        }
        StatsReport {
            worker_id: worker.to_string(),
            incarnation: incarnation.to_string(),
            epoch,
            last: false,
            snapshot,
        }
    }

    #[test]
    fn duplicate_reports_are_dropped() {
        let mut agg = Aggregator::new();
        assert!(agg.merge_report(&report("w1", 1, 3)));
        assert!(agg.merge_report(&report("w2", 1, 4)));
        assert!(!agg.merge_report(&report("w1", 1, 3)));
        assert!(agg.merge_report(&report("w1", 2, 5)));

        assert_eq!(agg.snapshot().request_count(), 12);
    }

    #[test]
    fn restarted_worker_epochs_are_not_duplicates() {
        let mut agg = Aggregator::new();
        assert!(agg.merge_report(&report_from("w", "first", 1, 4)));
        assert!(agg.merge_report(&report_from("w", "first", 2, 2)));
        // same id, new process: epochs start over
        assert!(agg.merge_report(&report_from("w", "second", 1, 3)));
        assert!(agg.merge_report(&report_from("w", "second", 2, 1)));
        assert!(!agg.merge_report(&report_from("w", "second", 2, 1)));

        assert_eq!(agg.snapshot().request_count(), 10);
    }

    #[test]
    fn delivery_order_does_not_matter() {
        let reports = [report("w1", 1, 2), report("w2", 1, 7), report("w1", 2, 1)];

        let mut forward = Aggregator::new();
        for r in &reports {
            forward.merge_report(r);
        }

        let mut backward = Aggregator::new();
        for r in reports.iter().rev() {
            backward.merge_report(r);
            // redelivery of the same report
            backward.merge_report(r);
        }

        assert_eq!(forward.into_snapshot(), backward.into_snapshot());
    }

    #[test]
    fn local_merges_accumulate() {
        let mut agg = Aggregator::new();
        agg.merge_local(&report("local", 0, 2).snapshot);
        agg.merge_local(&report("local", 0, 2).snapshot);
        assert_eq!(agg.snapshot().request_count(), 4);
    }

    #[test]
    fn report_round_trips_through_json() {
        let original = report("w9", 3, 2);
        let json = serde_json::to_value(&original).expect("serialize");
        assert_eq!(json["worker_id"], "w9");
        assert_eq!(json["epoch"], 3);
        let back: StatsReport = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, original);
    }
}
