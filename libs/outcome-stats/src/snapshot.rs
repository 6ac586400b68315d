//! Mergeable per-name statistics.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::outcome::RequestOutcome;

/// Response times in milliseconds, bucketed so that similar values share a
/// counter. Memory stays bounded no matter how many requests are recorded and
/// the map is cheap to ship from a worker to the master.
///
/// Buckets: exact below 100ms, nearest 10ms up to 500ms, nearest 100ms up to
/// 1s, nearest second above that.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseTimes(BTreeMap<u64, u64>);

impl ResponseTimes {
    /// Count one response time.
    pub fn insert(&mut self, millis: u64) {
        *self.0.entry(bucket(millis)).or_default() += 1;
    }

    /// Add every counter of `other` into `self`.
    pub fn merge(&mut self, other: &ResponseTimes) {
        for (bucket, count) in &other.0 {
            *self.0.entry(*bucket).or_default() += count;
        }
    }

    /// Number of response times counted.
    pub fn count(&self) -> u64 {
        self.0.values().sum()
    }

    /// Nearest-rank percentile, `fraction` in `0.0..=1.0`.
    pub fn percentile(&self, fraction: f64) -> Option<u64> {
        let total = self.count();
        if total == 0 {
            return None;
        }
        let rank = ((total as f64 * fraction.clamp(0.0, 1.0)).ceil() as u64).max(1);
        let mut seen = 0;
        for (bucket, count) in &self.0 {
            seen += count;
            if seen >= rank {
                return Some(*bucket);
            }
        }
        self.0.keys().next_back().copied()
    }
}

fn bucket(millis: u64) -> u64 {
    let round_to = |step: u64| (millis + step / 2) / step * step;
    match millis {
        0..=100 => millis,
        101..=500 => round_to(10),
        501..=1000 => round_to(100),
        _ => round_to(1000),
    }
}

/// Counters for one stats key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorStats {
    pub requests: u64,
    pub failures: u64,
    /// `None` until the first request is counted.
    pub min_ms: Option<u64>,
    pub max_ms: u64,
    pub total_ms: u64,
    pub total_bytes: u64,
    pub response_times: ResponseTimes,
    /// failure detail -> occurrences
    pub errors: BTreeMap<String, u64>,
}

impl BehaviorStats {
    /// Count one outcome.
    pub fn record(&mut self, outcome: &RequestOutcome) {
        let millis = u64::try_from(outcome.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.requests += 1;
        self.min_ms = Some(self.min_ms.map_or(millis, |min| min.min(millis)));
        self.max_ms = self.max_ms.max(millis);
        self.total_ms = self.total_ms.saturating_add(millis);
        self.total_bytes = self.total_bytes.saturating_add(outcome.payload_bytes());
        self.response_times.insert(millis);

        if let Some(detail) = outcome.failure_detail() {
            self.failures += 1;
            *self.errors.entry(detail.to_owned()).or_default() += 1;
        }
    }

    /// Fold `other` into `self`. Commutative and associative.
    pub fn merge(&mut self, other: &BehaviorStats) {
        self.requests += other.requests;
        self.failures += other.failures;
        self.min_ms = match (self.min_ms, other.min_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_ms = self.max_ms.max(other.max_ms);
        self.total_ms = self.total_ms.saturating_add(other.total_ms);
        self.total_bytes = self.total_bytes.saturating_add(other.total_bytes);
        self.response_times.merge(&other.response_times);
        for (detail, count) in &other.errors {
            *self.errors.entry(detail.clone()).or_default() += count;
        }
    }

    pub fn average_ms(&self) -> Option<f64> {
        (self.requests > 0).then(|| self.total_ms as f64 / self.requests as f64)
    }

    pub fn average_bytes(&self) -> Option<f64> {
        (self.requests > 0).then(|| self.total_bytes as f64 / self.requests as f64)
    }

    /// Percentile of response times, clamped into the observed `[min, max]`
    /// since buckets round.
    pub fn percentile(&self, fraction: f64) -> Option<u64> {
        let value = self.response_times.percentile(fraction)?;
        let min = self.min_ms.unwrap_or(0);
        Some(value.clamp(min, self.max_ms.max(min)))
    }
}

/// Point-in-time aggregation of outcomes, keyed by stats name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    entries: BTreeMap<String, BehaviorStats>,
}

impl StatsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one outcome under its name.
    pub fn record(&mut self, outcome: &RequestOutcome) {
        self.entries
            .entry(outcome.name().to_owned())
            .or_default()
            .record(outcome);
    }

    /// Fold every entry of `other` into `self`.
    pub fn merge(&mut self, other: &StatsSnapshot) {
        for (name, stats) in &other.entries {
            self.entries.entry(name.clone()).or_default().merge(stats);
        }
    }

    /// By-value variant of [`merge`](Self::merge).
    pub fn merged(mut self, other: &StatsSnapshot) -> Self {
        self.merge(other);
        self
    }

    pub fn get(&self, name: &str) -> Option<&BehaviorStats> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BehaviorStats)> {
        self.entries.iter().map(|(name, stats)| (name.as_str(), stats))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry folded into one.
    pub fn total(&self) -> BehaviorStats {
        let mut total = BehaviorStats::default();
        for stats in self.entries.values() {
            total.merge(stats);
        }
        total
    }

    /// Total number of requests across every name.
    pub fn request_count(&self) -> u64 {
        self.entries.values().map(|stats| stats.requests).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn outcome(name: &str, millis: u64, ok: bool) -> RequestOutcome {
        let elapsed = Duration::from_millis(millis);
        if ok {
            RequestOutcome::success(name, elapsed, 100)
        } else {
            RequestOutcome::failure(name, elapsed, "HTTP 500")
        }
    }

    fn snapshot(outcomes: &[(&str, u64, bool)]) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot::new();
        for (name, millis, ok) in outcomes {
            snapshot.record(&outcome(name, *millis, *ok));
        }
        snapshot
    }

    #[test]
    fn bucket_rounding() {
        assert_eq!(bucket(0), 0);
        assert_eq!(bucket(99), 99);
        assert_eq!(bucket(100), 100);
        assert_eq!(bucket(104), 100);
        assert_eq!(bucket(105), 110);
        assert_eq!(bucket(549), 500);
        assert_eq!(bucket(551), 600);
        assert_eq!(bucket(1499), 1000);
        assert_eq!(bucket(1500), 2000);
    }

    #[test]
    fn records_counters() {
        let snap = snapshot(&[("a", 10, true), ("a", 30, false), ("b", 5, true)]);
        let a = snap.get("a").expect("a stats");

        assert_eq!(a.requests, 2);
        assert_eq!(a.failures, 1);
        assert_eq!(a.min_ms, Some(10));
        assert_eq!(a.max_ms, 30);
        assert_eq!(a.total_ms, 40);
        assert_eq!(a.total_bytes, 100);
        assert_eq!(a.errors.get("HTTP 500"), Some(&1));
        assert_eq!(a.average_ms(), Some(20.0));
        assert_eq!(snap.request_count(), 3);
        assert_eq!(snap.total().requests, 3);
    }

    #[test]
    fn percentiles_follow_rank() {
        let outcomes = (1..=100).map(|ms| ("p", ms, true)).collect::<Vec<_>>();
        let snap = snapshot(&outcomes);
        let stats = snap.get("p").expect("p stats");

        assert_eq!(stats.percentile(0.50), Some(50));
        assert_eq!(stats.percentile(0.95), Some(95));
        assert_eq!(stats.percentile(0.99), Some(99));
        assert_eq!(stats.percentile(1.0), Some(100));
        assert_eq!(BehaviorStats::default().percentile(0.5), None);
    }

    #[test]
    fn percentile_clamped_to_observed_range() {
        // 1450ms lands in the 1000ms bucket, below the real minimum
        let snap = snapshot(&[("slow", 1450, true)]);
        assert_eq!(snap.get("slow").and_then(|s| s.percentile(0.5)), Some(1450));
    }

    #[test]
    fn merge_is_associative_and_commutative() {
        let a = snapshot(&[("x", 10, true), ("y", 250, false)]);
        let b = snapshot(&[("x", 3, false), ("z", 1200, true)]);
        let c = snapshot(&[("y", 40, true), ("x", 700, true), ("x", 90, true)]);

        let left = a.clone().merged(&b).merged(&c);
        let right = a.clone().merged(&b.clone().merged(&c));
        assert_eq!(left, right);

        let swapped = c.clone().merged(&a).merged(&b);
        assert_eq!(left, swapped);

        assert_eq!(left.request_count(), 7);
        assert_eq!(left.get("x").map(|s| s.min_ms), Some(Some(3)));
        assert_eq!(left.get("x").map(|s| s.max_ms), Some(700));
    }

    #[test]
    fn merge_with_empty_keeps_min() {
        let mut empty = BehaviorStats::default();
        let filled = snapshot(&[("x", 7, true)]);
        empty.merge(filled.get("x").expect("x stats"));
        assert_eq!(empty.min_ms, Some(7));
    }

    #[test]
    fn serde_keeps_numeric_buckets() {
        let snap = snapshot(&[("x", 120, true), ("x", 3, false)]);
        let json = serde_json::to_string(&snap).expect("serialize");
        let back: StatsSnapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, snap);
    }
}
