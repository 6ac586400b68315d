use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::snapshot::{BehaviorStats, StatsSnapshot};

/// Name used for the row folding every stats key together.
pub const AGGREGATED: &str = "Aggregated";

/// Run facts that do not live in the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub mode: String,
    pub target_users: usize,
    pub peak_users: usize,
    pub workers: usize,
    pub duration: Duration,
    /// users terminated after the stop grace period expired
    pub forced_stops: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsRow {
    pub name: String,
    pub requests: u64,
    pub failures: u64,
    pub average_ms: Option<f64>,
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
    pub average_bytes: Option<f64>,
    pub requests_per_sec: f64,
    pub failures_per_sec: f64,
}

impl StatsRow {
    fn new(name: &str, stats: &BehaviorStats, duration_secs: f64) -> Self {
        Self {
            name: name.to_string(),
            requests: stats.requests,
            failures: stats.failures,
            average_ms: stats.average_ms(),
            min_ms: stats.min_ms,
            max_ms: (stats.requests > 0).then_some(stats.max_ms),
            p50_ms: stats.percentile(0.50),
            p95_ms: stats.percentile(0.95),
            p99_ms: stats.percentile(0.99),
            average_bytes: stats.average_bytes(),
            requests_per_sec: stats.requests as f64 / duration_secs,
            failures_per_sec: stats.failures as f64 / duration_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRow {
    pub name: String,
    pub detail: String,
    pub occurrences: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub meta: RunMeta,
    pub rows: Vec<StatsRow>,
    pub total: StatsRow,
    pub errors: Vec<ErrorRow>,
    pub error_rate: f64,
}

impl RunReport {
    pub fn new(snapshot: &StatsSnapshot, meta: RunMeta) -> Self {
        let duration_secs = meta.duration.as_secs_f64().max(1e-9);

        let rows = snapshot
            .iter()
            .map(|(name, stats)| StatsRow::new(name, stats, duration_secs))
            .collect::<Vec<_>>();
        let total_stats = snapshot.total();
        let total = StatsRow::new(AGGREGATED, &total_stats, duration_secs);

        let mut errors = snapshot
            .iter()
            .flat_map(|(name, stats)| {
                stats.errors.iter().map(move |(detail, occurrences)| ErrorRow {
                    name: name.to_string(),
                    detail: detail.clone(),
                    occurrences: *occurrences,
                })
            })
            .collect::<Vec<_>>();
        errors.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));

        let error_rate = if total_stats.requests == 0 {
            0.0
        } else {
            total_stats.failures as f64 / total_stats.requests as f64
        };

        Self {
            meta,
            rows,
            total,
            errors,
            error_rate,
        }
    }

    pub fn human_summary(&self) -> String {
        let mut output = String::new();
        output.push_str("Load test report\n");
        output.push_str(&format!(
            "mode: {} | users: target={}, peak={} | workers: {}\n",
            self.meta.mode, self.meta.target_users, self.meta.peak_users, self.meta.workers
        ));
        output.push_str(&format!(
            "duration: {}ms | forced stops: {} | error rate: {:.2}%\n",
            self.meta.duration.as_millis(),
            self.meta.forced_stops,
            self.error_rate * 100.0
        ));
        output.push_str(&format!(
            "{:<28} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>9}\n",
            "name", "reqs", "fails", "avg", "min", "max", "p50", "p95", "req/s"
        ));
        for row in self.rows.iter().chain(std::iter::once(&self.total)) {
            output.push_str(&format!(
                "{:<28} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>9.2}\n",
                row.name,
                row.requests,
                row.failures,
                fmt_opt(row.average_ms.map(|avg| avg.round() as u64)),
                fmt_opt(row.min_ms),
                fmt_opt(row.max_ms),
                fmt_opt(row.p50_ms),
                fmt_opt(row.p95_ms),
                row.requests_per_sec,
            ));
        }
        for error in &self.errors {
            output.push_str(&format!(
                "error [{}] {}: {}\n",
                error.name, error.detail, error.occurrences
            ));
        }
        output
    }
}

fn fmt_opt(value: Option<u64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}
