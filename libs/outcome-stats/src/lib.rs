//! # outcome-stats
//!
//! Accumulates the outcome of every request a simulated user issues and
//! turns them into mergeable per-name statistics.
//!
//! - [`Recorder`] is the multi-writer accumulator shared by every simulated
//!   user in a process. [`Recorder::flush`] swaps its buffer out and hands
//!   back a [`StatsSnapshot`].
//! - [`StatsSnapshot`] merges are commutative and associative, so snapshots
//!   coming from several workers in any order produce the same totals.
//! - [`Aggregator`] owns the global snapshot and drops duplicated
//!   [`StatsReport`]s by their `(worker_id, incarnation, epoch)` tag.
//! - [`RunReport`] is the end-of-run summary built from a snapshot.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod aggregator;
pub mod outcome;
pub mod recorder;
pub mod report;
pub mod snapshot;

pub use aggregator::{Aggregator, StatsReport, merge};
pub use outcome::RequestOutcome;
pub use recorder::Recorder;
pub use report::{ErrorRow, RunMeta, RunReport, StatsRow};
pub use snapshot::{BehaviorStats, ResponseTimes, StatsSnapshot};
