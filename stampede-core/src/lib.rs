//! # stampede
//!
//! Engine for a distributed HTTP load generator. Simulated users pick
//! weighted behaviors, issue requests through a [`Transport`], and record
//! every outcome; a [`Coordinator`] ramps them up and stops them either in
//! one process or split across a master and its workers.
//!
//! [`Transport`]: transport::Transport
//! [`Coordinator`]: coordinator::Coordinator
#![warn(
    missing_debug_implementations,
    missing_copy_implementations,
    rust_2018_idioms,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
pub use anyhow;
pub use async_trait::async_trait;
pub use outcome_stats;
pub use tokio;
pub use tokio_util::sync::CancellationToken;
pub use tracing;

pub use crate::coordinator::{Coordinator, RunRole, Workload};

pub mod behavior;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod hooks;
pub mod prelude;
pub mod scenario;
pub mod scheduler;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod user;
