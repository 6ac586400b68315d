//! stampede prelude

pub use crate::{
    CancellationToken,
    anyhow::{self, Context, Result},
    async_trait,
    behavior::{Action, Behavior, BehaviorError},
    config::RunConfig,
    coordinator::{Coordinator, RunRole, Workload},
    hooks::{Hooks, RunListener},
    outcome_stats::RunReport,
    scenario::{Scenario, ThinkTime},
    session::{UserContext, UserSession},
    tokio,
    tracing::{self, debug, error, info, instrument, trace, warn},
    transport::{Method, Request, Response, Transport, TransportError},
};

pub use std::{sync::Arc, time::Duration};
