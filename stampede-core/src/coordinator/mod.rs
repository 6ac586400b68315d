//! Run coordination: owns the simulated users and drives a run in one of
//! three roles.
mod master;
mod pool;
mod ramp;
mod standalone;
mod worker;

use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use outcome_stats::RunReport;

pub use master::Master;
pub use pool::UserPool;
pub use ramp::{RAMP_TICK, RampPlan};
pub use worker::Worker;

use crate::{
    config::RunConfig, error::ConfigError, hooks::Hooks, scenario::Scenario,
    scheduler::TaskScheduler, transport::Transport,
};

/// What this process does in a run. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunRole {
    /// users and aggregation in one process
    Standalone,
    /// no users; splits the load across workers and aggregates their stats
    Master,
    /// runs users on command from a master
    Worker,
}

impl RunRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            RunRole::Standalone => "standalone",
            RunRole::Master => "master",
            RunRole::Worker => "worker",
        }
    }
}

impl FromStr for RunRole {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standalone" => Ok(RunRole::Standalone),
            "master" => Ok(RunRole::Master),
            "worker" => Ok(RunRole::Worker),
            _ => Err(ConfigError::InvalidRole(s.to_owned())),
        }
    }
}

impl fmt::Display for RunRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The scenario every user of this process runs, its scheduler, and the
/// transport its requests go through. Cheap to clone.
#[derive(Clone)]
pub struct Workload {
    scenario: Arc<Scenario>,
    scheduler: Arc<TaskScheduler>,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workload")
            .field("scenario", &self.scenario.name())
            .field("behaviors", &self.scheduler.behaviors().len())
            .finish()
    }
}

impl Workload {
    /// Fails if the scenario's behaviors do not form a valid schedule.
    pub fn new(scenario: Scenario, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        let scheduler = TaskScheduler::new(scenario.name(), scenario.behaviors().to_vec())?;
        Ok(Self {
            scenario: Arc::new(scenario),
            scheduler: Arc::new(scheduler),
            transport,
        })
    }

    pub fn scenario(&self) -> &Arc<Scenario> {
        &self.scenario
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

/// Drives one run in the role picked by its [`RunConfig`].
#[derive(Debug)]
pub struct Coordinator {
    config: RunConfig,
    workload: Workload,
    hooks: Hooks,
}

impl Coordinator {
    /// Validate `config` and set up a coordinator. Nothing starts until
    /// [`Coordinator::run`].
    pub fn new(config: RunConfig, workload: Workload, hooks: Hooks) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            workload,
            hooks,
        })
    }

    pub fn role(&self) -> RunRole {
        self.config.role
    }

    /// Run until `shutdown` is cancelled, the run time elapses, or (on a
    /// worker) the master says quit. Returns the final report.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<RunReport> {
        info!(role = %self.config.role, scenario = %self.workload.scenario().name(), "starting run");
        match self.config.role {
            RunRole::Standalone => {
                standalone::run(self.config, self.workload, self.hooks, shutdown).await
            }
            RunRole::Master => {
                // a master runs no users of its own
                let master = Master::bind(self.config, self.hooks).await?;
                master.run(shutdown).await
            }
            RunRole::Worker => {
                Worker::new(self.config, self.workload, self.hooks)
                    .run(shutdown)
                    .await
            }
        }
    }
}

/// Resolves at `deadline`, or never when there is none.
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
