#![allow(clippy::cognitive_complexity)]
use std::{process::ExitCode, sync::Arc};

use anyhow::{Context, Result, anyhow};

use http_transport::HttpTransport;
use stampede_core::{
    CancellationToken, Coordinator, RunRole, Workload,
    config::{
        RunConfig,
        cli::{self, Parser},
        trace,
    },
    hooks::{Hooks, RunListener},
    outcome_stats::RunReport,
    tokio::{self, runtime::Builder, signal},
    tracing::*,
};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<ExitCode> {
    // load .env first so its values can fill in cli args
    let dotenv = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.stampede_log, &config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv {
        debug!(?err, ".env file not loaded");
    }

    let output_json = config.json;
    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }

    let run_config = match RunConfig::try_from(config) {
        Ok(run_config) => run_config,
        Err(err) => {
            error!(%err, "invalid configuration");
            eprintln!("configuration error: {err:#}");
            return Ok(ExitCode::from(2));
        }
    };
    // build the runtime
    let rt = builder.build()?;

    let result = rt.block_on(async move {
        match tokio::spawn(start(run_config)).await {
            Err(err) => Err(anyhow!(err).context("run task failed")),
            Ok(result) => result,
        }
    });

    match result {
        Ok(report) => {
            if output_json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("failed to serialize report")?
                );
            } else {
                println!("{}", report.human_summary());
            }
            debug!("exiting...");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            error!(?err, "exited with error");
            eprintln!("run failed: {err:#}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn start(config: RunConfig) -> Result<RunReport> {
    let transport = HttpTransport::new(config.host.as_str(), config.request_timeout)
        .context("failed to build http client")?;
    if config.role != RunRole::Master {
        info!(host = %transport.base(), "target host");
    }
    let workload = Workload::new(job_board::scenario()?, Arc::new(transport))?;

    let mut hooks = Hooks::new();
    hooks.register(RunLog);
    let coordinator = Coordinator::new(config, workload, hooks)?;

    let token = CancellationToken::new();
    let signals = tokio::spawn(shutdown_signal(token.clone()));
    let report = coordinator.run(token).await;
    signals.abort();
    report
}

/// Lifecycle events at `info`.
#[derive(Debug, Clone, Copy)]
struct RunLog;

impl RunListener for RunLog {
    fn on_test_start(&self, role: RunRole, target_users: usize) {
        info!(%role, target_users, "test starting");
    }

    fn on_spawning_complete(&self, user_count: usize) {
        info!(user_count, "spawning complete");
    }

    fn on_test_stop(&self, report: &RunReport) {
        info!(
            requests = report.total.requests,
            failures = report.total.failures,
            forced_stops = report.meta.forced_stops,
            "test stopped"
        );
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            ret = signal::ctrl_c() => ret.map_err(|err| anyhow!(err))?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    signal::ctrl_c().await.map_err(|err| anyhow!(err))?;

    info!("shutdown signal received, stopping");
    token.cancel();
    Ok(())
}
