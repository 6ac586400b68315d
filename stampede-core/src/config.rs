//! stampede run configuration

use std::time::Duration;

use crate::{coordinator::RunRole, error::ConfigError};

pub mod cli {
    //! Parse from either cli or env var

    /// default role when none is given
    pub static DEFAULT_ROLE: &str = "standalone";
    /// default target host
    pub static DEFAULT_HOST: &str = "http://localhost:8000";
    /// default master address workers connect to / master binds
    pub static DEFAULT_MASTER_HOST: &str = "127.0.0.1";
    /// default master control port
    pub const DEFAULT_MASTER_PORT: u16 = 5557;
    /// default grace for in-flight requests on stop, in seconds
    pub const DEFAULT_STOP_TIMEOUT: u64 = 5;
    /// number of workers a master waits for before spawning
    pub const DEFAULT_EXPECT_WORKERS: usize = 1;
    /// seconds between recorder flushes
    pub const DEFAULT_STATS_INTERVAL: u64 = 3;
    /// seconds between master heartbeats
    pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 1;
    /// seconds of silence before a peer is considered gone
    pub const DEFAULT_HEARTBEAT_TIMEOUT: u64 = 10;
    /// seconds a disconnected worker keeps spawning before it pauses
    pub const DEFAULT_RECONNECT_GRACE: u64 = 10;
    /// per-request timeout in seconds
    pub const DEFAULT_REQUEST_TIMEOUT: u64 = 30;
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "stampede-worker";
    /// default log level. Can use this argument or STAMPEDE_LOG env var
    pub static DEFAULT_STAMPEDE_LOG: &str = "info";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub static DEFAULT_LOG_FORMAT: &str = "standard";

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq)]
    #[clap(author, name = "stampede", bin_name = "stampede", about, long_about = None)]
    /// parses from cli & environment var. stampede will load `.env` in the working dir as well
    pub struct Config {
        /// one of standalone, master, worker
        #[clap(long, env, value_parser, default_value = DEFAULT_ROLE)]
        pub role: String,
        /// base url of the system under test
        #[clap(long, env = "STAMPEDE_HOST", value_parser, default_value = DEFAULT_HOST)]
        pub host: String,
        /// target number of simulated users (standalone and master)
        #[clap(short, long, env, value_parser)]
        pub users: Option<usize>,
        /// users started per second (standalone and master)
        #[clap(short = 'r', long, env, value_parser)]
        pub spawn_rate: Option<f64>,
        /// stop after this many seconds; runs until interrupted when unset
        #[clap(short = 't', long, env, value_parser)]
        pub run_time: Option<u64>,
        /// seconds in-flight requests get to finish once a stop begins
        #[clap(long, env, value_parser, default_value_t = DEFAULT_STOP_TIMEOUT)]
        pub stop_timeout: u64,
        /// master address (bind address for a master)
        #[clap(long, env, value_parser, default_value = DEFAULT_MASTER_HOST)]
        pub master_host: String,
        /// master control port
        #[clap(long, env, value_parser, default_value_t = DEFAULT_MASTER_PORT)]
        pub master_port: u16,
        /// workers the master waits for before spawning
        #[clap(long, env, value_parser, default_value_t = DEFAULT_EXPECT_WORKERS)]
        pub expect_workers: usize,
        /// seconds between stats flushes
        #[clap(long, env, value_parser, default_value_t = DEFAULT_STATS_INTERVAL)]
        pub stats_interval: u64,
        /// seconds between heartbeats
        #[clap(long, env, value_parser, default_value_t = DEFAULT_HEARTBEAT_INTERVAL)]
        pub heartbeat_interval: u64,
        /// seconds without a heartbeat before the peer is dropped
        #[clap(long, env, value_parser, default_value_t = DEFAULT_HEARTBEAT_TIMEOUT)]
        pub heartbeat_timeout: u64,
        /// seconds a disconnected worker keeps ramping before it pauses spawning
        #[clap(long, env, value_parser, default_value_t = DEFAULT_RECONNECT_GRACE)]
        pub reconnect_grace: u64,
        /// per-request timeout in seconds
        #[clap(long, env, value_parser, default_value_t = DEFAULT_REQUEST_TIMEOUT)]
        pub request_timeout: u64,
        /// seed for reproducible behavior selection and think times
        #[clap(long, env, value_parser)]
        pub seed: Option<u64>,
        /// id a worker announces to the master; random when unset
        #[clap(long, env, value_parser)]
        pub worker_id: Option<String>,
        /// print the final report as json
        #[clap(long, env)]
        pub json: bool,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, alias = "log", env, value_parser, default_value = DEFAULT_STAMPEDE_LOG)]
        pub stampede_log: String,
        /// log format: standard, json or pretty
        #[clap(long, env, value_parser, default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
        /// tokio worker threads, defaults to the number of cores
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
    }

    impl Config {
        /// Create new request timeout as `Duration`
        pub fn request_timeout(&self) -> std::time::Duration {
            std::time::Duration::from_secs(self.request_timeout)
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Tracing subscriber settings
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber
        pub fn parse(stampede_log: &str, log_frmt: &str) -> Result<Self> {
            let filter = EnvFilter::try_new(stampede_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?)
                .add_directive("reqwest=warn".parse()?);

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .try_init()?;
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .try_init()?;
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .try_init()?;
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
            })
        }
    }
}

/// Validated settings for one coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub role: RunRole,
    pub host: String,
    /// target users; unused by workers, which take theirs from the master
    pub users: usize,
    /// users per second; unused by workers
    pub spawn_rate: f64,
    pub run_time: Option<Duration>,
    pub stop_timeout: Duration,
    pub master_host: String,
    pub master_port: u16,
    pub expect_workers: usize,
    pub stats_interval: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_grace: Duration,
    pub request_timeout: Duration,
    pub seed: Option<u64>,
    pub worker_id: Option<String>,
}

impl RunConfig {
    /// Settings for `role` with every optional knob at its default.
    pub fn new(role: RunRole, users: usize, spawn_rate: f64) -> Self {
        Self {
            role,
            host: cli::DEFAULT_HOST.to_owned(),
            users,
            spawn_rate,
            run_time: None,
            stop_timeout: Duration::from_secs(cli::DEFAULT_STOP_TIMEOUT),
            master_host: cli::DEFAULT_MASTER_HOST.to_owned(),
            master_port: cli::DEFAULT_MASTER_PORT,
            expect_workers: cli::DEFAULT_EXPECT_WORKERS,
            stats_interval: Duration::from_secs(cli::DEFAULT_STATS_INTERVAL),
            heartbeat_interval: Duration::from_secs(cli::DEFAULT_HEARTBEAT_INTERVAL),
            heartbeat_timeout: Duration::from_secs(cli::DEFAULT_HEARTBEAT_TIMEOUT),
            reconnect_grace: Duration::from_secs(cli::DEFAULT_RECONNECT_GRACE),
            request_timeout: Duration::from_secs(cli::DEFAULT_REQUEST_TIMEOUT),
            seed: None,
            worker_id: None,
        }
    }

    /// `host:port` of the master control listener.
    pub fn master_addr(&self) -> String {
        format!("{}:{}", self.master_host, self.master_port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.role != RunRole::Worker {
            if self.users == 0 {
                return Err(ConfigError::MissingUsers(self.role.as_str()));
            }
            if !self.spawn_rate.is_finite() || self.spawn_rate <= 0.0 {
                return Err(ConfigError::InvalidSpawnRate(self.spawn_rate));
            }
        }
        if self.role == RunRole::Master && self.expect_workers == 0 {
            return Err(ConfigError::Invalid {
                name: "expect_workers",
                reason: "a master needs at least one worker".into(),
            });
        }
        for (name, value) in [
            ("stats_interval", self.stats_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("heartbeat_timeout", self.heartbeat_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    name,
                    reason: "must be greater than 0".into(),
                });
            }
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::Invalid {
                name: "heartbeat_timeout",
                reason: format!(
                    "{:?} must exceed the heartbeat interval {:?}",
                    self.heartbeat_timeout, self.heartbeat_interval
                ),
            });
        }
        // a worker blocked stopping users sends no heartbeats meanwhile
        if self.role != RunRole::Standalone && self.stop_timeout >= self.heartbeat_timeout {
            return Err(ConfigError::Invalid {
                name: "stop_timeout",
                reason: format!(
                    "{:?} must be shorter than the heartbeat timeout {:?}",
                    self.stop_timeout, self.heartbeat_timeout
                ),
            });
        }
        if self.run_time.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Invalid {
                name: "run_time",
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

impl TryFrom<cli::Config> for RunConfig {
    type Error = ConfigError;

    fn try_from(cli: cli::Config) -> Result<Self, Self::Error> {
        let role: RunRole = cli.role.parse()?;
        let request_timeout = cli.request_timeout();
        let (users, spawn_rate) = match role {
            // workers are told how many users to run by the master
            RunRole::Worker => (cli.users.unwrap_or(0), cli.spawn_rate.unwrap_or(1.0)),
            _ => (
                cli.users.ok_or(ConfigError::MissingUsers(role.as_str()))?,
                cli.spawn_rate.ok_or_else(|| ConfigError::Invalid {
                    name: "spawn_rate",
                    reason: format!("required for the {role} role"),
                })?,
            ),
        };

        let config = RunConfig {
            role,
            host: cli.host,
            users,
            spawn_rate,
            run_time: cli.run_time.map(Duration::from_secs),
            stop_timeout: Duration::from_secs(cli.stop_timeout),
            master_host: cli.master_host,
            master_port: cli.master_port,
            expect_workers: cli.expect_workers,
            stats_interval: Duration::from_secs(cli.stats_interval),
            heartbeat_interval: Duration::from_secs(cli.heartbeat_interval),
            heartbeat_timeout: Duration::from_secs(cli.heartbeat_timeout),
            reconnect_grace: Duration::from_secs(cli.reconnect_grace),
            request_timeout,
            seed: cli.seed,
            worker_id: cli.worker_id,
        };
        config.validate()?;
        Ok(config)
    }
}
