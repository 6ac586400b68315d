use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use outcome_stats::{Aggregator, Recorder, RunMeta, RunReport};

use super::{RAMP_TICK, RampPlan, RunRole, UserPool, Workload, until};
use crate::{config::RunConfig, hooks::Hooks};

/// Users and aggregation in this process.
#[instrument(name = "standalone", level = "debug", skip_all)]
pub(super) async fn run(
    config: RunConfig,
    workload: Workload,
    hooks: Hooks,
    shutdown: CancellationToken,
) -> anyhow::Result<RunReport> {
    let recorder = Arc::new(Recorder::new());
    let mut pool = UserPool::new(workload, Arc::clone(&recorder), config.seed);
    let mut aggregator = Aggregator::new();
    let mut ramp = RampPlan::new(0, config.users, config.spawn_rate);

    let started = Instant::now();
    let deadline = config.run_time.map(|run_time| started + run_time);
    hooks.test_start(RunRole::Standalone, config.users);
    info!(
        users = config.users,
        spawn_rate = config.spawn_rate,
        run_time = ?config.run_time,
        "ramping up"
    );

    let mut ramp_tick = interval(RAMP_TICK);
    ramp_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stats_tick = interval_at(started + config.stats_interval, config.stats_interval);
    stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("stop requested");
                break;
            }
            _ = until(deadline) => {
                info!("run time elapsed");
                break;
            }
            _ = ramp_tick.tick(), if !ramp.is_done() => {
                pool.spawn(ramp.next_batch());
                if ramp.is_done() {
                    info!(users = pool.len(), elapsed = ?started.elapsed(), "spawning complete");
                    hooks.spawning_complete(pool.len());
                }
            }
            _ = stats_tick.tick() => {
                let snapshot = recorder.flush();
                debug!(requests = snapshot.request_count(), "flushed stats");
                aggregator.merge_local(&snapshot);
            }
        }
    }

    info!(users = pool.len(), grace = ?config.stop_timeout, "stopping users");
    let forced = pool.stop_all(config.stop_timeout).await;
    aggregator.merge_local(&recorder.flush());

    let report = RunReport::new(
        aggregator.snapshot(),
        RunMeta {
            mode: RunRole::Standalone.to_string(),
            target_users: config.users,
            peak_users: pool.peak(),
            workers: 0,
            duration: started.elapsed(),
            forced_stops: forced,
        },
    );
    hooks.test_stop(&report);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use parking_lot::Mutex;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    use super::*;
    use crate::{hooks::RunListener, session::ABANDONED, testing};

    #[derive(Default)]
    struct Timeline {
        spawned: Mutex<Option<(Instant, usize)>>,
        stopped: Mutex<Option<u64>>,
    }

    struct Watch(Arc<Timeline>);

    impl RunListener for Watch {
        fn on_spawning_complete(&self, user_count: usize) {
            *self.0.spawned.lock() = Some((Instant::now(), user_count));
        }

        fn on_test_stop(&self, report: &RunReport) {
            *self.0.stopped.lock() = Some(report.total.requests);
        }
    }

    fn config(users: usize, rate: f64) -> RunConfig {
        let mut config = RunConfig::new(RunRole::Standalone, users, rate);
        config.seed = Some(11);
        config.stats_interval = Duration::from_secs(1);
        config
    }

    #[tokio::test(start_paused = true)]
    async fn fifty_users_at_ten_per_second_ramp_within_five_seconds() {
        let timeline = Arc::new(Timeline::default());
        let mut hooks = Hooks::new();
        hooks.register(Watch(Arc::clone(&timeline)));
        let mut config = config(50, 10.0);
        config.run_time = Some(Duration::from_secs(8));

        let started = Instant::now();
        let report = run(
            config,
            testing::fetch_workload(Duration::from_millis(200)),
            hooks,
            CancellationToken::new(),
        )
        .await
        .expect("run");

        let (at, users) = timeline.spawned.lock().expect("spawning completed");
        assert_eq!(users, 50);
        assert!(at - started <= Duration::from_secs(5), "ramp took {:?}", at - started);
        assert_eq!(report.meta.peak_users, 50);
        assert_eq!(report.meta.forced_stops, 0);
        assert_eq!(*timeline.stopped.lock(), Some(report.total.requests));
        assert!(report.total.requests > 0);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn stop_signal_abandons_slow_requests_after_grace() {
        let shutdown = CancellationToken::new();
        let mut config = config(3, 10.0);
        config.stop_timeout = Duration::from_secs(2);

        let stop = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stop.cancel();
        });

        let started = Instant::now();
        let report = run(
            config,
            testing::fetch_workload(Duration::from_secs(10)),
            Hooks::new(),
            shutdown,
        )
        .await
        .expect("run");

        assert!(started.elapsed() <= Duration::from_secs(3) + Duration::from_millis(10));
        assert_eq!(report.meta.forced_stops, 3);
        assert_eq!(report.total.requests, 3);
        assert_eq!(report.total.failures, 3);
        assert!(report.errors.iter().any(|e| e.detail == ABANDONED && e.occurrences == 3));
        assert!(logs_contain("user did not stop within grace period"));
    }
}
