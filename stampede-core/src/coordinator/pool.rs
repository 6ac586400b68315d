//! The set of simulated users a coordinator owns.
use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn};
use tracing_futures::Instrument;

use outcome_stats::Recorder;

use super::Workload;
use crate::user::{SimulatedUser, UserState};

#[derive(Debug)]
struct UserHandle {
    index: usize,
    token: CancellationToken,
    state: watch::Receiver<UserState>,
    task: JoinHandle<()>,
}

/// Spawns, tracks and stops simulated users. Users are stopped newest
/// first when the pool shrinks.
#[derive(Debug)]
pub struct UserPool {
    workload: Workload,
    recorder: Arc<Recorder>,
    seed: Option<u64>,
    users: Vec<UserHandle>,
    next_index: usize,
    peak: usize,
}

impl UserPool {
    pub fn new(workload: Workload, recorder: Arc<Recorder>, seed: Option<u64>) -> Self {
        Self {
            workload,
            recorder,
            seed,
            users: Vec::new(),
            next_index: 0,
            peak: 0,
        }
    }

    /// Start `count` more users.
    pub fn spawn(&mut self, count: usize) {
        for _ in 0..count {
            let index = self.next_index;
            self.next_index += 1;

            let token = CancellationToken::new();
            let (user, state) = SimulatedUser::new(
                index,
                self.workload.clone(),
                Arc::clone(&self.recorder),
                self.seed,
                token.clone(),
            );
            let span = info_span!("user", index, id = %user.session().id());
            let task = tokio::spawn(user.run().instrument(span));
            self.users.push(UserHandle {
                index,
                token,
                state,
                task,
            });
        }
        self.peak = self.peak.max(self.users.len());
        if count > 0 {
            debug!(spawned = count, total = self.users.len(), "spawned users");
        }
    }

    /// Users owned right now, whatever their state.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Users past their `on_start` and inside the behavior loop.
    pub fn running(&self) -> usize {
        self.users
            .iter()
            .filter(|u| *u.state.borrow() == UserState::Running)
            .count()
    }

    /// Most users this pool has owned at once.
    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Stop the newest users until at most `target` remain. Returns how many
    /// had to be aborted after `grace`.
    pub async fn shrink_to(&mut self, target: usize, grace: Duration) -> usize {
        if self.users.len() <= target {
            return 0;
        }
        let excess = self.users.split_off(target);
        debug!(stopping = excess.len(), remaining = target, "shrinking user pool");
        stop(excess, grace).await
    }

    /// Stop every user. In-flight behaviors get `grace` to finish; anything
    /// still running after that is aborted, which records its outstanding
    /// request as failed. Returns how many users were aborted.
    pub async fn stop_all(&mut self, grace: Duration) -> usize {
        let users = std::mem::take(&mut self.users);
        stop(users, grace).await
    }
}

async fn stop(users: Vec<UserHandle>, grace: Duration) -> usize {
    for user in &users {
        user.token.cancel();
    }

    let deadline = Instant::now() + grace;
    let mut forced = 0;
    for mut user in users {
        match timeout_at(deadline, &mut user.task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(index = user.index, ?err, "user task ended abnormally"),
            Err(_) => {
                error!(
                    index = user.index,
                    grace = ?grace,
                    "user did not stop within grace period, aborting"
                );
                user.task.abort();
                // wait for the abort so the dropped request is recorded
                let _ = user.task.await;
                forced += 1;
            }
        }
    }
    forced
}
