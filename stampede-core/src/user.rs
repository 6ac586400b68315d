//! The simulated user loop.
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use rand::{SeedableRng, rngs::StdRng};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use outcome_stats::{Recorder, RequestOutcome};

use crate::{
    behavior::Action,
    coordinator::Workload,
    session::{UserContext, UserSession},
};

/// Stats key for requests issued by a scenario's `on_start` action.
pub const ON_START: &str = "on_start";

/// Stats key for failures of the behavior `name` itself, kept apart from the
/// requests it issued so a failed behavior never adds to their count.
pub fn error_key(name: &str) -> String {
    format!("{name} (error)")
}

/// Lifecycle of one simulated user. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UserState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// One independent actor: select a behavior, run it, think, repeat until
/// cancelled.
pub struct SimulatedUser {
    session: UserSession,
    workload: Workload,
    recorder: Arc<Recorder>,
    rng: StdRng,
    state: watch::Sender<UserState>,
    token: CancellationToken,
}

impl std::fmt::Debug for SimulatedUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedUser")
            .field("session", &self.session)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl SimulatedUser {
    pub fn new(
        index: usize,
        workload: Workload,
        recorder: Arc<Recorder>,
        seed: Option<u64>,
        token: CancellationToken,
    ) -> (Self, watch::Receiver<UserState>) {
        let session = UserSession::new(index, workload.scenario().default_headers().clone());
        let (state, rx) = watch::channel(UserState::Starting);
        let user = Self {
            session,
            workload,
            recorder,
            rng: user_rng(seed, index),
            state,
            token,
        };
        (user, rx)
    }

    pub fn session(&self) -> &UserSession {
        &self.session
    }

    /// Drive the user until its token is cancelled. Cancellation is observed
    /// between behaviors and during think time, never inside a behavior.
    pub async fn run(mut self) {
        if let Some(action) = self.workload.scenario().start_action().cloned() {
            self.execute(ON_START, &action).await;
        }
        self.state.send_replace(UserState::Running);
        trace!("user running");

        let scheduler = Arc::clone(self.workload.scheduler());
        let think_time = self.workload.scenario().wait_time();
        while !self.token.is_cancelled() {
            let behavior = scheduler.select(&mut self.rng);
            self.execute(behavior.name(), behavior.action()).await;

            let pause = think_time.sample(&mut self.rng);
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        self.state.send_replace(UserState::Stopping);
        trace!("user stopping");
        self.state.send_replace(UserState::Stopped);
    }

    /// Run `action` once. A returned error or a panic becomes one failed
    /// outcome under [`error_key`]; the loop carries on either way.
    async fn execute(&mut self, name: &str, action: &Arc<dyn Action>) {
        let started = Instant::now();
        let result = {
            let mut ctx = UserContext::new(
                &mut self.session,
                self.workload.transport().as_ref(),
                &self.recorder,
                name,
                &mut self.rng,
            );
            AssertUnwindSafe(action.run(&mut ctx)).catch_unwind().await
        };

        let detail = match result {
            Ok(Ok(())) => return,
            Ok(Err(err)) if err.is_recorded() => {
                debug!(behavior = name, %err, "behavior failed");
                return;
            }
            Ok(Err(err)) => err.to_string(),
            Err(panic) => format!("behavior panicked: {}", panic_message(&*panic)),
        };
        debug!(behavior = name, %detail, "behavior failed");
        self.recorder
            .record(RequestOutcome::failure(error_key(name), started.elapsed(), detail));
    }
}

/// Per-user RNG. With a run seed every user gets its own reproducible stream.
fn user_rng(seed: Option<u64>, index: usize) -> StdRng {
    match seed {
        Some(seed) => {
            StdRng::seed_from_u64(seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
        }
        None => StdRng::from_entropy(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic payload"
    }
}
