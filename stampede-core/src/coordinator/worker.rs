use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{Instant, MissedTickBehavior, interval, interval_at, sleep, sleep_until, timeout},
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, info, info_span, instrument, warn};
use tracing_futures::Instrument;

use outcome_stats::{Aggregator, Recorder, RunMeta, RunReport, StatsReport};

use super::{RAMP_TICK, RampPlan, RunRole, UserPool, Workload, until};
use crate::{
    config::RunConfig,
    control::{ControlCodec, ControlMessage, Heartbeat, Hello, Inbound, Spawn},
    error::ChannelError,
    hooks::Hooks,
};

/// Time allowed for one connect attempt to the master.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// First reconnect delay; doubles per failed attempt.
const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
/// How long a finished worker waits for its last frames to go out.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

/// Delay before reconnect attempt `attempt` (0-based).
pub(crate) fn backoff(attempt: u32) -> Duration {
    RECONNECT_BASE
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(RECONNECT_MAX)
}

#[derive(Debug)]
enum LinkEvent {
    Connected,
    Lost(ChannelError),
    Message(ControlMessage),
}

/// Runs users on command from a master and reports their stats back.
#[derive(Debug)]
pub struct Worker {
    config: RunConfig,
    workload: Workload,
    hooks: Hooks,
    id: String,
    incarnation: String,
}

impl Worker {
    pub fn new(config: RunConfig, workload: Workload, hooks: Hooks) -> Self {
        let id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4().simple()));
        Self {
            config,
            workload,
            hooks,
            id,
            incarnation: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tag unique to this worker process, carried in every stats report.
    pub fn incarnation(&self) -> &str {
        &self.incarnation
    }

    #[instrument(
        name = "worker",
        level = "debug",
        skip_all,
        fields(worker_id = %self.id, incarnation = %self.incarnation)
    )]
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<RunReport> {
        let Worker {
            config,
            workload,
            hooks,
            id,
            incarnation,
        } = self;
        let addr = config.master_addr();
        info!(%addr, "connecting to master");

        let (outbound, to_master) = mpsc::unbounded_channel();
        let (link_events, mut events) = mpsc::unbounded_channel();
        let link_cancel = CancellationToken::new();
        let mut link = tokio::spawn(
            maintain_link(
                addr,
                id.clone(),
                config.heartbeat_timeout,
                to_master,
                link_events,
                link_cancel.clone(),
            )
            .instrument(info_span!("link")),
        );

        let recorder = Arc::new(Recorder::new());
        let mut pool = UserPool::new(workload, Arc::clone(&recorder), config.seed);
        let mut reports = Reports::new(id.clone(), incarnation);
        let mut ramp: Option<RampPlan> = None;
        let mut target_users = 0;
        let mut test_started = false;
        let mut stopped = false;
        let mut quit = false;
        let mut forced = 0;
        let mut disconnected_since: Option<Instant> = None;
        let mut paused = false;

        let started = Instant::now();
        let mut ramp_tick = interval(RAMP_TICK);
        ramp_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats_tick = interval_at(started + config.stats_interval, config.stats_interval);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let grace_deadline = disconnected_since
                .filter(|_| !paused)
                .map(|since| since + config.reconnect_grace);
            let ramping = !paused && ramp.as_ref().is_some_and(|plan| !plan.is_done());

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stop requested");
                    break;
                }
                _ = until(grace_deadline), if grace_deadline.is_some() => {
                    paused = true;
                    warn!(
                        grace = ?config.reconnect_grace,
                        users = pool.len(),
                        "master unreachable, pausing spawning"
                    );
                }
                event = events.recv() => match event {
                    None => break,
                    Some(LinkEvent::Connected) => {
                        info!("connected to master");
                        disconnected_since = None;
                        if paused {
                            info!("resuming spawning");
                            paused = false;
                        }
                    }
                    Some(LinkEvent::Lost(err)) => {
                        warn!(%err, "lost master link, reconnecting");
                        disconnected_since.get_or_insert_with(Instant::now);
                    }
                    Some(LinkEvent::Message(msg)) => match msg {
                        ControlMessage::Spawn(Spawn { user_count, spawn_rate }) => {
                            if !test_started {
                                test_started = true;
                                hooks.test_start(RunRole::Worker, user_count);
                            }
                            stopped = false;
                            target_users = user_count;
                            if user_count <= pool.len() {
                                ramp = None;
                                forced += pool.shrink_to(user_count, config.stop_timeout).await;
                                info!(users = pool.len(), "holding at assigned user count");
                            } else {
                                info!(from = pool.len(), to = user_count, spawn_rate, "ramping");
                                ramp = Some(RampPlan::new(pool.len(), user_count, spawn_rate));
                                ramp_tick.reset_immediately();
                            }
                        }
                        ControlMessage::Stop => {
                            info!(users = pool.len(), grace = ?config.stop_timeout, "stopping users");
                            ramp = None;
                            forced += pool.stop_all(config.stop_timeout).await;
                            if let Some(report) = reports.flush(&recorder, true) {
                                let _ = outbound.send(ControlMessage::Stats(report));
                            }
                            stopped = true;
                        }
                        ControlMessage::Heartbeat(_) => {
                            let _ = outbound.send(ControlMessage::Heartbeat(Heartbeat {
                                sender: id.clone(),
                                user_count: pool.len(),
                            }));
                        }
                        ControlMessage::Quit => {
                            info!("master sent quit");
                            quit = true;
                            break;
                        }
                        other => debug!(tag = other.tag(), "ignoring message"),
                    },
                },
                _ = ramp_tick.tick(), if ramping => {
                    if let Some(plan) = ramp.as_mut() {
                        pool.spawn(plan.next_batch());
                        if plan.is_done() {
                            info!(users = pool.len(), "spawning complete");
                            hooks.spawning_complete(pool.len());
                        }
                    }
                }
                _ = stats_tick.tick() => {
                    if let Some(report) = reports.flush(&recorder, false) {
                        let _ = outbound.send(ControlMessage::Stats(report));
                    }
                }
            }
        }

        if !pool.is_empty() {
            forced += pool.stop_all(config.stop_timeout).await;
        }
        if !quit && !stopped {
            // let the master count whatever ran before we went away
            if let Some(report) = reports.flush(&recorder, true) {
                let _ = outbound.send(ControlMessage::Stats(report));
            }
        } else {
            reports.absorb(&recorder);
        }
        drop(outbound);
        if quit {
            link_cancel.cancel();
        }
        if timeout(FLUSH_TIMEOUT, &mut link).await.is_err() {
            warn!("could not deliver final frames to master");
            link_cancel.cancel();
            let _ = link.await;
        }

        let report = RunReport::new(
            reports.totals.snapshot(),
            RunMeta {
                mode: RunRole::Worker.to_string(),
                target_users,
                peak_users: pool.peak(),
                workers: 0,
                duration: started.elapsed(),
                forced_stops: forced,
            },
        );
        hooks.test_stop(&report);
        Ok(report)
    }
}

/// Numbers outgoing stats reports and keeps the worker's own running totals.
#[derive(Debug)]
struct Reports {
    worker_id: String,
    incarnation: String,
    epoch: u64,
    totals: Aggregator,
}

impl Reports {
    fn new(worker_id: String, incarnation: String) -> Self {
        Self {
            worker_id,
            incarnation,
            epoch: 0,
            totals: Aggregator::new(),
        }
    }

    /// Flush the recorder into a report. Empty periodic flushes are skipped;
    /// a last report always goes out so the master knows this worker is done.
    fn flush(&mut self, recorder: &Recorder, last: bool) -> Option<StatsReport> {
        let snapshot = recorder.flush();
        if snapshot.is_empty() && !last {
            return None;
        }
        self.epoch += 1;
        self.totals.merge_local(&snapshot);
        debug!(epoch = self.epoch, last, requests = snapshot.request_count(), "sending stats");
        Some(StatsReport {
            worker_id: self.worker_id.clone(),
            incarnation: self.incarnation.clone(),
            epoch: self.epoch,
            last,
            snapshot,
        })
    }

    /// Fold anything left in the recorder into the local totals only.
    fn absorb(&mut self, recorder: &Recorder) {
        self.totals.merge_local(&recorder.flush());
    }
}

/// Keep a connection to the master up: connect with backoff, announce
/// ourselves, then pump frames until the link fails or we are done.
async fn maintain_link(
    addr: String,
    worker_id: String,
    heartbeat_timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<ControlMessage>,
    events: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut unsent: Option<ControlMessage> = None;
    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            connected = connect(&addr, &worker_id) => connected,
        };
        let err = match connected {
            Ok(mut framed) => {
                attempt = 0;
                if events.send(LinkEvent::Connected).is_err() {
                    return;
                }
                match pump(
                    &mut framed,
                    &mut outbound,
                    &mut unsent,
                    &events,
                    heartbeat_timeout,
                    &cancel,
                )
                .await
                {
                    Some(err) => err,
                    None => return,
                }
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            let _ = events.send(LinkEvent::Lost(err));
            return;
        }
        let delay = backoff(attempt);
        attempt = attempt.saturating_add(1);
        warn!(attempt, ?delay, %err, "master link down, retrying");
        if events.send(LinkEvent::Lost(err)).is_err() {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }
}

async fn connect(
    addr: &str,
    worker_id: &str,
) -> Result<Framed<TcpStream, ControlCodec>, ChannelError> {
    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            return Err(ChannelError::Connect {
                addr: addr.to_owned(),
                reason: err.to_string(),
            });
        }
        Err(_) => {
            return Err(ChannelError::Connect {
                addr: addr.to_owned(),
                reason: format!("timed out after {CONNECT_TIMEOUT:?}"),
            });
        }
    };
    let mut framed = Framed::new(stream, ControlCodec::new());
    framed
        .send(ControlMessage::Hello(Hello {
            worker_id: worker_id.to_owned(),
        }))
        .await?;
    Ok(framed)
}

/// Relay frames both ways. Returns `None` once there is nothing left to do
/// (cancelled, or every outbound message was written after the sender
/// closed) and the error otherwise. A message whose write failed is kept in
/// `unsent` and goes out first on the next connection.
async fn pump(
    framed: &mut Framed<TcpStream, ControlCodec>,
    outbound: &mut mpsc::UnboundedReceiver<ControlMessage>,
    unsent: &mut Option<ControlMessage>,
    events: &mpsc::UnboundedSender<LinkEvent>,
    heartbeat_timeout: Duration,
    cancel: &CancellationToken,
) -> Option<ChannelError> {
    let mut last_heard = Instant::now();
    loop {
        if let Some(msg) = unsent.take() {
            if let Err(err) = framed.send(msg.clone()).await {
                *unsent = Some(msg);
                return Some(err.into());
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = sleep_until(last_heard + heartbeat_timeout) => {
                return Some(ChannelError::HeartbeatTimeout(heartbeat_timeout));
            }
            msg = outbound.recv() => match msg {
                Some(msg) => *unsent = Some(msg),
                None => return None,
            },
            frame = framed.next() => match frame {
                Some(Ok(Inbound::Message(msg))) => {
                    last_heard = Instant::now();
                    if events.send(LinkEvent::Message(msg)).is_err() {
                        return None;
                    }
                }
                Some(Ok(Inbound::Unknown(tag))) => {
                    last_heard = Instant::now();
                    debug!(%tag, "ignoring unknown control message");
                }
                Some(Ok(Inbound::Malformed { tag, reason })) => {
                    last_heard = Instant::now();
                    warn!(?tag, %reason, "dropping malformed control message");
                }
                Some(Err(err)) => return Some(err.into()),
                None => return Some(ChannelError::Closed),
            },
        }
    }
}
