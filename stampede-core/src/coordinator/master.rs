use std::{collections::BTreeMap, io, net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::{Instant, MissedTickBehavior, interval, timeout},
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, error, info, instrument, trace, warn};

use outcome_stats::{Aggregator, RunMeta, RunReport};

use super::{RunRole, until};
use crate::{
    config::RunConfig,
    control::{ControlCodec, ControlMessage, Heartbeat, Inbound, Spawn},
    error::ChannelError,
    hooks::Hooks,
};

/// Sender name on heartbeats from the master.
pub const MASTER_ID: &str = "master";

/// Extra time past the stop grace for workers' final reports to arrive.
const FINAL_REPORT_MARGIN: Duration = Duration::from_secs(2);

type ConnId = u64;

#[derive(Debug)]
enum MasterEvent {
    Joined {
        conn: ConnId,
        worker_id: String,
        outbound: mpsc::UnboundedSender<ControlMessage>,
    },
    Message {
        conn: ConnId,
        msg: ControlMessage,
    },
    Left {
        conn: ConnId,
        reason: String,
    },
}

#[derive(Debug)]
struct WorkerLink {
    worker_id: String,
    outbound: mpsc::UnboundedSender<ControlMessage>,
    last_seen: Instant,
    assigned: usize,
    user_count: usize,
    finished: bool,
}

impl WorkerLink {
    fn send(&self, msg: ControlMessage) {
        if self.outbound.send(msg).is_err() {
            trace!(worker_id = %self.worker_id, "worker connection already closed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// waiting for `expect_workers` workers
    Gathering,
    Running,
    /// stop sent, collecting final reports
    Stopping,
}

/// Splits the load across workers and aggregates what they report. Runs no
/// users itself.
#[derive(Debug)]
pub struct Master {
    config: RunConfig,
    hooks: Hooks,
    listener: TcpListener,
}

impl Master {
    /// Bind the control listener on `master_host:master_port`.
    pub async fn bind(config: RunConfig, hooks: Hooks) -> Result<Self, ChannelError> {
        let addr = config.master_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ChannelError::Bind { addr, source })?;
        Ok(Self {
            config,
            hooks,
            listener,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[instrument(name = "master", level = "debug", skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<RunReport> {
        let Master {
            config,
            hooks,
            listener,
        } = self;
        info!(
            addr = ?listener.local_addr().ok(),
            expect_workers = config.expect_workers,
            "waiting for workers"
        );

        let (events_tx, events) = mpsc::unbounded_channel();
        let accepting = CancellationToken::new();
        let acceptor = tokio::spawn(accept_loop(
            listener,
            events_tx,
            config.heartbeat_timeout,
            accepting.clone(),
        ));

        let mut state = MasterState::new(config, hooks);
        let stopped = state.drive(events, shutdown).await;

        accepting.cancel();
        if let Err(err) = acceptor.await {
            warn!(?err, "accept loop ended abnormally");
        }
        let report = state.finish(stopped);
        Ok(report)
    }
}

struct MasterState {
    config: RunConfig,
    hooks: Hooks,
    workers: BTreeMap<ConnId, WorkerLink>,
    aggregator: Aggregator,
    phase: Phase,
    started: Option<Instant>,
    peak_users: usize,
    peak_workers: usize,
    spawning_complete: bool,
}

impl MasterState {
    fn new(config: RunConfig, hooks: Hooks) -> Self {
        Self {
            config,
            hooks,
            workers: BTreeMap::new(),
            aggregator: Aggregator::new(),
            phase: Phase::Gathering,
            started: None,
            peak_users: 0,
            peak_workers: 0,
            spawning_complete: false,
        }
    }

    /// Run until stopped, then collect final reports. Returns the instant
    /// the stop began.
    async fn drive(
        &mut self,
        mut events: mpsc::UnboundedReceiver<MasterEvent>,
        shutdown: CancellationToken,
    ) -> Instant {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadline = None;

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
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle(event);
                        if self.phase == Phase::Gathering
                            && self.workers.len() >= self.config.expect_workers
                        {
                            self.start_spawning();
                            deadline = self.config.run_time.map(|run_time| Instant::now() + run_time);
                        }
                    }
                    None => {
                        error!("accept loop stopped unexpectedly");
                        break;
                    }
                },
                _ = heartbeat.tick() => self.heartbeat(),
            }
        }

        let stopped = Instant::now();
        self.collect_final_reports(&mut events).await;
        stopped
    }

    fn start_spawning(&mut self) {
        info!(
            workers = self.workers.len(),
            users = self.config.users,
            spawn_rate = self.config.spawn_rate,
            "ramping up"
        );
        self.phase = Phase::Running;
        self.started = Some(Instant::now());
        self.hooks.test_start(RunRole::Master, self.config.users);
        self.rebalance();
    }

    /// Split users and spawn rate evenly over connected workers, in worker id
    /// order. The first `users % n` workers take one extra user.
    fn rebalance(&mut self) {
        if self.phase != Phase::Running || self.workers.is_empty() {
            return;
        }
        let mut links: Vec<_> = self.workers.values_mut().collect();
        links.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        let shares = split_users(self.config.users, links.len());
        let spawn_rate = self.config.spawn_rate / links.len() as f64;
        for (link, user_count) in links.into_iter().zip(shares) {
            link.assigned = user_count;
            debug!(worker_id = %link.worker_id, user_count, spawn_rate, "assigning users");
            link.send(ControlMessage::Spawn(Spawn {
                user_count,
                spawn_rate,
            }));
        }
    }

    fn handle(&mut self, event: MasterEvent) {
        match event {
            MasterEvent::Joined {
                conn,
                worker_id,
                outbound,
            } => {
                // a reconnecting worker may beat the close of its old link
                let stale: Vec<_> = self
                    .workers
                    .iter()
                    .filter(|(_, link)| link.worker_id == worker_id)
                    .map(|(conn, _)| *conn)
                    .collect();
                for old in stale {
                    self.workers.remove(&old);
                }
                info!(%worker_id, conn, "worker connected");
                self.workers.insert(
                    conn,
                    WorkerLink {
                        worker_id,
                        outbound,
                        last_seen: Instant::now(),
                        assigned: 0,
                        user_count: 0,
                        finished: false,
                    },
                );
                self.peak_workers = self.peak_workers.max(self.workers.len());
                self.rebalance();
            }
            MasterEvent::Left { conn, reason } => {
                if let Some(link) = self.workers.remove(&conn) {
                    warn!(worker_id = %link.worker_id, %reason, "worker disconnected");
                    self.rebalance();
                }
            }
            // reports are tagged, so one arriving on a replaced connection
            // still counts
            MasterEvent::Message {
                conn,
                msg: ControlMessage::Stats(report),
            } => {
                if let Some(link) = self.workers.get_mut(&conn) {
                    link.last_seen = Instant::now();
                    if report.last {
                        link.finished = true;
                    }
                }
                if self.aggregator.merge_report(&report) {
                    trace!(
                        worker_id = %report.worker_id,
                        epoch = report.epoch,
                        requests = report.snapshot.request_count(),
                        "merged stats report"
                    );
                }
            }
            MasterEvent::Message { conn, msg } => {
                let Some(link) = self.workers.get_mut(&conn) else {
                    debug!(conn, tag = msg.tag(), "ignoring message from replaced connection");
                    return;
                };
                link.last_seen = Instant::now();
                match msg {
                    ControlMessage::Heartbeat(beat) => {
                        link.user_count = beat.user_count;
                        self.observe_users();
                    }
                    other => {
                        debug!(worker_id = %link.worker_id, tag = other.tag(), "ignoring message");
                    }
                }
            }
        }
    }

    fn observe_users(&mut self) {
        let running: usize = self.workers.values().map(|link| link.user_count).sum();
        self.peak_users = self.peak_users.max(running);
        if self.phase == Phase::Running && !self.spawning_complete && running >= self.config.users {
            self.spawning_complete = true;
            let elapsed = self.started.map(|started| started.elapsed());
            info!(users = running, ?elapsed, "spawning complete");
            self.hooks.spawning_complete(running);
        }
    }

    fn heartbeat(&mut self) {
        let timeout = self.config.heartbeat_timeout;
        let silent: Vec<_> = self
            .workers
            .iter()
            .filter(|(_, link)| link.last_seen.elapsed() > timeout)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in &silent {
            if let Some(link) = self.workers.remove(conn) {
                warn!(
                    worker_id = %link.worker_id,
                    err = %ChannelError::HeartbeatTimeout(timeout),
                    "dropping silent worker"
                );
            }
        }
        if !silent.is_empty() {
            self.rebalance();
        }

        for link in self.workers.values() {
            link.send(ControlMessage::Heartbeat(Heartbeat {
                sender: MASTER_ID.to_owned(),
                user_count: link.assigned,
            }));
        }
    }

    /// Tell every worker to stop and wait for each one's last report, then
    /// send quit.
    async fn collect_final_reports(&mut self, events: &mut mpsc::UnboundedReceiver<MasterEvent>) {
        self.phase = Phase::Stopping;
        for link in self.workers.values() {
            link.send(ControlMessage::Stop);
        }
        let wait = self.config.stop_timeout + FINAL_REPORT_MARGIN;
        info!(workers = self.workers.len(), ?wait, "waiting for final worker reports");

        let collected = timeout(wait, async {
            while self.workers.values().any(|link| !link.finished) {
                match events.recv().await {
                    // late joiners during a stop get no work
                    Some(MasterEvent::Joined { worker_id, .. }) => {
                        debug!(%worker_id, "ignoring worker joining during stop");
                    }
                    Some(event) => self.handle(event),
                    None => break,
                }
            }
        })
        .await;
        if collected.is_err() {
            let missing: Vec<_> = self
                .workers
                .values()
                .filter(|link| !link.finished)
                .map(|link| link.worker_id.as_str())
                .collect();
            warn!(?missing, "final reports did not arrive in time");
        }

        for link in self.workers.values() {
            link.send(ControlMessage::Quit);
        }
        // dropping the senders closes each connection once quit is written
        self.workers.clear();
    }

    fn finish(self, stopped: Instant) -> RunReport {
        let duration = self
            .started
            .map(|started| stopped.duration_since(started))
            .unwrap_or_default();
        let report = RunReport::new(
            self.aggregator.snapshot(),
            RunMeta {
                mode: RunRole::Master.to_string(),
                target_users: self.config.users,
                peak_users: self.peak_users,
                workers: self.peak_workers,
                duration,
                forced_stops: 0,
            },
        );
        self.hooks.test_stop(&report);
        report
    }
}

/// Even split of `users` over `workers`, remainder to the first ones.
fn split_users(users: usize, workers: usize) -> Vec<usize> {
    if workers == 0 {
        return Vec::new();
    }
    let base = users / workers;
    let extra = users % workers;
    (0..workers)
        .map(|i| base + usize::from(i < extra))
        .collect()
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::UnboundedSender<MasterEvent>,
    hello_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut next_conn: ConnId = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    next_conn += 1;
                    debug!(%peer, conn = next_conn, "accepted control connection");
                    tokio::spawn(serve_worker(
                        next_conn,
                        stream,
                        events.clone(),
                        hello_timeout,
                        cancel.clone(),
                    ));
                }
                Err(err) => {
                    error!(?err, "failed to accept control connection");
                }
            },
        }
    }
}

/// Pump one worker connection: wait for its hello, then relay frames both
/// ways until either side closes.
async fn serve_worker(
    conn: ConnId,
    stream: TcpStream,
    events: mpsc::UnboundedSender<MasterEvent>,
    hello_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, ControlCodec::new());

    let hello = tokio::select! {
        _ = cancel.cancelled() => return,
        hello = timeout(hello_timeout, await_hello(&mut framed)) => hello,
    };
    let worker_id = match hello {
        Ok(Some(worker_id)) => worker_id,
        Ok(None) => {
            debug!(conn, "connection closed before hello");
            return;
        }
        Err(_) => {
            warn!(conn, ?hello_timeout, "no hello from connection, closing");
            return;
        }
    };

    let (outbound, mut to_worker) = mpsc::unbounded_channel();
    if events
        .send(MasterEvent::Joined {
            conn,
            worker_id: worker_id.clone(),
            outbound,
        })
        .is_err()
    {
        return;
    }

    let reason = loop {
        tokio::select! {
            msg = to_worker.recv() => match msg {
                Some(msg) => {
                    if let Err(err) = framed.send(msg).await {
                        break ChannelError::from(err).to_string();
                    }
                }
                None => break "closed by master".to_owned(),
            },
            frame = framed.next() => match frame {
                Some(Ok(Inbound::Message(msg))) => {
                    if events.send(MasterEvent::Message { conn, msg }).is_err() {
                        break "master stopped".to_owned();
                    }
                }
                Some(Ok(Inbound::Unknown(tag))) => {
                    debug!(%worker_id, %tag, "ignoring unknown control message");
                }
                Some(Ok(Inbound::Malformed { tag, reason })) => {
                    warn!(%worker_id, ?tag, %reason, "dropping malformed control message");
                }
                Some(Err(err)) => break ChannelError::from(err).to_string(),
                None => break ChannelError::Closed.to_string(),
            },
        }
    };
    let _ = events.send(MasterEvent::Left { conn, reason });
}

async fn await_hello(framed: &mut Framed<TcpStream, ControlCodec>) -> Option<String> {
    while let Some(frame) = framed.next().await {
        match frame {
            Ok(Inbound::Message(ControlMessage::Hello(hello))) => return Some(hello.worker_id),
            Ok(other) => debug!(?other, "ignoring frame before hello"),
            Err(err) => {
                debug!(?err, "control connection failed before hello");
                return None;
            }
        }
    }
    None
}
