//! In-memory transport and workloads for exercising the engine without a
//! network. Built for this crate's own tests and, behind the `testing`
//! feature, for scenario crates' tests.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    behavior::{Action, Behavior, BehaviorError},
    coordinator::Workload,
    scenario::Scenario,
    session::UserContext,
    transport::{Request, Response, Transport, TransportError},
};

/// Stats key used by [`fetch_workload`].
pub const FETCH: &str = "fetch";

#[derive(Debug, Clone)]
enum Reply {
    Status(u16, Bytes),
    Refuse,
}

/// Answers every request from a fixed script after an optional delay, and
/// keeps a copy of each request it saw.
#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    delay: Duration,
    fallback: Reply,
    routes: Vec<(String, Reply)>,
    seen: Arc<Mutex<Vec<Request>>>,
}

impl ScriptedTransport {
    /// `200 {}` for everything.
    pub fn ok() -> Self {
        Self::with_fallback(Reply::Status(200, Bytes::from_static(b"{}")))
    }

    /// Connection refused for everything.
    pub fn refusing() -> Self {
        Self::with_fallback(Reply::Refuse)
    }

    fn with_fallback(fallback: Reply) -> Self {
        Self {
            delay: Duration::ZERO,
            fallback,
            routes: Vec::new(),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sleep this long before answering.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Answer requests whose path starts with `prefix`. The first matching
    /// route wins.
    pub fn route(mut self, prefix: impl Into<String>, status: u16, body: impl Into<Bytes>) -> Self {
        self.routes
            .push((prefix.into(), Reply::Status(status, body.into())));
        self
    }

    /// Handle on every request seen so far, in arrival order.
    pub fn requests(&self) -> Arc<Mutex<Vec<Request>>> {
        Arc::clone(&self.seen)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let reply = self
            .routes
            .iter()
            .find(|(prefix, _)| request.path.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.fallback.clone());
        self.seen.lock().push(request);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match reply {
            Reply::Status(status, body) => Ok(Response::new(status, body, self.delay)),
            Reply::Refuse => Err(TransportError::Connect("connection refused".into())),
        }
    }
}

/// Issues a single `GET` to a fixed path.
#[derive(Debug, Clone, Copy)]
pub struct Fetch(pub &'static str);

#[async_trait]
impl Action for Fetch {
    async fn run(&self, ctx: &mut UserContext<'_>) -> Result<(), BehaviorError> {
        ctx.request(Request::get(self.0)).await?;
        Ok(())
    }
}

/// One `fetch` behavior, no think time, against a transport that answers
/// after `delay`.
pub fn fetch_workload(delay: Duration) -> Workload {
    workload_with(ScriptedTransport::ok().delay(delay))
}

/// One `fetch` behavior, no think time, over `transport`.
pub fn workload_with(transport: ScriptedTransport) -> Workload {
    let scenario = Scenario::new("fetcher").behavior(Behavior::new(FETCH, 1, Fetch("/")));
    Workload::new(scenario, Arc::new(transport)).expect("single weight-1 behavior is valid")
}
