//! Per-user state and the context handed to behaviors.
use rand::rngs::StdRng;
use tokio::time::Instant;
use tracing::trace;

use outcome_stats::{Recorder, RequestOutcome};

use crate::transport::{HeaderMap, Request, Response, Transport, TransportError};

/// Failure detail for a request cut off by a forced stop.
pub const ABANDONED: &str = "request abandoned: user stopped before completion";

/// State owned by exactly one simulated user for its whole life.
#[derive(Debug, Clone)]
pub struct UserSession {
    id: String,
    index: usize,
    headers: HeaderMap,
}

impl UserSession {
    pub fn new(index: usize, headers: HeaderMap) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            index,
            headers,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spawn order of the owning user within its process.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Headers sent with every request this user makes.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(name)
    }
}

/// Everything a behavior may touch while it runs: its own user's session,
/// the user's RNG, and the request path to the transport.
pub struct UserContext<'a> {
    session: &'a mut UserSession,
    transport: &'a dyn Transport,
    recorder: &'a Recorder,
    behavior: &'a str,
    rng: &'a mut StdRng,
}

impl std::fmt::Debug for UserContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserContext")
            .field("session", &self.session)
            .field("behavior", &self.behavior)
            .finish()
    }
}

impl<'a> UserContext<'a> {
    pub(crate) fn new(
        session: &'a mut UserSession,
        transport: &'a dyn Transport,
        recorder: &'a Recorder,
        behavior: &'a str,
        rng: &'a mut StdRng,
    ) -> Self {
        Self {
            session,
            transport,
            recorder,
            behavior,
            rng,
        }
    }

    pub fn session(&self) -> &UserSession {
        &*self.session
    }

    pub fn session_mut(&mut self) -> &mut UserSession {
        &mut *self.session
    }

    /// Name of the behavior being executed.
    pub fn behavior(&self) -> &str {
        self.behavior
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut *self.rng
    }

    /// Send `request` with this user's session headers and record its
    /// outcome. Headers set on the request win over session headers.
    ///
    /// The outcome is recorded before this returns, including on `Err`, so
    /// callers may propagate the error with `?` without it being counted
    /// twice.
    pub async fn request(&mut self, mut request: Request) -> Result<Response, TransportError> {
        for (name, value) in self.session.headers() {
            request
                .headers
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| self.behavior.to_string());
        trace!(%name, method = %request.method, path = %request.path, "sending request");

        let pending = PendingRequest::start(self.recorder, name.clone());
        match self.transport.send(request).await {
            Ok(response) => {
                let payload = response.body.len() as u64;
                let outcome = match response.failure() {
                    None => RequestOutcome::success(name, response.elapsed, payload),
                    Some(detail) => {
                        RequestOutcome::failure(name, response.elapsed, detail).with_payload(payload)
                    }
                };
                pending.complete(outcome);
                Ok(response)
            }
            Err(err) => {
                let elapsed = pending.started.elapsed();
                pending.complete(RequestOutcome::failure(name, elapsed, err.to_string()));
                Err(err)
            }
        }
    }
}

/// Records an abandoned-request failure if dropped before `complete`, which
/// happens when a user task is aborted mid-request.
struct PendingRequest<'a> {
    recorder: &'a Recorder,
    name: Option<String>,
    started: Instant,
}

impl<'a> PendingRequest<'a> {
    fn start(recorder: &'a Recorder, name: String) -> Self {
        Self {
            recorder,
            name: Some(name),
            started: Instant::now(),
        }
    }

    fn complete(mut self, outcome: RequestOutcome) {
        self.name = None;
        self.recorder.record(outcome);
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if let Some(name) = self.name.take() {
            self.recorder.record(RequestOutcome::failure(
                name,
                self.started.elapsed(),
                ABANDONED,
            ));
        }
    }
}
