//! A single request outcome.
use std::time::Duration;

/// Immutable record of one interaction issued by a simulated user.
///
/// A failure detail is present exactly when the request failed; the
/// constructors are the only way to build one, so the two can never
/// disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    name: String,
    elapsed: Duration,
    payload_bytes: u64,
    failure: Option<String>,
}

impl RequestOutcome {
    /// A request that completed successfully.
    pub fn success(name: impl Into<String>, elapsed: Duration, payload_bytes: u64) -> Self {
        Self {
            name: name.into(),
            elapsed,
            payload_bytes,
            failure: None,
        }
    }

    /// A request that failed with `detail`.
    pub fn failure(name: impl Into<String>, elapsed: Duration, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            elapsed,
            payload_bytes: 0,
            failure: Some(detail.into()),
        }
    }

    /// Set the payload size, for failures that still returned a body.
    pub fn with_payload(mut self, payload_bytes: u64) -> Self {
        self.payload_bytes = payload_bytes;
        self
    }

    /// Stats key this outcome is aggregated under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wall time from issuing the request to its completion or abandonment.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Size of the response payload in bytes.
    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes
    }

    /// Whether the request succeeded.
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// The failure detail, `None` for successful requests.
    pub fn failure_detail(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}
