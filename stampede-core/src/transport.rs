//! The request/response boundary simulated users talk through.
//!
//! The engine never speaks HTTP itself. A [`Transport`] takes a [`Request`]
//! and hands back a [`Response`]; the `http-transport` crate provides the real
//! one and tests plug in scripted fakes.
use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Header name -> value. Ordered so requests print deterministically.
pub type HeaderMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out waiting for response after {0:?}")]
    Timeout(Duration),
    #[error("connection error: {0}")]
    Connect(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("request failed: {0}")]
    Other(String),
}

/// One outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Path relative to the target host, e.g. `/api/v1/jobs?limit=20`.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Stats key override. Defaults to the behavior name.
    pub name: Option<String>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            name: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Serialize `body` as the JSON payload.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, TransportError> {
        let encoded =
            serde_json::to_vec(body).map_err(|err| TransportError::Encode(err.to_string()))?;
        self.body = Some(Bytes::from(encoded));
        Ok(self.header("Content-Type", "application/json"))
    }

    /// Aggregate this request's outcome under `name` instead of the behavior
    /// name, e.g. to group `/api/v1/jobs/{id}` lookups.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// What came back for a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
    pub elapsed: Duration,
    /// Failure reported by the transport for an otherwise complete exchange.
    pub failure: Option<String>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Bytes>, elapsed: Duration) -> Self {
        Self {
            status,
            body: body.into(),
            elapsed,
            failure: None,
        }
    }

    /// Failure detail for this response, counting any 4xx/5xx status as a
    /// failure.
    pub fn failure(&self) -> Option<String> {
        match &self.failure {
            Some(detail) => Some(detail.clone()),
            None if self.status >= 400 => Some(format!("HTTP {}", self.status)),
            None => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure().is_none()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Sends requests to the system under test.
///
/// Implementations must be shareable across every simulated user of a
/// process; each user holds the same `Arc<dyn Transport>`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: Request) -> Result<Response, TransportError>;
}
