//! HTTP transport for stampede, backed by a shared `reqwest` client.
//!
//! One [`HttpTransport`] is built per process and handed to every simulated
//! user; `reqwest::Client` pools connections internally.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    non_snake_case,
    non_upper_case_globals
)]
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::trace;

use stampede_core::transport::{Method, Request, Response, Transport, TransportError};

/// User-Agent sent when a request does not set its own.
pub static USER_AGENT: &str = concat!("stampede/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: String,
    timeout: Duration,
}

impl HttpTransport {
    /// Transport for requests relative to `base`, e.g. `http://localhost:8000`.
    /// Every request is bounded by `timeout`.
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| TransportError::Other(err.to_string()))?;
        let base = base.into().trim_end_matches('/').to_owned();
        Ok(Self {
            client,
            base,
            timeout,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_owned()
        } else if path.starts_with('/') {
            format!("{}{}", self.base, path)
        } else {
            format!("{}/{}", self.base, path)
        }
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_builder() {
            TransportError::Encode(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

fn method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
        Method::Head => reqwest::Method::HEAD,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let url = self.url(&request.path);
        trace!(method = %request.method, %url, "http request");

        let mut builder = self.client.request(method(request.method), url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|err| self.classify(err))?;
        let status = response.status().as_u16();
        match response.bytes().await {
            Ok(body) => Ok(Response::new(status, body, started.elapsed())),
            // the exchange happened, so this is a failed outcome rather than an error
            Err(err) => {
                let mut partial = Response::new(status, Bytes::new(), started.elapsed());
                partial.failure = Some(match self.classify(err) {
                    TransportError::Timeout(after) => format!("body timed out after {after:?}"),
                    other => format!("failed to read body: {other}"),
                });
                Ok(partial)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use serde_json::json;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
    };

    use super::*;

    /// Accept one connection, capture the raw request, and answer with
    /// `status` and `body`. `None` never answers.
    async fn serve_once(reply: Option<(&'static str, &'static str)>) -> (SocketAddr, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.expect("read");
                raw.extend_from_slice(&buf[..n]);
                if n == 0 || request_complete(&raw) {
                    break;
                }
            }
            match reply {
                Some((status, body)) => {
                    let response = format!(
                        "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    stream.write_all(response.as_bytes()).await.expect("write");
                }
                None => tokio::time::sleep(Duration::from_secs(30)).await,
            }
            String::from_utf8_lossy(&raw).into_owned()
        });
        (addr, task)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(head_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..head_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        raw.len() >= head_end + 4 + length
    }

    fn transport(addr: SocketAddr) -> HttpTransport {
        HttpTransport::new(format!("http://{addr}/"), Duration::from_secs(5)).expect("client")
    }

    #[tokio::test]
    async fn get_forwards_headers_and_returns_body() {
        let (addr, server) = serve_once(Some(("200 OK", r#"{"jobs":[]}"#))).await;
        let response = transport(addr)
            .send(Request::get("/api/v1/jobs?limit=20").header("Authorization", "Bearer abc"))
            .await
            .expect("response");

        assert_eq!(response.status, 200);
        assert!(response.is_success());
        assert_eq!(&response.body[..], br#"{"jobs":[]}"#);

        let raw = server.await.expect("server").to_ascii_lowercase();
        assert!(raw.starts_with("get /api/v1/jobs?limit=20 http/1.1"));
        assert!(raw.contains("authorization: bearer abc"));
        assert!(raw.contains("user-agent: stampede/"));
    }

    #[tokio::test]
    async fn server_error_is_a_failed_response_not_an_error() {
        let (addr, server) = serve_once(Some(("500 Internal Server Error", "boom"))).await;
        let request = Request::post("/api/v1/jobs")
            .json(&json!({ "title": "Rust engineer" }))
            .expect("encode");
        let response = transport(addr).send(request).await.expect("response");

        assert_eq!(response.status, 500);
        assert_eq!(response.failure().as_deref(), Some("HTTP 500"));
        let raw = server.await.expect("server");
        assert!(raw.ends_with(r#"{"title":"Rust engineer"}"#));
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let addr = {
            let probe = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            probe.local_addr().expect("addr")
        };
        let err = transport(addr)
            .send(Request::get("/health"))
            .await
            .expect_err("nothing listening");
        assert!(matches!(err, TransportError::Connect(_)), "{err:?}");
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let (addr, server) = serve_once(None).await;
        let transport =
            HttpTransport::new(format!("http://{addr}"), Duration::from_millis(200)).expect("client");
        let err = transport
            .send(Request::get("/slow"))
            .await
            .expect_err("timeout");
        assert!(matches!(err, TransportError::Timeout(_)), "{err:?}");
        server.abort();
    }

    #[test]
    fn urls_join_against_base() {
        let transport = HttpTransport::new("http://svc:8000/", Duration::from_secs(1)).expect("client");
        assert_eq!(transport.base(), "http://svc:8000");
        assert_eq!(transport.url("/health"), "http://svc:8000/health");
        assert_eq!(transport.url("health"), "http://svc:8000/health");
        assert_eq!(transport.url("https://other/x"), "https://other/x");
    }
}
