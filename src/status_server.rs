//! Worker status endpoint.
//!
//! Line-delimited JSON over TCP. Each request line is either a bare method
//! name or `{"id": "..", "method": ".."}`; each reply is one JSON line:
//!
//! ```text
//! → {"id":"1","method":"status"}
//! ← {"id":"1","ok":true,"body":{..},"quota":{"limit":100,"remaining":99,"reset_in_secs":60}}
//! ```
//!
//! Every request is admitted through the rate limiter, keyed by peer IP.
//! The listener sets SO_REUSEPORT so sibling workers can bind the same
//! address and the kernel spreads connections across them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::health::HealthMonitor;
use crate::rate_limiter::RateLimiter;
use crate::recovery::with_recovery_async;
use crate::resilience::ResilienceHandle;
use crate::status::get_service_status;
use crate::supervisor::WorkerService;
use crate::types::{Error, Result};

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_LINE_BYTES: usize = 4096;

/// Shared state the endpoint reports on.
#[derive(Debug, Clone)]
pub struct StatusState {
    pub monitor: HealthMonitor,
    pub resilience: ResilienceHandle,
    pub limiter: Arc<Mutex<RateLimiter>>,
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: String,
    method: String,
}

/// Quota headers attached to every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub limit: u32,
    pub remaining: u32,
    pub reset_in_secs: u64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct Response {
    id: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
    quota: Quota,
}

/// TCP status server run by each worker.
#[derive(Debug)]
pub struct StatusServer {
    addr: SocketAddr,
    state: StatusState,
    tracker: TaskTracker,
}

impl StatusServer {
    pub fn new(addr: SocketAddr, state: StatusState) -> Self {
        Self {
            addr,
            state,
            tracker: TaskTracker::new(),
        }
    }

    /// Bind with SO_REUSEADDR (and SO_REUSEPORT on unix).
    pub fn bind(addr: SocketAddr) -> Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        #[cfg(unix)]
        socket.set_reuseport(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(1024)?)
    }

    /// Accept connections on `listener` until `shutdown`, then wait for
    /// in-flight connections to finish.
    pub async fn serve_listener(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "status_server_listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(active = self.tracker.len(), "status_server_draining");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "status_accept_failed");
                            continue;
                        }
                    };
                    tracing::debug!(peer = %peer, "status_connection_opened");

                    let state = self.state.clone();
                    let cancel = shutdown.clone();
                    self.tracker.spawn(async move {
                        let handled = with_recovery_async(
                            handle_connection(stream, peer, state, cancel),
                            "status_connection",
                        );
                        if let Err(e) = handled.await {
                            tracing::warn!(peer = %peer, error = %e, "status_connection_error");
                        }
                    });
                }
            }
        }

        drop(listener);
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("status_server_stopped");
        Ok(())
    }
}

#[async_trait]
impl WorkerService for StatusServer {
    async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = Self::bind(self.addr)?;
        self.serve_listener(listener, shutdown).await
    }
}

/// Serve request lines on one connection until EOF, idle timeout or shutdown.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: StatusState,
    cancel: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let key = peer.ip().to_string();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(READ_TIMEOUT, lines.next_line()) => match next {
                Err(_elapsed) => {
                    tracing::debug!(peer = %peer, "status_read_timeout");
                    break;
                }
                Ok(result) => match result? {
                    Some(line) => line,
                    None => break,
                },
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = if line.len() > MAX_LINE_BYTES {
            let quota = admit(&state, &key).await.1;
            error_response(String::new(), Error::validation("request line too long"), quota)
        } else {
            respond(&state, &key, &line).await
        };

        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        tokio::time::timeout(WRITE_TIMEOUT, writer.write_all(&encoded))
            .await
            .map_err(|_| Error::timeout("status write timed out"))??;
    }

    Ok(())
}

async fn respond(state: &StatusState, key: &str, line: &str) -> Response {
    let request = parse_request(line);
    let (admitted, quota) = admit(state, key).await;

    let request = match request {
        Ok(request) => request,
        Err(e) => return error_response(String::new(), e, quota),
    };
    if !admitted {
        tracing::debug!(key = key, "status_request_rate_limited");
        let e = Error::rate_limited(format!(
            "{} requests per {}s exceeded, retry in {}s",
            quota.limit,
            state.limiter.lock().await.window_seconds(),
            quota.reset_in_secs
        ));
        return error_response(request.id, e, quota);
    }

    match dispatch(state, &request.method).await {
        Ok(body) => Response {
            id: request.id,
            ok: true,
            body: Some(body),
            error: None,
            quota,
        },
        Err(e) => error_response(request.id, e, quota),
    }
}

async fn admit(state: &StatusState, key: &str) -> (bool, Quota) {
    let mut limiter = state.limiter.lock().await;
    let admitted = limiter.check_limit(key);
    let quota = Quota {
        limit: limiter.max_requests(),
        remaining: limiter.remaining_requests(key),
        reset_in_secs: limiter.window_seconds_remaining(key),
    };
    (admitted, quota)
}

fn parse_request(line: &str) -> Result<Request> {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        Ok(serde_json::from_str(trimmed)?)
    } else {
        Ok(Request {
            id: String::new(),
            method: trimmed.to_string(),
        })
    }
}

async fn dispatch(state: &StatusState, method: &str) -> Result<serde_json::Value> {
    match method {
        "ping" => Ok(serde_json::json!({ "pong": true })),
        "health" => Ok(serde_json::to_value(state.monitor.get_health_status())?),
        "status" => {
            let status = get_service_status(&state.monitor, &state.resilience).await;
            Ok(serde_json::to_value(status)?)
        }
        "circuits" => Ok(serde_json::to_value(
            state.resilience.circuit_summary().await,
        )?),
        other => Err(Error::not_found(format!("unknown method: {}", other))),
    }
}

fn error_response(id: String, error: Error, quota: Quota) -> Response {
    Response {
        id,
        ok: false,
        body: None,
        error: Some(ErrorBody {
            code: error.code(),
            message: error.to_string(),
        }),
        quota,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::StaticProbe;
    use crate::types::{HealthConfig, ResilienceConfig};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn state(max_requests: u32) -> StatusState {
        StatusState {
            monitor: HealthMonitor::new(HealthConfig::default(), Arc::new(StaticProbe::new())),
            resilience: ResilienceHandle::from_config(ResilienceConfig::default()),
            limiter: Arc::new(Mutex::new(RateLimiter::with_limits(max_requests, 60))),
        }
    }

    async fn start(
        state: StatusState,
    ) -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let listener = StatusServer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let server = StatusServer::new(addr, state);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { server.serve_listener(listener, token).await });
        (addr, shutdown, handle)
    }

    async fn roundtrip(
        lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
        request: &str,
    ) -> serde_json::Value {
        writer
            .write_all(format!("{}\n", request).as_bytes())
            .await
            .unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_status_request_and_quota() {
        let (addr, shutdown, handle) = start(state(10)).await;
        let (reader, mut writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut lines = BufReader::new(reader).lines();

        let reply = roundtrip(&mut lines, &mut writer, r#"{"id":"a","method":"status"}"#).await;
        assert_eq!(reply["id"], "a");
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["body"]["overall"], "unhealthy");
        assert_eq!(reply["quota"]["limit"], 10);
        assert_eq!(reply["quota"]["remaining"], 9);

        let reply = roundtrip(&mut lines, &mut writer, "ping").await;
        assert_eq!(reply["body"]["pong"], true);
        assert_eq!(reply["quota"]["remaining"], 8);

        drop(writer);
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rate_limited_per_peer() {
        let (addr, shutdown, handle) = start(state(2)).await;
        let (reader, mut writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut lines = BufReader::new(reader).lines();

        assert_eq!(roundtrip(&mut lines, &mut writer, "ping").await["ok"], true);
        assert_eq!(roundtrip(&mut lines, &mut writer, "ping").await["ok"], true);
        let denied = roundtrip(&mut lines, &mut writer, "health").await;
        assert_eq!(denied["ok"], false);
        assert_eq!(denied["error"]["code"], "RATE_LIMITED");
        assert_eq!(denied["quota"]["remaining"], 0);
        assert!(denied["quota"]["reset_in_secs"].as_u64().unwrap() > 0);

        drop(writer);
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_method_and_bad_json() {
        let (addr, shutdown, handle) = start(state(10)).await;
        let (reader, mut writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut lines = BufReader::new(reader).lines();

        let reply = roundtrip(&mut lines, &mut writer, "reboot").await;
        assert_eq!(reply["error"]["code"], "NOT_FOUND");

        let reply = roundtrip(&mut lines, &mut writer, "{oops").await;
        assert_eq!(reply["ok"], false);

        drop(writer);
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_connections() {
        let (addr, shutdown, handle) = start(state(10)).await;
        let stream = TcpStream::connect(addr).await.unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server drains idle connections")
            .unwrap()
            .unwrap();
        drop(stream);
    }
}
