//! JSON-RPC 2.0 client for app processes, spoken as HTTP/1.1 over a unix
//! domain socket.
//!
//! The client owns a small multi-thread tokio runtime that is created on the
//! first call. Callers are plain threads (runner workers); each call is
//! spawned onto the runtime and the caller blocks on a oneshot until the
//! exchange finishes, the timeout elapses, or the caller's token is
//! cancelled. The oneshot can only be fulfilled once.

use crate::config::RpcConfig;
use crate::error::codes;
use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to connect to {socket}: {source}")]
    Connect {
        socket: String,
        #[source]
        source: std::io::Error,
    },
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("call timed out after {0}ms")]
    Timeout(u64),
    #[error("call cancelled")]
    Cancelled,
    #[error("HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("I/O runtime unavailable: {0}")]
    Runtime(String),
}

impl RpcError {
    /// Error code used in the callback contract.
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::Timeout(_) => codes::TIMEOUT,
            RpcError::Cancelled => codes::CANCELLED,
            RpcError::Remote { .. } => codes::RPC_ERROR,
            _ => codes::RPC_TRANSPORT,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            RpcError::Remote { code, message } => json!({
                "error": self.code(),
                "code": code,
                "message": message,
            }),
            _ => json!({ "error": self.code(), "message": self.to_string() }),
        }
    }
}

/// Maps call arguments onto JSON-RPC `params`: objects are named, arrays
/// positional, `null` is an empty list and any other scalar a singleton.
pub fn rpc_params(args: &Value) -> Value {
    match args {
        Value::Object(_) | Value::Array(_) => args.clone(),
        Value::Null => Value::Array(Vec::new()),
        other => Value::Array(vec![other.clone()]),
    }
}

pub fn request_body(method: &str, args: &Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": Uuid::new_v4().to_string(),
        "method": method,
        "params": rpc_params(args),
    })
}

pub struct RpcClient {
    config: RpcConfig,
    runtime: OnceCell<Runtime>,
}

impl RpcClient {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            config,
            runtime: OnceCell::new(),
        }
    }

    fn runtime(&self) -> Result<&Runtime, RpcError> {
        self.runtime.get_or_try_init(|| {
            debug!(
                "[Rpc] Starting I/O runtime with {} threads",
                self.config.io_threads.max(1)
            );
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(self.config.io_threads.max(1))
                .thread_name("rpc-io")
                .enable_all()
                .build()
                .map_err(|e| RpcError::Runtime(e.to_string()))
        })
    }

    /// Performs one call and blocks until it resolves. Must not be called
    /// from inside an async context.
    pub fn call(
        &self,
        socket: &str,
        method: &str,
        args: &Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, RpcError> {
        let runtime = self.runtime()?;
        let body = request_body(method, args).to_string();
        let socket = socket.to_string();
        let cancel = cancel.clone();
        let limit = self.config.max_response_bytes;
        let (tx, rx) = oneshot::channel();

        debug!("[Rpc] Calling '{}' on {}", method, socket);
        runtime.spawn(async move {
            let exchange = exchange(&socket, &body, limit);
            let outcome = if timeout.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => Err(RpcError::Cancelled),
                    r = exchange => r,
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => Err(RpcError::Cancelled),
                    r = tokio::time::timeout(timeout, exchange) => {
                        r.unwrap_or(Err(RpcError::Timeout(timeout.as_millis() as u64)))
                    }
                }
            };
            if let Err(e) = &outcome {
                warn!("[Rpc] Call to {} failed: {}", socket, e);
            }
            let _ = tx.send(outcome);
        });

        rx.blocking_recv()
            .map_err(|_| RpcError::Runtime("call dropped before completion".to_string()))?
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn exchange(socket: &str, body: &str, limit: u64) -> Result<Value, RpcError> {
    let mut stream = UnixStream::connect(socket)
        .await
        .map_err(|source| RpcError::Connect {
            socket: socket.to_string(),
            source,
        })?;

    let request = format!(
        "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut raw = Vec::new();
    (&mut stream)
        .take(limit.saturating_add(1))
        .read_to_end(&mut raw)
        .await?;
    if raw.len() as u64 > limit {
        return Err(RpcError::MalformedResponse(format!(
            "response exceeds {} bytes",
            limit
        )));
    }
    parse_response(&raw)
}

/// Parses a complete HTTP response carrying a JSON-RPC reply.
pub fn parse_response(raw: &[u8]) -> Result<Value, RpcError> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| RpcError::MalformedResponse("missing header terminator".to_string()))?;
    let head = String::from_utf8_lossy(&raw[..split]);
    let mut body = raw[split + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RpcError::MalformedResponse(format!("bad status line '{}'", status_line)))?;

    let mut content_length = None;
    let mut chunked = false;
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            if key == "content-length" {
                content_length = value.parse::<usize>().ok();
            } else if key == "transfer-encoding" && value.eq_ignore_ascii_case("chunked") {
                chunked = true;
            }
        }
    }
    if chunked {
        body = decode_chunked(&body)?;
    } else if let Some(len) = content_length {
        body.truncate(len);
    }

    if !(200..300).contains(&status) {
        return Err(RpcError::HttpStatus {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    let reply: Value = serde_json::from_slice(&body)
        .map_err(|e| RpcError::MalformedResponse(format!("invalid JSON body: {}", e)))?;
    match reply.get("error") {
        Some(err) if !err.is_null() => Err(RpcError::Remote {
            code: err.get("code").and_then(Value::as_i64).unwrap_or(-32000),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string()),
        }),
        _ => Ok(reply.get("result").cloned().unwrap_or(Value::Null)),
    }
}

fn decode_chunked(mut data: &[u8]) -> Result<Vec<u8>, RpcError> {
    let mut out = Vec::new();
    loop {
        let line_end = data
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| RpcError::MalformedResponse("truncated chunk header".to_string()))?;
        let size_text = String::from_utf8_lossy(&data[..line_end]);
        let size_text = size_text.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| RpcError::MalformedResponse(format!("bad chunk size '{}'", size_text)))?;
        data = &data[line_end + 2..];
        if size == 0 {
            return Ok(out);
        }
        if data.len() < size {
            return Err(RpcError::MalformedResponse("truncated chunk".to_string()));
        }
        out.extend_from_slice(&data[..size]);
        data = data.get(size + 2..).unwrap_or_default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_mapping() {
        assert_eq!(rpc_params(&json!({"a": 1})), json!({"a": 1}));
        assert_eq!(rpc_params(&json!([1, 2])), json!([1, 2]));
        assert_eq!(rpc_params(&Value::Null), json!([]));
        assert_eq!(rpc_params(&json!("hi")), json!(["hi"]));
        assert_eq!(rpc_params(&json!(3)), json!([3]));
    }

    #[test]
    fn request_body_has_jsonrpc_envelope() {
        let body = request_body("echo", &json!({"text": "hi"}));
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["method"], "echo");
        assert_eq!(body["params"], json!({"text": "hi"}));
        assert!(body["id"].as_str().map_or(false, |id| !id.is_empty()));
    }

    #[test]
    fn parses_content_length_response() {
        let body = r#"{"jsonrpc":"2.0","id":"1","result":{"ok":true}}"#;
        let raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        assert_eq!(parse_response(raw.as_bytes()).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn parses_chunked_response() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
            10\r\n{\"result\":[1,2,3\r\n2\r\n]}\r\n0\r\n\r\n";
        assert_eq!(parse_response(raw).unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn remote_error_and_http_status_are_distinguished() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\n{\"error\":{\"code\":-32601,\"message\":\"Method not found\"}}";
        match parse_response(raw) {
            Err(RpcError::Remote { code, message }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("unexpected {:?}", other),
        }

        let raw = b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\n\r\nbusy";
        assert!(matches!(
            parse_response(raw),
            Err(RpcError::HttpStatus { status: 503, .. })
        ));
    }

    #[test]
    fn missing_socket_is_transport_error() {
        let client = RpcClient::new(RpcConfig::default());
        let err = client
            .call(
                "/nonexistent/decision-engine-test.sock",
                "echo",
                &Value::Null,
                Duration::from_millis(500),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, RpcError::Connect { .. }));
        assert_eq!(err.to_json()["error"], "rpc_transport");
    }
}
