#![allow(dead_code)]

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::runtime::Runtime;

pub type Handler = Arc<dyn Fn(&str, &Value) -> Value + Send + Sync>;

/// Minimal JSON-RPC app listening on a unix socket. `handler` receives the
/// method and params and returns the full JSON-RPC member to send back
/// (`{"result": ...}` or `{"error": ...}`). Requests are recorded.
pub struct FakeApp {
    pub socket: PathBuf,
    pub requests: Arc<Mutex<Vec<Value>>>,
    _runtime: Runtime,
}

impl FakeApp {
    pub fn start(dir: &Path, name: &str, handler: Handler) -> Self {
        let socket = dir.join(format!("{}.sock", name));
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let listener = {
            let _guard = runtime.enter();
            UnixListener::bind(&socket).unwrap()
        };
        let seen = requests.clone();
        runtime.spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let seen = seen.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let request = match read_request(&mut stream).await {
                        Some(r) => r,
                        None => return,
                    };
                    seen.lock().unwrap().push(request.clone());
                    let method = request["method"].as_str().unwrap_or_default().to_string();
                    let mut reply = json!({"jsonrpc": "2.0", "id": request["id"].clone()});
                    if let (Value::Object(out), Value::Object(member)) =
                        (&mut reply, handler(&method, &request["params"]))
                    {
                        out.extend(member);
                    }
                    let body = reply.to_string();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self {
            socket,
            requests,
            _runtime: runtime,
        }
    }

    pub fn socket_str(&self) -> String {
        self.socket.to_string_lossy().into_owned()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

async fn read_request(stream: &mut tokio::net::UnixStream) -> Option<Value> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        if let Some(split) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&raw[..split]).to_string();
            let length = head
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            while raw.len() < split + 4 + length {
                let n = stream.read(&mut buf).await.ok()?;
                if n == 0 {
                    return None;
                }
                raw.extend_from_slice(&buf[..n]);
            }
            return serde_json::from_slice(&raw[split + 4..split + 4 + length]).ok();
        }
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        raw.extend_from_slice(&buf[..n]);
    }
}

/// Echoes the method and params back as the result.
pub fn echo_handler() -> Handler {
    Arc::new(|method: &str, params: &Value| {
        json!({"result": {"method": method, "params": params}})
    })
}

/// Completion callback that forwards results into a channel.
pub fn channel_callback() -> (impl Fn(&Value) + Send + Sync + 'static, mpsc::Receiver<Value>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    (
        move |result: &Value| {
            let _ = tx.lock().unwrap().send(result.clone());
        },
        rx,
    )
}

pub const WAIT: Duration = Duration::from_secs(10);
