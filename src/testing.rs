//! Test fixtures: scripted fake daemons, a loopback HTTP responder and
//! service directory builders.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;

type Handler = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

#[derive(Clone, Copy)]
enum Framing {
    Line,
    /// Small pieces with pauses in between
    Chunked,
    /// No trailing newline, then the connection closes
    Unterminated,
}

/// A daemon stand-in listening on a Unix socket.
///
/// The handler receives each parsed request and returns the response line
/// (without terminator), or `None` to hold the connection open unanswered.
pub struct FakeDaemon {
    task: JoinHandle<()>,
    calls: Arc<AtomicUsize>,
    methods: Arc<Mutex<Vec<String>>>,
}

impl FakeDaemon {
    pub fn spawn<F>(path: &Path, handler: F) -> Self
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        Self::start(path, Arc::new(handler), Duration::ZERO, Framing::Line)
    }

    /// Answers only after `delay`
    pub fn spawn_delayed<F>(path: &Path, delay: Duration, handler: F) -> Self
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        Self::start(path, Arc::new(handler), delay, Framing::Line)
    }

    /// Writes each response in small pieces with pauses in between
    pub fn spawn_chunked<F>(path: &Path, handler: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        let handler = Arc::new(move |v: &Value| Some(handler(v)));
        Self::start(path, handler, Duration::ZERO, Framing::Chunked)
    }

    /// Writes each response without its line terminator and hangs up
    pub fn spawn_unterminated<F>(path: &Path, handler: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        let handler = Arc::new(move |v: &Value| Some(handler(v)));
        Self::start(path, handler, Duration::ZERO, Framing::Unterminated)
    }

    /// Answers `health` with the given result and `stop` with success
    pub fn healthy(path: &Path, result: Value) -> Self {
        Self::spawn(path, move |req| {
            let body = match req["method"].as_str() {
                Some("health") => json!({"id": req["id"], "ok": true, "result": result.clone()}),
                _ => json!({"id": req["id"], "ok": true, "result": {}}),
            };
            Some(body.to_string())
        })
    }

    fn start(path: &Path, handler: Handler, delay: Duration, framing: Framing) -> Self {
        let listener = UnixListener::bind(path).expect("bind fake daemon socket");
        let calls = Arc::new(AtomicUsize::new(0));
        let methods = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let calls = Arc::clone(&calls);
            let methods = Arc::clone(&methods);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let handler = Arc::clone(&handler);
                    let calls = Arc::clone(&calls);
                    let methods = Arc::clone(&methods);
                    tokio::spawn(async move {
                        let (reader, mut writer) = stream.into_split();
                        let mut line = String::new();
                        if BufReader::new(reader).read_line(&mut line).await.is_err() {
                            return;
                        }
                        let Ok(request) = serde_json::from_str::<Value>(&line) else {
                            return;
                        };
                        calls.fetch_add(1, Ordering::SeqCst);
                        if let Some(m) = request["method"].as_str() {
                            methods.lock().unwrap().push(m.to_string());
                        }
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        match handler(&request) {
                            Some(body) => match framing {
                                Framing::Line => {
                                    let line = format!("{}\n", body);
                                    let _ = writer.write_all(line.as_bytes()).await;
                                }
                                Framing::Chunked => {
                                    let bytes = format!("{}\n", body).into_bytes();
                                    for piece in bytes.chunks(7) {
                                        let _ = writer.write_all(piece).await;
                                        let _ = writer.flush().await;
                                        tokio::time::sleep(Duration::from_millis(5)).await;
                                    }
                                }
                                Framing::Unterminated => {
                                    let _ = writer.write_all(body.as_bytes()).await;
                                    let _ = writer.shutdown().await;
                                }
                            },
                            None => {
                                tokio::time::sleep(Duration::from_secs(3600)).await;
                            }
                        }
                    });
                }
            })
        };

        Self {
            task,
            calls,
            methods,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().unwrap().clone()
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Serve `body` over plain HTTP on loopback; returns the URL for `file_name`.
pub async fn serve_http(file_name: &str, status: u16, body: Vec<u8>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = Arc::new(body);

    let task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let body = Arc::clone(&body);
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut byte).await {
                        Ok(1) => head.push(byte[0]),
                        _ => return,
                    }
                }
                let reason = if status == 200 { "OK" } else { "Error" };
                let header = format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n\
                     Content-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
                    status,
                    reason,
                    body.len()
                );
                let _ = stream.write_all(header.as_bytes()).await;
                let _ = stream.write_all(&body).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (format!("http://{}/{}", addr, file_name), task)
}

/// Create `<root>/<name>/manifest.json` declaring `entrypoint`
pub fn write_manifest(root: &Path, name: &str, entrypoint: &str) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let manifest = json!({
        "name": name,
        "version": "1.0.0",
        "daemon": { "entrypoint": entrypoint }
    });
    std::fs::write(dir.join("manifest.json"), manifest.to_string()).unwrap();
    dir
}

/// Write an executable shell script
#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Poll until `cond` holds or `limit` elapses
pub async fn wait_for(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
