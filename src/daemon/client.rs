//! One-shot RPC transport over a per-service Unix socket.
//!
//! Each call opens its own connection, writes one request line, reads one
//! response line and drops the connection. Nothing is pooled or multiplexed.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace};

use super::protocol::{RpcRequest, RpcResponse, METHOD_HEALTH, METHOD_METHODS, METHOD_STOP};
use crate::error::{Result, SupervisorError};

/// Default deadline for a whole request/response exchange
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a single response line
const MAX_LINE_BYTES: u64 = 10 * 1024 * 1024;

/// Issue one call against the daemon listening at `socket_path`.
pub async fn call(
    socket_path: &Path,
    method: &str,
    params: Map<String, Value>,
    timeout: Duration,
) -> Result<RpcResponse> {
    let request = RpcRequest::new(method, params);
    trace!(socket = %socket_path.display(), method, id = %request.id, "RPC call");

    let exchange = exchange(socket_path, &request);
    let response = match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result?,
        Err(_) => {
            debug!(socket = %socket_path.display(), method, "RPC call timed out");
            return Err(SupervisorError::Timeout {
                method: method.to_string(),
                timeout,
            });
        }
    };

    if response.id != request.id {
        return Err(SupervisorError::Protocol(format!(
            "response id '{}' does not match request id '{}'",
            response.id, request.id
        )));
    }

    trace!(method, ok = response.ok, "RPC response");
    Ok(response)
}

#[cfg(unix)]
async fn exchange(socket_path: &Path, request: &RpcRequest) -> Result<RpcResponse> {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    if !socket_path.exists() {
        return Err(SupervisorError::Unavailable {
            path: socket_path.to_path_buf(),
            reason: "socket not found".into(),
        });
    }

    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| SupervisorError::Unavailable {
            path: socket_path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let (reader, mut writer) = stream.into_split();

    let broken = |e: std::io::Error| {
        SupervisorError::Protocol(format!("connection failed mid-exchange: {}", e))
    };

    let line = request.encode_line()?;
    writer.write_all(&line).await.map_err(broken)?;
    writer.flush().await.map_err(broken)?;

    let mut reader = BufReader::new(reader.take(MAX_LINE_BYTES));
    let mut buf = Vec::new();
    reader.read_until(b'\n', &mut buf).await.map_err(broken)?;

    if buf.last() != Some(&b'\n') {
        let reason = if buf.len() as u64 >= MAX_LINE_BYTES {
            "response line exceeds size limit"
        } else {
            "connection closed before a complete response line"
        };
        return Err(SupervisorError::Protocol(reason.into()));
    }

    RpcResponse::decode_line(&buf)
}

#[cfg(not(unix))]
async fn exchange(socket_path: &Path, _request: &RpcRequest) -> Result<RpcResponse> {
    Err(SupervisorError::Unavailable {
        path: socket_path.to_path_buf(),
        reason: "local sockets are only supported on Unix".into(),
    })
}

/// Client bound to a single daemon socket
#[derive(Debug, Clone)]
pub struct RpcClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    pub async fn call(&self, method: &str, params: Map<String, Value>) -> Result<RpcResponse> {
        call(&self.socket_path, method, params, self.timeout).await
    }

    pub async fn health(&self) -> Result<RpcResponse> {
        self.call(METHOD_HEALTH, Map::new()).await
    }

    pub async fn methods(&self) -> Result<RpcResponse> {
        self.call(METHOD_METHODS, Map::new()).await
    }

    pub async fn stop(&self) -> Result<RpcResponse> {
        self.call(METHOD_STOP, Map::new()).await
    }

    /// Socket present and `health` answered with `ok: true`
    pub async fn is_alive(&self) -> bool {
        if !self.socket_exists() {
            return false;
        }
        matches!(self.health().await, Ok(response) if response.ok)
    }
}
