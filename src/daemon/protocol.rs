//! Wire protocol types for per-service daemon sockets
//!
//! Every message is one compact JSON object terminated by a single `\n`.
//! `serde_json` never emits raw line breaks inside a compact document (they
//! are escaped inside strings), so the terminator is unambiguous.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SupervisorError};

/// Protocol version sent in every request
pub const PROTOCOL_VERSION: u32 = 1;

/// Liveness + version/uptime
pub const METHOD_HEALTH: &str = "health";
/// Capability listing
pub const METHOD_METHODS: &str = "methods";
/// Graceful shutdown
pub const METHOD_STOP: &str = "stop";

/// Request sent to a daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub id: String,
    pub v: u32,
    pub method: String,
    pub params: Map<String, Value>,
}

impl RpcRequest {
    /// Create a request with a fresh unique id
    pub fn new(method: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            v: PROTOCOL_VERSION,
            method: method.into(),
            params,
        }
    }

    /// Encode as a single line, terminator included
    pub fn encode_line(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Error object carried by a failed response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

/// Server-side timing metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseMeta {
    #[serde(default)]
    pub server_ms: f64,
    #[serde(default)]
    pub protocol_v: u32,
}

/// Response received from a daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

impl RpcResponse {
    /// Decode one response line (terminator optional).
    ///
    /// Fails with `Protocol` unless the line is exactly one JSON object with a
    /// string `id` and a boolean `ok`.
    pub fn decode_line(line: &[u8]) -> Result<Self> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        let value: Value = serde_json::from_slice(line)
            .map_err(|e| SupervisorError::Protocol(format!("malformed response: {}", e)))?;

        let obj = value
            .as_object()
            .ok_or_else(|| SupervisorError::Protocol("response is not a JSON object".into()))?;

        if !obj.get("id").is_some_and(Value::is_string) {
            return Err(SupervisorError::Protocol("response lacks string 'id'".into()));
        }
        if !obj.get("ok").is_some_and(Value::is_boolean) {
            return Err(SupervisorError::Protocol("response lacks boolean 'ok'".into()));
        }

        serde_json::from_value(value)
            .map_err(|e| SupervisorError::Protocol(format!("invalid response shape: {}", e)))
    }

    /// Result object of a successful response, if it is an object
    pub fn result_object(&self) -> Option<&Map<String, Value>> {
        if !self.ok {
            return None;
        }
        self.result.as_ref().and_then(Value::as_object)
    }

    /// Convert `ok: false` into an `Rpc` error, keeping the daemon's message
    pub fn into_result(self) -> Result<Value> {
        if self.ok {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        let (code, message) = match self.error {
            Some(e) => (e.code, e.message),
            None => (None, "unknown error".to_string()),
        };
        Err(SupervisorError::Rpc { code, message })
    }
}

/// Observed service status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    /// No socket present
    Stopped,
    /// Start in flight
    Starting,
    /// Health probe answered
    Running,
    /// Health probe answered but the daemon reports itself degraded
    Degraded,
    /// Socket present but health probe failed
    NotResponding,
    /// Stop in flight
    Stopping,
}

impl DaemonStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, DaemonStatus::Running | DaemonStatus::Degraded)
    }

    /// Consumers treat both self-reported and probe-detected trouble as degraded
    pub fn is_degraded(&self) -> bool {
        matches!(self, DaemonStatus::Degraded | DaemonStatus::NotResponding)
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, DaemonStatus::Starting | DaemonStatus::Stopping)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonStatus::Stopped => "stopped",
            DaemonStatus::Starting => "starting",
            DaemonStatus::Running => "running",
            DaemonStatus::Degraded => "degraded",
            DaemonStatus::NotResponding => "not_responding",
            DaemonStatus::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
