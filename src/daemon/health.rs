use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::protocol::{DaemonStatus, RpcResponse};
use super::services::ServiceRecord;
use crate::error::Result;

/// Classification of a single `health` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    pub status: DaemonStatus,
    pub version: Option<String>,
    pub uptime_seconds: Option<u64>,
}

/// Map the outcome of a `health` call onto a status.
///
/// Any transport failure, `ok: false`, or a result that is not an object
/// means the daemon is not responding.
pub fn classify_health(outcome: Result<RpcResponse>) -> HealthProbe {
    let not_responding = HealthProbe {
        status: DaemonStatus::NotResponding,
        version: None,
        uptime_seconds: None,
    };

    let Ok(response) = outcome else {
        return not_responding;
    };
    let Some(result) = response.result_object() else {
        return not_responding;
    };

    let status = match result.get("status").and_then(Value::as_str) {
        Some("degraded") => DaemonStatus::Degraded,
        _ => DaemonStatus::Running,
    };

    HealthProbe {
        status,
        version: result.get("version").and_then(Value::as_str).map(String::from),
        uptime_seconds: result.get("uptime_seconds").and_then(Value::as_u64),
    }
}

/// Health of one dependency as reported by a daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DependencyHealth {
    pub ok: bool,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

/// Detailed `health` result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub status: String,
    pub version: Option<String>,
    pub uptime_seconds: Option<u64>,
    pub dependencies: BTreeMap<String, DependencyHealth>,
}

impl HealthReport {
    pub fn from_result(result: &Value) -> Self {
        let mut dependencies = BTreeMap::new();
        if let Some(deps) = result.get("dependencies").and_then(Value::as_object) {
            for (key, value) in deps {
                dependencies.insert(
                    key.clone(),
                    DependencyHealth {
                        ok: value.get("ok").and_then(Value::as_bool).unwrap_or(false),
                        latency_ms: value.get("latency_ms").and_then(Value::as_f64),
                        message: value.get("message").and_then(Value::as_str).map(String::from),
                    },
                );
            }
        }

        Self {
            status: result
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            version: result.get("version").and_then(Value::as_str).map(String::from),
            uptime_seconds: result.get("uptime_seconds").and_then(Value::as_u64),
            dependencies,
        }
    }

    pub fn failing_dependencies(&self) -> Vec<&str> {
        self.dependencies
            .iter()
            .filter(|(_, d)| !d.ok)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Aggregate health across all services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    /// Nothing is degraded and nothing failed
    Healthy,
    /// At least one running service is degraded or unresponsive
    Degraded,
    /// A listing or action error is outstanding
    Error,
}

/// Health status summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub degraded: usize,
    /// Services that need attention
    pub unhealthy: Vec<String>,
}

impl HealthSummary {
    pub fn from_records(records: &[ServiceRecord]) -> Self {
        let mut summary = HealthSummary {
            total: records.len(),
            ..Default::default()
        };

        for record in records {
            match record.status {
                DaemonStatus::Running => summary.running += 1,
                DaemonStatus::Stopped => summary.stopped += 1,
                DaemonStatus::Degraded | DaemonStatus::NotResponding => {
                    summary.degraded += 1;
                    summary.unhealthy.push(record.name.clone());
                }
                DaemonStatus::Starting | DaemonStatus::Stopping => {
                    // Transitional states
                }
            }
        }

        summary
    }

    pub fn is_healthy(&self) -> bool {
        self.degraded == 0
    }

    pub fn overall(&self, has_errors: bool) -> OverallHealth {
        if has_errors {
            OverallHealth::Error
        } else if !self.is_healthy() {
            OverallHealth::Degraded
        } else {
            OverallHealth::Healthy
        }
    }
}
