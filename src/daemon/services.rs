use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use super::client::RpcClient;
use super::health::{classify_health, HealthReport};
use super::protocol::DaemonStatus;
use crate::error::{Result, SupervisorError};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SOCKET_FILE: &str = "daemon.sock";
pub const PID_FILE: &str = "daemon.pid";

/// Root directory holding one subdirectory per installed service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicesRoot {
    root: PathBuf,
}

/// Filesystem locations of one service, all derived from its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePaths {
    pub name: String,
    pub dir: PathBuf,
    pub manifest: PathBuf,
    pub socket: PathBuf,
    pub pid: PathBuf,
}

impl ServicesRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root from $SVCMGR_SERVICES_DIR / $SVCMGR_HOME
    pub fn from_env() -> Self {
        Self::new(crate::clienv::services_dir())
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// A service name must be a single visible path component
    pub fn validate_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(&['/', '\\', '\0'][..])
            && Path::new(name).components().count() == 1;
        if valid {
            Ok(())
        } else {
            Err(SupervisorError::InvalidServiceName(name.to_string()))
        }
    }

    pub fn paths(&self, name: &str) -> Result<ServicePaths> {
        Self::validate_name(name)?;
        let dir = self.root.join(name);
        Ok(ServicePaths {
            name: name.to_string(),
            manifest: dir.join(MANIFEST_FILE),
            socket: dir.join(SOCKET_FILE),
            pid: dir.join(PID_FILE),
            dir,
        })
    }
}

/// `daemon` section of a manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonSection {
    /// Executable path relative to the install directory
    pub entrypoint: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
}

fn default_args() -> Vec<String> {
    vec!["start".to_string()]
}

/// Service manifest (`manifest.json`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    #[serde(default)]
    pub name: Option<String>,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub daemon: DaemonSection,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub methods: Vec<Value>,
}

impl Manifest {
    /// Read and parse; never cached, so callers always see the file as it is now
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn entrypoint_path(&self, install_dir: &Path) -> PathBuf {
        install_dir.join(&self.daemon.entrypoint)
    }

    /// File name the running process is expected to report as its command
    pub fn entrypoint_basename(&self) -> Option<String> {
        Path::new(&self.daemon.entrypoint)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }
}

/// Point-in-time view of one service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRecord {
    pub name: String,
    pub install_dir: PathBuf,
    pub has_manifest: bool,
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub status: DaemonStatus,
    pub version: Option<String>,
    pub uptime_seconds: Option<u64>,
    pub is_running: bool,
}

impl ServiceRecord {
    fn from_paths(paths: &ServicePaths) -> Self {
        Self {
            name: paths.name.clone(),
            install_dir: paths.dir.clone(),
            has_manifest: paths.manifest.exists(),
            socket_path: paths.socket.clone(),
            pid_path: paths.pid.clone(),
            status: DaemonStatus::Stopped,
            version: None,
            uptime_seconds: None,
            is_running: false,
        }
    }
}

/// Enumerates the services root and classifies each service
#[derive(Debug, Clone)]
pub struct Scanner {
    root: ServicesRoot,
    probe_timeout: Duration,
}

impl Scanner {
    pub fn new(root: ServicesRoot, probe_timeout: Duration) -> Self {
        Self {
            root,
            probe_timeout,
        }
    }

    pub fn root(&self) -> &ServicesRoot {
        &self.root
    }

    /// All services under the root, probed concurrently, sorted by name
    pub async fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        let names = self.service_names().await?;

        let mut probes = JoinSet::new();
        for name in names {
            let paths = self.root.paths(&name)?;
            let timeout = self.probe_timeout;
            probes.spawn(async move { probe_paths(&paths, timeout).await });
        }

        let mut records = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(record) => records.push(record),
                Err(e) => warn!("Health probe task failed: {}", e),
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(count = records.len(), "Scanned services");
        Ok(records)
    }

    /// Probe a single service by name
    pub async fn probe(&self, name: &str) -> Result<ServiceRecord> {
        let paths = self.root.paths(name)?;
        Ok(probe_paths(&paths, self.probe_timeout).await)
    }

    /// Detailed health of a running service
    pub async fn health_report(&self, name: &str) -> Result<HealthReport> {
        let paths = self.root.paths(name)?;
        if !paths.socket.exists() {
            return Err(SupervisorError::NotRunning(name.to_string()));
        }
        let response = RpcClient::new(&paths.socket)
            .with_timeout(self.probe_timeout)
            .health()
            .await?;
        let result = response.into_result()?;
        Ok(HealthReport::from_result(&result))
    }

    /// Invoke `method` on a service and return its `result`
    pub async fn call(
        &self,
        name: &str,
        method: &str,
        params: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let paths = self.root.paths(name)?;
        RpcClient::new(&paths.socket)
            .with_timeout(timeout)
            .call(method, params)
            .await?
            .into_result()
    }

    pub async fn is_running(&self, name: &str) -> bool {
        match self.root.paths(name) {
            Ok(paths) => {
                RpcClient::new(&paths.socket)
                    .with_timeout(self.probe_timeout)
                    .is_alive()
                    .await
            }
            Err(_) => false,
        }
    }

    async fn service_names(&self) -> Result<Vec<String>> {
        let root = self.root.path();
        if !root.exists() {
            trace!(root = %root.display(), "Services root missing");
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if ServicesRoot::validate_name(&name).is_ok() {
                names.push(name);
            }
        }
        Ok(names)
    }
}

async fn probe_paths(paths: &ServicePaths, timeout: Duration) -> ServiceRecord {
    let mut record = ServiceRecord::from_paths(paths);

    if !paths.socket.exists() {
        return record;
    }

    let outcome = RpcClient::new(&paths.socket)
        .with_timeout(timeout)
        .health()
        .await;
    if let Err(e) = &outcome {
        debug!(service = %paths.name, "Health probe failed: {}", e);
    }

    let probe = classify_health(outcome);
    record.status = probe.status;
    record.version = probe.version;
    record.uptime_seconds = probe.uptime_seconds;
    record.is_running = probe.status.is_running();
    record
}
