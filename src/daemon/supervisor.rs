use std::collections::HashSet;
use std::path::{Component, Path};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::client::RpcClient;
use super::process::{command_matches, read_pid_file, ProcessTable, SystemProcessTable};
use super::services::{Manifest, ServicePaths, ServicesRoot};
use crate::error::{Result, SupervisorError};
use crate::user_config::SupervisorSettings;

type InFlight = Arc<Mutex<HashSet<String>>>;

/// How a successful `start` came about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A live daemon already answered; nothing was spawned
    AlreadyRunning,
    /// A new process was spawned and its socket came alive
    Started { pid: Option<u32> },
}

/// How a successful `stop` came about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The daemon accepted the `stop` call
    Graceful,
    /// SIGTERM was sent after the identity check
    Terminated { pid: u32, exited: bool },
    /// Nothing was running; leftover socket/pid files were removed
    Cleaned,
}

/// Exclusive claim on one service name, released on drop
#[derive(Debug)]
pub struct OperationGuard {
    name: String,
    in_flight: InFlight,
}

impl OperationGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.name);
        }
    }
}

/// Starts, stops and restarts service processes.
///
/// Clones share the same per-service claims.
#[derive(Clone)]
pub struct Supervisor {
    root: ServicesRoot,
    settings: SupervisorSettings,
    processes: Arc<dyn ProcessTable>,
    in_flight: InFlight,
}

impl Supervisor {
    pub fn new(root: ServicesRoot, settings: SupervisorSettings) -> Self {
        Self {
            root,
            settings,
            processes: Arc::new(SystemProcessTable),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Swap the process table (tests, other platforms)
    pub fn with_process_table(mut self, processes: Arc<dyn ProcessTable>) -> Self {
        self.processes = processes;
        self
    }

    pub fn root(&self) -> &ServicesRoot {
        &self.root
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Claim a service for one operation; fails if another is in flight
    pub fn claim(&self, name: &str) -> Result<OperationGuard> {
        ServicesRoot::validate_name(name)?;
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| SupervisorError::OperationInProgress(name.to_string()))?;
        if !set.insert(name.to_string()) {
            debug!(service = name, "Operation already in flight");
            return Err(SupervisorError::OperationInProgress(name.to_string()));
        }
        Ok(OperationGuard {
            name: name.to_string(),
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn is_busy(&self, name: &str) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(name))
            .unwrap_or(false)
    }

    pub async fn start(&self, name: &str) -> Result<StartOutcome> {
        let guard = self.claim(name)?;
        self.start_claimed(&guard).await
    }

    pub async fn stop(&self, name: &str) -> Result<StopOutcome> {
        let guard = self.claim(name)?;
        self.stop_claimed(&guard).await
    }

    /// Stop (errors ignored), settle, start
    pub async fn restart(&self, name: &str) -> Result<StartOutcome> {
        let guard = self.claim(name)?;
        if let Err(e) = self.stop_claimed(&guard).await {
            debug!(service = name, "Ignoring stop failure during restart: {}", e);
        }
        tokio::time::sleep(self.settings.restart_delay).await;
        self.start_claimed(&guard).await
    }

    pub async fn start_claimed(&self, guard: &OperationGuard) -> Result<StartOutcome> {
        let name = guard.name();
        let paths = self.root.paths(name)?;

        if !paths.manifest.exists() {
            return Err(SupervisorError::NotInstalled(name.to_string()));
        }
        let manifest = Manifest::load(&paths.manifest)
            .map_err(|e| invalid_entrypoint(name, format!("unreadable manifest: {}", e)))?;
        let entrypoint = resolve_entrypoint(name, &manifest, &paths)?;

        if paths.socket.exists() {
            if self.probe_client(&paths).is_alive().await {
                info!(service = name, "Service already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
            warn!(service = name, socket = %paths.socket.display(), "Removing stale socket");
            remove_if_exists(&paths.socket)?;
        }

        let child = {
            let mut cmd = Command::new(&entrypoint);
            cmd.args(&manifest.daemon.args)
                .current_dir(&paths.dir)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(false);
            #[cfg(unix)]
            cmd.process_group(0);
            cmd.spawn().map_err(|e| {
                invalid_entrypoint(name, format!("failed to spawn {}: {}", entrypoint.display(), e))
            })?
        };
        let pid = child.id();
        info!(service = name, pid = ?pid, "Spawned service process");
        // Detached: the runtime reaps it if it exits, we never wait on it
        drop(child);

        self.wait_until_live(&paths).await?;
        info!(service = name, "Service is ready");
        Ok(StartOutcome::Started { pid })
    }

    pub async fn stop_claimed(&self, guard: &OperationGuard) -> Result<StopOutcome> {
        let name = guard.name();
        let paths = self.root.paths(name)?;

        if paths.socket.exists() {
            match self.probe_client(&paths).stop().await {
                Ok(response) if response.ok => {
                    info!(service = name, "Service stopped gracefully");
                    cleanup(&paths);
                    return Ok(StopOutcome::Graceful);
                }
                // A refusal is not a stop; the verified pid path below still
                // decides, and it only signals the service's own process.
                Ok(response) => {
                    let message = response.error.map(|e| e.message).unwrap_or_default();
                    warn!(service = name, "Daemon refused stop: {}", message);
                }
                Err(e) => debug!(service = name, "Graceful stop unavailable: {}", e),
            }
        }

        let socket_present = paths.socket.exists();
        let Some(pid) = read_pid_file(&paths.pid) else {
            if socket_present {
                cleanup(&paths);
                return Ok(StopOutcome::Cleaned);
            }
            return Err(SupervisorError::NotRunning(name.to_string()));
        };

        let Some(actual) = self.processes.command_name_for(pid) else {
            info!(service = name, pid, "Recorded process is gone, cleaning up");
            cleanup(&paths);
            return Ok(StopOutcome::Cleaned);
        };

        if !paths.manifest.exists() {
            return Err(SupervisorError::NotInstalled(name.to_string()));
        }
        let manifest = Manifest::load(&paths.manifest)
            .map_err(|e| invalid_entrypoint(name, format!("unreadable manifest: {}", e)))?;
        let expected = manifest
            .entrypoint_basename()
            .ok_or_else(|| invalid_entrypoint(name, "entrypoint has no file name".into()))?;

        if !command_matches(&actual, &expected) {
            warn!(
                service = name,
                pid,
                actual = %actual,
                expected = %expected,
                "Refusing to signal unrelated process"
            );
            return Err(SupervisorError::ProcessMismatch {
                pid,
                expected,
                actual,
            });
        }

        info!(service = name, pid, "Sending SIGTERM");
        if let Err(e) = self.processes.terminate(pid) {
            if self.processes.is_alive(pid) {
                return Err(e.into());
            }
        }

        let exited = self.wait_for_exit(pid).await;
        if !exited {
            warn!(service = name, pid, "Process still alive after grace period");
        }
        cleanup(&paths);
        Ok(StopOutcome::Terminated { pid, exited })
    }

    fn probe_client(&self, paths: &ServicePaths) -> RpcClient {
        RpcClient::new(&paths.socket).with_timeout(self.settings.probe_timeout)
    }

    async fn wait_until_live(&self, paths: &ServicePaths) -> Result<()> {
        let deadline = Instant::now() + self.settings.start_timeout;
        let client = self.probe_client(paths);
        loop {
            if client.is_alive().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(service = %paths.name, "Service did not become ready in time");
                return Err(SupervisorError::StartTimeout {
                    service: paths.name.clone(),
                    timeout: self.settings.start_timeout,
                });
            }
            tokio::time::sleep(self.settings.start_poll).await;
        }
    }

    async fn wait_for_exit(&self, pid: u32) -> bool {
        let deadline = Instant::now() + self.settings.stop_grace;
        let poll = self.settings.start_poll.max(Duration::from_millis(10));
        while Instant::now() < deadline {
            if !self.processes.is_alive(pid) {
                return true;
            }
            tokio::time::sleep(poll).await;
        }
        !self.processes.is_alive(pid)
    }
}

fn invalid_entrypoint(service: &str, reason: String) -> SupervisorError {
    SupervisorError::InvalidEntrypoint {
        service: service.to_string(),
        reason,
    }
}

/// Entrypoint must stay inside the install dir and be an executable file
fn resolve_entrypoint(
    name: &str,
    manifest: &Manifest,
    paths: &ServicePaths,
) -> Result<std::path::PathBuf> {
    let relative = Path::new(&manifest.daemon.entrypoint);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if manifest.daemon.entrypoint.is_empty() || escapes {
        return Err(invalid_entrypoint(
            name,
            format!("'{}' is not a path inside the install directory", manifest.daemon.entrypoint),
        ));
    }

    let path = manifest.entrypoint_path(&paths.dir);
    let metadata = std::fs::metadata(&path)
        .map_err(|_| invalid_entrypoint(name, format!("{} not found", path.display())))?;
    if !metadata.is_file() {
        return Err(invalid_entrypoint(name, format!("{} is not a file", path.display())));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(invalid_entrypoint(name, format!("{} is not executable", path.display())));
        }
    }

    Ok(path)
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn cleanup(paths: &ServicePaths) {
    for file in [&paths.socket, &paths.pid] {
        if let Err(e) = remove_if_exists(file) {
            warn!(path = %file.display(), "Failed to remove: {}", e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::daemon::services::{PID_FILE, SOCKET_FILE};
    use crate::testing::{wait_for, write_manifest, write_script, FakeDaemon};
    use serde_json::json;
    use std::collections::HashMap;

    /// Process table with scripted names that records every signal
    #[derive(Default)]
    struct RecordingTable {
        names: Mutex<HashMap<u32, String>>,
        terminated: Mutex<Vec<u32>>,
    }

    impl RecordingTable {
        fn with(pid: u32, name: &str) -> Arc<Self> {
            let table = Self::default();
            table.names.lock().unwrap().insert(pid, name.to_string());
            Arc::new(table)
        }

        fn terminated(&self) -> Vec<u32> {
            self.terminated.lock().unwrap().clone()
        }
    }

    impl ProcessTable for RecordingTable {
        fn command_name_for(&self, pid: u32) -> Option<String> {
            self.names.lock().unwrap().get(&pid).cloned()
        }

        fn terminate(&self, pid: u32) -> std::io::Result<()> {
            self.terminated.lock().unwrap().push(pid);
            self.names.lock().unwrap().remove(&pid);
            Ok(())
        }
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            probe_timeout: Duration::from_millis(300),
            start_timeout: Duration::from_millis(400),
            start_poll: Duration::from_millis(20),
            stop_grace: Duration::from_millis(200),
            restart_delay: Duration::from_millis(10),
            ..SupervisorSettings::default()
        }
    }

    fn supervisor(root: &Path, table: Arc<dyn ProcessTable>) -> Supervisor {
        Supervisor::new(ServicesRoot::new(root), settings()).with_process_table(table)
    }

    #[tokio::test]
    async fn start_requires_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("mail")).unwrap();
        let sup = supervisor(dir.path(), Arc::new(RecordingTable::default()));

        let err = sup.start("mail").await.unwrap_err();
        assert_eq!(err.kind(), "not_installed");
        let err = sup.start("ghost").await.unwrap_err();
        assert_eq!(err.kind(), "not_installed");
    }

    #[tokio::test]
    async fn start_rejects_missing_entrypoint() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "mail", "bin/mail");
        let sup = supervisor(dir.path(), Arc::new(RecordingTable::default()));

        let err = sup.start("mail").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_entrypoint");
        assert!(!dir.path().join("mail").join(SOCKET_FILE).exists());
    }

    #[tokio::test]
    async fn start_rejects_non_executable_and_escaping_entrypoints() {
        let dir = tempfile::tempdir().unwrap();
        let svc = write_manifest(dir.path(), "mail", "bin/mail");
        std::fs::create_dir_all(svc.join("bin")).unwrap();
        std::fs::write(svc.join("bin/mail"), "#!/bin/sh\n").unwrap();
        let sup = supervisor(dir.path(), Arc::new(RecordingTable::default()));
        assert_eq!(sup.start("mail").await.unwrap_err().kind(), "invalid_entrypoint");

        write_manifest(dir.path(), "sneaky", "../mail/bin/mail");
        assert_eq!(sup.start("sneaky").await.unwrap_err().kind(), "invalid_entrypoint");
    }

    #[tokio::test]
    async fn start_is_idempotent_when_live() {
        let dir = tempfile::tempdir().unwrap();
        let svc = write_manifest(dir.path(), "mail", "bin/mail");
        write_script(&svc.join("bin/mail"), "touch spawned");
        let daemon = FakeDaemon::healthy(&svc.join(SOCKET_FILE), json!({"status": "healthy"}));
        let sup = supervisor(dir.path(), Arc::new(RecordingTable::default()));

        assert_eq!(sup.start("mail").await.unwrap(), StartOutcome::AlreadyRunning);
        assert_eq!(sup.start("mail").await.unwrap(), StartOutcome::AlreadyRunning);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!svc.join("spawned").exists());
        assert_eq!(daemon.methods(), vec!["health", "health"]);
    }

    #[tokio::test]
    async fn start_spawns_in_install_dir_and_times_out_without_socket() {
        let dir = tempfile::tempdir().unwrap();
        let svc = write_manifest(dir.path(), "mail", "bin/mail");
        write_script(&svc.join("bin/mail"), "echo \"$1\" > arg.txt\nsleep 5");
        // Stale socket: the file exists but nobody listens
        drop(std::os::unix::net::UnixListener::bind(svc.join(SOCKET_FILE)).unwrap());
        let sup = supervisor(dir.path(), Arc::new(RecordingTable::default()));

        let err = sup.start("mail").await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(!svc.join(SOCKET_FILE).exists(), "stale socket should be removed");

        let arg = svc.join("arg.txt");
        assert!(wait_for(Duration::from_secs(2), || arg.exists()).await);
        assert!(wait_for(Duration::from_secs(2), || {
            std::fs::read_to_string(&arg).map(|s| s.trim() == "start").unwrap_or(false)
        })
        .await);
    }

    #[tokio::test]
    async fn start_succeeds_once_socket_answers() {
        let dir = tempfile::tempdir().unwrap();
        let svc = write_manifest(dir.path(), "mail", "bin/mail");
        write_script(&svc.join("bin/mail"), "exit 0");
        let sock = svc.join(SOCKET_FILE);

        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            FakeDaemon::healthy(&sock, json!({"status": "healthy"}))
        });

        let sup = supervisor(dir.path(), Arc::new(RecordingTable::default()));
        let outcome = sup.start("mail").await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started { .. }));
        drop(late.await.unwrap());
    }

    #[tokio::test]
    async fn stop_prefers_graceful_rpc() {
        let dir = tempfile::tempdir().unwrap();
        let svc = write_manifest(dir.path(), "mail", "bin/mail");
        std::fs::write(svc.join(PID_FILE), "4321").unwrap();
        let daemon = FakeDaemon::healthy(&svc.join(SOCKET_FILE), json!({}));
        let table = RecordingTable::with(4321, "mail");
        let sup = supervisor(dir.path(), table.clone());

        assert_eq!(sup.stop("mail").await.unwrap(), StopOutcome::Graceful);
        assert_eq!(daemon.methods(), vec!["stop"]);
        assert!(table.terminated().is_empty());
        assert!(!svc.join(SOCKET_FILE).exists());
        assert!(!svc.join(PID_FILE).exists());
    }

    #[tokio::test]
    async fn stop_refuses_to_signal_unrelated_process() {
        let dir = tempfile::tempdir().unwrap();
        let svc = write_manifest(dir.path(), "mail", "bin/mail");
        std::fs::write(svc.join(PID_FILE), "4321").unwrap();
        let table = RecordingTable::with(4321, "/usr/bin/python3");
        let sup = supervisor(dir.path(), table.clone());

        match sup.stop("mail").await.unwrap_err() {
            SupervisorError::ProcessMismatch { pid, expected, actual } => {
                assert_eq!(pid, 4321);
                assert_eq!(expected, "mail");
                assert_eq!(actual, "/usr/bin/python3");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(table.terminated().is_empty());
        assert!(svc.join(PID_FILE).exists());
    }

    #[tokio::test]
    async fn stop_signals_verified_process_when_socket_is_dead() {
        let dir = tempfile::tempdir().unwrap();
        let svc = write_manifest(dir.path(), "mail", "bin/mail");
        std::fs::write(svc.join(PID_FILE), "4321\n").unwrap();
        drop(std::os::unix::net::UnixListener::bind(svc.join(SOCKET_FILE)).unwrap());
        let table = RecordingTable::with(4321, "/opt/services/mail/bin/mail");
        let sup = supervisor(dir.path(), table.clone());

        let outcome = sup.stop("mail").await.unwrap();
        assert_eq!(outcome, StopOutcome::Terminated { pid: 4321, exited: true });
        assert_eq!(table.terminated(), vec![4321]);
        assert!(!svc.join(SOCKET_FILE).exists());
        assert!(!svc.join(PID_FILE).exists());
    }

    #[tokio::test]
    async fn stop_refused_over_rpc_falls_back_to_verified_signal() {
        let dir = tempfile::tempdir().unwrap();
        let svc = write_manifest(dir.path(), "mail", "bin/mail");
        std::fs::write(svc.join(PID_FILE), "4321").unwrap();
        let daemon = FakeDaemon::spawn(&svc.join(SOCKET_FILE), |req| {
            let body = json!({"id": req["id"], "ok": false, "error": {"message": "busy"}});
            Some(body.to_string())
        });
        let table = RecordingTable::with(4321, "mail");
        let sup = supervisor(dir.path(), table.clone());

        let outcome = sup.stop("mail").await.unwrap();
        assert_eq!(outcome, StopOutcome::Terminated { pid: 4321, exited: true });
        assert_eq!(daemon.methods(), vec!["stop"]);
        assert_eq!(table.terminated(), vec![4321]);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn stop_terminates_live_script_entrypoint_via_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let svc = write_manifest(dir.path(), "calendar", "bin/calendar-bridge-daemon");
        let entrypoint = svc.join("bin/calendar-bridge-daemon");
        write_script(&entrypoint, "while true; do sleep 0.1; done");

        let mut child = Command::new(&entrypoint).spawn().unwrap();
        let pid = child.id().unwrap();
        std::fs::write(svc.join(PID_FILE), pid.to_string()).unwrap();
        // comm is set once exec completes
        assert!(
            wait_for(Duration::from_secs(2), || {
                SystemProcessTable.command_name_for(pid).as_deref() == Some("calendar-bridge")
            })
            .await
        );

        let sup = Supervisor::new(ServicesRoot::new(dir.path()), settings());
        let outcome = sup.stop("calendar").await.unwrap();
        assert_eq!(outcome, StopOutcome::Terminated { pid, exited: true });
        assert!(!svc.join(PID_FILE).exists());

        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn stop_without_traces_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "mail", "bin/mail");
        let sup = supervisor(dir.path(), Arc::new(RecordingTable::default()));
        assert_eq!(sup.stop("mail").await.unwrap_err().kind(), "not_running");
    }

    #[tokio::test]
    async fn stop_with_vanished_pid_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let svc = write_manifest(dir.path(), "mail", "bin/mail");
        std::fs::write(svc.join(PID_FILE), "4321").unwrap();
        let table = Arc::new(RecordingTable::default());
        let sup = supervisor(dir.path(), table.clone());

        assert_eq!(sup.stop("mail").await.unwrap(), StopOutcome::Cleaned);
        assert!(table.terminated().is_empty());
        assert!(!svc.join(PID_FILE).exists());
    }

    #[tokio::test]
    async fn operations_on_one_name_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "mail", "bin/mail");
        let sup = supervisor(dir.path(), Arc::new(RecordingTable::default()));

        let guard = sup.claim("mail").unwrap();
        assert!(sup.is_busy("mail"));
        assert_eq!(sup.start("mail").await.unwrap_err().kind(), "operation_in_progress");
        assert_eq!(sup.stop("mail").await.unwrap_err().kind(), "operation_in_progress");
        assert!(sup.claim("calendar").is_ok());

        drop(guard);
        assert!(!sup.is_busy("mail"));
        assert_eq!(sup.stop("mail").await.unwrap_err().kind(), "not_running");
    }

    #[tokio::test]
    async fn restart_ignores_stop_failure() {
        let dir = tempfile::tempdir().unwrap();
        let svc = write_manifest(dir.path(), "mail", "bin/mail");
        write_script(&svc.join("bin/mail"), "touch restarted");
        let sup = supervisor(dir.path(), Arc::new(RecordingTable::default()));

        // Nothing to stop, and the new process never opens a socket
        let err = sup.restart("mail").await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(wait_for(Duration::from_secs(2), || svc.join("restarted").exists()).await);
    }
}
