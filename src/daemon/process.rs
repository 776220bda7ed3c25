//! OS process inspection used by the stop fallback path.

use std::io;
use std::path::Path;
use tracing::trace;

/// Linux truncates `comm` to 15 bytes
const COMM_MAX: usize = 15;

/// Minimal view of the OS process table.
///
/// The supervisor only ever signals a pid after `command_name_for` confirmed
/// the process identity, so implementations must not guess.
pub trait ProcessTable: Send + Sync {
    /// Basename of the command running as `pid`, `None` if no such process
    fn command_name_for(&self, pid: u32) -> Option<String>;

    fn is_alive(&self, pid: u32) -> bool {
        self.command_name_for(pid).is_some()
    }

    /// Send SIGTERM
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// Process table backed by `/proc` on Linux and `ps` elsewhere on Unix
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn command_name_for(&self, pid: u32) -> Option<String> {
        if pid == 0 {
            return None;
        }
        let name = platform::command_name(pid);
        trace!(pid, name = ?name, "Resolved command name");
        name
    }

    fn is_alive(&self, pid: u32) -> bool {
        pid != 0 && platform::is_alive(pid)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        if pid <= 1 || pid > i32::MAX as u32 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to signal pid {}", pid),
            ));
        }
        platform::terminate(pid)
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use std::io;

    /// The kernel's `comm`: the exec'd file name, so a `#!` script reports
    /// itself rather than its interpreter. Truncated to 15 bytes.
    pub fn command_name(pid: u32) -> Option<String> {
        if !is_alive(pid) {
            return None;
        }
        std::fs::read_to_string(format!("/proc/{}/comm", pid))
            .ok()
            .map(|c| c.trim_end_matches('\n').to_string())
            .filter(|c| !c.is_empty())
    }

    pub fn is_alive(pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            return false;
        };
        // state follows the parenthesised comm, which may itself contain ')'
        let state = stat
            .rfind(')')
            .and_then(|i| stat[i + 1..].trim_start().chars().next());
        !matches!(state, None | Some('Z') | Some('X'))
    }

    pub fn terminate(pid: u32) -> io::Result<()> {
        super::send_sigterm(pid)
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
mod platform {
    use super::basename;
    use std::io;
    use std::process::Command;

    pub fn command_name(pid: u32) -> Option<String> {
        let output = Command::new("ps")
            .args(["-p", &pid.to_string(), "-o", "comm="])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let comm = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!comm.is_empty()).then(|| basename(&comm))
    }

    pub fn is_alive(pid: u32) -> bool {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        // Signal 0 performs the permission and existence checks only
        unsafe { libc::kill(pid, 0) == 0 }
    }

    pub fn terminate(pid: u32) -> io::Result<()> {
        super::send_sigterm(pid)
    }
}

#[cfg(not(unix))]
mod platform {
    use std::io;

    pub fn command_name(_pid: u32) -> Option<String> {
        None
    }

    pub fn is_alive(_pid: u32) -> bool {
        false
    }

    pub fn terminate(_pid: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process signalling is only supported on Unix",
        ))
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> io::Result<()> {
    let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn basename(command: &str) -> String {
    Path::new(command)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| command.to_string())
}

/// Whether a live command name identifies the expected entrypoint
pub fn command_matches(actual: &str, expected_basename: &str) -> bool {
    let actual = basename(actual);
    if actual == expected_basename {
        return true;
    }
    actual.len() == COMM_MAX && expected_basename.starts_with(&actual)
}

/// Parse a pid file; `None` when absent, empty or not a positive integer
pub fn read_pid_file(path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    content.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_uses_basenames() {
        assert!(command_matches("/opt/svc/bin/mailer", "mailer"));
        assert!(command_matches("mailer", "mailer"));
        assert!(!command_matches("/usr/bin/python3", "mailer"));
        assert!(!command_matches("mail", "mailer"));
    }

    #[test]
    fn truncated_comm_matches_long_entrypoint() {
        assert!(command_matches("calendar-bridge", "calendar-bridge-daemon"));
        assert!(!command_matches("calendar-bridge", "other-long-daemon-name"));
    }

    #[test]
    fn pid_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        assert_eq!(read_pid_file(&path), None);

        std::fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid_file(&path), Some(4242));

        std::fs::write(&path, "zero").unwrap();
        assert_eq!(read_pid_file(&path), None);

        std::fs::write(&path, "0").unwrap();
        assert_eq!(read_pid_file(&path), None);
    }

    #[test]
    fn refuses_to_signal_init_or_group() {
        let table = SystemProcessTable;
        assert!(table.terminate(0).is_err());
        assert!(table.terminate(1).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn own_process_is_visible() {
        let table = SystemProcessTable;
        let pid = std::process::id();
        assert!(table.is_alive(pid));
        let name = table.command_name_for(pid).unwrap();
        assert!(!name.is_empty());
        assert!(!name.contains('/'));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn script_reports_its_own_name_not_the_interpreter() {
        use crate::testing::{wait_for, write_script};
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("mail-daemon");
        write_script(&script, "while true; do sleep 0.1; done");
        let mut child = tokio::process::Command::new(&script).spawn().unwrap();
        let pid = child.id().unwrap();

        let table = SystemProcessTable;
        assert!(
            wait_for(Duration::from_secs(2), || {
                table.command_name_for(pid).as_deref() == Some("mail-daemon")
            })
            .await
        );
        assert!(command_matches(&table.command_name_for(pid).unwrap(), "mail-daemon"));

        child.kill().await.unwrap();
    }
}
