use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tar::Archive;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zip::ZipArchive;

use crate::daemon::monitor::Monitor;
use crate::daemon::services::{Manifest, ServicesRoot, MANIFEST_FILE};
use crate::daemon::supervisor::{OperationGuard, Supervisor};
use crate::error::{Result, SupervisorError};
use crate::registry::{current_platform, Package, Registry};

/// One step of an installation, streamed to the caller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallProgress {
    pub package: String,
    pub step: String,
    pub progress: u32,
    pub total: u32,
}

/// Where a package comes from, decided once per install
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    Binary { url: String, checksum: String },
    Source { repo_url: String },
}

impl InstallSource {
    /// Prefer a prebuilt artifact for `platform`, fall back to the repository
    pub fn resolve(package: &Package, platform: &str) -> Result<Self> {
        if let Some(artifact) = package.artifact_for(platform) {
            return Ok(Self::Binary {
                url: artifact.url.clone(),
                checksum: artifact.sha256.clone(),
            });
        }
        match package.repository.as_deref() {
            Some(repo) if !repo.trim().is_empty() => Ok(Self::Source {
                repo_url: repo.to_string(),
            }),
            _ => Err(SupervisorError::InstallFailed {
                package: package.name.clone(),
                reason: format!("no artifact for {} and no repository", platform),
            }),
        }
    }
}

/// Checksums that were never filled in are not verified
pub fn is_placeholder_checksum(checksum: &str) -> bool {
    let c = checksum.trim().to_ascii_lowercase();
    c.is_empty()
        || c.chars().all(|ch| ch == '0')
        || c.starts_with("placeholder")
        || c.starts_with("todo")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Commands used to build a package from source
#[derive(Debug, Clone)]
pub struct SourceBuild {
    pub git_program: String,
    pub build_program: String,
    pub build_args: Vec<String>,
}

impl Default for SourceBuild {
    fn default() -> Self {
        Self {
            git_program: "git".into(),
            build_program: "cargo".into(),
            build_args: vec!["build".into(), "--release".into()],
        }
    }
}

/// Temporary path removed on drop
struct Scratch(PathBuf);

impl Drop for Scratch {
    fn drop(&mut self) {
        let result = if self.0.is_dir() {
            std::fs::remove_dir_all(&self.0)
        } else {
            std::fs::remove_file(&self.0)
        };
        if let Err(e) = result {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.0.display(), "Failed to remove scratch path: {}", e);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    TarGz,
    Zip,
}

fn archive_kind(url: &str) -> Option<ArchiveKind> {
    let path = url
        .split(|c: char| c == '?' || c == '#')
        .next()
        .unwrap_or(url)
        .to_ascii_lowercase();
    if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else if path.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else {
        None
    }
}

pub struct PackageInstaller {
    registry: Arc<dyn Registry>,
    supervisor: Supervisor,
    monitor: Option<Monitor>,
    platform: String,
    source_build: SourceBuild,
}

impl PackageInstaller {
    pub fn new(registry: Arc<dyn Registry>, supervisor: Supervisor) -> Self {
        Self {
            registry,
            supervisor,
            monitor: None,
            platform: current_platform(),
            source_build: SourceBuild::default(),
        }
    }

    /// Refresh this monitor after every install and uninstall
    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_source_build(mut self, source_build: SourceBuild) -> Self {
        self.source_build = source_build;
        self
    }

    fn root(&self) -> &ServicesRoot {
        self.supervisor.root()
    }

    pub async fn install_package(
        &self,
        name: &str,
        progress: &mpsc::UnboundedSender<InstallProgress>,
    ) -> Result<()> {
        let guard = self.supervisor.claim(name)?;
        emit(progress, name, "Fetching package info...", 0);

        let package = self.registry.get_package(name)?;
        let source = InstallSource::resolve(&package, &self.platform)?;
        let install_dir = self.root().paths(guard.name())?.dir;
        info!(package = name, source = ?source, "Installing package");

        let result = match &source {
            InstallSource::Binary { url, checksum } => {
                self.install_binary(&guard, url, checksum, &install_dir, progress)
                    .await
            }
            InstallSource::Source { repo_url } => {
                self.install_from_source(name, repo_url, &install_dir, progress)
                    .await
            }
        };
        drop(guard);

        match &result {
            Ok(()) => {
                emit(progress, name, "Installation complete!", 100);
                info!(package = name, "Package installed");
            }
            Err(e) => warn!(package = name, "Installation failed: {}", e),
        }
        self.notify_monitor().await;
        result
    }

    /// Stop if running, then remove the install directory
    pub async fn uninstall_package(&self, name: &str) -> Result<()> {
        let guard = self.supervisor.claim(name)?;
        let paths = self.root().paths(name)?;
        self.stop_if_running(&guard).await?;

        if paths.dir.exists() {
            tokio::fs::remove_dir_all(&paths.dir).await?;
            info!(package = name, dir = %paths.dir.display(), "Package removed");
        } else {
            debug!(package = name, "Nothing to remove");
        }
        drop(guard);

        self.notify_monitor().await;
        Ok(())
    }

    async fn stop_if_running(&self, guard: &OperationGuard) -> Result<()> {
        match self.supervisor.stop_claimed(guard).await {
            Ok(outcome) => {
                debug!(package = guard.name(), ?outcome, "Stopped service");
                Ok(())
            }
            Err(SupervisorError::NotRunning(_) | SupervisorError::Unavailable { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn notify_monitor(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.refresh_now().await;
        }
    }

    async fn install_binary(
        &self,
        guard: &OperationGuard,
        url: &str,
        checksum: &str,
        install_dir: &Path,
        progress: &mpsc::UnboundedSender<InstallProgress>,
    ) -> Result<()> {
        let name = guard.name();
        let kind = archive_kind(url).ok_or_else(|| SupervisorError::InstallFailed {
            package: name.to_string(),
            reason: format!("unsupported artifact format: {}", url),
        })?;

        let root = self.root().path().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        let tag = Uuid::new_v4().simple().to_string();
        let download = Scratch(root.join(format!(".{}-{}.download", name, tag)));
        let staging = Scratch(root.join(format!(".{}-{}.staging", name, tag)));

        emit(progress, name, "Downloading...", 20);
        let actual = download_to(url, &download.0).await?;

        emit(progress, name, "Verifying checksum...", 50);
        if is_placeholder_checksum(checksum) {
            warn!(package = name, "Artifact has no checksum, skipping verification");
        } else if !actual.eq_ignore_ascii_case(checksum.trim()) {
            return Err(SupervisorError::ChecksumMismatch {
                package: name.to_string(),
                expected: checksum.trim().to_string(),
                actual,
            });
        }

        emit(progress, name, "Extracting...", 70);
        let archive = download.0.clone();
        let staging_dir = staging.0.clone();
        let package = name.to_string();
        tokio::task::spawn_blocking(move || unpack(&package, kind, &archive, &staging_dir))
            .await
            .map_err(|e| SupervisorError::InstallFailed {
                package: name.to_string(),
                reason: format!("extraction task failed: {}", e),
            })??;

        let content = content_root(name, &staging.0)?;
        prepare_entrypoint(name, &content)?;

        if install_dir.exists() {
            info!(package = name, "Replacing existing installation");
            // Its socket and pid file go with the directory
            self.stop_if_running(guard).await?;
            tokio::fs::remove_dir_all(install_dir).await?;
        }
        tokio::fs::rename(&content, install_dir).await?;
        Ok(())
    }

    async fn install_from_source(
        &self,
        name: &str,
        repo_url: &str,
        install_dir: &Path,
        progress: &mpsc::UnboundedSender<InstallProgress>,
    ) -> Result<()> {
        let build = &self.source_build;
        let mut cloned = false;

        if !install_dir.exists() {
            emit(progress, name, "Cloning repository...", 20);
            if let Some(parent) = install_dir.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut clone = Command::new(&build.git_program);
            clone.arg("clone").arg(repo_url).arg(install_dir);
            let output = run(name, &mut clone).await?;
            if !output.status.success() {
                return Err(SupervisorError::InstallFailed {
                    package: name.to_string(),
                    reason: format!(
                        "git clone failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            }
            cloned = true;
        } else {
            debug!(package = name, "Install directory exists, skipping clone");
        }

        emit(progress, name, "Building daemon...", 50);
        let mut cmd = Command::new(&build.build_program);
        cmd.args(&build.build_args).current_dir(install_dir);
        let outcome = match run(name, &mut cmd).await {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(SupervisorError::BuildFailed {
                package: name.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            Err(e) => Err(e),
        };

        if outcome.is_err() && cloned {
            warn!(package = name, "Removing clone after failed build");
            if let Err(e) = tokio::fs::remove_dir_all(install_dir).await {
                warn!(package = name, "Failed to remove clone: {}", e);
            }
        }
        outcome
    }
}

fn emit(tx: &mpsc::UnboundedSender<InstallProgress>, package: &str, step: &str, progress: u32) {
    let _ = tx.send(InstallProgress {
        package: package.to_string(),
        step: step.to_string(),
        progress,
        total: 100,
    });
}

async fn run(package: &str, cmd: &mut Command) -> Result<std::process::Output> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    debug!(package, program = %program, "Running");
    cmd.stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| SupervisorError::InstallFailed {
            package: package.to_string(),
            reason: format!("failed to run {}: {}", program, e),
        })
}

/// Stream `url` into `dest`, returning the SHA-256 of what was written
async fn download_to(url: &str, dest: &Path) -> Result<String> {
    let network = |reason: String| SupervisorError::NetworkFailure {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .user_agent(concat!("svcmgr/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| network(format!("failed to create HTTP client: {}", e)))?;

    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| network(e.to_string()))?;
    if !response.status().is_success() {
        return Err(network(format!("HTTP {}", response.status())));
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut hasher = Sha256::new();
    let mut written = 0usize;
    while let Some(chunk) = response.chunk().await.map_err(|e| network(e.to_string()))? {
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        written += chunk.len();
    }
    file.flush().await?;
    debug!(url, bytes = written, "Download complete");

    Ok(format!("{:x}", hasher.finalize()))
}

fn unpack(package: &str, kind: ArchiveKind, archive: &Path, dest: &Path) -> Result<()> {
    let failed = |reason: String| SupervisorError::InstallFailed {
        package: package.to_string(),
        reason,
    };
    std::fs::create_dir_all(dest)?;
    let file = std::fs::File::open(archive)?;

    match kind {
        ArchiveKind::TarGz => Archive::new(GzDecoder::new(file))
            .unpack(dest)
            .map_err(|e| failed(format!("failed to read tar archive: {}", e))),
        ArchiveKind::Zip => {
            let mut zip = ZipArchive::new(file)
                .map_err(|e| failed(format!("failed to read zip archive: {}", e)))?;
            for i in 0..zip.len() {
                let mut entry = zip
                    .by_index(i)
                    .map_err(|e| failed(format!("failed to read zip entry: {}", e)))?;
                let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
                    return Err(failed(format!("unsafe path in archive: {}", entry.name())));
                };
                let target = dest.join(relative);

                if entry.is_dir() {
                    std::fs::create_dir_all(&target)?;
                    continue;
                }
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut out = std::fs::File::create(&target)?;
                std::io::copy(&mut entry, &mut out)?;

                #[cfg(unix)]
                if let Some(mode) = entry.unix_mode() {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
                }
            }
            Ok(())
        }
    }
}

/// The extracted tree, allowing for one wrapping top-level directory
fn content_root(package: &str, staging: &Path) -> Result<PathBuf> {
    if staging.join(MANIFEST_FILE).exists() {
        return Ok(staging.to_path_buf());
    }

    let dirs: Vec<PathBuf> = std::fs::read_dir(staging)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    if let [only] = dirs.as_slice() {
        if only.join(MANIFEST_FILE).exists() {
            return Ok(only.clone());
        }
    }

    Err(SupervisorError::InstallFailed {
        package: package.to_string(),
        reason: format!("archive contains no {}", MANIFEST_FILE),
    })
}

fn prepare_entrypoint(package: &str, content: &Path) -> Result<()> {
    let failed = |reason: String| SupervisorError::InstallFailed {
        package: package.to_string(),
        reason,
    };
    let manifest = Manifest::load(&content.join(MANIFEST_FILE))
        .map_err(|e| failed(format!("invalid manifest: {}", e)))?;
    let entrypoint = manifest.entrypoint_path(content);
    if !entrypoint.is_file() {
        return Err(failed(format!(
            "entrypoint {} missing from archive",
            manifest.daemon.entrypoint
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&entrypoint)?.permissions();
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(&entrypoint, perms)?;
    }

    Ok(())
}
