use std::path::PathBuf;

const ENV_HOME: &str = "SVCMGR_HOME";
const ENV_SERVICES_DIR: &str = "SVCMGR_SERVICES_DIR";
const ENV_REGISTRY: &str = "SVCMGR_REGISTRY";
const ENV_CONFIG_DIR: &str = "SVCMGR_CONFIG_DIR";

const FALLBACK_HOME: &str = "~/.svcmgr";
const FALLBACK_CONFIG_DIR: &str = "~/.config";
const SVCMGR_SUBDIR: &str = "svcmgr";

/// Non-empty environment variable value.
fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Base data directory ($SVCMGR_HOME or ~/.svcmgr)
pub fn home_dir() -> PathBuf {
    let dir = env_opt(ENV_HOME)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".svcmgr"))
                .unwrap_or_else(|| PathBuf::from(FALLBACK_HOME))
        });
    tracing::trace!(dir = %dir.display(), "Resolved home directory");
    dir
}

/// Services root ($SVCMGR_SERVICES_DIR or $SVCMGR_HOME/services)
pub fn services_dir() -> PathBuf {
    let dir = env_opt(ENV_SERVICES_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join("services"));
    tracing::trace!(dir = %dir.display(), "Resolved services directory");
    dir
}

/// Package registry document ($SVCMGR_REGISTRY or $SVCMGR_HOME/registry.json)
pub fn registry_path() -> PathBuf {
    let path = env_opt(ENV_REGISTRY)
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join("registry.json"));
    tracing::trace!(path = %path.display(), "Registry path");
    path
}

/// Config directory ($SVCMGR_CONFIG_DIR or ~/.config/svcmgr)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(ENV_CONFIG_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(SVCMGR_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}
