pub(crate) mod packages;
pub(crate) mod services;

use std::path::PathBuf;
use std::sync::Arc;

use svcmgr::daemon::{Monitor, Scanner, ServicesRoot, Supervisor};
use svcmgr::{FileRegistry, PackageInstaller, SupervisorSettings, UserConfig};

/// Everything a command needs, resolved once from env and config
pub(crate) struct Context {
    pub root: ServicesRoot,
    pub settings: SupervisorSettings,
    pub json: bool,
    supervisor: Supervisor,
}

impl Context {
    pub fn load(services_dir: Option<PathBuf>, json: bool) -> anyhow::Result<Self> {
        let settings = UserConfig::load()?.settings();
        let root = services_dir
            .map(ServicesRoot::new)
            .unwrap_or_else(ServicesRoot::from_env);
        tracing::debug!(root = %root.path().display(), ?settings, "Resolved context");

        Ok(Self {
            supervisor: Supervisor::new(root.clone(), settings),
            root,
            settings,
            json,
        })
    }

    pub fn scanner(&self) -> Scanner {
        Scanner::new(self.root.clone(), self.settings.probe_timeout)
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn monitor(&self) -> Monitor {
        Monitor::new(
            self.scanner(),
            self.supervisor.clone(),
            self.settings.poll_interval,
        )
    }

    pub fn registry(&self) -> FileRegistry {
        FileRegistry::from_env()
    }

    pub fn installer(&self) -> PackageInstaller {
        PackageInstaller::new(Arc::new(self.registry()), self.supervisor.clone())
    }
}

/// Render seconds as `1d 2h`, `3h 4m`, `5m 6s` or `7s`
pub(crate) fn format_uptime(seconds: u64) -> String {
    let (d, h, m, s) = (
        seconds / 86_400,
        seconds % 86_400 / 3_600,
        seconds % 3_600 / 60,
        seconds % 60,
    );
    if d > 0 {
        format!("{}d {}h", d, h)
    } else if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
