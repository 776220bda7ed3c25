use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::daemon::services::{Manifest, ServicesRoot, MANIFEST_FILE};
use crate::error::{Result, SupervisorError};

/// Downloadable build of a package for one platform
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub url: String,
    #[serde(default)]
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Package {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    /// Git URL for building from source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Keyed by platform, e.g. `darwin-aarch64`
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
    #[serde(default)]
    pub methods_count: u32,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub featured: bool,
    #[serde(default)]
    pub official: bool,

    // Derived from the services root, never read from the catalogue
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub installed_version: Option<String>,
    #[serde(default)]
    pub update_available: bool,
}

impl Package {
    pub fn artifact_for(&self, platform: &str) -> Option<&Artifact> {
        self.artifacts.get(platform)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: String,
}

/// The catalogue document as stored in `registry.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RegistryDocument {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(default)]
    pub categories: Vec<Category>,
}

impl RegistryDocument {
    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| SupervisorError::Registry(format!("failed to parse registry: {}", e)))
    }
}

/// Read-only package catalogue
pub trait Registry: Send + Sync {
    fn get_package(&self, name: &str) -> Result<Package>;

    fn list_packages(&self) -> Result<Vec<Package>>;
}

impl Registry for RegistryDocument {
    fn get_package(&self, name: &str) -> Result<Package> {
        self.packages
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| SupervisorError::PackageNotFound(name.to_string()))
    }

    fn list_packages(&self) -> Result<Vec<Package>> {
        Ok(self.packages.clone())
    }
}

/// Registry backed by a JSON file, re-read on every lookup
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// $SVCMGR_REGISTRY or ~/.svcmgr/registry.json
    pub fn from_env() -> Self {
        Self::new(crate::clienv::registry_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<RegistryDocument> {
        trace!(path = %self.path.display(), "Loading registry");
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            SupervisorError::Registry(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        let document = RegistryDocument::parse(&content)?;
        debug!(packages = document.packages.len(), "Registry loaded");
        Ok(document)
    }
}

impl Registry for FileRegistry {
    fn get_package(&self, name: &str) -> Result<Package> {
        self.load()?.get_package(name)
    }

    fn list_packages(&self) -> Result<Vec<Package>> {
        Ok(self.load()?.packages)
    }
}

/// Fill in `installed`, `installed_version` and `update_available`
pub fn annotate_installed(packages: &mut [Package], root: &ServicesRoot) {
    for package in packages.iter_mut() {
        let manifest_path = root.path().join(&package.name).join(MANIFEST_FILE);
        package.installed = manifest_path.exists();
        package.installed_version = None;
        package.update_available = false;

        if !package.installed {
            continue;
        }
        if let Ok(manifest) = Manifest::load(&manifest_path) {
            package.update_available = manifest.version != package.version;
            package.installed_version = Some(manifest.version);
        }
    }
}

/// Catalogue listing annotated against the services root
pub fn list_annotated(registry: &dyn Registry, root: &ServicesRoot) -> Result<Vec<Package>> {
    let mut packages = registry.list_packages()?;
    annotate_installed(&mut packages, root);
    Ok(packages)
}

/// Platform key for artifact lookup, e.g. `linux-x86_64`
pub fn current_platform() -> String {
    let os = if cfg!(target_os = "macos") {
        "darwin"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else {
        "unknown"
    };

    let arch = if cfg!(target_arch = "x86_64") {
        "x86_64"
    } else if cfg!(target_arch = "aarch64") {
        "aarch64"
    } else {
        "unknown"
    };

    format!("{}-{}", os, arch)
}
