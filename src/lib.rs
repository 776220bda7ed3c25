pub mod clienv;
pub mod daemon;
pub mod error;
pub mod installer;
pub mod registry;
pub mod user_config;

#[cfg(all(test, unix))]
mod testing;

pub use error::{Result, SupervisorError};
pub use installer::{InstallProgress, InstallSource, PackageInstaller};
pub use registry::{FileRegistry, Package, Registry};
pub use user_config::{SupervisorSettings, UserConfig};
