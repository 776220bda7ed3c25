use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "svcmgr")]
#[command(version)]
#[command(about = "Supervise local daemons that speak JSON over Unix sockets", long_about = None)]
pub(crate) struct Cli {
    /// Services root. Can also be set via SVCMGR_SERVICES_DIR env var.
    #[arg(long, global = true)]
    pub services_dir: Option<PathBuf>,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// List installed services and their status
    List,

    /// Show detailed health of a running service
    Health {
        /// Service name
        name: String,
    },

    /// Start a service and wait until it answers
    Start {
        /// Service name
        name: String,
    },

    /// Stop a service
    Stop {
        /// Service name
        name: String,
    },

    /// Stop then start a service
    Restart {
        /// Service name
        name: String,
    },

    /// Start a stopped service or stop a running one
    Toggle {
        /// Service name
        name: String,
    },

    /// Call a method on a running service
    Call {
        /// Service name
        name: String,

        /// Method name (e.g., gmail.list)
        method: String,

        /// Parameters as a JSON object
        #[arg(short, long, default_value = "{}")]
        params: String,

        /// Timeout in seconds (default from config, 30)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// List the methods a running service exposes
    Methods {
        /// Service name
        name: String,
    },

    /// List packages available in the registry
    Packages,

    /// Install a package from the registry
    Install {
        /// Package name
        name: String,
    },

    /// Stop and remove an installed package
    Uninstall {
        /// Package name
        name: String,
    },

    /// Continuously display service status
    Watch,
}
