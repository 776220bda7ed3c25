//! Local daemon supervision
//!
//! Every service lives in its own directory under the services root and,
//! while running, answers line-delimited JSON requests on `daemon.sock`.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                   Monitor                    │
//! │        (poll loop, watch snapshots)          │
//! ├──────────────────────┬───────────────────────┤
//! │       Scanner        │      Supervisor       │
//! │   (list + probe)     │  (start/stop/restart) │
//! ├──────────────────────┴───────────────────────┤
//! │              RpcClient (socket)              │
//! └──────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod health;
pub mod monitor;
pub mod process;
pub mod protocol;
pub mod services;
pub mod supervisor;

pub use client::RpcClient;
pub use health::{HealthReport, HealthSummary, OverallHealth};
pub use monitor::{Monitor, ServiceSnapshot};
pub use process::{ProcessTable, SystemProcessTable};
pub use protocol::{DaemonStatus, RpcRequest, RpcResponse};
pub use services::{Manifest, Scanner, ServiceRecord, ServicesRoot};
pub use supervisor::{OperationGuard, StartOutcome, StopOutcome, Supervisor};
