//! Monitor - single owner of the published service state
//!
//! Polls the scanner on an interval and publishes immutable
//! [`ServiceSnapshot`]s through a watch channel. Toggles go through the
//! supervisor claim, so at most one action per service is ever in flight.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::health::{HealthSummary, OverallHealth};
use super::protocol::DaemonStatus;
use super::services::{Scanner, ServiceRecord};
use super::supervisor::Supervisor;
use crate::error::Result;

/// Immutable published state
#[derive(Debug, Clone, Default)]
pub struct ServiceSnapshot {
    pub services: Arc<Vec<ServiceRecord>>,
    /// Last listing failure; the list above is the previous good one
    pub list_error: Option<String>,
    /// Failure of the most recent action per service
    pub action_errors: BTreeMap<String, String>,
    pub in_flight: BTreeSet<String>,
    pub updated_at: Option<SystemTime>,
}

impl ServiceSnapshot {
    pub fn service(&self, name: &str) -> Option<&ServiceRecord> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary::from_records(&self.services)
    }

    pub fn overall(&self) -> OverallHealth {
        let has_errors = self.list_error.is_some() || !self.action_errors.is_empty();
        self.summary().overall(has_errors)
    }
}

#[derive(Default)]
struct MonitorState {
    scanned: Arc<Vec<ServiceRecord>>,
    list_error: Option<String>,
    action_errors: BTreeMap<String, String>,
    overlays: BTreeMap<String, DaemonStatus>,
    updated_at: Option<SystemTime>,
}

impl MonitorState {
    fn snapshot(&self) -> ServiceSnapshot {
        let services = if self.overlays.is_empty() {
            Arc::clone(&self.scanned)
        } else {
            let records = self
                .scanned
                .iter()
                .map(|record| match self.overlays.get(&record.name) {
                    Some(status) => ServiceRecord {
                        status: *status,
                        is_running: status.is_running(),
                        ..record.clone()
                    },
                    None => record.clone(),
                })
                .collect();
            Arc::new(records)
        };

        ServiceSnapshot {
            services,
            list_error: self.list_error.clone(),
            action_errors: self.action_errors.clone(),
            in_flight: self.overlays.keys().cloned().collect(),
            updated_at: self.updated_at,
        }
    }
}

struct Inner {
    scanner: Scanner,
    supervisor: Supervisor,
    poll_interval: Duration,
    state: Mutex<MonitorState>,
    snapshots: watch::Sender<ServiceSnapshot>,
    shutdown: watch::Sender<bool>,
}

/// Cheap to clone; all clones share one state
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<Inner>,
}

impl Monitor {
    pub fn new(scanner: Scanner, supervisor: Supervisor, poll_interval: Duration) -> Self {
        let (snapshots, _) = watch::channel(ServiceSnapshot::default());
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                scanner,
                supervisor,
                poll_interval,
                state: Mutex::new(MonitorState::default()),
                snapshots,
                shutdown,
            }),
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        self.inner.snapshots.borrow().clone()
    }

    /// Poll until [`Monitor::stop`] is called
    pub async fn run(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.inner.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.inner.poll_interval, "Monitor started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh_now().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Monitor stopped");
    }

    pub fn spawn(&self) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move { monitor.run().await })
    }

    /// No further polls are scheduled; a scan already running completes
    pub fn stop(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Scan now and publish
    pub async fn refresh_now(&self) -> ServiceSnapshot {
        let listing = self.inner.scanner.list_services().await;
        let mut state = self.lock_state();
        match listing {
            Ok(records) => {
                state.scanned = Arc::new(records);
                state.list_error = None;
            }
            Err(e) => {
                warn!("Service listing failed: {}", e);
                state.list_error = Some(e.to_string());
            }
        }
        state.updated_at = Some(SystemTime::now());
        self.publish(&state)
    }

    /// Stop a live service, start a stopped one
    pub async fn toggle(&self, record: &ServiceRecord) -> Result<()> {
        let supervisor = &self.inner.supervisor;
        let guard = supervisor.claim(&record.name)?;
        let starting = record.status == DaemonStatus::Stopped;
        let overlay = if starting {
            DaemonStatus::Starting
        } else {
            DaemonStatus::Stopping
        };

        {
            let mut state = self.lock_state();
            state.overlays.insert(record.name.clone(), overlay);
            self.publish(&state);
        }
        debug!(service = %record.name, action = overlay.as_str(), "Toggle in flight");

        let outcome = if starting {
            supervisor.start_claimed(&guard).await.map(|_| ())
        } else {
            supervisor.stop_claimed(&guard).await.map(|_| ())
        };

        {
            let mut state = self.lock_state();
            state.overlays.remove(&record.name);
            match &outcome {
                Ok(()) => {
                    state.action_errors.remove(&record.name);
                }
                Err(e) => {
                    warn!(service = %record.name, "Toggle failed: {}", e);
                    state
                        .action_errors
                        .insert(record.name.clone(), e.to_string());
                }
            }
            self.publish(&state);
        }
        drop(guard);

        self.refresh_now().await;
        outcome
    }

    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        // A panicked writer leaves plain data behind; keep serving it
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &MonitorState) -> ServiceSnapshot {
        let snapshot = state.snapshot();
        self.inner.snapshots.send_replace(snapshot.clone());
        snapshot
    }
}
