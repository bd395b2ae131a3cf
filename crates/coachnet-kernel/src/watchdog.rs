//! [`Watchdog`] – liveness monitor for long-running loops.
//!
//! The health propagator calls [`Watchdog::heartbeat`] at the end of every
//! successful cycle. The watchdog tracks the timestamp of each heartbeat and
//! considers an entry *frozen* when its maximum gap has been exceeded.
//!
//! [`LivenessMonitor`] runs on its own timer, separate from the propagator's,
//! so a hung propagation loop is itself detected: when an entry freezes the
//! monitor drives the system into its safe state through an
//! [`EmergencyResponder`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info};

use crate::emergency::EmergencyResponder;

/// Heartbeat id used by the health propagator.
pub const PROPAGATOR_HEARTBEAT: &str = "health_propagator";

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Liveness reported for a single entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// A heartbeat arrived within the maximum gap.
    Alive,
    /// No heartbeat within the maximum gap.
    Frozen,
}

struct Entry {
    last_heartbeat: Instant,
    max_gap: Duration,
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

/// Tracks heartbeats and detects frozen loops.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use coachnet_kernel::watchdog::{Liveness, Watchdog};
///
/// let mut wd = Watchdog::new();
/// wd.register("health_propagator", Duration::from_secs(15));
/// wd.heartbeat("health_propagator");
///
/// assert_eq!(wd.liveness("health_propagator"), Liveness::Alive);
/// ```
#[derive(Default)]
pub struct Watchdog {
    entries: HashMap<String, Entry>,
}

/// A watchdog shared between the loops it supervises and the monitor.
pub type SharedWatchdog = Arc<Mutex<Watchdog>>;

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedWatchdog {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Register `id` with a maximum heartbeat gap. The last heartbeat starts
    /// at now; re-registering resets it.
    pub fn register(&mut self, id: &str, max_gap: Duration) {
        self.entries.insert(
            id.to_string(),
            Entry {
                last_heartbeat: Instant::now(),
                max_gap,
            },
        );
    }

    /// Record a heartbeat for `id`. No-op for unregistered ids.
    pub fn heartbeat(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.last_heartbeat = Instant::now();
        }
    }

    /// [`Liveness::Frozen`] for unknown ids.
    pub fn liveness(&self, id: &str) -> Liveness {
        match self.entries.get(id) {
            Some(entry) if entry.last_heartbeat.elapsed() <= entry.max_gap => Liveness::Alive,
            _ => Liveness::Frozen,
        }
    }

    /// Time since the last heartbeat of `id`.
    pub fn since_last(&self, id: &str) -> Option<Duration> {
        self.entries.get(id).map(|e| e.last_heartbeat.elapsed())
    }

    /// Ids whose maximum gap has been exceeded, sorted.
    pub fn check_all(&self) -> Vec<String> {
        let mut frozen: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.last_heartbeat.elapsed() > entry.max_gap)
            .map(|(id, _)| id.clone())
            .collect();
        frozen.sort();
        frozen
    }
}

/// Lock a shared watchdog, tolerating poisoning.
pub fn lock(watchdog: &SharedWatchdog) -> std::sync::MutexGuard<'_, Watchdog> {
    watchdog.lock().unwrap_or_else(PoisonError::into_inner)
}

// ────────────────────────────────────────────────────────────────────────────
// Monitor
// ────────────────────────────────────────────────────────────────────────────

/// Periodically checks a [`SharedWatchdog`] and trips an emergency stop for
/// every entry that freezes. Each entry trips once per frozen period.
pub struct LivenessMonitor {
    watchdog: SharedWatchdog,
    responder: Arc<dyn EmergencyResponder>,
    period: Duration,
    tripped: BTreeSet<String>,
}

impl LivenessMonitor {
    pub fn new(
        watchdog: SharedWatchdog,
        responder: Arc<dyn EmergencyResponder>,
        period: Duration,
    ) -> Self {
        Self {
            watchdog,
            responder,
            period,
            tripped: BTreeSet::new(),
        }
    }

    /// Run one check and return the entries that tripped on this call.
    pub async fn check(&mut self) -> Vec<String> {
        let frozen = lock(&self.watchdog).check_all();

        let recovered: Vec<String> = self
            .tripped
            .iter()
            .filter(|id| !frozen.contains(*id))
            .cloned()
            .collect();
        for id in recovered {
            info!(entry = %id, "heartbeat recovered");
            self.tripped.remove(&id);
        }

        let mut newly = Vec::new();
        for id in frozen {
            if self.tripped.contains(&id) {
                continue;
            }
            error!(entry = %id, "heartbeat deadline missed; entering safe state");
            let report = self
                .responder
                .emergency_stop(&format!("watchdog: '{id}' missed its heartbeat deadline"))
                .await;
            if !report.is_complete() {
                error!(entry = %id, failures = ?report.failures(), "watchdog stop was incomplete");
            }
            self.tripped.insert(id.clone());
            newly.push(id);
        }
        newly
    }

    /// Check every `period` until `shutdown` flips to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("liveness monitor stopped");
                        return;
                    }
                }
            }
        }
    }
}
