//! [`HealthPropagator`] – the single writer of every component's safety
//! state.
//!
//! # Cycle
//!
//! On every tick (default 5 s) the propagator:
//!
//! 1. polls every started component's health check concurrently, each call
//!    bounded by a timeout (a timeout or a panic counts as `Failed`);
//! 2. derives each component's next state from its own report;
//! 3. walks the reverse required edges breadth-first from every impaired or
//!    held component, visiting each node at most once, and re-evaluates the
//!    reached nodes in stage order against their dependencies;
//! 4. commits the changes, publishing one event per transition;
//! 5. if any `critical` component is `Failed`, invokes the emergency
//!    responder exactly once and enters [`SystemMode::SafeShutdown`];
//! 6. records a watchdog heartbeat and publishes a fresh
//!    [`SafetySnapshot`].
//!
//! A cycle that errors or panics does not retry: the propagator enters safe
//! shutdown, triggers an emergency stop and stops running. The missing
//! heartbeat is then also visible to the liveness monitor.
//!
//! Readers never lock the state map. They take the latest snapshot from a
//! [`PropagatorHandle`], which also carries operator commands to the task.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use coachnet_middleware::{EventBus, Topic};
use coachnet_types::{
    Event, EventPayload, GatewayError, HealthLevel, HealthReport, OperatorAuthorization,
    SafetyState, SystemStatus,
};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::component::Lifecycle;
use crate::emergency::EmergencyResponder;
use crate::registry::Registry;
use crate::safety::{
    self, ComponentSafety, FailureResponse, SafetySnapshot, SystemMode, check_operator_transition,
    failure_response, inherited_state, next_state,
};
use crate::watchdog::{self, PROPAGATOR_HEARTBEAT, SharedWatchdog};

const SOURCE: &str = "coachnet-kernel::propagator";
const COMMAND_CAPACITY: usize = 32;

// ────────────────────────────────────────────────────────────────────────────
// Configuration & reports
// ────────────────────────────────────────────────────────────────────────────

/// Timers used by the propagator.
#[derive(Debug, Clone, Copy)]
pub struct PropagatorConfig {
    pub interval: Duration,
    pub health_timeout: Duration,
    /// Maximum gap between successful cycles before the liveness monitor
    /// trips.
    pub watchdog_gap: Duration,
}

impl Default for PropagatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            health_timeout: Duration::from_secs(1),
            watchdog_gap: Duration::from_secs(15),
        }
    }
}

/// One committed state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub component: String,
    pub from: SafetyState,
    pub to: SafetyState,
}

/// Outcome of a single propagation cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub transitions: Vec<Transition>,
    /// `true` when this cycle invoked the emergency responder.
    pub emergency_triggered: bool,
    pub status: SystemStatus,
}

enum Command {
    Cycle {
        reply: oneshot::Sender<Result<CycleReport, GatewayError>>,
    },
    Override {
        component: String,
        target: SafetyState,
        identity: String,
        reply: oneshot::Sender<Result<ComponentSafety, GatewayError>>,
    },
    Rearm {
        identity: String,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
}

// ────────────────────────────────────────────────────────────────────────────
// Handle
// ────────────────────────────────────────────────────────────────────────────

/// Cloneable access to a running propagator.
#[derive(Clone)]
pub struct PropagatorHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Arc<SafetySnapshot>>,
}

fn gone() -> GatewayError {
    GatewayError::Unavailable("health propagator".to_string())
}

impl PropagatorHandle {
    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<SafetySnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified after every cycle and override.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SafetySnapshot>> {
        self.snapshot.clone()
    }

    /// Run a cycle now, outside the regular interval.
    pub async fn run_cycle(&self) -> Result<CycleReport, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Cycle { reply })
            .await
            .map_err(|_| gone())?;
        rx.await.map_err(|_| gone())?
    }

    /// Apply an operator state override.
    pub async fn override_state(
        &self,
        component: &str,
        target: SafetyState,
        authorization: &OperatorAuthorization,
    ) -> Result<ComponentSafety, GatewayError> {
        if !authorization.authorized {
            return Err(GatewayError::Unauthorized(authorization.identity.clone()));
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Override {
                component: component.to_string(),
                target,
                identity: authorization.identity.clone(),
                reply,
            })
            .await
            .map_err(|_| gone())?;
        rx.await.map_err(|_| gone())?
    }

    /// Leave safe-shutdown mode after the interlock has been reset. Refused
    /// while a critical component is still `Failed`.
    pub async fn rearm_system(&self, authorization: &OperatorAuthorization) -> Result<(), GatewayError> {
        if !authorization.authorized {
            return Err(GatewayError::Unauthorized(authorization.identity.clone()));
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Rearm {
                identity: authorization.identity.clone(),
                reply,
            })
            .await
            .map_err(|_| gone())?;
        rx.await.map_err(|_| gone())?
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Propagator
// ────────────────────────────────────────────────────────────────────────────

pub struct HealthPropagator {
    registry: Arc<Registry>,
    responder: Arc<dyn EmergencyResponder>,
    events: EventBus,
    watchdog: SharedWatchdog,
    config: PropagatorConfig,
    /// Components in stage order.
    order: Vec<String>,
    states: BTreeMap<String, ComponentSafety>,
    mode: SystemMode,
    cycle: u64,
    emergency_invoked: bool,
    halted: bool,
    snapshot_tx: watch::Sender<Arc<SafetySnapshot>>,
    commands: mpsc::Receiver<Command>,
}

impl HealthPropagator {
    /// Build a propagator over a booted registry.
    ///
    /// Started components begin in `Initializing`; everything else in
    /// `Stopped`.
    pub fn new(
        registry: Arc<Registry>,
        responder: Arc<dyn EmergencyResponder>,
        events: EventBus,
        watchdog: SharedWatchdog,
        config: PropagatorConfig,
    ) -> Result<(Self, PropagatorHandle), GatewayError> {
        let order: Vec<String> = registry.resolve_stages()?.into_iter().flatten().collect();
        let states: BTreeMap<String, ComponentSafety> = order
            .iter()
            .filter_map(|name| {
                let classification = registry.classification(name)?;
                let state = match registry.lifecycle(name) {
                    Some(Lifecycle::Started) => SafetyState::Initializing,
                    _ => SafetyState::Stopped,
                };
                Some((name.clone(), ComponentSafety::new(name.clone(), classification, state)))
            })
            .collect();

        watchdog::lock(&watchdog).register(PROPAGATOR_HEARTBEAT, config.watchdog_gap);

        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(SafetySnapshot::new(states.clone())));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);

        let propagator = Self {
            registry,
            responder,
            events,
            watchdog,
            config,
            order,
            states,
            mode: SystemMode::Normal,
            cycle: 0,
            emergency_invoked: false,
            halted: false,
            snapshot_tx,
            commands: commands_rx,
        };
        let handle = PropagatorHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        };
        Ok((propagator, handle))
    }

    pub fn mode(&self) -> SystemMode {
        self.mode
    }

    pub fn snapshot(&self) -> SafetySnapshot {
        SafetySnapshot {
            cycle: self.cycle,
            taken_at: Utc::now(),
            mode: self.mode,
            components: self.states.clone(),
        }
    }

    /// Tick until `shutdown` flips to `true` or a cycle fails.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.config.interval.as_millis() as u64, "health propagator running");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.run_cycle().await;
                }
                Some(command) = self.commands.recv() => {
                    self.handle(command).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("health propagator stopped");
                        return;
                    }
                }
            }
            if self.halted {
                error!("health propagator halted");
                return;
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Cycle { reply } => {
                let _ = reply.send(self.run_cycle().await);
            }
            Command::Override {
                component,
                target,
                identity,
                reply,
            } => {
                let _ = reply.send(self.apply_override(&component, target, &identity));
            }
            Command::Rearm { identity, reply } => {
                let _ = reply.send(self.rearm(&identity));
            }
        }
    }

    /// Run one propagation cycle. A cycle that fails or panics puts the
    /// system into safe shutdown and halts the propagator.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, GatewayError> {
        if self.halted {
            return Err(gone());
        }
        match AssertUnwindSafe(self.propagate()).catch_unwind().await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => {
                self.halt(&format!("propagation cycle failed: {e}")).await;
                Err(e)
            }
            Err(_) => {
                self.halt("propagation cycle panicked").await;
                Err(gone())
            }
        }
    }

    async fn propagate(&mut self) -> Result<CycleReport, GatewayError> {
        let reports = self.poll().await;
        let now = Utc::now();

        // Own health first.
        let mut levels: BTreeMap<String, HealthLevel> = BTreeMap::new();
        let mut next: BTreeMap<String, SafetyState> = BTreeMap::new();
        for name in &self.order {
            let entry = self
                .states
                .get_mut(name)
                .ok_or_else(|| GatewayError::NotFound(name.clone()))?;
            match reports.get(name) {
                Some(report) => {
                    match report.level {
                        HealthLevel::Healthy => entry.consecutive_failure_count = 0,
                        HealthLevel::Failed => entry.consecutive_failure_count += 1,
                        HealthLevel::Degraded => {}
                    }
                    entry.last_report = Some(report.clone());
                    entry.last_checked = Some(now);
                    levels.insert(name.clone(), report.level);
                    next.insert(name.clone(), next_state(entry.state, report.level, None));
                }
                None => {
                    next.insert(name.clone(), entry.state);
                }
            }
        }

        // Cascade along reverse required edges, in stage order so every
        // dependency is final before its dependents are evaluated.
        let affected = self.affected(&next);
        for name in &self.order {
            if !affected.contains(name) {
                continue;
            }
            let (Some(level), Some(entry)) = (levels.get(name), self.states.get(name)) else {
                continue;
            };
            let inherited = self
                .registry
                .required_dependencies(name)
                .iter()
                .filter_map(|dep| {
                    let classification = self.states.get(dep)?.classification;
                    inherited_state(classification, *next.get(dep)?)
                })
                .max_by_key(|state| safety::severity(*state));
            next.insert(name.clone(), next_state(entry.state, *level, inherited));
        }

        let transitions = self.commit(&next);
        // A failed critical component is visible before the stop it causes.
        self.publish_snapshot();
        let emergency_triggered = self.escalate().await;

        watchdog::lock(&self.watchdog).heartbeat(PROPAGATOR_HEARTBEAT);
        self.cycle += 1;
        self.publish_snapshot();

        Ok(CycleReport {
            cycle: self.cycle,
            transitions,
            emergency_triggered,
            status: self.snapshot_tx.borrow().status(),
        })
    }

    async fn poll(&self) -> BTreeMap<String, HealthReport> {
        let mut set = JoinSet::new();
        for (name, component) in self.registry.started() {
            if !self.states.contains_key(&name) {
                continue;
            }
            let timeout = self.config.health_timeout;
            set.spawn(async move {
                let check = AssertUnwindSafe(component.health_check()).catch_unwind();
                let report = match tokio::time::timeout(timeout, check).await {
                    Ok(Ok(report)) => report,
                    Ok(Err(_)) => HealthReport::failed("health check panicked"),
                    Err(_) => {
                        let err = GatewayError::HealthCheckTimeout(name.clone());
                        warn!(component = %name, error = %err, "health check timed out");
                        HealthReport::failed(err.to_string())
                    }
                };
                (name, report)
            });
        }

        let mut reports = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, report)) => {
                    reports.insert(name, report);
                }
                Err(e) => error!(error = %e, "health poll task aborted"),
            }
        }
        reports
    }

    /// Breadth-first walk from every component that affects its dependents.
    /// Each node is visited at most once.
    fn affected(&self, next: &BTreeMap<String, SafetyState>) -> BTreeSet<String> {
        let mut queue: VecDeque<String> = self
            .order
            .iter()
            .filter(|name| {
                match (self.states.get(*name), next.get(*name)) {
                    (Some(entry), Some(state)) => {
                        inherited_state(entry.classification, *state).is_some()
                    }
                    _ => false,
                }
            })
            .cloned()
            .collect();

        let mut visited = BTreeSet::new();
        while let Some(name) = queue.pop_front() {
            for dependent in self.registry.dependents(&name) {
                if visited.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        visited
    }

    fn commit(&mut self, next: &BTreeMap<String, SafetyState>) -> Vec<Transition> {
        let now = Utc::now();
        let mut transitions = Vec::new();
        for name in &self.order {
            let (Some(entry), Some(&to)) = (self.states.get_mut(name), next.get(name)) else {
                continue;
            };
            let from = entry.state;
            if from == to {
                continue;
            }
            entry.state = to;
            entry.last_changed = now;
            let classification = entry.classification;
            let detail = entry
                .last_report
                .as_ref()
                .map(|r| r.detail.clone())
                .unwrap_or_default();

            match to {
                SafetyState::Failed => match failure_response(classification) {
                    FailureResponse::EmergencyStop => {
                        error!(component = %name, %classification, %from, "critical component failed")
                    }
                    FailureResponse::DegradeDependents => {
                        error!(component = %name, %classification, %from, "component failed; degrading dependents")
                    }
                    FailureResponse::LogOnly => {
                        warn!(component = %name, %classification, %from, "component failed")
                    }
                },
                SafetyState::Degraded => {
                    warn!(component = %name, %classification, %from, "component degraded")
                }
                _ => info!(component = %name, %classification, %from, %to, "component state changed"),
            }

            self.events.publish_to(
                Topic::SafetyTransitions,
                Event::new(
                    SOURCE,
                    EventPayload::SafetyTransition {
                        component: name.clone(),
                        from,
                        to,
                        detail,
                    },
                ),
            );
            transitions.push(Transition {
                component: name.clone(),
                from,
                to,
            });
        }
        transitions
    }

    /// Invoke the emergency responder once if a critical component failed.
    async fn escalate(&mut self) -> bool {
        let failed: Vec<&str> = self
            .states
            .values()
            .filter(|c| {
                c.state == SafetyState::Failed
                    && failure_response(c.classification) == FailureResponse::EmergencyStop
            })
            .map(|c| c.name.as_str())
            .collect();
        if failed.is_empty() || self.emergency_invoked {
            return false;
        }
        let reason = format!("critical component failed: {}", failed.join(", "));
        self.enter_safe_shutdown(&reason).await;
        true
    }

    async fn enter_safe_shutdown(&mut self, reason: &str) {
        self.mode = SystemMode::SafeShutdown;
        self.events.publish_to(
            Topic::SystemAlerts,
            Event::new(
                SOURCE,
                EventPayload::SafeShutdown {
                    reason: reason.to_string(),
                },
            ),
        );
        if self.emergency_invoked {
            return;
        }
        self.emergency_invoked = true;
        error!(%reason, "entering safe shutdown");
        let report = self.responder.emergency_stop(reason).await;
        if !report.is_complete() {
            error!(
                sequence = report.signal.sequence,
                failures = ?report.failures(),
                "emergency stop incomplete; manual verification required"
            );
        }
    }

    async fn halt(&mut self, reason: &str) {
        error!(%reason, "health propagation failed");
        self.halted = true;
        self.enter_safe_shutdown(reason).await;
        self.publish_snapshot();
    }

    fn apply_override(
        &mut self,
        component: &str,
        target: SafetyState,
        identity: &str,
    ) -> Result<ComponentSafety, GatewayError> {
        let started = self.registry.lifecycle(component) == Some(Lifecycle::Started);
        let entry = self
            .states
            .get_mut(component)
            .ok_or_else(|| GatewayError::NotFound(component.to_string()))?;
        check_operator_transition(component, entry.state, target)?;
        if target == SafetyState::Initializing && !started {
            return Err(GatewayError::Unavailable(component.to_string()));
        }

        let from = entry.state;
        entry.state = target;
        entry.last_changed = Utc::now();
        if target == SafetyState::Initializing {
            entry.consecutive_failure_count = 0;
        }
        let updated = entry.clone();
        info!(%component, %from, to = %target, operator = %identity, "operator state override");

        self.events.publish_to(
            Topic::SafetyTransitions,
            Event::new(
                SOURCE,
                EventPayload::OperatorOverride {
                    component: component.to_string(),
                    from,
                    to: target,
                    identity: identity.to_string(),
                },
            ),
        );
        self.publish_snapshot();
        Ok(updated)
    }

    fn rearm(&mut self, identity: &str) -> Result<(), GatewayError> {
        if self.halted {
            return Err(gone());
        }
        if let Some(failed) = self.states.values().find(|c| {
            c.state == SafetyState::Failed
                && failure_response(c.classification) == FailureResponse::EmergencyStop
        }) {
            return Err(GatewayError::Blocked {
                reason: format!("critical component '{}' is still failed", failed.name),
            });
        }
        if self.mode == SystemMode::SafeShutdown {
            info!(operator = %identity, "leaving safe shutdown");
        }
        self.mode = SystemMode::Normal;
        self.emergency_invoked = false;
        self.publish_snapshot();
        Ok(())
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(Arc::new(self.snapshot()));
    }
}
