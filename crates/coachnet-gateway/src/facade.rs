//! [`BusOperations`] – the single entry point for bus traffic.
//!
//! Callers never talk to a transport, the injector, the filter or the
//! recorder directly. They go through the facade, which owns the
//! [`Interlock`] and refuses every write while it is engaged.
//!
//! | Operation | While the interlock is engaged |
//! |---|---|
//! | [`send`](BusOperations::send) | `Blocked` |
//! | [`inject`](BusOperations::inject) | `Blocked` |
//! | [`emergency_stop`](BusOperations::emergency_stop) | no-op, reports the first stop |
//! | [`health`](BusOperations::health) | `EmergencyStop` |
//! | [`reset_safe_state`](BusOperations::reset_safe_state) | clears it, given authorization and verification |
//!
//! # Emergency stop
//!
//! The flag is set before anything else happens, so every write that starts
//! after that point is blocked. Only then is the stop signal fanned out to
//! every started component through the registry's
//! [`StopBroadcaster`] while the engagement is written to the safety store.
//! A second caller arriving while the first stop is still fanning out gets
//! the first stop's record back and triggers nothing.
//!
//! A write already in flight when the flag is set is not cancelled. It
//! finishes or times out, and its result is then discarded as `Blocked`.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coachnet_kernel::safety::{self, SafetySnapshot};
use coachnet_kernel::{
    Component, ComponentSpec, Dependencies, EmergencyResponder, HookOutcome, PropagatorHandle,
    StopBroadcaster, StopReport,
};
use coachnet_middleware::{EventBus, Topic};
use coachnet_store::SafetyStore;
use coachnet_types::{
    BusFrame, Event, EventPayload, FrameDirection, GatewayError, HealthLevel, HealthReport,
    OperatorAuthorization, PhysicalVerification, SafetyClassification, SafetyState, SendOutcome,
    StopRecord, StopSignal, SystemStatus,
};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::filter::FrameFilter;
use crate::injector::FrameInjector;
use crate::interlock::{Clearing, Engagement, Interlock, UNALLOCATED_SEQUENCE};
use crate::recorder::FrameRecorder;
use crate::subsystem::{Subsystem, settle};
use crate::transport::TransportComponent;

const SOURCE: &str = "coachnet-gateway::facade";

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct FacadeConfig {
    /// Hard limit on a single transport write.
    pub send_timeout: Duration,
    /// Sends slower than this succeed with a warning.
    pub send_budget: Duration,
    /// Setting the interlock flag slower than this is logged.
    pub stop_budget: Duration,
    /// Limit on each subsystem's health reading.
    pub health_timeout: Duration,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(250),
            send_budget: Duration::from_millis(50),
            stop_budget: Duration::from_millis(20),
            health_timeout: Duration::from_secs(1),
        }
    }
}

/// Everything the facade needs besides its registry dependencies.
pub struct FacadeParts {
    /// Interlock state restored from the safety store; `None` boots clear.
    pub restored: Option<StopRecord>,
    pub store: Option<Arc<SafetyStore>>,
    pub events: EventBus,
    pub config: FacadeConfig,
}

// ────────────────────────────────────────────────────────────────────────────
// Results
// ────────────────────────────────────────────────────────────────────────────

/// Result of [`BusOperations::emergency_stop`]. An emergency stop always
/// succeeds; `incomplete` asks for manual verification.
#[derive(Debug, Clone, Serialize)]
pub struct StopAck {
    pub record: StopRecord,
    /// `true` when the interlock was already engaged and this call did
    /// nothing.
    pub already_engaged: bool,
    pub outcomes: BTreeMap<String, HookOutcome>,
    pub incomplete: bool,
    pub flag_set_micros: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl StopAck {
    pub fn report(&self) -> StopReport {
        StopReport {
            signal: self.record.signal(),
            outcomes: self.outcomes.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubsystemHealth {
    pub kind: &'static str,
    pub classification: SafetyClassification,
    pub status: SystemStatus,
    pub report: HealthReport,
}

/// Everything [`BusOperations::comprehensive_health`] knows.
#[derive(Debug, Clone, Serialize)]
pub struct ComprehensiveHealth {
    pub status: SystemStatus,
    pub checked_at: DateTime<Utc>,
    pub interlock: Option<StopRecord>,
    pub subsystems: BTreeMap<String, SubsystemHealth>,
    /// Latest propagator snapshot, when a propagator is attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety: Option<SafetySnapshot>,
}

fn state_of(level: HealthLevel) -> SafetyState {
    match level {
        HealthLevel::Healthy => SafetyState::Healthy,
        HealthLevel::Degraded => SafetyState::Degraded,
        HealthLevel::Failed => SafetyState::Failed,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Facade
// ────────────────────────────────────────────────────────────────────────────

pub struct BusOperations {
    name: String,
    interlock: Interlock,
    transports: BTreeMap<String, Arc<TransportComponent>>,
    injector: Option<Arc<FrameInjector>>,
    filter: Option<Arc<FrameFilter>>,
    recorder: Option<Arc<FrameRecorder>>,
    subsystems: Vec<(String, Arc<dyn Subsystem>)>,
    broadcaster: StopBroadcaster,
    store: Option<Arc<SafetyStore>>,
    events: EventBus,
    config: FacadeConfig,
    propagator: OnceLock<PropagatorHandle>,
}

impl BusOperations {
    /// Declare the facade. Add its subsystems with
    /// [`ComponentSpec::requires`] / [`ComponentSpec::optional`].
    pub fn spec(name: &str, classification: SafetyClassification, parts: FacadeParts) -> ComponentSpec {
        let owned = name.to_string();
        ComponentSpec::new(name, classification, move |deps| async move {
            let facade = BusOperations::from_dependencies(&owned, &deps, parts)?;
            Ok(Arc::new(facade) as Arc<dyn Component>)
        })
        .tag("bus_operations")
    }

    /// Build the facade from its started dependencies. Every dependency that
    /// is a transport, injector, filter or recorder becomes an owned
    /// subsystem; at least one transport is required.
    pub fn from_dependencies(
        name: &str,
        deps: &Dependencies,
        parts: FacadeParts,
    ) -> Result<Self, GatewayError> {
        let mut subsystems: Vec<(String, Arc<dyn Subsystem>)> = Vec::new();

        let mut transports = BTreeMap::new();
        for (component, transport) in deps.all_of::<TransportComponent>() {
            let bus = transport.logical_bus().to_string();
            if transports.contains_key(&bus) {
                return Err(GatewayError::Config(format!(
                    "logical bus '{bus}' is served by more than one transport"
                )));
            }
            subsystems.push((component, transport.clone() as Arc<dyn Subsystem>));
            transports.insert(bus, transport);
        }
        if transports.is_empty() {
            return Err(GatewayError::Config(format!(
                "'{name}' has no transport among its dependencies"
            )));
        }

        let injector = deps.all_of::<FrameInjector>().into_iter().next();
        let filter = deps.all_of::<FrameFilter>().into_iter().next();
        let recorder = deps.all_of::<FrameRecorder>().into_iter().next();
        if let Some((component, injector)) = &injector {
            subsystems.push((component.clone(), injector.clone() as Arc<dyn Subsystem>));
        }
        if let Some((component, filter)) = &filter {
            subsystems.push((component.clone(), filter.clone() as Arc<dyn Subsystem>));
        }
        if let Some((component, recorder)) = &recorder {
            subsystems.push((component.clone(), recorder.clone() as Arc<dyn Subsystem>));
        }

        let broadcaster = deps.broadcaster();
        let restored = match parts.restored {
            // A first boot has nothing journalled yet; its record takes the
            // next sequence so the re-asserted stop reaches every device.
            Some(record) if record.sequence == UNALLOCATED_SEQUENCE => Some(StopRecord {
                sequence: broadcaster.next_sequence(),
                ..record
            }),
            Some(record) => {
                broadcaster.observe_sequence(record.sequence);
                Some(record)
            }
            None => None,
        };

        info!(
            facade = %name,
            buses = ?transports.keys().collect::<Vec<_>>(),
            subsystems = subsystems.len(),
            interlock_engaged = restored.is_some(),
            "bus operations ready"
        );

        Ok(Self {
            name: name.to_string(),
            interlock: Interlock::from_restored(restored),
            transports,
            injector: injector.map(|(_, i)| i),
            filter: filter.map(|(_, f)| f),
            recorder: recorder.map(|(_, r)| r),
            subsystems,
            broadcaster,
            store: parts.store,
            events: parts.events,
            config: parts.config,
            propagator: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical buses with a transport, sorted.
    pub fn logical_buses(&self) -> Vec<String> {
        self.transports.keys().cloned().collect()
    }

    pub fn recorder(&self) -> Option<Arc<FrameRecorder>> {
        self.recorder.clone()
    }

    pub fn filter(&self) -> Option<Arc<FrameFilter>> {
        self.filter.clone()
    }

    pub fn is_engaged(&self) -> bool {
        self.interlock.is_engaged()
    }

    pub fn interlock_record(&self) -> Option<StopRecord> {
        self.interlock.record()
    }

    /// Attach the running propagator. Health then includes its snapshot and
    /// a reset re-arms it. Returns `false` if one was already attached.
    pub fn attach_propagator(&self, handle: PropagatorHandle) -> bool {
        self.propagator.set(handle).is_ok()
    }

    pub fn propagator(&self) -> Option<PropagatorHandle> {
        self.propagator.get().cloned()
    }

    // ── Writes ──────────────────────────────────────────────────────────────

    /// Put a frame on `logical_bus`.
    pub async fn send(
        &self,
        logical_bus: &str,
        id: u32,
        payload: Vec<u8>,
    ) -> Result<SendOutcome, GatewayError> {
        self.write(FrameDirection::Sent, BusFrame::new(logical_bus, id, payload))
            .await
    }

    /// Inject a diagnostic frame on `logical_bus`, subject to the injector's
    /// rate limit.
    pub async fn inject(
        &self,
        logical_bus: &str,
        id: u32,
        payload: Vec<u8>,
    ) -> Result<SendOutcome, GatewayError> {
        self.interlock.check()?;
        let injector = self
            .injector
            .as_ref()
            .ok_or_else(|| GatewayError::Unavailable("injector".to_string()))?;
        injector.admit(logical_bus)?;
        self.write(FrameDirection::Injected, BusFrame::new(logical_bus, id, payload))
            .await
    }

    async fn write(
        &self,
        direction: FrameDirection,
        frame: BusFrame,
    ) -> Result<SendOutcome, GatewayError> {
        let started = Instant::now();
        self.interlock.check()?;
        frame.validate()?;
        let transport = self
            .transports
            .get(&frame.logical_bus)
            .ok_or_else(|| GatewayError::UnknownBus(frame.logical_bus.clone()))?;
        if let Some(filter) = &self.filter {
            filter.check(&frame)?;
        }

        let written = tokio::time::timeout(self.config.send_timeout, transport.write(&frame)).await;
        let mut outcome = match written {
            Ok(result) => result?,
            Err(_) => {
                return Err(GatewayError::Timeout {
                    operation: format!("write on '{}'", frame.logical_bus),
                    millis: self.config.send_timeout.as_millis() as u64,
                });
            }
        };

        if let Err(blocked) = self.interlock.check() {
            warn!(
                logical_bus = %frame.logical_bus,
                id = frame.id,
                "write completed after an emergency stop; result discarded"
            );
            return Err(blocked);
        }

        let elapsed = started.elapsed();
        if elapsed > self.config.send_budget {
            warn!(
                logical_bus = %frame.logical_bus,
                id = frame.id,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.config.send_budget.as_millis() as u64,
                "write exceeded latency budget"
            );
            outcome.warn(format!(
                "write took {} ms, budget is {} ms",
                elapsed.as_millis(),
                self.config.send_budget.as_millis()
            ));
        }

        if let Some(recorder) = &self.recorder {
            recorder.record(direction, &frame).await;
        }
        debug!(logical_bus = %frame.logical_bus, id = frame.id, ?direction, "frame written");
        self.events.publish_to(
            Topic::Traffic,
            Event::new(SOURCE, EventPayload::Frame { direction, frame }),
        );
        Ok(outcome)
    }

    // ── Emergency stop ──────────────────────────────────────────────────────

    /// Engage the interlock and stop every started component.
    pub async fn emergency_stop(&self, reason: &str) -> StopAck {
        let started = Instant::now();
        let engagement = self
            .interlock
            .engage(|| self.broadcaster.next_sequence(), reason);
        let flag_set = started.elapsed();

        let mut warnings = Vec::new();
        if flag_set > self.config.stop_budget {
            warn!(
                elapsed_us = flag_set.as_micros() as u64,
                budget_ms = self.config.stop_budget.as_millis() as u64,
                "interlock flag-set exceeded latency budget"
            );
            warnings.push(format!("flag set after {} µs", flag_set.as_micros()));
        }

        let record = match engagement {
            Engagement::AlreadyEngaged(record) => {
                info!(sequence = record.sequence, %reason, "emergency stop already engaged");
                return StopAck {
                    record,
                    already_engaged: true,
                    outcomes: BTreeMap::new(),
                    incomplete: false,
                    flag_set_micros: flag_set.as_micros() as u64,
                    warnings,
                };
            }
            Engagement::Engaged(record) => record,
        };
        error!(sequence = record.sequence, %reason, "emergency stop engaged");

        let signal = record.signal();
        let (persisted, report) =
            tokio::join!(self.persist_engaged(&record), self.broadcaster.broadcast(&signal));
        if let Err(e) = persisted {
            error!(sequence = record.sequence, error = %e, "interlock engagement not persisted");
            warnings.push(format!("engagement not persisted: {e}"));
        }

        let incomplete = !report.is_complete();
        if incomplete {
            warn!(
                sequence = record.sequence,
                failures = ?report.failures(),
                "stop was incomplete; manual verification required"
            );
        }
        self.publish_stop(&record, incomplete);

        StopAck {
            record,
            already_engaged: false,
            outcomes: report.outcomes,
            incomplete,
            flag_set_micros: flag_set.as_micros() as u64,
            warnings,
        }
    }

    /// Re-deliver a restored engagement to every started component so that
    /// devices boot halted. No-op when the interlock is clear.
    pub async fn reassert_interlock(&self) -> Option<StopReport> {
        let record = self.interlock.record()?;
        warn!(
            sequence = record.sequence,
            reason = %record.reason,
            "re-asserting restored interlock"
        );
        Some(self.broadcaster.broadcast(&record.signal()).await)
    }

    async fn persist_engaged(&self, record: &StopRecord) -> Result<(), GatewayError> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let record = record.clone();
        tokio::task::spawn_blocking(move || store.record_engaged(&record))
            .await
            .map_err(|e| GatewayError::Persistence(e.to_string()))??;
        Ok(())
    }

    fn publish_stop(&self, record: &StopRecord, incomplete: bool) {
        self.events.publish_to(
            Topic::SystemAlerts,
            Event::new(
                SOURCE,
                EventPayload::EmergencyStop {
                    sequence: record.sequence,
                    reason: record.reason.clone(),
                    incomplete,
                },
            ),
        );
    }

    // ── Reset ───────────────────────────────────────────────────────────────

    /// Clear the interlock after an authorized operator confirmed a physical
    /// inspection. Returns the cleared record, or `None` if it was clear.
    ///
    /// With a propagator attached the reset is refused while a critical
    /// component is still `Failed`, and the propagator is re-armed after the
    /// interlock is cleared.
    ///
    /// An emergency stop that lands while the reset is being journalled wins:
    /// the interlock stays engaged with the new stop's record, that record is
    /// journalled again so it is the newest row, and the reset fails with
    /// `Blocked`.
    pub async fn reset_safe_state(
        &self,
        authorization: &OperatorAuthorization,
        verification: &PhysicalVerification,
    ) -> Result<Option<StopRecord>, GatewayError> {
        if !authorization.authorized {
            warn!(identity = %authorization.identity, "unauthorized interlock reset refused");
            return Err(GatewayError::Unauthorized(authorization.identity.clone()));
        }
        if !verification.confirmed || verification.inspected_by.trim().is_empty() {
            return Err(GatewayError::VerificationRequired(
                "confirm that the coach was physically inspected".to_string(),
            ));
        }
        let Some(record) = self.interlock.begin_reset() else {
            info!(identity = %authorization.identity, "interlock already clear");
            return Ok(None);
        };

        if let Some(handle) = self.propagator.get() {
            let snapshot = handle.snapshot();
            let still_failed = snapshot.components.values().find(|c| {
                c.state == SafetyState::Failed
                    && safety::failure_response(c.classification)
                        == safety::FailureResponse::EmergencyStop
            });
            if let Some(component) = still_failed {
                self.interlock.abort_reset(record.sequence);
                return Err(GatewayError::Blocked {
                    reason: format!("critical component '{}' is still failed", component.name),
                });
            }
        }

        if let Err(e) = self
            .persist_reset(record.sequence, &authorization.identity, &verification.notes)
            .await
        {
            self.interlock.abort_reset(record.sequence);
            return Err(e);
        }
        let cleared = match self.interlock.clear_if(record.sequence) {
            Clearing::Cleared(cleared) => cleared,
            Clearing::AlreadyClear => return Ok(None),
            Clearing::Superseded(current) => {
                warn!(
                    reset = record.sequence,
                    sequence = current.sequence,
                    reason = %current.reason,
                    "emergency stop engaged during reset; interlock stays engaged"
                );
                if let Err(e) = self.persist_engaged(&current).await {
                    error!(sequence = current.sequence, error = %e, "interlock engagement not persisted");
                }
                return Err(GatewayError::Blocked {
                    reason: format!(
                        "emergency stop #{} engaged during the reset: {}",
                        current.sequence, current.reason
                    ),
                });
            }
        };
        info!(
            sequence = record.sequence,
            identity = %authorization.identity,
            inspected_by = %verification.inspected_by,
            "interlock reset"
        );

        let resumed = self.broadcaster.broadcast_resume().await;
        let not_resumed: Vec<&String> = resumed
            .iter()
            .filter(|(_, outcome)| !outcome.is_completed())
            .map(|(name, _)| name)
            .collect();
        if !not_resumed.is_empty() {
            warn!(components = ?not_resumed, "some components did not resume");
        }

        self.events.publish_to(
            Topic::SystemAlerts,
            Event::new(
                SOURCE,
                EventPayload::InterlockReset {
                    sequence: record.sequence,
                    identity: authorization.identity.clone(),
                    notes: verification.notes.clone(),
                },
            ),
        );

        if let Some(handle) = self.propagator.get() {
            if let Err(e) = handle.rearm_system(authorization).await {
                warn!(error = %e, "propagator not re-armed after interlock reset");
            }
        }
        Ok(Some(cleared))
    }

    async fn persist_reset(&self, sequence: u64, identity: &str, notes: &str) -> Result<(), GatewayError> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let identity = identity.to_string();
        let notes = notes.to_string();
        tokio::task::spawn_blocking(move || store.record_reset(sequence, &identity, &notes))
            .await
            .map_err(|e| GatewayError::Persistence(e.to_string()))??;
        Ok(())
    }

    // ── Health ──────────────────────────────────────────────────────────────

    /// Aggregate status. `EmergencyStop` while the interlock is engaged.
    pub async fn health(&self) -> SystemStatus {
        if self.interlock.is_engaged() {
            return SystemStatus::EmergencyStop;
        }
        self.comprehensive_health().await.status
    }

    /// Per-subsystem health plus the aggregate. Subsystems that answer
    /// synchronously and those that have to be awaited are read
    /// concurrently and normalized to one report each; nothing here fails.
    pub async fn comprehensive_health(&self) -> ComprehensiveHealth {
        let timeout = self.config.health_timeout;
        let readings = self.subsystems.iter().map(|(name, subsystem)| {
            let reading = subsystem.read_health();
            async move {
                let report = settle(name, reading, timeout).await;
                (name.clone(), subsystem, report)
            }
        });

        let mut subsystems = BTreeMap::new();
        for (name, subsystem, report) in join_all(readings).await {
            let classification = subsystem.classification();
            let status = safety::aggregate([(classification, state_of(report.level))]);
            subsystems.insert(
                name,
                SubsystemHealth {
                    kind: subsystem.kind(),
                    classification,
                    status,
                    report,
                },
            );
        }

        let safety_snapshot = self.propagator.get().map(|h| (*h.snapshot()).clone());
        let interlock = self.interlock.record();

        let mut status = subsystems
            .values()
            .map(|s| s.status)
            .max()
            .unwrap_or(SystemStatus::Safe);
        if let Some(snapshot) = &safety_snapshot {
            status = status.max(snapshot.status());
        }
        if interlock.is_some() {
            status = SystemStatus::EmergencyStop;
        }

        ComprehensiveHealth {
            status,
            checked_at: Utc::now(),
            interlock,
            subsystems,
            safety: safety_snapshot,
        }
    }
}

#[async_trait]
impl Component for BusOperations {
    async fn health_check(&self) -> HealthReport {
        let detail = json!({
            "buses": self.logical_buses(),
            "interlock": self.interlock.record(),
        });
        match self.interlock.record() {
            Some(record) => HealthReport::degraded(format!("interlock engaged: {}", record.reason))
                .with_detail(detail),
            None => HealthReport::healthy().with_detail(detail),
        }
    }

    /// Stop hook. When the stop started here this is a no-op; when it was
    /// broadcast by someone else the interlock is engaged with the
    /// broadcast's sequence.
    async fn emergency_stop(&self, signal: &StopSignal) -> Result<(), GatewayError> {
        match self.interlock.engage(|| signal.sequence, &signal.reason) {
            Engagement::AlreadyEngaged(_) => Ok(()),
            Engagement::Engaged(record) => {
                error!(sequence = record.sequence, reason = %record.reason, "interlock engaged by broadcast");
                self.publish_stop(&record, false);
                self.persist_engaged(&record).await
            }
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[async_trait]
impl EmergencyResponder for BusOperations {
    async fn emergency_stop(&self, reason: &str) -> StopReport {
        BusOperations::emergency_stop(self, reason).await.report()
    }
}
