//! [`DeviceController`] – a coach device exposed to the registry as a
//! [`Component`].
//!
//! A controller owns the actuator and relay drivers of one device (the
//! slide-outs, the awning, the leveling jacks, ...). On an emergency stop it
//! applies the safe action of its classification and refuses every new
//! command until an authorized reset resumes it. Resuming never moves
//! anything on its own.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use coachnet_kernel::{Component, ComponentSpec};
use coachnet_kernel::safety::{SafeAction, safe_action};
use coachnet_types::{GatewayError, HealthLevel, HealthReport, SafetyClassification, StopSignal};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::actuator::Actuator;
use crate::relay::Relay;

/// Kinds of coach device the gateway controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Lighting,
    Slides,
    Awnings,
    LevelingJacks,
    Brakes,
}

impl DeviceKind {
    /// Default actuator ids for this kind of device.
    pub fn actuator_ids(self) -> &'static [&'static str] {
        match self {
            DeviceKind::Slides => &["slide_front", "slide_rear"],
            DeviceKind::Awnings => &["awning"],
            DeviceKind::LevelingJacks => &["jack_fl", "jack_fr", "jack_rl", "jack_rr"],
            DeviceKind::Lighting | DeviceKind::Brakes => &[],
        }
    }

    /// Default relay ids for this kind of device.
    pub fn relay_ids(self) -> &'static [&'static str] {
        match self {
            DeviceKind::Lighting => &["interior", "exterior"],
            DeviceKind::Slides => &["slide_motor"],
            DeviceKind::Awnings => &["awning_motor"],
            DeviceKind::LevelingJacks => &["jack_pump"],
            DeviceKind::Brakes => &["brake_release"],
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceKind::Lighting => "lighting",
            DeviceKind::Slides => "slides",
            DeviceKind::Awnings => "awnings",
            DeviceKind::LevelingJacks => "leveling_jacks",
            DeviceKind::Brakes => "brakes",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct Drivers {
    actuators: BTreeMap<String, Box<dyn Actuator>>,
    relays: BTreeMap<String, Box<dyn Relay>>,
}

pub struct DeviceController {
    name: String,
    kind: DeviceKind,
    classification: SafetyClassification,
    drivers: Mutex<Drivers>,
    halted: AtomicBool,
    last_stop: AtomicU64,
    stops_handled: AtomicU64,
    fault: Mutex<Option<HealthReport>>,
}

impl DeviceController {
    pub fn new(
        name: impl Into<String>,
        kind: DeviceKind,
        classification: SafetyClassification,
        actuators: Vec<Box<dyn Actuator>>,
        relays: Vec<Box<dyn Relay>>,
    ) -> Self {
        let drivers = Drivers {
            actuators: actuators.into_iter().map(|a| (a.id().to_string(), a)).collect(),
            relays: relays.into_iter().map(|r| (r.id().to_string(), r)).collect(),
        };
        Self {
            name: name.into(),
            kind,
            classification,
            drivers: Mutex::new(drivers),
            halted: AtomicBool::new(false),
            last_stop: AtomicU64::new(0),
            stops_handled: AtomicU64::new(0),
            fault: Mutex::new(None),
        }
    }

    /// Registry declaration for an already-built controller, tagged
    /// `device`.
    pub fn spec(device: Arc<DeviceController>) -> ComponentSpec {
        let name = device.name.clone();
        let classification = device.classification;
        ComponentSpec::new(name, classification, move |_deps| async move {
            info!(device = %device.name, kind = ?device.kind, "device ready");
            Ok(device as Arc<dyn Component>)
        })
        .tag("device")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn classification(&self) -> SafetyClassification {
        self.classification
    }

    /// `true` between an emergency stop and the next resume.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Number of distinct stop events handled.
    pub fn stops_handled(&self) -> u64 {
        self.stops_handled.load(Ordering::Acquire)
    }

    fn drivers(&self) -> MutexGuard<'_, Drivers> {
        self.drivers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refuse_if_halted(&self, what: &str) -> Result<(), GatewayError> {
        if self.is_halted() {
            warn!(device = %self.name, %what, "command refused while halted");
            return Err(GatewayError::Blocked {
                reason: format!("'{}' is holding its safe state", self.name),
            });
        }
        Ok(())
    }

    /// Command actuator `actuator` to `target`.
    pub fn move_to(&self, actuator: &str, target: f32) -> Result<(), GatewayError> {
        self.refuse_if_halted("move")?;
        let mut drivers = self.drivers();
        let driver = drivers.actuators.get_mut(actuator).ok_or_else(|| GatewayError::DeviceFault {
            device: self.name.clone(),
            details: format!("actuator '{actuator}' is not fitted"),
        })?;
        driver.set_position(target)
    }

    /// Switch relay `relay`.
    pub fn set_relay(&self, relay: &str, on: bool) -> Result<(), GatewayError> {
        self.refuse_if_halted("switch")?;
        let mut drivers = self.drivers();
        let driver = drivers.relays.get_mut(relay).ok_or_else(|| GatewayError::DeviceFault {
            device: self.name.clone(),
            details: format!("relay '{relay}' is not fitted"),
        })?;
        driver.set_state(on)
    }

    pub fn position(&self, actuator: &str) -> Option<f32> {
        self.drivers().actuators.get(actuator).map(|a| a.position())
    }

    pub fn relay_state(&self, relay: &str) -> Option<bool> {
        self.drivers().relays.get(relay).map(|r| r.state())
    }

    /// Override the health report with `report` (simulation and tests).
    /// `None` clears the fault.
    pub fn inject_fault(&self, report: Option<HealthReport>) {
        if let Some(report) = &report {
            warn!(device = %self.name, level = ?report.level, "fault injected");
        }
        *self.fault.lock().unwrap_or_else(PoisonError::into_inner) = report;
    }

    /// Drive the hardware into `action`. Every driver is commanded even if
    /// an earlier one fails; the first failure is returned.
    fn apply(&self, action: SafeAction) -> Result<(), GatewayError> {
        let mut drivers = self.drivers();
        let mut first_error = None;

        if matches!(action, SafeAction::HoldPosition | SafeAction::DeEnergize) {
            for actuator in drivers.actuators.values_mut() {
                let held = actuator.position();
                if let Err(e) = actuator.set_position(held) {
                    error!(device = %self.name, actuator = %actuator.id(), error = %e, "hold failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if action == SafeAction::DeEnergize {
            for relay in drivers.relays.values_mut() {
                if let Err(e) = relay.set_state(false) {
                    error!(device = %self.name, relay = %relay.id(), error = %e, "de-energise failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(GatewayError::DeviceFault {
                device: self.name.clone(),
                details: e.to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Component for DeviceController {
    async fn health_check(&self) -> HealthReport {
        if let Some(fault) = self.fault.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return fault;
        }
        let drivers = self.drivers();
        let positions: BTreeMap<&str, f32> = drivers
            .actuators
            .iter()
            .map(|(id, a)| (id.as_str(), a.position()))
            .collect();
        let relays: BTreeMap<&str, bool> = drivers
            .relays
            .iter()
            .map(|(id, r)| (id.as_str(), r.state()))
            .collect();
        HealthReport::healthy().with_detail(json!({
            "kind": self.kind,
            "halted": self.is_halted(),
            "positions": positions,
            "relays": relays,
        }))
    }

    async fn emergency_stop(&self, signal: &StopSignal) -> Result<(), GatewayError> {
        self.halted.store(true, Ordering::Release);
        let previous = self.last_stop.fetch_max(signal.sequence, Ordering::AcqRel);
        if previous >= signal.sequence {
            debug!(device = %self.name, sequence = signal.sequence, "duplicate stop ignored");
            return Ok(());
        }
        self.stops_handled.fetch_add(1, Ordering::AcqRel);

        let action = safe_action(self.classification, HealthLevel::Failed);
        info!(
            device = %self.name,
            kind = %self.kind,
            sequence = signal.sequence,
            ?action,
            "applying safe action"
        );
        self.apply(action)
    }

    async fn resume(&self) -> Result<(), GatewayError> {
        if self.halted.swap(false, Ordering::AcqRel) {
            info!(device = %self.name, "commands accepted again");
        }
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
