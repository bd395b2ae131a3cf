//! Simulated drivers for running the gateway without a coach.
//!
//! [`SimDevices`] assembles a [`DeviceController`] from stub drivers that
//! record commands and return them as state. This lets the full gateway run
//! in headless tests and on a bench.
//!
//! # Example
//!
//! ```rust
//! use coachnet_hal::device::DeviceKind;
//! use coachnet_hal::sim::SimDevices;
//! use coachnet_types::SafetyClassification;
//!
//! let jacks = SimDevices::for_kind(DeviceKind::LevelingJacks).build(
//!     "leveling_jacks",
//!     DeviceKind::LevelingJacks,
//!     SafetyClassification::PositionCritical,
//! );
//! jacks.move_to("jack_fl", 0.3).unwrap();
//! ```

use coachnet_types::{GatewayError, SafetyClassification};

use crate::actuator::Actuator;
use crate::device::{DeviceController, DeviceKind};
use crate::relay::Relay;

// ────────────────────────────────────────────────────────────────────────────
// Stub actuator
// ────────────────────────────────────────────────────────────────────────────

/// Simulated actuator that records the commanded position. Rejects targets
/// outside `0.0..=1.0`.
pub struct SimActuator {
    id: String,
    position: f32,
}

impl SimActuator {
    pub fn new(id: impl Into<String>) -> Box<Self> {
        Box::new(Self {
            id: id.into(),
            position: 0.0,
        })
    }
}

impl Actuator for SimActuator {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_position(&mut self, target: f32) -> Result<(), GatewayError> {
        if !(0.0..=1.0).contains(&target) {
            return Err(GatewayError::DeviceFault {
                device: self.id.clone(),
                details: format!("target {target} outside travel"),
            });
        }
        self.position = target;
        Ok(())
    }

    fn position(&self) -> f32 {
        self.position
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Stub relay
// ────────────────────────────────────────────────────────────────────────────

/// Simulated relay. A jammed relay rejects every command.
pub struct SimRelay {
    id: String,
    state: bool,
    jammed: bool,
}

impl SimRelay {
    pub fn new(id: impl Into<String>) -> Box<Self> {
        Box::new(Self {
            id: id.into(),
            state: false,
            jammed: false,
        })
    }

    pub fn jammed(id: impl Into<String>) -> Box<Self> {
        Box::new(Self {
            id: id.into(),
            state: true,
            jammed: true,
        })
    }
}

impl Relay for SimRelay {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_state(&mut self, active: bool) -> Result<(), GatewayError> {
        if self.jammed {
            return Err(GatewayError::DeviceFault {
                device: self.id.clone(),
                details: "contacts welded".to_string(),
            });
        }
        self.state = active;
        Ok(())
    }

    fn state(&self) -> bool {
        self.state
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Builder
// ────────────────────────────────────────────────────────────────────────────

/// Builder for a [`DeviceController`] backed by simulated drivers.
#[derive(Default)]
pub struct SimDevices {
    actuators: Vec<Box<dyn Actuator>>,
    relays: Vec<Box<dyn Relay>>,
}

impl SimDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with the default layout of `kind`.
    pub fn for_kind(kind: DeviceKind) -> Self {
        let builder = kind
            .actuator_ids()
            .iter()
            .fold(Self::new(), |builder, id| builder.with_actuator(*id));
        kind.relay_ids()
            .iter()
            .fold(builder, |builder, id| builder.with_relay(*id))
    }

    pub fn with_actuator(self, id: impl Into<String>) -> Self {
        self.with_actuator_driver(SimActuator::new(id))
    }

    pub fn with_relay(self, id: impl Into<String>) -> Self {
        self.with_relay_driver(SimRelay::new(id))
    }

    /// Add a custom actuator driver.
    pub fn with_actuator_driver(mut self, actuator: Box<dyn Actuator>) -> Self {
        self.actuators.push(actuator);
        self
    }

    /// Add a custom relay driver.
    pub fn with_relay_driver(mut self, relay: Box<dyn Relay>) -> Self {
        self.relays.push(relay);
        self
    }

    pub fn build(
        self,
        name: impl Into<String>,
        kind: DeviceKind,
        classification: SafetyClassification,
    ) -> DeviceController {
        DeviceController::new(name, kind, classification, self.actuators, self.relays)
    }
}
