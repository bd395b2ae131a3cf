//! `coachnet-hal` – Hardware Abstraction Layer
//!
//! Device controllers for the coach's moving and switched hardware, built
//! from two driver traits:
//!
//! - [`actuator::Actuator`] – position-controlled hardware (slide-outs,
//!   awnings, leveling jacks).
//! - [`relay::Relay`] – on/off hardware (lighting circuits, pump contactors,
//!   the brake-release solenoid).
//!
//! [`device::DeviceController`] wraps a set of drivers as a registry
//! component that applies its classification's safe action on emergency
//! stop. [`sim`] provides stub drivers for benches and CI.

pub mod actuator;
pub mod device;
pub mod relay;
pub mod sim;

pub use actuator::Actuator;
pub use device::{DeviceController, DeviceKind};
pub use relay::Relay;
pub use sim::{SimActuator, SimDevices, SimRelay};
