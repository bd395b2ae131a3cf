//! Generic `Actuator` trait for slide-outs, awnings, leveling jacks and any
//! other position-controlled coach hardware.
//!
//! Drivers implement this trait and are owned by a
//! [`DeviceController`][crate::device::DeviceController]. The rest of the
//! gateway only ever talks to the controller, so drivers can be swapped
//! without touching safety logic.

use coachnet_types::GatewayError;

/// A position-controlled actuator.
///
/// Positions are normalised travel: `0.0` fully retracted, `1.0` fully
/// extended.
pub trait Actuator: Send + Sync {
    /// Stable identifier, e.g. `"slide_front"` or `"jack_fl"`.
    fn id(&self) -> &str;

    /// Command the actuator to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DeviceFault`] if the command cannot be
    /// applied.
    fn set_position(&mut self, target: f32) -> Result<(), GatewayError>;

    /// Most recently known position.
    fn position(&self) -> f32;
}
