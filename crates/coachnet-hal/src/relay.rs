//! Generic `Relay` trait for discrete on/off coach hardware (lighting
//! circuits, pump and motor contactors, the brake-release solenoid).

use coachnet_types::GatewayError;

/// A discrete on/off device.
///
/// Brake releases are wired fail-safe: de-energising the relay engages the
/// brakes.
pub trait Relay: Send + Sync {
    /// Stable identifier, e.g. `"interior"` or `"brake_release"`.
    fn id(&self) -> &str;

    /// Drive the relay to `active` (`true` = energised).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DeviceFault`] if the command cannot be
    /// applied.
    fn set_state(&mut self, active: bool) -> Result<(), GatewayError>;

    /// Current state (`true` = energised).
    fn state(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockRelay {
        id: String,
        state: bool,
    }

    impl Relay for MockRelay {
        fn id(&self) -> &str {
            &self.id
        }

        fn set_state(&mut self, active: bool) -> Result<(), GatewayError> {
            self.state = active;
            Ok(())
        }

        fn state(&self) -> bool {
            self.state
        }
    }

    #[test]
    fn mock_relay_toggle() {
        let mut relay = MockRelay {
            id: "interior".into(),
            state: false,
        };
        assert_eq!(relay.id(), "interior");
        relay.set_state(true).unwrap();
        assert!(relay.state());
        relay.set_state(false).unwrap();
        assert!(!relay.state());
    }
}
