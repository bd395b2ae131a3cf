//! Safety classification model.
//!
//! Pure rules with no I/O: how a component's own health and the state of its
//! required dependencies map onto a [`SafetyState`], how each
//! [`SafetyClassification`] responds to failure, and which transitions an
//! operator may request. The health propagator is the only caller that
//! applies them to live state.
//!
//! | Classification | Failure response | Safe action |
//! |---|---|---|
//! | `critical` | [`FailureResponse::EmergencyStop`] | de-energise |
//! | `safety_related` | [`FailureResponse::DegradeDependents`] | de-energise |
//! | `position_critical` | [`FailureResponse::DegradeDependents`] | hold position, always |
//! | `operational` | [`FailureResponse::LogOnly`] | de-energise on failure, resume default when degraded |
//! | `maintenance` | [`FailureResponse::LogOnly`] | de-energise on failure, resume default when degraded |

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use coachnet_types::{
    GatewayError, HealthLevel, HealthReport, SafetyClassification, SafetyState, SystemStatus,
};
use serde::Serialize;

// ────────────────────────────────────────────────────────────────────────────
// Classification policy
// ────────────────────────────────────────────────────────────────────────────

/// What the system does when a component of a given classification fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureResponse {
    EmergencyStop,
    DegradeDependents,
    LogOnly,
}

/// Physical action a device takes when it is driven to its safe state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeAction {
    /// Keep the last commanded position and refuse new motion.
    HoldPosition,
    /// Switch outputs off.
    DeEnergize,
    /// Return to the default operating behaviour.
    ResumeDefault,
}

pub fn failure_response(classification: SafetyClassification) -> FailureResponse {
    match classification {
        SafetyClassification::Critical => FailureResponse::EmergencyStop,
        SafetyClassification::SafetyRelated | SafetyClassification::PositionCritical => {
            FailureResponse::DegradeDependents
        }
        SafetyClassification::Operational | SafetyClassification::Maintenance => {
            FailureResponse::LogOnly
        }
    }
}

/// Safe action for a component of `classification` at health `level`.
///
/// `position_critical` never resumes a default: whatever the severity, it
/// holds position.
pub fn safe_action(classification: SafetyClassification, level: HealthLevel) -> SafeAction {
    match (classification, level) {
        (SafetyClassification::PositionCritical, _) => SafeAction::HoldPosition,
        (SafetyClassification::Critical | SafetyClassification::SafetyRelated, _) => {
            SafeAction::DeEnergize
        }
        (_, HealthLevel::Failed) => SafeAction::DeEnergize,
        (_, _) => SafeAction::ResumeDefault,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Transition rules
// ────────────────────────────────────────────────────────────────────────────

pub(crate) fn severity(state: SafetyState) -> u8 {
    match state {
        SafetyState::Failed => 2,
        SafetyState::Degraded => 1,
        _ => 0,
    }
}

fn from_level(level: HealthLevel) -> SafetyState {
    match level {
        HealthLevel::Healthy => SafetyState::Healthy,
        HealthLevel::Degraded => SafetyState::Degraded,
        HealthLevel::Failed => SafetyState::Failed,
    }
}

/// State a dependent inherits through a required edge from a dependency of
/// `classification` currently in `state`. `None` means no effect.
pub fn inherited_state(
    classification: SafetyClassification,
    state: SafetyState,
) -> Option<SafetyState> {
    match state {
        SafetyState::Failed if failure_response(classification) == FailureResponse::EmergencyStop => {
            Some(SafetyState::Failed)
        }
        SafetyState::Failed
        | SafetyState::Degraded
        | SafetyState::SafeShutdown
        | SafetyState::Stopped
        | SafetyState::Maintenance => Some(SafetyState::Degraded),
        SafetyState::Healthy | SafetyState::Initializing => None,
    }
}

/// The next state of a component.
///
/// Operator-held states are never left here. `Failed` is terminal for the
/// propagator; only an operator re-arm moves a component out of it.
/// Otherwise the result is the worse of the component's own health and
/// whatever it inherits from its required dependencies.
pub fn next_state(
    current: SafetyState,
    own: HealthLevel,
    inherited: Option<SafetyState>,
) -> SafetyState {
    if current.is_operator_held() || current == SafetyState::Failed {
        return current;
    }
    let own = from_level(own);
    match inherited {
        Some(inherited) if severity(inherited) > severity(own) => inherited,
        _ => own,
    }
}

/// Check an operator-requested transition.
///
/// `SafeShutdown` and `Maintenance` can be entered from anywhere. A component
/// is re-armed to `Initializing` only from `Failed`, `SafeShutdown`,
/// `Maintenance` or `Stopped`; the next propagation cycle then decides its
/// real state.
pub fn check_operator_transition(
    component: &str,
    from: SafetyState,
    to: SafetyState,
) -> Result<(), GatewayError> {
    let allowed = match to {
        SafetyState::SafeShutdown | SafetyState::Maintenance => true,
        SafetyState::Initializing => matches!(
            from,
            SafetyState::Failed
                | SafetyState::SafeShutdown
                | SafetyState::Maintenance
                | SafetyState::Stopped
        ),
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(GatewayError::InvalidTransition {
            component: component.to_string(),
            from,
            to,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Snapshot types
// ────────────────────────────────────────────────────────────────────────────

/// Safety bookkeeping for one component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentSafety {
    pub name: String,
    pub classification: SafetyClassification,
    pub state: SafetyState,
    pub consecutive_failure_count: u32,
    pub last_report: Option<HealthReport>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_changed: DateTime<Utc>,
}

impl ComponentSafety {
    pub fn new(name: impl Into<String>, classification: SafetyClassification, state: SafetyState) -> Self {
        Self {
            name: name.into(),
            classification,
            state,
            consecutive_failure_count: 0,
            last_report: None,
            last_checked: None,
            last_changed: Utc::now(),
        }
    }
}

/// System-wide propagation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    Normal,
    /// Entered after a critical failure, a propagation fault or a missed
    /// watchdog deadline. New motion and bus writes are blocked.
    SafeShutdown,
}

/// Point-in-time view of every component's safety state.
#[derive(Debug, Clone, Serialize)]
pub struct SafetySnapshot {
    pub cycle: u64,
    pub taken_at: DateTime<Utc>,
    pub mode: SystemMode,
    pub components: BTreeMap<String, ComponentSafety>,
}

impl SafetySnapshot {
    pub fn new(components: BTreeMap<String, ComponentSafety>) -> Self {
        Self {
            cycle: 0,
            taken_at: Utc::now(),
            mode: SystemMode::Normal,
            components,
        }
    }

    pub fn get(&self, name: &str) -> Option<&ComponentSafety> {
        self.components.get(name)
    }

    pub fn state(&self, name: &str) -> Option<SafetyState> {
        self.components.get(name).map(|c| c.state)
    }

    /// Aggregate status ignoring the bus interlock.
    pub fn status(&self) -> SystemStatus {
        if self.mode == SystemMode::SafeShutdown {
            return SystemStatus::EmergencyStop;
        }
        aggregate(self.components.values().map(|c| (c.classification, c.state)))
    }
}

/// Fold component states into a [`SystemStatus`].
///
/// A failed component whose failure response goes beyond logging makes the
/// system `Unsafe`; any other impaired or held component makes it
/// `Degraded`. Only an engaged interlock or safe-shutdown mode yields
/// `EmergencyStop`.
pub fn aggregate(
    states: impl IntoIterator<Item = (SafetyClassification, SafetyState)>,
) -> SystemStatus {
    states
        .into_iter()
        .map(|(classification, state)| match state {
            SafetyState::Failed if failure_response(classification) != FailureResponse::LogOnly => {
                SystemStatus::Unsafe
            }
            SafetyState::Failed
            | SafetyState::Degraded
            | SafetyState::SafeShutdown
            | SafetyState::Maintenance
            | SafetyState::Stopped => SystemStatus::Degraded,
            SafetyState::Healthy | SafetyState::Initializing => SystemStatus::Safe,
        })
        .max()
        .unwrap_or(SystemStatus::Safe)
}
