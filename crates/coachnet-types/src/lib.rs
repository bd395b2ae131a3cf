use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Largest frame identifier accepted on any logical bus (29-bit extended id).
pub const MAX_FRAME_ID: u32 = 0x1FFF_FFFF;

/// Largest payload accepted on any logical bus.
pub const MAX_PAYLOAD_LEN: usize = 64;

/// Static severity tier of a component. Fixed at registration time and
/// governs how the system responds when the component fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyClassification {
    /// Failure forces a system-wide emergency stop.
    Critical,
    /// Failure degrades every dependent but does not stop the system.
    SafetyRelated,
    /// Moves something physical; its safe action is always "hold position".
    PositionCritical,
    /// Ordinary functionality; failures are logged.
    Operational,
    /// Diagnostics and service tooling; failures are logged.
    Maintenance,
}

impl fmt::Display for SafetyClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafetyClassification::Critical => "critical",
            SafetyClassification::SafetyRelated => "safety_related",
            SafetyClassification::PositionCritical => "position_critical",
            SafetyClassification::Operational => "operational",
            SafetyClassification::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

/// Runtime safety state of a started component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyState {
    Stopped,
    Initializing,
    Healthy,
    Degraded,
    Failed,
    SafeShutdown,
    Maintenance,
}

impl SafetyState {
    /// `true` for `Degraded` and `Failed`.
    pub fn is_impaired(self) -> bool {
        matches!(self, SafetyState::Degraded | SafetyState::Failed)
    }

    /// States the health propagator never moves a component out of; only an
    /// operator can.
    pub fn is_operator_held(self) -> bool {
        matches!(
            self,
            SafetyState::Stopped | SafetyState::SafeShutdown | SafetyState::Maintenance
        )
    }
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafetyState::Stopped => "stopped",
            SafetyState::Initializing => "initializing",
            SafetyState::Healthy => "healthy",
            SafetyState::Degraded => "degraded",
            SafetyState::Failed => "failed",
            SafetyState::SafeShutdown => "safe_shutdown",
            SafetyState::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

/// Severity a component reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    /// A non-fatal problem.
    Degraded,
    /// A fatal problem.
    Failed,
}

/// Point-in-time health snapshot returned by a component health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub level: HealthLevel,
    /// Free-form diagnostic payload.
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            level: HealthLevel::Healthy,
            detail: serde_json::Value::Null,
        }
    }

    pub fn degraded(detail: impl Into<String>) -> Self {
        Self {
            level: HealthLevel::Degraded,
            detail: serde_json::Value::String(detail.into()),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            level: HealthLevel::Failed,
            detail: serde_json::Value::String(detail.into()),
        }
    }

    /// Replace the diagnostic payload (builder-style).
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Whether a dependency gates startup and failure escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Required,
    Optional,
}

/// A dependency edge from the declaring component to `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub kind: DependencyKind,
}

impl Dependency {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DependencyKind::Required,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DependencyKind::Optional,
        }
    }

    pub fn is_required(&self) -> bool {
        self.kind == DependencyKind::Required
    }
}

/// Aggregated status reported to monitoring and the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    Safe,
    Degraded,
    Unsafe,
    EmergencyStop,
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SystemStatus::Safe => "safe",
            SystemStatus::Degraded => "degraded",
            SystemStatus::Unsafe => "unsafe",
            SystemStatus::EmergencyStop => "emergency_stop",
        };
        f.write_str(s)
    }
}

/// A raw frame addressed to a logical bus. The payload is opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusFrame {
    /// Logical bus identifier, e.g. `"house"` or `"chassis"`.
    pub logical_bus: String,
    pub id: u32,
    pub payload: Vec<u8>,
}

impl BusFrame {
    pub fn new(logical_bus: impl Into<String>, id: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            logical_bus: logical_bus.into(),
            id,
            payload: payload.into(),
        }
    }

    /// Check identifier width and payload length.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.id > MAX_FRAME_ID {
            return Err(GatewayError::InvalidFrame(format!(
                "frame id {:#x} exceeds {MAX_FRAME_ID:#x}",
                self.id
            )));
        }
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(GatewayError::InvalidFrame(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD_LEN}",
                self.payload.len()
            )));
        }
        Ok(())
    }
}

/// Successful bus write, possibly with non-fatal warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl SendOutcome {
    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}

/// Signal handed to every stop hook during an emergency stop.
///
/// `sequence` identifies one emergency-stop event; a hook that sees the same
/// sequence twice must treat the second delivery as a duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopSignal {
    pub sequence: u64,
    pub reason: String,
}

/// What was recorded when the interlock was engaged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRecord {
    pub sequence: u64,
    pub reason: String,
    pub engaged_at: DateTime<Utc>,
}

impl StopRecord {
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            sequence: self.sequence,
            reason: self.reason.clone(),
        }
    }
}

/// Result of an external authorization check. The core never decides how
/// operators authenticate; it only consumes this verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorAuthorization {
    pub authorized: bool,
    /// Identity written to the audit trail.
    pub identity: String,
}

impl OperatorAuthorization {
    pub fn granted(identity: impl Into<String>) -> Self {
        Self {
            authorized: true,
            identity: identity.into(),
        }
    }

    pub fn denied(identity: impl Into<String>) -> Self {
        Self {
            authorized: false,
            identity: identity.into(),
        }
    }
}

/// Operator statement that the physical state has been inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalVerification {
    pub inspected_by: String,
    pub confirmed: bool,
    #[serde(default)]
    pub notes: String,
}

/// Direction of a frame observed on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameDirection {
    Sent,
    Injected,
}

/// Unified event wrapper for the in-process event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"coachnet-kernel::propagator"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    SafetyTransition {
        component: String,
        from: SafetyState,
        to: SafetyState,
        detail: serde_json::Value,
    },
    OperatorOverride {
        component: String,
        from: SafetyState,
        to: SafetyState,
        identity: String,
    },
    EmergencyStop {
        sequence: u64,
        reason: String,
        incomplete: bool,
    },
    InterlockReset {
        sequence: u64,
        identity: String,
        notes: String,
    },
    SafeShutdown {
        reason: String,
    },
    Frame {
        direction: FrameDirection,
        frame: BusFrame,
    },
}

/// Error type spanning registry validation, runtime safety failures, bus
/// writes, and persistence.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GatewayError {
    #[error("component '{0}' is already registered")]
    DuplicateName(String),

    #[error("component '{component}' requires unknown component '{dependency}'")]
    UnknownDependency { component: String, dependency: String },

    #[error("dependency cycle detected among {0:?}")]
    CycleDetected(Vec<String>),

    #[error("component '{0}' not found")]
    NotFound(String),

    #[error("'{0}' is unavailable")]
    Unavailable(String),

    #[error("component '{component}' failed to start: {details}")]
    ComponentStartFailed { component: String, details: String },

    #[error("health check of '{0}' timed out")]
    HealthCheckTimeout(String),

    #[error("emergency stop of '{subsystem}' failed: {details}")]
    EmergencyStopSubsystemFailure { subsystem: String, details: String },

    #[error("blocked: system in emergency stop ({reason})")]
    Blocked { reason: String },

    #[error("operator '{0}' is not authorized")]
    Unauthorized(String),

    #[error("physical verification required: {0}")]
    VerificationRequired(String),

    #[error("invalid state transition for '{component}': {from} -> {to}")]
    InvalidTransition {
        component: String,
        from: SafetyState,
        to: SafetyState,
    },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unknown logical bus '{0}'")]
    UnknownBus(String),

    #[error("frame {id:#x} on '{logical_bus}' rejected by filter")]
    Filtered { logical_bus: String, id: u32 },

    #[error("injection rate limit exceeded on '{0}'")]
    RateLimited(String),

    #[error("transport fault on '{logical_bus}': {details}")]
    Transport { logical_bus: String, details: String },

    #[error("device fault on '{device}': {details}")]
    DeviceFault { device: String, details: String },

    #[error("{operation} timed out after {millis} ms")]
    Timeout { operation: String, millis: u64 },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),
}
