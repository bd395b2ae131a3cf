//! Transports: the concrete write path of one logical bus.
//!
//! The facade never writes to hardware itself. It hands a validated frame to
//! the [`Transport`] that owns the addressed logical bus. Transports report
//! health synchronously.
//!
//! - [`Transport`] – the trait every transport implements.
//! - [`SimTransport`] – an in-memory transport for benches and tests; records
//!   frames and can simulate latency and faults.
//! - [`TransportComponent`] – wraps a transport as a registry component.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use coachnet_kernel::{Component, ComponentSpec};
use coachnet_types::{
    BusFrame, GatewayError, HealthReport, SafetyClassification, SendOutcome, StopSignal,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::subsystem::{HealthReading, StopLatch, Subsystem};

/// Largest identifier of a standard (11-bit) frame.
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Owns the physical write path of one logical bus.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Logical bus this transport serves, e.g. `"house"`.
    fn logical_bus(&self) -> &str;

    /// Put `frame` on the wire. The frame has already been validated.
    async fn write(&self, frame: &BusFrame) -> Result<SendOutcome, GatewayError>;

    fn health(&self) -> HealthReport;
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated transport
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SimState {
    written: Vec<BusFrame>,
    fault: Option<String>,
}

/// In-memory transport.
///
/// # Example
///
/// ```
/// use coachnet_gateway::transport::{SimTransport, Transport};
///
/// let house = SimTransport::new("house").with_extended_ids(false);
/// assert_eq!(house.logical_bus(), "house");
/// ```
pub struct SimTransport {
    logical_bus: String,
    latency: Duration,
    extended_ids: bool,
    state: Mutex<SimState>,
}

impl SimTransport {
    pub fn new(logical_bus: impl Into<String>) -> Self {
        Self {
            logical_bus: logical_bus.into(),
            latency: Duration::ZERO,
            extended_ids: true,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Delay every write by `latency` (builder-style).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Whether the simulated bus is configured for 29-bit identifiers. When
    /// it is not, extended frames are still written but carry a warning.
    pub fn with_extended_ids(mut self, extended_ids: bool) -> Self {
        self.extended_ids = extended_ids;
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make subsequent writes fail with `details`; `None` clears the fault.
    pub fn set_fault(&self, details: Option<&str>) {
        self.state().fault = details.map(str::to_string);
    }

    /// Every frame written so far.
    pub fn written(&self) -> Vec<BusFrame> {
        self.state().written.clone()
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn logical_bus(&self) -> &str {
        &self.logical_bus
    }

    async fn write(&self, frame: &BusFrame) -> Result<SendOutcome, GatewayError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.state();
        if let Some(details) = &state.fault {
            return Err(GatewayError::Transport {
                logical_bus: self.logical_bus.clone(),
                details: details.clone(),
            });
        }
        let mut outcome = SendOutcome::default();
        if !self.extended_ids && frame.id > MAX_STANDARD_ID {
            outcome.warn(format!(
                "extended identifier {:#x} on a standard-frame bus",
                frame.id
            ));
        }
        state.written.push(frame.clone());
        Ok(outcome)
    }

    fn health(&self) -> HealthReport {
        let state = self.state();
        match &state.fault {
            Some(details) => HealthReport::failed(details.clone()),
            None => HealthReport::healthy().with_detail(json!({
                "logical_bus": self.logical_bus,
                "frames_written": state.written.len(),
            })),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Registry component
// ────────────────────────────────────────────────────────────────────────────

/// A [`Transport`] managed by the registry.
///
/// After an emergency stop the component refuses writes on its own, in
/// addition to the facade's interlock, until it is resumed.
pub struct TransportComponent {
    transport: Arc<dyn Transport>,
    classification: SafetyClassification,
    latch: StopLatch,
}

impl TransportComponent {
    pub fn new(transport: Arc<dyn Transport>, classification: SafetyClassification) -> Self {
        Self {
            transport,
            classification,
            latch: StopLatch::new(),
        }
    }

    /// Declare a transport component named `name`.
    pub fn spec(
        name: &str,
        classification: SafetyClassification,
        transport: Arc<dyn Transport>,
    ) -> ComponentSpec {
        ComponentSpec::new(name, classification, move |_deps| async move {
            info!(logical_bus = %transport.logical_bus(), "transport ready");
            Ok(Arc::new(TransportComponent::new(transport, classification)) as Arc<dyn Component>)
        })
        .tag("transport")
    }

    pub fn logical_bus(&self) -> &str {
        self.transport.logical_bus()
    }

    pub fn is_halted(&self) -> bool {
        self.latch.is_halted()
    }

    pub async fn write(&self, frame: &BusFrame) -> Result<SendOutcome, GatewayError> {
        if self.latch.is_halted() {
            return Err(GatewayError::Blocked {
                reason: format!("transport '{}' halted", self.logical_bus()),
            });
        }
        self.transport.write(frame).await
    }
}

impl Subsystem for TransportComponent {
    fn kind(&self) -> &'static str {
        "transport"
    }

    fn classification(&self) -> SafetyClassification {
        self.classification
    }

    fn read_health(&self) -> HealthReading {
        HealthReading::Ready(self.transport.health())
    }
}

#[async_trait]
impl Component for TransportComponent {
    async fn health_check(&self) -> HealthReport {
        self.transport.health()
    }

    async fn emergency_stop(&self, signal: &StopSignal) -> Result<(), GatewayError> {
        if self.latch.latch(signal) {
            warn!(logical_bus = %self.logical_bus(), sequence = signal.sequence, "transport halted");
        } else {
            debug!(logical_bus = %self.logical_bus(), sequence = signal.sequence, "duplicate stop ignored");
        }
        Ok(())
    }

    async fn resume(&self) -> Result<(), GatewayError> {
        if self.latch.release() {
            info!(logical_bus = %self.logical_bus(), "transport resumed");
        }
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
