//! `coachnet-gateway` – Bus Operations
//!
//! The facade every caller goes through to reach the coach network, and the
//! bus subsystems it owns.
//!
//! # Modules
//!
//! - [`facade`] – [`BusOperations`][facade::BusOperations]: send, inject,
//!   emergency stop, aggregated health and the authorized safe-state reset.
//! - [`interlock`] – [`Interlock`][interlock::Interlock]: the atomic
//!   emergency-stop flag and its restart policy.
//! - [`transport`] – the [`Transport`][transport::Transport] trait, the
//!   simulated transport and its registry component.
//! - [`injector`] – rate-limited diagnostic injection.
//! - [`filter`] – allow/deny rules on frame identifiers.
//! - [`recorder`] – bounded capture of sent and injected frames.
//! - [`subsystem`] – health readings that may or may not need awaiting, and
//!   stop-sequence bookkeeping shared by every subsystem.

pub mod facade;
pub mod filter;
pub mod injector;
pub mod interlock;
pub mod recorder;
pub mod subsystem;
pub mod transport;

pub use facade::{BusOperations, ComprehensiveHealth, FacadeConfig, FacadeParts, StopAck, SubsystemHealth};
pub use filter::{FilterAction, FilterRule, FrameFilter};
pub use injector::FrameInjector;
pub use interlock::{Clearing, Engagement, Interlock, UNALLOCATED_SEQUENCE};
pub use recorder::{FrameRecorder, RecordedFrame};
pub use subsystem::{HealthReading, StopLatch, Subsystem};
pub use transport::{SimTransport, Transport, TransportComponent};
