//! `coachnet-kernel` – Safety & Orchestration
//!
//! The core of the gateway. It does not talk to any bus itself; it decides
//! what runs, in which order, and what a failure means.
//!
//! # Modules
//!
//! - [`component`] – the [`Component`] trait every managed unit implements,
//!   and [`ComponentSpec`], its declaration before registration.
//! - [`registry`] – [`Registry`][registry::Registry]: rejects duplicate
//!   names and dependency cycles, layers components into start stages and
//!   boots each stage concurrently.
//! - [`safety`] – the safety classification model: pure transition rules,
//!   failure responses and safe actions per
//!   [`SafetyClassification`][coachnet_types::SafetyClassification].
//! - [`propagator`] – [`HealthPropagator`][propagator::HealthPropagator]:
//!   the single writer of every component's safety state; polls health,
//!   cascades failures along required edges and escalates critical failures
//!   to an emergency stop.
//! - [`emergency`] – [`StopBroadcaster`][emergency::StopBroadcaster]:
//!   concurrent, isolated fan-out of stop and resume hooks.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog] and
//!   [`LivenessMonitor`][watchdog::LivenessMonitor]: detect a frozen
//!   propagation loop on an independent timer.
//! - [`authorization`] – [`Authorizer`][authorization::Authorizer]: the
//!   operator authorization gate consumed by resets and overrides.

pub mod authorization;
pub mod component;
pub mod emergency;
pub mod propagator;
pub mod registry;
pub mod safety;
pub mod watchdog;

pub use authorization::{Authorizer, OperatorAction, StaticAuthorizer};
pub use component::{Component, ComponentRecord, ComponentSpec, Dependencies, Lifecycle};
pub use emergency::{EmergencyResponder, HookOutcome, StartedComponents, StopBroadcaster, StopReport};
pub use propagator::{CycleReport, HealthPropagator, PropagatorConfig, PropagatorHandle, Transition};
pub use registry::{BootReport, Registry};
pub use safety::{ComponentSafety, FailureResponse, SafeAction, SafetySnapshot, SystemMode};
pub use watchdog::{LivenessMonitor, Liveness, SharedWatchdog, Watchdog};
