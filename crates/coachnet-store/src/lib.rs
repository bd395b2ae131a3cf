//! `coachnet-store` – durable safety state.
//!
//! A local SQLite file that outlives the process, so a restart after an
//! emergency stop never silently comes back up as "safe".
//!
//! # Modules
//!
//! - [`store`] – [`SafetyStore`][store::SafetyStore]: connection handling,
//!   schema and the crate's error type.
//! - [`interlock`] – the interlock journal: every engagement and every
//!   authorized reset, newest last.
//! - [`audit`] – the safety audit trail: state transitions, operator
//!   overrides, emergency stops, resets and final states at shutdown.

pub mod audit;
pub mod interlock;
pub mod store;

pub use audit::AuditEntry;
pub use interlock::InterlockEvent;
pub use store::{SafetyStore, StoreError};
