//! `coachnet-middleware` – in-process event routing.
//!
//! Carries safety transitions, emergency-stop alerts and bus traffic between
//! the kernel, the gateway, the audit journal and connected dashboards
//! without any of them knowing about each other.
//!
//! # Modules
//!
//! - [`events`] – topic-based publish/subscribe [`EventBus`] built on Tokio
//!   broadcast channels.

pub mod events;

pub use events::{EventBus, Topic, TopicReceiver};
