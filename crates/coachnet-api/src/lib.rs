//! `coachnet-api` – HTTP and WebSocket surface
//!
//! Exposes the gateway to dashboards, monitoring and service tools:
//!
//! | Route | Effect |
//! |---|---|
//! | `GET /health` | aggregated status plus per-subsystem detail |
//! | `POST /emergency-stop` | engage the interlock and stop every component |
//! | `GET /components`, `GET /components/:name` | registry introspection |
//! | `POST /components/:name/state` | authorized operator state override |
//! | `POST /bus/send`, `POST /bus/inject` | bus writes through the facade |
//! | `POST /safety/reset` | authorized, verified interlock reset |
//! | `GET /events` | WebSocket stream of event-bus traffic |
//!
//! Every error is a JSON body `{error, code}` with a status derived from the
//! [`GatewayError`][coachnet_types::GatewayError] variant.

pub mod error;
pub mod events;
pub mod routes;
pub mod server;
pub mod state;

#[cfg(test)]
mod testing;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use server::{ApiServer, DEFAULT_PORT};
pub use state::AppState;
