//! Shared state handed to every handler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use coachnet_gateway::BusOperations;
use coachnet_kernel::{Authorizer, OperatorAction, Registry};
use coachnet_middleware::EventBus;
use coachnet_types::OperatorAuthorization;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub facade: Arc<BusOperations>,
    pub authorizer: Arc<dyn Authorizer>,
    pub events: EventBus,
    pub version: String,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        registry: Arc<Registry>,
        facade: Arc<BusOperations>,
        authorizer: Arc<dyn Authorizer>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            facade,
            authorizer,
            events,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
        }
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    pub fn authorize(&self, operator: &str, token: &str, action: OperatorAction) -> OperatorAuthorization {
        self.authorizer.authorize(operator, token, action)
    }
}
