//! Shared fixture for handler tests.

use std::sync::Arc;

use axum::Router;
use coachnet_gateway::{
    BusOperations, FacadeConfig, FacadeParts, FrameInjector, SimTransport, TransportComponent,
};
use coachnet_kernel::{OperatorAction, Registry, StaticAuthorizer};
use coachnet_middleware::EventBus;
use coachnet_types::SafetyClassification;

use crate::routes::create_router;
use crate::state::AppState;

/// A booted gateway with one critical transport on `house`, a one frame per
/// second injector and the facade, plus operator `tech-1` (token `4711`).
pub(crate) async fn app() -> (Router, AppState) {
    let events = EventBus::default();
    let mut registry = Registry::new();
    registry
        .register(TransportComponent::spec(
            "house_bus",
            SafetyClassification::Critical,
            Arc::new(SimTransport::new("house")),
        ))
        .unwrap();
    registry
        .register(FrameInjector::spec("injector", SafetyClassification::Maintenance, 1))
        .unwrap();
    registry
        .register(
            BusOperations::spec(
                "bus",
                SafetyClassification::Critical,
                FacadeParts {
                    restored: None,
                    store: None,
                    events: events.clone(),
                    config: FacadeConfig::default(),
                },
            )
            .requires("house_bus")
            .optional("injector"),
        )
        .unwrap();
    registry.start_all().await.unwrap();
    let facade = registry.get_as::<BusOperations>("bus").unwrap();

    let mut authorizer = StaticAuthorizer::new();
    authorizer.grant(
        "tech-1",
        "4711",
        [OperatorAction::ResetInterlock, OperatorAction::OverrideState],
    );
    let state = AppState::new(Arc::new(registry), facade, Arc::new(authorizer), events);
    (create_router(state.clone()), state)
}
