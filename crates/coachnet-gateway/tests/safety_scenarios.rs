//! End-to-end safety scenarios across registry, propagator, devices and the
//! bus facade.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coachnet_gateway::{
    BusOperations, FacadeConfig, FacadeParts, FrameRecorder, Interlock, SimTransport,
    TransportComponent,
};
use coachnet_hal::{DeviceController, DeviceKind, SimDevices};
use coachnet_kernel::{
    Component, ComponentSpec, EmergencyResponder, HealthPropagator, PropagatorConfig, Registry,
    Watchdog,
};
use coachnet_middleware::EventBus;
use coachnet_store::SafetyStore;
use coachnet_types::{
    GatewayError, HealthReport, OperatorAuthorization, PhysicalVerification, SafetyClassification,
    SafetyState, StopRecord, StopSignal, SystemStatus,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

// ────────────────────────────────────────────────────────────────────────────
// Fixtures
// ────────────────────────────────────────────────────────────────────────────

fn device(name: &str, kind: DeviceKind, classification: SafetyClassification) -> Arc<DeviceController> {
    Arc::new(SimDevices::for_kind(kind).build(name, kind, classification))
}

struct Coach {
    registry: Arc<Registry>,
    facade: Arc<BusOperations>,
    brakes: Arc<DeviceController>,
    lights: Arc<DeviceController>,
    slides: Arc<DeviceController>,
    events: EventBus,
}

/// A coach with one critical transport, a critical brake controller, a
/// position-critical slide-out that requires the brakes, and operational
/// lighting with an operational awning light bar depending on it.
async fn boot(restored: Option<StopRecord>, store: Option<Arc<SafetyStore>>) -> Coach {
    boot_with(restored, store, Vec::new()).await
}

/// [`boot`] with `extra` components registered alongside the coach's own.
async fn boot_with(
    restored: Option<StopRecord>,
    store: Option<Arc<SafetyStore>>,
    extra: Vec<ComponentSpec>,
) -> Coach {
    let events = EventBus::default();
    let brakes = device("brakes", DeviceKind::Brakes, SafetyClassification::Critical);
    let lights = device("lighting", DeviceKind::Lighting, SafetyClassification::Operational);
    let slides = device("slides", DeviceKind::Slides, SafetyClassification::PositionCritical);
    let awning_lights = device("awning_lights", DeviceKind::Lighting, SafetyClassification::Operational);

    let mut registry = Registry::new();
    registry
        .register(TransportComponent::spec(
            "house_bus",
            SafetyClassification::Critical,
            Arc::new(SimTransport::new("house")),
        ))
        .unwrap();
    registry
        .register(FrameRecorder::spec("recorder", SafetyClassification::Maintenance, 64, true))
        .unwrap();
    registry
        .register(
            BusOperations::spec(
                "bus",
                SafetyClassification::Critical,
                FacadeParts {
                    restored,
                    store,
                    events: events.clone(),
                    config: FacadeConfig::default(),
                },
            )
            .requires("house_bus")
            .optional("recorder"),
        )
        .unwrap();
    registry.register(DeviceController::spec(brakes.clone()).requires("bus")).unwrap();
    registry.register(DeviceController::spec(slides.clone()).requires("brakes")).unwrap();
    registry.register(DeviceController::spec(lights.clone())).unwrap();
    registry
        .register(DeviceController::spec(awning_lights).requires("lighting"))
        .unwrap();
    for spec in extra {
        registry.register(spec).unwrap();
    }
    registry.start_all().await.unwrap();

    let facade = registry.get_as::<BusOperations>("bus").unwrap();
    Coach {
        registry: Arc::new(registry),
        facade,
        brakes,
        lights,
        slides,
        events,
    }
}

fn propagator(coach: &Coach) -> HealthPropagator {
    let responder = coach.facade.clone() as Arc<dyn EmergencyResponder>;
    let (propagator, handle) = HealthPropagator::new(
        coach.registry.clone(),
        responder,
        coach.events.clone(),
        Watchdog::shared(),
        PropagatorConfig::default(),
    )
    .unwrap();
    coach.facade.attach_propagator(handle);
    propagator
}

fn technician() -> (OperatorAuthorization, PhysicalVerification) {
    (
        OperatorAuthorization::granted("tech-1"),
        PhysicalVerification {
            inspected_by: "tech-1".into(),
            confirmed: true,
            notes: "brake lines checked".into(),
        },
    )
}

// ────────────────────────────────────────────────────────────────────────────
// Scenarios
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_emergency_stops_record_one_event() {
    let store = Arc::new(SafetyStore::open_in_memory().unwrap());
    let coach = boot(None, Some(store.clone())).await;

    let (a, b) = tokio::join!(
        coach.facade.emergency_stop("driver pressed stop"),
        coach.facade.emergency_stop("remote stop"),
    );

    assert_eq!(a.record, b.record);
    assert_eq!([a.already_engaged, b.already_engaged].iter().filter(|x| !**x).count(), 1);
    assert!(!a.incomplete && !b.incomplete);

    // Each device saw one stop event.
    assert_eq!(coach.brakes.stops_handled(), 1);
    assert_eq!(coach.slides.stops_handled(), 1);

    let history = store.interlock_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sequence(), a.record.sequence);
}

/// A stop hook that announces itself and then takes its time.
#[derive(Default)]
struct SlowStop {
    entered: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl Component for SlowStop {
    async fn health_check(&self) -> HealthReport {
        HealthReport::healthy()
    }

    async fn emergency_stop(&self, _signal: &StopSignal) -> Result<(), GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[tokio::test]
async fn second_stop_during_fan_out_triggers_nothing() {
    let store = Arc::new(SafetyStore::open_in_memory().unwrap());
    let slow = Arc::new(SlowStop::default());
    let hooked = slow.clone();
    let spec = ComponentSpec::new("leveling", SafetyClassification::PositionCritical, move |_| async move {
        Ok(hooked as Arc<dyn Component>)
    });
    let coach = boot_with(None, Some(store.clone()), vec![spec]).await;

    let facade = coach.facade.clone();
    let first = tokio::spawn(async move { facade.emergency_stop("driver pressed stop").await });
    slow.entered.notified().await;

    let second = coach.facade.emergency_stop("remote stop").await;
    assert!(second.already_engaged);
    assert!(second.outcomes.is_empty());
    assert!(!first.is_finished());

    let first = first.await.unwrap();
    assert!(!first.already_engaged);
    assert_eq!(second.record, first.record);
    assert_eq!(second.record.reason, "driver pressed stop");

    assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
    assert_eq!(coach.brakes.stops_handled(), 1);
    assert_eq!(coach.slides.stops_handled(), 1);
    assert_eq!(coach.lights.stops_handled(), 1);
    assert_eq!(store.interlock_history(10).unwrap().len(), 1);
}

#[tokio::test]
async fn critical_failure_reaches_emergency_stop_and_blocks_sends() {
    let coach = boot(None, None).await;
    let mut propagator = propagator(&coach);

    let first = propagator.run_cycle().await.unwrap();
    assert!(!first.emergency_triggered);
    assert!(coach.facade.send("house", 0x1FEDA, vec![0]).await.is_ok());

    coach
        .brakes
        .inject_fault(Some(HealthReport::failed("brake pressure lost")));
    let report = propagator.run_cycle().await.unwrap();
    assert!(report.emergency_triggered);
    assert_eq!(report.status, SystemStatus::EmergencyStop);

    assert_eq!(coach.facade.health().await, SystemStatus::EmergencyStop);
    match coach.facade.send("house", 0x1FEDA, vec![0]).await {
        Err(err @ GatewayError::Blocked { .. }) => {
            assert!(err.to_string().starts_with("blocked: system in emergency stop"));
        }
        other => panic!("expected blocked, got {other:?}"),
    }

    // Position-critical hardware holds and refuses motion.
    assert!(coach.slides.is_halted());
    assert!(coach.slides.move_to("slide_front", 0.5).is_err());

    // The slide-out requires the brakes, so it inherits the failure.
    let snapshot = propagator.snapshot();
    assert_eq!(snapshot.state("brakes"), Some(SafetyState::Failed));
    assert_eq!(snapshot.state("slides"), Some(SafetyState::Failed));
}

#[tokio::test]
async fn operational_failure_never_escalates() {
    let coach = boot(None, None).await;
    let mut propagator = propagator(&coach);
    propagator.run_cycle().await.unwrap();

    coach.lights.inject_fault(Some(HealthReport::failed("breaker tripped")));
    let report = propagator.run_cycle().await.unwrap();

    assert!(!report.emergency_triggered);
    assert!(matches!(report.status, SystemStatus::Safe | SystemStatus::Degraded));
    let snapshot = propagator.snapshot();
    assert_eq!(snapshot.state("lighting"), Some(SafetyState::Failed));
    assert_eq!(snapshot.state("awning_lights"), Some(SafetyState::Degraded));

    assert!(!coach.facade.is_engaged());
    assert_ne!(coach.facade.health().await, SystemStatus::EmergencyStop);
    assert!(coach.facade.send("house", 1, vec![]).await.is_ok());
}

#[tokio::test]
async fn reset_is_refused_until_the_critical_component_recovers() {
    let coach = boot(None, None).await;
    let mut propagator = propagator(&coach);
    propagator.run_cycle().await.unwrap();
    coach.brakes.inject_fault(Some(HealthReport::failed("brake pressure lost")));
    propagator.run_cycle().await.unwrap();
    assert!(coach.facade.is_engaged());

    // From here on the propagator runs as a task and is reached through its
    // handle.
    let handle = coach.facade.propagator().unwrap();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(propagator.run(shutdown_rx));

    let (auth, verification) = technician();
    assert!(matches!(
        coach.facade.reset_safe_state(&auth, &verification).await,
        Err(GatewayError::Blocked { .. })
    ));
    assert!(coach.facade.is_engaged());

    // Repair, re-arm the brake controller and let a cycle re-evaluate it.
    coach.brakes.inject_fault(None);
    handle
        .override_state("brakes", SafetyState::Initializing, &auth)
        .await
        .unwrap();
    handle.run_cycle().await.unwrap();
    assert_ne!(handle.snapshot().state("brakes"), Some(SafetyState::Failed));

    let cleared = coach.facade.reset_safe_state(&auth, &verification).await.unwrap();
    assert!(cleared.is_some());
    assert!(!coach.facade.is_engaged());
    assert!(!coach.brakes.is_halted());
    assert_eq!(handle.snapshot().mode, coachnet_kernel::SystemMode::Normal);
    assert!(coach.facade.send("house", 1, vec![]).await.is_ok());

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn restart_after_stop_boots_blocked_until_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");

    {
        let store = Arc::new(SafetyStore::open(&path).unwrap());
        let coach = boot(None, Some(store)).await;
        coach.facade.emergency_stop("operator interrupt").await;
    }

    let store = Arc::new(SafetyStore::open(&path).unwrap());
    let restored = Interlock::restored_record(store.last_interlock_event().unwrap(), true);
    assert_eq!(restored.as_ref().map(|r| r.reason.as_str()), Some("operator interrupt"));

    let coach = boot(restored, Some(store.clone())).await;
    assert!(matches!(
        coach.facade.send("house", 1, vec![]).await,
        Err(GatewayError::Blocked { .. })
    ));
    coach.facade.reassert_interlock().await.unwrap();
    assert!(coach.slides.is_halted());

    let (auth, verification) = technician();
    coach.facade.reset_safe_state(&auth, &verification).await.unwrap();
    assert!(coach.facade.send("house", 1, vec![]).await.is_ok());
    assert!(!coach.slides.is_halted());

    let restored = Interlock::restored_record(store.last_interlock_event().unwrap(), true);
    assert_eq!(restored, None);
}

#[tokio::test]
async fn first_boot_without_history_halts_every_device() {
    let restored = Interlock::restored_record(None, true);
    let coach = boot(restored, None).await;

    let record = coach.facade.interlock_record().unwrap();
    assert!(record.sequence >= 1);
    let report = coach.facade.reassert_interlock().await.unwrap();
    assert_eq!(report.signal.sequence, record.sequence);
    assert!(report.is_complete());

    assert_eq!(coach.brakes.stops_handled(), 1);
    assert_eq!(coach.slides.stops_handled(), 1);
    assert!(coach.slides.is_halted());
    assert!(coach.slides.move_to("slide_front", 0.5).is_err());

    // Later stops are numbered above the boot record.
    let (auth, verification) = technician();
    coach.facade.reset_safe_state(&auth, &verification).await.unwrap();
    let ack = coach.facade.emergency_stop("operator").await;
    assert!(ack.record.sequence > record.sequence);
}

#[tokio::test]
async fn mixed_sync_and_async_health_never_raises() {
    let coach = boot(None, None).await;
    let health = coach.facade.comprehensive_health().await;
    assert_eq!(health.status, SystemStatus::Safe);
    assert_eq!(health.subsystems["house_bus"].kind, "transport");
    assert_eq!(health.subsystems["recorder"].kind, "recorder");
    assert_eq!(coach.facade.health().await, SystemStatus::Safe);
}

// ────────────────────────────────────────────────────────────────────────────
// Boot staging with an optional dependency that fails to start
// ────────────────────────────────────────────────────────────────────────────

struct Plain;

#[async_trait]
impl Component for Plain {
    async fn health_check(&self) -> HealthReport {
        HealthReport::healthy()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[tokio::test]
async fn optional_dependency_failure_does_not_block_boot() {
    let mut registry = Registry::new().with_start_timeout(Duration::from_millis(200));
    registry
        .register(ComponentSpec::new("a", SafetyClassification::Operational, |_| async {
            Ok(Arc::new(Plain) as Arc<dyn Component>)
        }))
        .unwrap();
    registry
        .register(
            ComponentSpec::new("b", SafetyClassification::Operational, |_| async {
                Err(GatewayError::ComponentStartFailed {
                    component: "b".into(),
                    details: "no response on the bus".into(),
                })
            })
            .requires("a"),
        )
        .unwrap();
    registry
        .register(
            ComponentSpec::new("c", SafetyClassification::Operational, |deps| async move {
                assert!(deps.is_absent("b"));
                Ok(Arc::new(Plain) as Arc<dyn Component>)
            })
            .optional("b"),
        )
        .unwrap();

    assert_eq!(
        registry.resolve_stages().unwrap(),
        vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
    );
    let report = registry.start_all().await.unwrap();
    assert_eq!(report.unavailable, vec!["b".to_string()]);
    assert!(registry.get("c").is_ok());
    assert!(matches!(registry.get("b"), Err(GatewayError::Unavailable(_))));
}
