//! [`Registry`] – owns every component from declaration to shutdown.
//!
//! Boot happens in three steps:
//!
//! 1. [`Registry::register`] records a [`ComponentSpec`]. Duplicate names and
//!    edges that close a cycle among required dependencies are rejected
//!    immediately. Dependencies may name components that are registered
//!    later.
//! 2. [`Registry::resolve_stages`] checks that every required dependency
//!    exists and layers the graph into stages (Kahn-style): each stage holds
//!    the components whose dependencies are all placed in strictly earlier
//!    stages.
//! 3. [`Registry::start_all`] constructs each stage concurrently and only
//!    moves on once every construction in the stage has finished.
//!
//! After boot the registry is shared read-only (`Arc<Registry>`) with the
//! health propagator, the HTTP layer and the daemon.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use coachnet_types::{Dependency, GatewayError, SafetyClassification};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::component::{
    Component, ComponentRecord, ComponentSpec, Dependencies, InitFn, InitFuture, Lifecycle,
};
use crate::emergency::{EmergencyResponder, StartedComponents, StopBroadcaster, StopReport};

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(250);

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct Entry {
    classification: SafetyClassification,
    dependencies: Vec<Dependency>,
    tags: BTreeSet<String>,
    init: Mutex<Option<InitFn>>,
    lifecycle: Lifecycle,
}

impl Entry {
    fn required(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(|d| d.is_required())
    }
}

/// Summary of a successful [`Registry::start_all`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct BootReport {
    pub stages: Vec<Vec<String>>,
    /// Components that failed to start but that nothing requires.
    pub unavailable: Vec<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Registry
// ────────────────────────────────────────────────────────────────────────────

/// Component registry and boot sequencer.
///
/// # Example
///
/// ```no_run
/// # async fn boot() -> Result<(), coachnet_types::GatewayError> {
/// use coachnet_kernel::Registry;
/// # use coachnet_kernel::ComponentSpec;
/// # use coachnet_types::SafetyClassification;
/// # fn spec(name: &str) -> ComponentSpec { unimplemented!() }
///
/// let mut registry = Registry::new();
/// registry.register(spec("house_bus"))?;
/// registry.register(spec("lighting").requires("house_bus"))?;
/// let report = registry.start_all().await?;
/// assert_eq!(report.stages.len(), 2);
/// # Ok(()) }
/// ```
pub struct Registry {
    entries: BTreeMap<String, Entry>,
    started: StartedComponents,
    broadcaster: StopBroadcaster,
    start_timeout: Duration,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let started = StartedComponents::default();
        Self {
            entries: BTreeMap::new(),
            broadcaster: StopBroadcaster::new(started.clone(), DEFAULT_STOP_TIMEOUT),
            started,
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }

    /// Bound on each component's construction (builder-style).
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Bound on each component's stop and resume hooks (builder-style).
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.broadcaster = StopBroadcaster::new(self.started.clone(), timeout);
        self
    }

    // ── Registration ────────────────────────────────────────────────────────

    /// Record `spec`.
    ///
    /// Fails with [`GatewayError::DuplicateName`] if the name is taken and
    /// with [`GatewayError::CycleDetected`] if one of its required edges
    /// closes a cycle with components already registered.
    pub fn register(&mut self, spec: ComponentSpec) -> Result<(), GatewayError> {
        if self.entries.contains_key(&spec.name) {
            return Err(GatewayError::DuplicateName(spec.name));
        }

        for dep in spec.dependencies.iter().filter(|d| d.is_required()) {
            let mut visited = BTreeSet::new();
            let mut path = Vec::new();
            if self.path_to(&dep.name, &spec.name, &mut visited, &mut path) {
                let mut cycle = vec![spec.name.clone()];
                cycle.extend(path);
                return Err(GatewayError::CycleDetected(cycle));
            }
        }

        debug!(
            component = %spec.name,
            classification = %spec.classification,
            dependencies = spec.dependencies.len(),
            "component registered"
        );
        self.entries.insert(
            spec.name,
            Entry {
                classification: spec.classification,
                dependencies: spec.dependencies,
                tags: spec.tags,
                init: Mutex::new(Some(spec.init)),
                lifecycle: Lifecycle::Registered,
            },
        );
        Ok(())
    }

    /// Depth-first search along required edges from `from` to `target`,
    /// collecting the nodes visited on the way.
    fn path_to(
        &self,
        from: &str,
        target: &str,
        visited: &mut BTreeSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        if from == target {
            return true;
        }
        if !visited.insert(from.to_string()) {
            return false;
        }
        path.push(from.to_string());
        if let Some(entry) = self.entries.get(from) {
            for dep in entry.required() {
                if self.path_to(&dep.name, target, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// Check that every required dependency names a registered component.
    pub fn validate(&self) -> Result<(), GatewayError> {
        for (name, entry) in &self.entries {
            if let Some(missing) = entry.required().find(|d| !self.entries.contains_key(&d.name)) {
                return Err(GatewayError::UnknownDependency {
                    component: name.clone(),
                    dependency: missing.name.clone(),
                });
            }
        }
        Ok(())
    }

    // ── Staging ─────────────────────────────────────────────────────────────

    /// Layer the registered components into start stages.
    ///
    /// Each iteration places every unplaced component whose dependencies are
    /// all placed. Optional edges to registered components order the stages
    /// too; they are only relaxed when nothing else can be placed, so an
    /// optional edge never blocks boot. An iteration that places nothing
    /// fails with [`GatewayError::CycleDetected`] listing the stuck set.
    pub fn resolve_stages(&self) -> Result<Vec<Vec<String>>, GatewayError> {
        self.validate()?;

        let mut placed: BTreeSet<&str> = BTreeSet::new();
        let mut remaining: BTreeSet<&str> = self.entries.keys().map(String::as_str).collect();
        let mut stages = Vec::new();

        while !remaining.is_empty() {
            let strict: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|name| {
                    self.entries[*name].dependencies.iter().all(|d| {
                        placed.contains(d.name.as_str())
                            || (!d.is_required() && !self.entries.contains_key(&d.name))
                    })
                })
                .collect();

            let ready = if strict.is_empty() {
                remaining
                    .iter()
                    .copied()
                    .filter(|name| {
                        self.entries[*name]
                            .required()
                            .all(|d| placed.contains(d.name.as_str()))
                    })
                    .collect()
            } else {
                strict
            };

            if ready.is_empty() {
                let stuck: Vec<String> = remaining.iter().map(|s| s.to_string()).collect();
                error!(?stuck, "unresolvable dependencies");
                return Err(GatewayError::CycleDetected(stuck));
            }

            for name in &ready {
                remaining.remove(name);
                placed.insert(*name);
            }
            stages.push(ready.into_iter().map(str::to_string).collect());
        }

        Ok(stages)
    }

    // ── Boot ────────────────────────────────────────────────────────────────

    /// Construct every component, stage by stage.
    ///
    /// Constructions inside a stage run concurrently with a timeout and panic
    /// isolation. A failure is fatal when the component is critical or when
    /// another component requires it: already started components are sent a
    /// stop signal and [`GatewayError::ComponentStartFailed`] is returned.
    /// Any other failure marks the component [`Lifecycle::Unavailable`] and
    /// its dependents receive an absent reference.
    pub async fn start_all(&mut self) -> Result<BootReport, GatewayError> {
        let stages = self.resolve_stages()?;
        let gating = self.gating_components();
        let mut report = BootReport {
            stages: stages.clone(),
            unavailable: Vec::new(),
        };

        for (index, stage) in stages.iter().enumerate() {
            info!(stage = index, components = ?stage, "starting stage");
            let mut set = JoinSet::new();
            let mut pending = BTreeSet::new();
            for name in stage {
                let Some(entry) = self.entries.get_mut(name) else {
                    continue;
                };
                let Some(init) = entry.init.get_mut().unwrap_or_else(PoisonError::into_inner).take() else {
                    return Err(GatewayError::ComponentStartFailed {
                        component: name.clone(),
                        details: "already started".to_string(),
                    });
                };
                let deps = Dependencies::new(
                    self.resolve_references(name),
                    self.broadcaster.clone(),
                );
                let timeout = self.start_timeout;
                let name = name.clone();
                pending.insert(name.clone());
                set.spawn(async move {
                    let result = construct(timeout, init(deps)).await;
                    (name, result)
                });
            }

            let mut results = Vec::new();
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((name, result)) => {
                        pending.remove(&name);
                        results.push((name, result));
                    }
                    Err(e) => error!(error = %e, "component construction task aborted"),
                }
            }
            // An aborted task never reported back; it failed like any other.
            results.extend(
                pending
                    .into_iter()
                    .map(|name| (name, Err("construction task aborted".to_string()))),
            );

            let mut fatal = None;
            for (name, result) in results {
                match result {
                    Ok(component) => {
                        self.started.insert(&name, component);
                        self.set_lifecycle(&name, Lifecycle::Started);
                        info!(component = %name, "component started");
                    }
                    Err(details) if gating.contains(&name) => {
                        error!(component = %name, %details, "required component failed to start");
                        self.set_lifecycle(&name, Lifecycle::FailedPermanently);
                        fatal.get_or_insert(GatewayError::ComponentStartFailed {
                            component: name,
                            details,
                        });
                    }
                    Err(details) => {
                        warn!(component = %name, %details, "optional component unavailable");
                        self.set_lifecycle(&name, Lifecycle::Unavailable);
                        report.unavailable.push(name);
                    }
                }
            }

            if let Some(err) = fatal {
                let stop = self.broadcast_emergency_stop("boot aborted").await;
                warn!(stopped = stop.outcomes.len(), "boot aborted");
                return Err(err);
            }
        }

        report.unavailable.sort();
        info!(
            started = self.started.len(),
            unavailable = report.unavailable.len(),
            "boot complete"
        );
        Ok(report)
    }

    /// Critical components plus everything that is the target of a required
    /// edge.
    fn gating_components(&self) -> BTreeSet<String> {
        let mut gating: BTreeSet<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.classification == SafetyClassification::Critical)
            .map(|(name, _)| name.clone())
            .collect();
        for entry in self.entries.values() {
            gating.extend(entry.required().map(|d| d.name.clone()));
        }
        gating
    }

    fn resolve_references(&self, name: &str) -> BTreeMap<String, Option<Arc<dyn Component>>> {
        self.entries
            .get(name)
            .map(|entry| {
                entry
                    .dependencies
                    .iter()
                    .map(|d| (d.name.clone(), self.started.get(&d.name)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn set_lifecycle(&mut self, name: &str, lifecycle: Lifecycle) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.lifecycle = lifecycle;
        }
    }

    // ── Lookup & introspection ──────────────────────────────────────────────

    /// The live component `name`.
    ///
    /// [`GatewayError::NotFound`] when nothing by that name is registered,
    /// [`GatewayError::Unavailable`] when it is registered but not running.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Component>, GatewayError> {
        match self.started.get(name) {
            Some(component) => Ok(component),
            None if self.entries.contains_key(name) => {
                Err(GatewayError::Unavailable(name.to_string()))
            }
            None => Err(GatewayError::NotFound(name.to_string())),
        }
    }

    /// [`get`](Self::get) downcast to the concrete type.
    pub fn get_as<T: Component>(&self, name: &str) -> Result<Arc<T>, GatewayError> {
        self.get(name)?
            .as_any()
            .downcast::<T>()
            .map_err(|_| GatewayError::Config(format!("component '{name}' has an unexpected type")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn classification(&self, name: &str) -> Option<SafetyClassification> {
        self.entries.get(name).map(|e| e.classification)
    }

    pub fn lifecycle(&self, name: &str) -> Option<Lifecycle> {
        self.entries.get(name).map(|e| e.lifecycle)
    }

    /// Required dependencies of `name`.
    pub fn required_dependencies(&self, name: &str) -> Vec<String> {
        self.entries
            .get(name)
            .map(|e| e.required().map(|d| d.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Components holding a required edge to `name` (reverse edges).
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.required().any(|d| d.name == name))
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Components carrying `tag`.
    pub fn tagged(&self, tag: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.tags.contains(tag))
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn record(&self, name: &str) -> Result<ComponentRecord, GatewayError> {
        self.entries
            .get(name)
            .map(|e| to_record(name, e))
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    pub fn records(&self) -> Vec<ComponentRecord> {
        self.entries.iter().map(|(n, e)| to_record(n, e)).collect()
    }

    /// Every started component, by name.
    pub fn started(&self) -> Vec<(String, Arc<dyn Component>)> {
        self.started.snapshot()
    }

    /// Fan-out handle shared with components at construction time.
    pub fn broadcaster(&self) -> StopBroadcaster {
        self.broadcaster.clone()
    }

    // ── Emergency stop ──────────────────────────────────────────────────────

    /// Invoke every started component's stop hook concurrently and return
    /// the per-component outcome. Never fails as a whole.
    pub async fn broadcast_emergency_stop(&self, reason: &str) -> StopReport {
        error!(%reason, components = self.started.len(), "broadcasting emergency stop");
        self.broadcaster.emergency_stop(reason).await
    }
}

fn to_record(name: &str, entry: &Entry) -> ComponentRecord {
    ComponentRecord {
        name: name.to_string(),
        classification: entry.classification,
        dependencies: entry.dependencies.clone(),
        tags: entry.tags.clone(),
        lifecycle: entry.lifecycle,
    }
}

async fn construct(timeout: Duration, init: InitFuture) -> Result<Arc<dyn Component>, String> {
    match tokio::time::timeout(timeout, AssertUnwindSafe(init).catch_unwind()).await {
        Ok(Ok(Ok(component))) => Ok(component),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Err(_)) => Err("initialisation panicked".to_string()),
        Err(_) => Err(format!(
            "initialisation timed out after {} ms",
            timeout.as_millis()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use coachnet_types::{HealthReport, StopSignal};
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    #[derive(Default)]
    struct Plain {
        stops: AtomicUsize,
        saw_absent: bool,
    }

    #[async_trait]
    impl Component for Plain {
        async fn health_check(&self) -> HealthReport {
            HealthReport::healthy()
        }

        async fn emergency_stop(&self, _signal: &StopSignal) -> Result<(), GatewayError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn ok(name: &str, class: SafetyClassification) -> ComponentSpec {
        ComponentSpec::new(name, class, |_| async {
            Ok(Arc::new(Plain::default()) as Arc<dyn Component>)
        })
    }

    fn op(name: &str) -> ComponentSpec {
        ok(name, SafetyClassification::Operational)
    }

    fn failing(name: &str, class: SafetyClassification) -> ComponentSpec {
        ComponentSpec::new(name, class, |_| async {
            Err(GatewayError::Transport {
                logical_bus: "house".into(),
                details: "no controller".into(),
            })
        })
    }

    fn explode() -> Result<Arc<dyn Component>, GatewayError> {
        panic!("bad params")
    }

    fn position_of(stages: &[Vec<String>], name: &str) -> usize {
        stages
            .iter()
            .position(|s| s.iter().any(|n| n == name))
            .unwrap_or_else(|| panic!("{name} missing from stages"))
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut registry = Registry::new();
        registry.register(op("lighting")).unwrap();
        assert_eq!(
            registry.register(op("lighting")),
            Err(GatewayError::DuplicateName("lighting".into()))
        );
    }

    #[test]
    fn forward_references_are_resolved_later() {
        let mut registry = Registry::new();
        registry.register(op("lighting").requires("house_bus")).unwrap();
        assert!(matches!(
            registry.resolve_stages(),
            Err(GatewayError::UnknownDependency { ref dependency, .. }) if dependency == "house_bus"
        ));
        registry.register(op("house_bus")).unwrap();
        assert_eq!(registry.resolve_stages().unwrap().len(), 2);
    }

    #[test]
    fn closing_a_required_cycle_fails_registration() {
        let mut registry = Registry::new();
        registry.register(op("a").requires("c")).unwrap();
        registry.register(op("b").requires("a")).unwrap();
        let err = registry.register(op("c").requires("b")).unwrap_err();
        match err {
            GatewayError::CycleDetected(cycle) => {
                assert_eq!(cycle, vec!["c", "b", "a"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!registry.contains("c"));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut registry = Registry::new();
        assert_eq!(
            registry.register(op("loop").requires("loop")),
            Err(GatewayError::CycleDetected(vec!["loop".into()]))
        );
    }

    #[test]
    fn optional_cycles_do_not_block_staging() {
        let mut registry = Registry::new();
        registry.register(op("a").optional("b")).unwrap();
        registry.register(op("b").optional("a")).unwrap();
        let stages = registry.resolve_stages().unwrap();
        assert_eq!(stages.iter().map(Vec::len).sum::<usize>(), 2);
    }

    #[test]
    fn optional_chain_is_ordered() {
        let mut registry = Registry::new();
        registry.register(op("a")).unwrap();
        registry.register(op("b").requires("a")).unwrap();
        registry.register(op("c").optional("b")).unwrap();
        let stages = registry.resolve_stages().unwrap();
        assert_eq!(stages, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn every_component_follows_its_required_dependencies() {
        let mut registry = Registry::new();
        registry.register(op("brakes")).unwrap();
        registry.register(op("chassis").requires("brakes")).unwrap();
        registry.register(op("house")).unwrap();
        registry.register(op("slides").requires("house").requires("chassis")).unwrap();
        registry.register(op("jacks").requires("chassis")).unwrap();
        registry.register(op("panel").requires("slides").requires("jacks")).unwrap();
        registry.register(op("recorder").optional("missing")).unwrap();

        let stages = registry.resolve_stages().unwrap();
        let total: usize = stages.iter().map(Vec::len).sum();
        assert_eq!(total, registry.len());
        for name in registry.names() {
            for dep in registry.required_dependencies(&name) {
                assert!(position_of(&stages, &dep) < position_of(&stages, &name));
            }
        }
        assert_eq!(position_of(&stages, "recorder"), 0);
    }

    #[test]
    fn dependents_follow_required_edges_only() {
        let mut registry = Registry::new();
        registry.register(op("house")).unwrap();
        registry.register(op("lighting").requires("house")).unwrap();
        registry.register(op("recorder").optional("house")).unwrap();
        assert_eq!(registry.dependents("house"), vec!["lighting"]);
    }

    #[tokio::test]
    async fn stage_members_start_concurrently() {
        let barrier = Arc::new(Barrier::new(2));
        let mut registry = Registry::new().with_start_timeout(Duration::from_secs(2));
        for name in ["left", "right"] {
            let barrier = barrier.clone();
            registry
                .register(ComponentSpec::new(name, SafetyClassification::Operational, move |_| async move {
                    barrier.wait().await;
                    Ok(Arc::new(Plain::default()) as Arc<dyn Component>)
                }))
                .unwrap();
        }
        let report = registry.start_all().await.unwrap();
        assert_eq!(report.stages.len(), 1);
        assert!(registry.get("left").is_ok());
        assert!(registry.get("right").is_ok());
    }

    #[tokio::test]
    async fn failed_optional_dependency_is_injected_as_absent() {
        let mut registry = Registry::new();
        registry.register(op("a")).unwrap();
        registry.register(failing("b", SafetyClassification::Operational).requires("a")).unwrap();
        registry
            .register(ComponentSpec::new("c", SafetyClassification::Operational, |deps| async move {
                Ok(Arc::new(Plain {
                    stops: AtomicUsize::new(0),
                    saw_absent: deps.is_absent("b"),
                }) as Arc<dyn Component>)
            })
            .optional("b"))
            .unwrap();

        let report = registry.start_all().await.unwrap();
        assert_eq!(report.stages, vec![vec!["a"], vec!["b"], vec!["c"]]);
        assert_eq!(report.unavailable, vec!["b"]);
        assert_eq!(registry.lifecycle("b"), Some(Lifecycle::Unavailable));
        assert!(matches!(registry.get("b"), Err(GatewayError::Unavailable(_))));
        assert!(registry.get_as::<Plain>("c").unwrap().saw_absent);
    }

    #[tokio::test]
    async fn required_start_failure_aborts_boot_and_stops_started() {
        let mut registry = Registry::new();
        registry.register(op("house")).unwrap();
        registry.register(failing("brakes", SafetyClassification::Critical)).unwrap();
        registry.register(op("slides").requires("brakes")).unwrap();

        let err = registry.start_all().await.unwrap_err();
        assert!(matches!(err, GatewayError::ComponentStartFailed { ref component, .. } if component == "brakes"));
        assert_eq!(registry.lifecycle("brakes"), Some(Lifecycle::FailedPermanently));
        assert_eq!(registry.lifecycle("slides"), Some(Lifecycle::Registered));
        let house = registry.get_as::<Plain>("house").unwrap();
        assert_eq!(house.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_and_hanging_inits_are_isolated() {
        let mut registry = Registry::new().with_start_timeout(Duration::from_millis(50));
        registry
            .register(ComponentSpec::new("panics", SafetyClassification::Maintenance, |_| async {
                explode()
            }))
            .unwrap();
        registry
            .register(ComponentSpec::new("hangs", SafetyClassification::Operational, |_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Arc::new(Plain::default()) as Arc<dyn Component>)
            }))
            .unwrap();
        registry.register(op("fine")).unwrap();

        let report = registry.start_all().await.unwrap();
        assert_eq!(report.unavailable, vec!["hangs", "panics"]);
        assert!(registry.get("fine").is_ok());
    }

    fn wiring_bug(_: Dependencies) -> std::future::Ready<Result<Arc<dyn Component>, GatewayError>> {
        panic!("constructor wired to a missing driver")
    }

    #[tokio::test]
    async fn aborted_construction_is_not_left_registered() {
        let mut registry = Registry::new();
        registry
            .register(ComponentSpec::new("awning", SafetyClassification::Operational, wiring_bug))
            .unwrap();
        registry.register(op("lighting")).unwrap();

        let report = registry.start_all().await.unwrap();
        assert_eq!(report.unavailable, vec!["awning"]);
        assert_eq!(registry.lifecycle("awning"), Some(Lifecycle::Unavailable));
        assert_eq!(registry.lifecycle("lighting"), Some(Lifecycle::Started));

        let mut registry = Registry::new();
        registry
            .register(ComponentSpec::new("brakes", SafetyClassification::Critical, wiring_bug))
            .unwrap();
        assert!(matches!(
            registry.start_all().await,
            Err(GatewayError::ComponentStartFailed { component, details })
                if component == "brakes" && details.contains("aborted")
        ));
        assert_eq!(registry.lifecycle("brakes"), Some(Lifecycle::FailedPermanently));
    }

    #[tokio::test]
    async fn broadcast_reaches_started_components() {
        let mut registry = Registry::new();
        registry.register(op("a")).unwrap();
        registry.register(op("b").requires("a")).unwrap();
        registry.start_all().await.unwrap();

        let report = registry.broadcast_emergency_stop("test").await;
        assert!(report.is_complete());
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(registry.get_as::<Plain>("b").unwrap().stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn records_expose_edges_and_tags() {
        let mut registry = Registry::new();
        registry.register(op("house").tag("bus")).unwrap();
        let record = registry.record("house").unwrap();
        assert_eq!(record.lifecycle, Lifecycle::Registered);
        assert!(record.tags.contains("bus"));
        assert_eq!(registry.tagged("bus"), vec!["house"]);
        assert!(matches!(registry.record("ghost"), Err(GatewayError::NotFound(_))));
    }
}
