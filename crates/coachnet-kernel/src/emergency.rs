//! Emergency-stop fan-out.
//!
//! [`StopBroadcaster`] invokes every started component's stop hook
//! concurrently. Each hook runs in its own task with a timeout and panic
//! isolation, so one misbehaving component can neither delay nor prevent the
//! others from stopping. There is no ordering across components: a failing
//! dependency must not hold up its dependents.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use coachnet_types::{GatewayError, StopSignal};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, warn};

use crate::component::Component;

/// Outcome of one hook invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HookOutcome {
    Completed,
    Failed { details: String },
    TimedOut,
}

impl HookOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, HookOutcome::Completed)
    }
}

/// Per-component result of an emergency-stop broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub signal: StopSignal,
    pub outcomes: BTreeMap<String, HookOutcome>,
}

impl StopReport {
    /// `true` when every hook completed. An incomplete stop still counts as
    /// a stop; it only requires manual verification.
    pub fn is_complete(&self) -> bool {
        self.outcomes.values().all(HookOutcome::is_completed)
    }

    /// Names of the components whose hook failed or timed out.
    pub fn failures(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_completed())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Anything that can drive the system into its safe state.
#[async_trait]
pub trait EmergencyResponder: Send + Sync {
    async fn emergency_stop(&self, reason: &str) -> StopReport;
}

/// Live set of started components, shared between the registry and every
/// [`StopBroadcaster`] handed out during boot.
#[derive(Clone, Default)]
pub struct StartedComponents(Arc<RwLock<BTreeMap<String, Arc<dyn Component>>>>);

impl StartedComponents {
    pub(crate) fn insert(&self, name: &str, component: Arc<dyn Component>) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), component);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Clone the current set out so that no lock is held across an await.
    pub fn snapshot(&self) -> Vec<(String, Arc<dyn Component>)> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, component)| (name.clone(), Arc::clone(component)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fans stop and resume calls out to every started component.
#[derive(Clone)]
pub struct StopBroadcaster {
    started: StartedComponents,
    timeout: Duration,
    sequence: Arc<AtomicU64>,
}

impl StopBroadcaster {
    pub fn new(started: StartedComponents, timeout: Duration) -> Self {
        Self {
            started,
            timeout,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Per-hook timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Deliver `signal` to every started component's stop hook and wait for
    /// all of them to complete, fail or time out.
    pub async fn broadcast(&self, signal: &StopSignal) -> StopReport {
        let outcomes = self
            .fan_out(|component, signal: StopSignal| async move {
                component.emergency_stop(&signal).await
            }, signal.clone())
            .await;

        for (name, outcome) in &outcomes {
            match outcome {
                HookOutcome::Completed => {}
                HookOutcome::Failed { details } => {
                    let err = GatewayError::EmergencyStopSubsystemFailure {
                        subsystem: name.clone(),
                        details: details.clone(),
                    };
                    error!(component = %name, sequence = signal.sequence, error = %err, "stop hook failed");
                }
                HookOutcome::TimedOut => {
                    error!(
                        component = %name,
                        sequence = signal.sequence,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "stop hook timed out"
                    );
                }
            }
        }

        StopReport {
            signal: signal.clone(),
            outcomes,
        }
    }

    /// Invoke every started component's resume hook.
    pub async fn broadcast_resume(&self) -> BTreeMap<String, HookOutcome> {
        let outcomes = self
            .fan_out(|component, _: ()| async move { component.resume().await }, ())
            .await;
        for (name, outcome) in &outcomes {
            if !outcome.is_completed() {
                warn!(component = %name, ?outcome, "resume hook did not complete");
            }
        }
        outcomes
    }

    /// Allocate the next stop-sequence number for signals built here.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Make sure future sequences are above `seen`, e.g. a sequence restored
    /// from before a restart.
    pub fn observe_sequence(&self, seen: u64) {
        self.sequence.fetch_max(seen, Ordering::AcqRel);
    }

    async fn fan_out<A, F, Fut>(&self, call: F, arg: A) -> BTreeMap<String, HookOutcome>
    where
        A: Clone + Send + 'static,
        F: Fn(Arc<dyn Component>, A) -> Fut,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        let mut set = JoinSet::new();
        for (name, component) in self.started.snapshot() {
            let hook = call(component, arg.clone());
            let timeout = self.timeout;
            set.spawn(async move {
                let outcome = guarded(timeout, hook).await;
                (name, outcome)
            });
        }

        let mut outcomes = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, outcome)) => {
                    outcomes.insert(name, outcome);
                }
                Err(e) => error!(error = %e, "hook task aborted"),
            }
        }
        outcomes
    }
}

#[async_trait]
impl EmergencyResponder for StopBroadcaster {
    async fn emergency_stop(&self, reason: &str) -> StopReport {
        let signal = StopSignal {
            sequence: self.next_sequence(),
            reason: reason.to_string(),
        };
        self.broadcast(&signal).await
    }
}

/// Run `hook` with a timeout, converting a panic into a failure.
pub(crate) async fn guarded<Fut>(timeout: Duration, hook: Fut) -> HookOutcome
where
    Fut: Future<Output = Result<(), GatewayError>>,
{
    match tokio::time::timeout(timeout, AssertUnwindSafe(hook).catch_unwind()).await {
        Ok(Ok(Ok(()))) => HookOutcome::Completed,
        Ok(Ok(Err(e))) => HookOutcome::Failed {
            details: e.to_string(),
        },
        Ok(Err(_)) => HookOutcome::Failed {
            details: "hook panicked".to_string(),
        },
        Err(_) => HookOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coachnet_types::HealthReport;
    use std::any::Any;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        stops: AtomicUsize,
        resumes: AtomicUsize,
    }

    #[async_trait]
    impl Component for Counting {
        async fn health_check(&self) -> HealthReport {
            HealthReport::healthy()
        }

        async fn emergency_stop(&self, _signal: &StopSignal) -> Result<(), GatewayError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn resume(&self) -> Result<(), GatewayError> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    struct Failing;

    #[async_trait]
    impl Component for Failing {
        async fn health_check(&self) -> HealthReport {
            HealthReport::healthy()
        }

        async fn emergency_stop(&self, _signal: &StopSignal) -> Result<(), GatewayError> {
            Err(GatewayError::Transport {
                logical_bus: "house".into(),
                details: "controller offline".into(),
            })
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    struct Panicking;

    #[async_trait]
    impl Component for Panicking {
        async fn health_check(&self) -> HealthReport {
            HealthReport::healthy()
        }

        async fn emergency_stop(&self, _signal: &StopSignal) -> Result<(), GatewayError> {
            panic!("stop hook exploded");
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    struct Hanging;

    #[async_trait]
    impl Component for Hanging {
        async fn health_check(&self) -> HealthReport {
            HealthReport::healthy()
        }

        async fn emergency_stop(&self, _signal: &StopSignal) -> Result<(), GatewayError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn signal() -> StopSignal {
        StopSignal {
            sequence: 1,
            reason: "test".into(),
        }
    }

    #[tokio::test]
    async fn failing_hooks_do_not_prevent_others() {
        let started = StartedComponents::default();
        let counting = Arc::new(Counting::default());
        started.insert("lighting", counting.clone());
        started.insert("awnings", Arc::new(Failing));
        started.insert("slides", Arc::new(Panicking));
        started.insert("jacks", Arc::new(Hanging));

        let broadcaster = StopBroadcaster::new(started, Duration::from_millis(50));
        let report = broadcaster.broadcast(&signal()).await;

        assert_eq!(counting.stops.load(Ordering::SeqCst), 1);
        assert_eq!(report.outcomes["lighting"], HookOutcome::Completed);
        assert!(matches!(report.outcomes["awnings"], HookOutcome::Failed { .. }));
        assert!(matches!(report.outcomes["slides"], HookOutcome::Failed { .. }));
        assert_eq!(report.outcomes["jacks"], HookOutcome::TimedOut);
        assert!(!report.is_complete());
        assert_eq!(report.failures(), vec!["awnings", "jacks", "slides"]);
    }

    #[tokio::test]
    async fn responder_allocates_increasing_sequences() {
        let started = StartedComponents::default();
        started.insert("lighting", Arc::new(Counting::default()));
        let broadcaster = StopBroadcaster::new(started, Duration::from_millis(50));

        let first = broadcaster.emergency_stop("one").await;
        let second = broadcaster.emergency_stop("two").await;
        assert_eq!(first.signal.sequence, 1);
        assert_eq!(second.signal.sequence, 2);
        assert!(first.is_complete());

        broadcaster.clone().observe_sequence(7);
        assert_eq!(broadcaster.next_sequence(), 8);
        broadcaster.observe_sequence(3);
        assert_eq!(broadcaster.next_sequence(), 9);
    }

    #[tokio::test]
    async fn resume_reaches_every_component() {
        let started = StartedComponents::default();
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        started.insert("a", a.clone());
        started.insert("b", b.clone());
        let broadcaster = StopBroadcaster::new(started.clone(), Duration::from_millis(50));

        let outcomes = broadcaster.broadcast_resume().await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(a.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(b.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(started.len(), 2);
    }

    #[tokio::test]
    async fn empty_broadcast_is_complete() {
        let broadcaster = StopBroadcaster::new(StartedComponents::default(), Duration::from_millis(10));
        let report = broadcaster.broadcast(&signal()).await;
        assert!(report.outcomes.is_empty());
        assert!(report.is_complete());
    }
}
