//! [`Component`] – the unit of functionality managed by the
//! [`Registry`][crate::registry::Registry].
//!
//! A component is declared with a [`ComponentSpec`]: a unique name, a static
//! [`SafetyClassification`], its dependency edges, free-form tags, and an
//! init function. The init function receives the already-started
//! dependencies as [`Dependencies`] and hands ownership of the constructed
//! component to the registry, which shares it out as `Arc<dyn Component>`.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use coachnet_types::{
    Dependency, GatewayError, HealthReport, SafetyClassification, StopSignal,
};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;

use crate::emergency::StopBroadcaster;

/// Behaviour every registry-managed component provides.
///
/// Components never change their own safety state; they only report health.
/// The health propagator decides what that report means.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// Return a point-in-time health snapshot. Must not mutate anything the
    /// safety layer depends on.
    async fn health_check(&self) -> HealthReport;

    /// Stop hook invoked during an emergency-stop broadcast.
    ///
    /// Deliveries carrying a `sequence` the component has already handled
    /// must be treated as duplicates of the same stop event.
    async fn emergency_stop(&self, _signal: &StopSignal) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Invoked after an authorized interlock reset.
    async fn resume(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Upcast used for typed dependency lookups. Implement as `{ self }`.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub(crate) type InitFuture = BoxFuture<'static, Result<Arc<dyn Component>, GatewayError>>;
pub(crate) type InitFn = Box<dyn FnOnce(Dependencies) -> InitFuture + Send>;

/// Declaration of a component prior to registration.
pub struct ComponentSpec {
    pub(crate) name: String,
    pub(crate) classification: SafetyClassification,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) init: InitFn,
}

impl ComponentSpec {
    /// Declare a component named `name` built by `init`.
    pub fn new<F, Fut>(name: impl Into<String>, classification: SafetyClassification, init: F) -> Self
    where
        F: FnOnce(Dependencies) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Arc<dyn Component>, GatewayError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            classification,
            dependencies: Vec::new(),
            tags: BTreeSet::new(),
            init: Box::new(move |deps| init(deps).boxed()),
        }
    }

    /// Add a required dependency (builder-style).
    pub fn requires(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(Dependency::required(name));
        self
    }

    /// Add an optional dependency (builder-style).
    pub fn optional(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(Dependency::optional(name));
        self
    }

    /// Add a grouping tag (builder-style).
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn classification(&self) -> SafetyClassification {
        self.classification
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }
}

impl fmt::Debug for ComponentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentSpec")
            .field("name", &self.name)
            .field("classification", &self.classification)
            .field("dependencies", &self.dependencies)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a registered component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Declared, not yet constructed.
    Registered,
    /// Constructed and reachable by name.
    Started,
    /// Failed to start but nothing requires it; dependents see an absent
    /// reference.
    Unavailable,
    /// Failed to start and the boot sequence was aborted.
    FailedPermanently,
}

/// Read-only introspection record for one component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentRecord {
    pub name: String,
    pub classification: SafetyClassification,
    pub dependencies: Vec<Dependency>,
    pub tags: BTreeSet<String>,
    pub lifecycle: Lifecycle,
}

/// Already-started dependencies handed to an init function.
///
/// Optional dependencies that failed to start, or were never registered,
/// resolve to `None`.
pub struct Dependencies {
    resolved: BTreeMap<String, Option<Arc<dyn Component>>>,
    broadcaster: StopBroadcaster,
}

impl Dependencies {
    pub(crate) fn new(
        resolved: BTreeMap<String, Option<Arc<dyn Component>>>,
        broadcaster: StopBroadcaster,
    ) -> Self {
        Self {
            resolved,
            broadcaster,
        }
    }

    /// Return the dependency `name` or [`GatewayError::NotFound`] when it is
    /// absent.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Component>, GatewayError> {
        self.optional(name)
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    /// Return the dependency `name` if it is available.
    pub fn optional(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.resolved.get(name).cloned().flatten()
    }

    /// Return the dependency `name` downcast to its concrete type.
    pub fn get_as<T: Component>(&self, name: &str) -> Result<Arc<T>, GatewayError> {
        self.get(name)?
            .as_any()
            .downcast::<T>()
            .map_err(|_| GatewayError::Config(format!("dependency '{name}' has an unexpected type")))
    }

    /// Every available dependency whose concrete type is `T`, by name.
    pub fn all_of<T: Component>(&self) -> Vec<(String, Arc<T>)> {
        self.resolved
            .iter()
            .filter_map(|(name, component)| {
                let typed = component.clone()?.as_any().downcast::<T>().ok()?;
                Some((name.clone(), typed))
            })
            .collect()
    }

    /// `true` when `name` was declared but resolved to an absent reference.
    pub fn is_absent(&self, name: &str) -> bool {
        matches!(self.resolved.get(name), Some(None))
    }

    /// Handle for broadcasting emergency stops to every started component.
    pub fn broadcaster(&self) -> StopBroadcaster {
        self.broadcaster.clone()
    }
}
