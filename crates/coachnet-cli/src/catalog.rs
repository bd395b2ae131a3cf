//! Component catalog – turns manifest entries into registry declarations.

use std::sync::Arc;
use std::time::Duration;

use coachnet_gateway::{
    BusOperations, FacadeParts, FilterAction, FilterRule, FrameFilter, FrameInjector, FrameRecorder,
    SimTransport, TransportComponent, injector, recorder,
};
use coachnet_hal::{DeviceController, DeviceKind, SimDevices};
use coachnet_kernel::{ComponentSpec, Registry};
use coachnet_types::GatewayError;
use serde::Deserialize;

use crate::manifest::{ComponentEntry, ComponentKind, Manifest};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransportParams {
    /// Defaults to the component name.
    #[serde(default)]
    logical_bus: Option<String>,
    #[serde(default)]
    latency_ms: u64,
    #[serde(default = "yes")]
    extended_ids: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InjectorParams {
    #[serde(default = "default_frames_per_second")]
    frames_per_second: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilterParams {
    #[serde(default)]
    default_action: FilterAction,
    #[serde(default)]
    rules: Vec<FilterRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecorderParams {
    #[serde(default = "default_capacity")]
    capacity: usize,
    #[serde(default = "yes")]
    autostart: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceParams {
    device: DeviceKind,
}

fn yes() -> bool {
    true
}
fn default_frames_per_second() -> u32 {
    injector::DEFAULT_FRAMES_PER_SECOND
}
fn default_capacity() -> usize {
    recorder::DEFAULT_CAPACITY
}

/// Build a registry holding every manifest component, validated but not
/// started. `parts` goes to the single `bus_operations` entry.
pub fn build_registry(manifest: &Manifest, parts: FacadeParts) -> Result<Registry, GatewayError> {
    let gateway = &manifest.gateway;
    let mut registry = Registry::new()
        .with_start_timeout(Duration::from_millis(gateway.start_timeout_ms))
        .with_stop_timeout(Duration::from_millis(gateway.stop_timeout_ms));

    let mut parts = Some(parts);
    for entry in &manifest.components {
        registry.register(declare(entry, &mut parts)?)?;
    }
    registry.validate()?;
    Ok(registry)
}

fn declare(entry: &ComponentEntry, parts: &mut Option<FacadeParts>) -> Result<ComponentSpec, GatewayError> {
    let name = entry.name.as_str();
    let class = entry.classification;
    let spec = match entry.kind {
        ComponentKind::SimTransport => {
            let p: TransportParams = entry.params()?;
            let transport = SimTransport::new(p.logical_bus.unwrap_or_else(|| name.to_string()))
                .with_latency(Duration::from_millis(p.latency_ms))
                .with_extended_ids(p.extended_ids);
            TransportComponent::spec(name, class, Arc::new(transport))
        }
        ComponentKind::Injector => {
            let p: InjectorParams = entry.params()?;
            FrameInjector::spec(name, class, p.frames_per_second)
        }
        ComponentKind::Filter => {
            let p: FilterParams = entry.params()?;
            FrameFilter::spec(name, class, p.rules, p.default_action)
        }
        ComponentKind::Recorder => {
            let p: RecorderParams = entry.params()?;
            FrameRecorder::spec(name, class, p.capacity, p.autostart)
        }
        ComponentKind::BusOperations => {
            let parts = parts.take().ok_or_else(|| {
                GatewayError::Config("only one bus_operations component is supported".into())
            })?;
            BusOperations::spec(name, class, parts)
        }
        ComponentKind::Device => {
            let p: DeviceParams = entry.params()?;
            let device = SimDevices::for_kind(p.device).build(name, p.device, class);
            DeviceController::spec(Arc::new(device))
        }
    };

    let spec = entry.requires.iter().fold(spec, |spec, dep| spec.requires(dep.as_str()));
    let spec = entry.optional.iter().fold(spec, |spec, dep| spec.optional(dep.as_str()));
    Ok(entry.tags.iter().fold(spec, |spec, tag| spec.tag(tag.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coachnet_gateway::FacadeConfig;
    use coachnet_middleware::EventBus;

    const EXAMPLE: &str = include_str!("../../../config/coachnet.example.toml");

    fn parts() -> FacadeParts {
        FacadeParts {
            restored: None,
            store: None,
            events: EventBus::default(),
            config: FacadeConfig::default(),
        }
    }

    #[tokio::test]
    async fn example_manifest_boots() {
        let manifest = Manifest::parse(EXAMPLE).unwrap();
        let mut registry = build_registry(&manifest, parts()).unwrap();
        let report = registry.start_all().await.unwrap();
        assert!(report.unavailable.is_empty());
        assert_eq!(report.stages[0].len(), 5);

        let facade = registry.get_as::<BusOperations>("bus").unwrap();
        assert_eq!(facade.logical_buses(), vec!["chassis".to_string(), "house".to_string()]);
        assert!(facade.send("house", 0x100, vec![1]).await.is_ok());
        assert!(matches!(
            facade.send("chassis", 0x0CF00410, vec![]).await,
            Err(GatewayError::Filtered { .. })
        ));
        assert!(facade.recorder().is_some());

        let slides = registry.get_as::<DeviceController>("slides").unwrap();
        assert_eq!(slides.kind(), DeviceKind::Slides);
        assert_eq!(registry.tagged("comfort"), vec!["lighting".to_string()]);
    }

    #[test]
    fn bad_params_are_config_errors() {
        let raw = EXAMPLE.replace("capacity = 4096", "capacity = \"lots\"");
        let manifest = Manifest::parse(&raw).unwrap();
        assert!(matches!(
            build_registry(&manifest, parts()),
            Err(GatewayError::Config(msg)) if msg.contains("recorder")
        ));

        let raw = EXAMPLE.replace("device = \"awnings\"", "device = \"hot_tub\"");
        let manifest = Manifest::parse(&raw).unwrap();
        assert!(matches!(build_registry(&manifest, parts()), Err(GatewayError::Config(_))));
    }

    #[test]
    fn unknown_dependency_fails_before_boot() {
        let raw = EXAMPLE.replace("requires = [\"bus\", \"brakes\"]\nparams = { device = \"slides\" }",
            "requires = [\"bus\", \"parking_brake\"]\nparams = { device = \"slides\" }");
        let manifest = Manifest::parse(&raw).unwrap();
        assert!(matches!(
            build_registry(&manifest, parts()),
            Err(GatewayError::UnknownDependency { .. })
        ));
    }
}
