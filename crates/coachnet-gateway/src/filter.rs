//! [`FrameFilter`] – allow/deny rules on frame identifiers.
//!
//! Rules are evaluated in insertion order; the first rule whose bus and id
//! range match decides. A frame no rule matches gets the default action. A
//! denied frame is a failed write ([`GatewayError::Filtered`]), never a
//! silent drop.

use std::any::Any;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use coachnet_kernel::{Component, ComponentSpec};
use coachnet_types::{BusFrame, GatewayError, HealthReport, SafetyClassification};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::subsystem::{HealthReading, Subsystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterAction {
    #[default]
    Allow,
    Deny,
}

/// One rule. `logical_bus = None` matches every bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    #[serde(default)]
    pub logical_bus: Option<String>,
    pub first_id: u32,
    pub last_id: u32,
    pub action: FilterAction,
}

impl FilterRule {
    pub fn deny(logical_bus: Option<&str>, first_id: u32, last_id: u32) -> Self {
        Self {
            logical_bus: logical_bus.map(str::to_string),
            first_id,
            last_id,
            action: FilterAction::Deny,
        }
    }

    pub fn allow(logical_bus: Option<&str>, first_id: u32, last_id: u32) -> Self {
        Self {
            action: FilterAction::Allow,
            ..Self::deny(logical_bus, first_id, last_id)
        }
    }

    fn matches(&self, frame: &BusFrame) -> bool {
        self.logical_bus
            .as_deref()
            .is_none_or(|bus| bus == frame.logical_bus)
            && (self.first_id..=self.last_id).contains(&frame.id)
    }
}

pub struct FrameFilter {
    rules: RwLock<Vec<FilterRule>>,
    default_action: FilterAction,
    classification: SafetyClassification,
}

impl FrameFilter {
    pub fn new(
        rules: Vec<FilterRule>,
        default_action: FilterAction,
        classification: SafetyClassification,
    ) -> Self {
        Self {
            rules: RwLock::new(rules),
            default_action,
            classification,
        }
    }

    pub fn spec(
        name: &str,
        classification: SafetyClassification,
        rules: Vec<FilterRule>,
        default_action: FilterAction,
    ) -> ComponentSpec {
        ComponentSpec::new(name, classification, move |_deps| async move {
            info!(rules = rules.len(), ?default_action, "frame filter ready");
            Ok(Arc::new(FrameFilter::new(rules, default_action, classification)) as Arc<dyn Component>)
        })
    }

    pub fn add_rule(&self, rule: FilterRule) {
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rule);
    }

    pub fn rules(&self) -> Vec<FilterRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `Err(Filtered)` when `frame` is denied.
    pub fn check(&self, frame: &BusFrame) -> Result<(), GatewayError> {
        let action = self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|rule| rule.matches(frame))
            .map(|rule| rule.action)
            .unwrap_or(self.default_action);
        match action {
            FilterAction::Allow => Ok(()),
            FilterAction::Deny => {
                debug!(logical_bus = %frame.logical_bus, id = frame.id, "frame denied by filter");
                Err(GatewayError::Filtered {
                    logical_bus: frame.logical_bus.clone(),
                    id: frame.id,
                })
            }
        }
    }

    fn report(&self) -> HealthReport {
        HealthReport::healthy().with_detail(json!({ "rules": self.rules().len() }))
    }
}

impl Subsystem for FrameFilter {
    fn kind(&self) -> &'static str {
        "filter"
    }

    fn classification(&self) -> SafetyClassification {
        self.classification
    }

    fn read_health(&self) -> HealthReading {
        HealthReading::Ready(self.report())
    }
}

#[async_trait]
impl Component for FrameFilter {
    async fn health_check(&self) -> HealthReport {
        self.report()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> FrameFilter {
        FrameFilter::new(
            vec![
                FilterRule::allow(Some("chassis"), 0x100, 0x100),
                FilterRule::deny(Some("chassis"), 0x000, 0x7FF),
                FilterRule::deny(None, 0x1FFF_0000, 0x1FFF_FFFF),
            ],
            FilterAction::Allow,
            SafetyClassification::SafetyRelated,
        )
    }

    #[test]
    fn first_matching_rule_decides() {
        let f = filter();
        assert!(f.check(&BusFrame::new("chassis", 0x100, vec![])).is_ok());
        assert!(matches!(
            f.check(&BusFrame::new("chassis", 0x101, vec![])),
            Err(GatewayError::Filtered { id: 0x101, .. })
        ));
        assert!(f.check(&BusFrame::new("house", 0x101, vec![])).is_ok());
    }

    #[test]
    fn bus_wildcard_and_default() {
        let f = filter();
        assert!(f.check(&BusFrame::new("house", 0x1FFF_0001, vec![])).is_err());

        let closed = FrameFilter::new(vec![], FilterAction::Deny, SafetyClassification::Operational);
        assert!(closed.check(&BusFrame::new("house", 1, vec![])).is_err());
        closed.add_rule(FilterRule::allow(Some("house"), 0, 0xFF));
        assert!(closed.check(&BusFrame::new("house", 1, vec![])).is_ok());
        assert_eq!(closed.rules().len(), 1);
    }

    #[test]
    fn rules_deserialize_from_manifest_tables() {
        let rule: FilterRule =
            serde_json::from_value(json!({ "first_id": 1, "last_id": 2, "action": "deny" })).unwrap();
        assert_eq!(rule, FilterRule::deny(None, 1, 2));
    }
}
