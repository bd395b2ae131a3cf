//! Startup manifest – reads `~/.coachnet/manifest.toml`.
//!
//! The manifest is parsed once, before anything is built, into typed
//! records. Environment overrides are applied immediately after parsing and
//! never consulted again.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use coachnet_gateway::FacadeConfig;
use coachnet_kernel::{OperatorAction, PropagatorConfig, StaticAuthorizer};
use coachnet_types::{GatewayError, SafetyClassification};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use zeroize::Zeroizing;

// ─────────────────────────────────────────────────────────────────────────────
// [gateway]
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySettings {
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// SQLite journal for the interlock and the audit trail.
    #[serde(default = "default_state_db")]
    pub state_db: PathBuf,

    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,

    #[serde(default = "default_watchdog_gap_ms")]
    pub watchdog_gap_ms: u64,

    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,

    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,

    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Boot with the interlock engaged when the journal has no history.
    #[serde(default = "default_true")]
    pub require_verification_on_first_boot: bool,
}

fn default_api_port() -> u16 {
    coachnet_api::DEFAULT_PORT
}
fn default_state_db() -> PathBuf {
    coachnet_dir_for_home(&home_dir()).join("state.db")
}
fn default_health_interval_ms() -> u64 {
    5_000
}
fn default_watchdog_gap_ms() -> u64 {
    15_000
}
fn default_health_timeout_ms() -> u64 {
    1_000
}
fn default_start_timeout_ms() -> u64 {
    5_000
}
fn default_stop_timeout_ms() -> u64 {
    250
}
fn default_send_timeout_ms() -> u64 {
    250
}
fn default_true() -> bool {
    true
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            state_db: default_state_db(),
            health_interval_ms: default_health_interval_ms(),
            watchdog_gap_ms: default_watchdog_gap_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            start_timeout_ms: default_start_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            require_verification_on_first_boot: true,
        }
    }
}

impl GatewaySettings {
    pub fn propagator_config(&self) -> PropagatorConfig {
        PropagatorConfig {
            interval: Duration::from_millis(self.health_interval_ms),
            health_timeout: Duration::from_millis(self.health_timeout_ms),
            watchdog_gap: Duration::from_millis(self.watchdog_gap_ms),
        }
    }

    pub fn facade_config(&self) -> FacadeConfig {
        FacadeConfig {
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            health_timeout: Duration::from_millis(self.health_timeout_ms),
            ..FacadeConfig::default()
        }
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.health_interval_ms == 0 {
            return Err(GatewayError::Config("health_interval_ms must be positive".into()));
        }
        if self.watchdog_gap_ms <= self.health_interval_ms {
            return Err(GatewayError::Config(format!(
                "watchdog_gap_ms ({}) must exceed health_interval_ms ({})",
                self.watchdog_gap_ms, self.health_interval_ms
            )));
        }
        if self.send_timeout_ms == 0 || self.stop_timeout_ms == 0 {
            return Err(GatewayError::Config("send and stop timeouts must be positive".into()));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// [[components]]
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    SimTransport,
    Injector,
    Filter,
    Recorder,
    BusOperations,
    Device,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentEntry {
    pub name: String,
    pub kind: ComponentKind,
    pub classification: SafetyClassification,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Kind-specific table, decoded by the catalog.
    #[serde(default)]
    pub params: toml::Table,
}

impl ComponentEntry {
    /// Decode `params` into the kind's parameter struct.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        toml::Value::Table(self.params.clone())
            .try_into()
            .map_err(|e| GatewayError::Config(format!("component '{}': invalid params: {e}", self.name)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// [[operators]]
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperatorEntry {
    pub id: String,
    #[serde(deserialize_with = "zeroizing")]
    pub token: Zeroizing<String>,
    #[serde(default)]
    pub actions: Vec<OperatorAction>,
}

fn zeroizing<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Zeroizing<String>, D::Error> {
    String::deserialize(deserializer).map(Zeroizing::new)
}

impl fmt::Debug for OperatorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorEntry")
            .field("id", &self.id)
            .field("token", &"<redacted>")
            .field("actions", &self.actions)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manifest
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub components: Vec<ComponentEntry>,
    #[serde(default)]
    pub operators: Vec<OperatorEntry>,
}

impl Manifest {
    /// Parse and validate a manifest. No environment overrides.
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let manifest: Manifest =
            toml::from_str(raw).map_err(|e| GatewayError::Config(format!("invalid manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        self.gateway.validate()?;

        let mut names = BTreeSet::new();
        for entry in &self.components {
            if !names.insert(entry.name.as_str()) {
                return Err(GatewayError::DuplicateName(entry.name.clone()));
            }
        }
        let facades = self
            .components
            .iter()
            .filter(|c| c.kind == ComponentKind::BusOperations)
            .count();
        if facades != 1 {
            return Err(GatewayError::Config(format!(
                "exactly one bus_operations component is required, found {facades}"
            )));
        }

        let mut operators = BTreeSet::new();
        for operator in &self.operators {
            if operator.token.is_empty() {
                return Err(GatewayError::Config(format!("operator '{}' has an empty token", operator.id)));
            }
            if !operators.insert(operator.id.as_str()) {
                return Err(GatewayError::Config(format!("operator '{}' is listed twice", operator.id)));
            }
        }
        Ok(())
    }

    /// Name of the single `bus_operations` component.
    pub fn facade_name(&self) -> Option<&str> {
        self.components
            .iter()
            .find(|c| c.kind == ComponentKind::BusOperations)
            .map(|c| c.name.as_str())
    }

    /// Grant table built from `[[operators]]`.
    pub fn authorizer(&self) -> StaticAuthorizer {
        let mut authorizer = StaticAuthorizer::new();
        for operator in &self.operators {
            authorizer.grant(&operator.id, &operator.token, operator.actions.iter().copied());
        }
        authorizer
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Location & loading
// ─────────────────────────────────────────────────────────────────────────────

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

pub(crate) fn coachnet_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".coachnet")
}

/// The manifest given on the command line or in `COACHNET_MANIFEST`, else
/// `~/.coachnet/manifest.toml`.
pub fn manifest_path(given: Option<PathBuf>) -> PathBuf {
    given.unwrap_or_else(|| coachnet_dir_for_home(&home_dir()).join("manifest.toml"))
}

/// Read, parse, override from the environment and validate.
pub fn load_from(path: &Path) -> Result<Manifest, GatewayError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        GatewayError::Config(format!("cannot read manifest at {}: {e}", path.display()))
    })?;
    let mut manifest = Manifest::parse(&raw)?;
    apply_env_overrides(&mut manifest);
    manifest.gateway.validate()?;
    Ok(manifest)
}

/// Apply `COACHNET_*` environment overrides.
///
/// | Variable | Field |
/// |---|---|
/// | `COACHNET_API_PORT` | `gateway.api_port` |
/// | `COACHNET_STATE_DB` | `gateway.state_db` |
/// | `COACHNET_HEALTH_INTERVAL_MS` | `gateway.health_interval_ms` |
pub fn apply_env_overrides(manifest: &mut Manifest) {
    apply_overrides(manifest, |key| std::env::var(key).ok());
}

/// Overrides from an arbitrary lookup. Unparseable values are ignored.
pub(crate) fn apply_overrides(manifest: &mut Manifest, var: impl Fn(&str) -> Option<String>) {
    let gateway = &mut manifest.gateway;
    if let Some(port) = var("COACHNET_API_PORT").and_then(|v| v.parse().ok()) {
        gateway.api_port = port;
    }
    if let Some(path) = var("COACHNET_STATE_DB") {
        gateway.state_db = PathBuf::from(path);
    }
    if let Some(ms) = var("COACHNET_HEALTH_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        gateway.health_interval_ms = ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
        [gateway]
        api_port = 9000

        [[components]]
        name = "house_bus"
        kind = "sim_transport"
        classification = "critical"
        params = { logical_bus = "house" }

        [[components]]
        name = "bus"
        kind = "bus_operations"
        classification = "critical"
        requires = ["house_bus"]

        [[operators]]
        id = "tech-1"
        token = "4711"
        actions = ["reset_interlock"]
    "#;

    #[test]
    fn parses_typed_records_with_defaults() {
        let manifest = Manifest::parse(MINIMAL).unwrap();
        assert_eq!(manifest.gateway.api_port, 9000);
        assert_eq!(manifest.gateway.health_interval_ms, 5_000);
        assert!(manifest.gateway.require_verification_on_first_boot);
        assert_eq!(manifest.components.len(), 2);
        assert_eq!(manifest.components[0].kind, ComponentKind::SimTransport);
        assert_eq!(manifest.components[1].requires, vec!["house_bus".to_string()]);
        assert_eq!(manifest.facade_name(), Some("bus"));
    }

    #[test]
    fn unknown_kind_or_classification_fails() {
        let bad_kind = MINIMAL.replace("\"sim_transport\"", "\"warp_drive\"");
        assert!(matches!(Manifest::parse(&bad_kind), Err(GatewayError::Config(_))));
        let bad_class = MINIMAL.replacen("\"critical\"", "\"important\"", 1);
        assert!(matches!(Manifest::parse(&bad_class), Err(GatewayError::Config(_))));
    }

    #[test]
    fn duplicate_component_names_fail() {
        let raw = MINIMAL.replace(
            "[[operators]]",
            "[[components]]\nname = \"bus\"\nkind = \"recorder\"\nclassification = \"maintenance\"\n\n[[operators]]",
        );
        assert_eq!(
            Manifest::parse(&raw).unwrap_err(),
            GatewayError::DuplicateName("bus".into())
        );
    }

    #[test]
    fn exactly_one_facade_is_required() {
        let raw = MINIMAL.replace("\"bus_operations\"", "\"recorder\"");
        assert!(matches!(Manifest::parse(&raw), Err(GatewayError::Config(_))));
    }

    #[test]
    fn watchdog_gap_must_exceed_interval() {
        let raw = MINIMAL.replace("api_port = 9000", "health_interval_ms = 20000");
        assert!(matches!(Manifest::parse(&raw), Err(GatewayError::Config(_))));
    }

    #[test]
    fn operator_tokens_are_redacted_and_granted() {
        let manifest = Manifest::parse(MINIMAL).unwrap();
        let debug = format!("{:?}", manifest.operators[0]);
        assert!(!debug.contains("4711"));
        assert!(debug.contains("<redacted>"));

        use coachnet_kernel::Authorizer;
        let auth = manifest.authorizer();
        assert!(auth.authorize("tech-1", "4711", OperatorAction::ResetInterlock).authorized);
        assert!(!auth.authorize("tech-1", "4711", OperatorAction::OverrideState).authorized);
    }

    #[test]
    fn overrides_apply_and_ignore_garbage() {
        let mut manifest = Manifest::parse(MINIMAL).unwrap();
        let vars: HashMap<&str, &str> = [
            ("COACHNET_API_PORT", "not-a-port"),
            ("COACHNET_STATE_DB", "/var/lib/coachnet/state.db"),
            ("COACHNET_HEALTH_INTERVAL_MS", "2500"),
        ]
        .into_iter()
        .collect();
        apply_overrides(&mut manifest, |key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(manifest.gateway.api_port, 9000);
        assert_eq!(manifest.gateway.state_db, PathBuf::from("/var/lib/coachnet/state.db"));
        assert_eq!(manifest.gateway.health_interval_ms, 2500);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("manifest.toml");
        fs::write(&path, MINIMAL).unwrap();
        let manifest = load_from(&path).unwrap();
        assert_eq!(manifest.components.len(), 2);

        let missing = load_from(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(GatewayError::Config(_))));
    }

    #[test]
    fn explicit_path_wins() {
        let explicit = PathBuf::from("/etc/coachnet/manifest.toml");
        assert_eq!(manifest_path(Some(explicit.clone())), explicit);
        assert!(manifest_path(None).ends_with(".coachnet/manifest.toml"));
        assert!(coachnet_dir_for_home("/home/owner").ends_with(".coachnet"));
    }
}
