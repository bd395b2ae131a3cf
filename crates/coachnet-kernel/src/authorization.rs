//! Operator authorization gate.
//!
//! The core never authenticates anyone. It asks an [`Authorizer`] whether an
//! operator may perform an [`OperatorAction`] and consumes the resulting
//! [`OperatorAuthorization`]: a yes/no verdict plus the identity written to
//! the audit trail.
//!
//! [`StaticAuthorizer`] is the default implementation: a grant table loaded
//! from the startup manifest, with tokens kept in zeroizing buffers.

use std::collections::{HashMap, HashSet};
use std::fmt;

use coachnet_types::OperatorAuthorization;
use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroizing;

/// Privileged operations an operator can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorAction {
    /// Clear the emergency-stop interlock after physical verification.
    ResetInterlock,
    /// Move a component to `safe_shutdown` / `maintenance` or re-arm it.
    OverrideState,
}

/// Produces an authorization verdict for an operator request.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, operator: &str, token: &str, action: OperatorAction) -> OperatorAuthorization;
}

struct Grant {
    token: Zeroizing<String>,
    actions: HashSet<OperatorAction>,
}

/// Grant table keyed by operator id.
///
/// # Example
///
/// ```
/// use coachnet_kernel::authorization::{Authorizer, OperatorAction, StaticAuthorizer};
///
/// let mut auth = StaticAuthorizer::new();
/// auth.grant("tech-1", "4711", [OperatorAction::ResetInterlock]);
///
/// assert!(auth.authorize("tech-1", "4711", OperatorAction::ResetInterlock).authorized);
/// assert!(!auth.authorize("tech-1", "4711", OperatorAction::OverrideState).authorized);
/// ```
#[derive(Default)]
pub struct StaticAuthorizer {
    grants: HashMap<String, Grant>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `actions` to `operator`, authenticated by `token`. Re-granting
    /// replaces the token and adds the actions.
    pub fn grant(
        &mut self,
        operator: &str,
        token: &str,
        actions: impl IntoIterator<Item = OperatorAction>,
    ) {
        let grant = self.grants.entry(operator.to_string()).or_insert_with(|| Grant {
            token: Zeroizing::new(String::new()),
            actions: HashSet::new(),
        });
        grant.token = Zeroizing::new(token.to_string());
        grant.actions.extend(actions);
    }

    /// Remove `action` from `operator`. No-op if absent.
    pub fn revoke(&mut self, operator: &str, action: OperatorAction) {
        if let Some(grant) = self.grants.get_mut(operator) {
            grant.actions.remove(&action);
        }
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

impl fmt::Debug for StaticAuthorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut operators: Vec<&String> = self.grants.keys().collect();
        operators.sort();
        f.debug_struct("StaticAuthorizer")
            .field("operators", &operators)
            .field("tokens", &"[redacted]")
            .finish()
    }
}

impl Authorizer for StaticAuthorizer {
    fn authorize(&self, operator: &str, token: &str, action: OperatorAction) -> OperatorAuthorization {
        let allowed = self.grants.get(operator).is_some_and(|grant| {
            constant_time_eq(grant.token.as_bytes(), token.as_bytes())
                && grant.actions.contains(&action)
        });
        if allowed {
            OperatorAuthorization::granted(operator)
        } else {
            warn!(%operator, ?action, "operator authorization denied");
            OperatorAuthorization::denied(operator)
        }
    }
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
