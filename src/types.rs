//! Convenience types and protocol constants.
//!
//! These types provide a more ergonomic API over the raw protobuf types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::Schema;

/// A change to a single attribute during a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// The path to the attribute that changed.
    pub path: String,
    /// The value before the change (None if creating).
    pub before: Option<Value>,
    /// The value after the change (None if deleting).
    pub after: Option<Value>,
}

impl AttributeChange {
    /// Create a new attribute change.
    pub fn new(path: impl Into<String>, before: Option<Value>, after: Option<Value>) -> Self {
        Self {
            path: path.into(),
            before,
            after,
        }
    }
}

impl From<AttributeChange> for crate::generated::AttributeChange {
    fn from(change: AttributeChange) -> Self {
        let encode = |v: Option<Value>| {
            v.map(|v| serde_json::to_vec(&v).unwrap_or_default())
                .unwrap_or_default()
        };
        Self {
            path: change.path,
            before: encode(change.before),
            after: encode(change.after),
        }
    }
}

/// The result of a plan operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    /// The planned state after the operation.
    pub planned_state: Value,
    /// The list of attribute changes.
    pub changes: Vec<AttributeChange>,
    /// Whether the resource requires replacement.
    pub requires_replace: bool,
}

impl PlanResult {
    /// Create a plan result with no changes.
    pub fn no_change(state: Value) -> Self {
        Self {
            planned_state: state,
            changes: Vec::new(),
            requires_replace: false,
        }
    }

    /// Diff two top-level states.
    ///
    /// `prior_state` is `None` for a create; a `Null` proposed state is a
    /// destroy. A changed attribute declared `force_new` in `schema` makes the
    /// plan a replacement, except for creates and destroys.
    pub fn diff(prior_state: Option<&Value>, proposed_state: Value, schema: &Schema) -> Self {
        let empty = serde_json::Map::new();
        let before = prior_state.and_then(Value::as_object).unwrap_or(&empty);
        let after = proposed_state.as_object().unwrap_or(&empty);

        let mut changes = Vec::new();
        for (key, old) in before {
            match after.get(key) {
                Some(new) if new == old => {}
                new => changes.push(AttributeChange::new(key, Some(old.clone()), new.cloned())),
            }
        }
        for (key, new) in after {
            if !before.contains_key(key) {
                changes.push(AttributeChange::new(key, None, Some(new.clone())));
            }
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));

        let is_update = prior_state.is_some() && !proposed_state.is_null();
        let requires_replace = is_update
            && changes
                .iter()
                .any(|c| c.before.is_some() && schema.forces_new(&c.path));

        Self {
            planned_state: proposed_state,
            changes,
            requires_replace,
        }
    }
}

/// An imported resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedResource {
    /// The resource type.
    pub resource_type: String,
    /// The imported state.
    pub state: Value,
}

impl ImportedResource {
    /// Create a new imported resource.
    pub fn new(resource_type: impl Into<String>, state: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            state,
        }
    }
}

/// Provider metadata returned by GetMetadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderMetadata {
    /// Resource type names, in registration order.
    pub resources: Vec<String>,
    /// Data source type names, in registration order.
    pub data_sources: Vec<String>,
    /// Server capabilities.
    pub capabilities: ServerCapabilities,
}

/// Server capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServerCapabilities {
    /// Whether the provider supports planning destroy operations.
    pub plan_destroy: bool,
}

/// The type name of this provider, also the prefix of every resource type.
pub const PROVIDER_NAME: &str = "puppetca";

/// The provider version.
pub const PROVIDER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Registry namespace the provider address is published under.
pub const ADDRESS_NAMESPACE: &str = "registry.hemmer.io/camptocamp";

/// The protocol version for the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// The handshake prefix output by providers.
pub const HANDSHAKE_PREFIX: &str = "HEMMER_PROVIDER";

/// Environment variable the host sets before launching a plugin.
pub const MAGIC_COOKIE_KEY: &str = "HEMMER_PLUGIN_MAGIC_COOKIE";

/// Value the host stores in [`MAGIC_COOKIE_KEY`].
pub const MAGIC_COOKIE_VALUE: &str =
    "d602bf8f470bc67ca7faa0386276bbdd4330efaf76d1a219cb4d6991ca9872b2";

/// Environment variable a user exports to point the host at a debug-mode plugin.
pub const REATTACH_ENV: &str = "HEMMER_REATTACH_PROVIDERS";

/// The registry address for a provider name.
pub fn provider_address(name: &str) -> String {
    format!("{}/{}", ADDRESS_NAMESPACE, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attribute;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::v0()
            .with_attribute("name", Attribute::required_string().with_force_new())
            .with_attribute("ttl", Attribute::optional_string())
    }

    #[test]
    fn test_diff_create() {
        let plan = PlanResult::diff(None, json!({"name": "node1", "ttl": "1d"}), &schema());
        assert_eq!(plan.changes.len(), 2);
        assert!(plan.changes.iter().all(|c| c.before.is_none()));
        assert!(!plan.requires_replace);
    }

    #[test]
    fn test_diff_update_in_place() {
        let prior = json!({"name": "node1", "ttl": "1d"});
        let plan = PlanResult::diff(Some(&prior), json!({"name": "node1", "ttl": "2d"}), &schema());
        assert_eq!(
            plan.changes,
            vec![AttributeChange::new("ttl", Some(json!("1d")), Some(json!("2d")))]
        );
        assert!(!plan.requires_replace);
    }

    #[test]
    fn test_diff_force_new_requires_replace() {
        let prior = json!({"name": "node1"});
        let plan = PlanResult::diff(Some(&prior), json!({"name": "node2"}), &schema());
        assert!(plan.requires_replace);
    }

    #[test]
    fn test_diff_destroy() {
        let prior = json!({"name": "node1"});
        let plan = PlanResult::diff(Some(&prior), Value::Null, &schema());
        assert_eq!(plan.changes.len(), 1);
        assert!(plan.changes[0].after.is_none());
        assert!(!plan.requires_replace);
    }

    #[test]
    fn test_diff_no_change() {
        let prior = json!({"name": "node1"});
        let plan = PlanResult::diff(Some(&prior), prior.clone(), &schema());
        assert!(plan.changes.is_empty());
    }

    #[test]
    fn test_attribute_change_to_proto() {
        let change = AttributeChange::new("ttl", None, Some(json!("1d")));
        let proto: crate::generated::AttributeChange = change.into();
        assert_eq!(proto.path, "ttl");
        assert!(proto.before.is_empty());
        assert_eq!(proto.after, br#""1d""#.to_vec());
    }

    #[test]
    fn test_provider_address() {
        assert_eq!(
            provider_address(PROVIDER_NAME),
            "registry.hemmer.io/camptocamp/puppetca"
        );
        assert_eq!(HANDSHAKE_PREFIX, "HEMMER_PROVIDER");
        assert_eq!(PROTOCOL_VERSION, 1);
    }
}
