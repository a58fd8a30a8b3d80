//! The contract a managed resource implementation satisfies.
//!
//! Instances are built by a registered constructor from the shared
//! [`Provider`](crate::provider::Provider) and live for a single host request.

use serde_json::Value;

use crate::error::ProviderError;
use crate::schema::{Diagnostic, Schema};
use crate::types::PlanResult;

/// A resource managed through create/read/update/delete.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use hemmer_provider_puppetca::{Provider, ProviderError, Resource};
/// use hemmer_provider_puppetca::schema::{Attribute, Schema};
///
/// struct Certificate {
///     provider: Arc<Provider>,
/// }
///
/// fn new_certificate(provider: Arc<Provider>) -> Box<dyn Resource> {
///     Box::new(Certificate { provider })
/// }
///
/// #[async_trait::async_trait]
/// impl Resource for Certificate {
///     fn type_name(&self, provider_type_name: &str) -> String {
///         format!("{provider_type_name}_certificate")
///     }
///
///     fn schema(&self) -> Schema {
///         Schema::v0().with_attribute("name", Attribute::required_string().with_force_new())
///     }
///
///     // ... create, read, update, delete
/// }
/// ```
#[async_trait::async_trait]
pub trait Resource: Send + Sync {
    /// The full type name, conventionally `<provider_type_name>_<suffix>`.
    fn type_name(&self, provider_type_name: &str) -> String;

    /// The schema of this resource.
    fn schema(&self) -> Schema;

    /// Validate a configuration before planning.
    async fn validate_config(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let _ = config;
        Ok(vec![])
    }

    /// Upgrade state written by an older schema version.
    async fn upgrade_state(&self, version: i64, state: Value) -> Result<Value, ProviderError> {
        let _ = version;
        Ok(state)
    }

    /// Plan changes. The default diffs top-level attributes against the schema.
    async fn plan(
        &self,
        prior_state: Option<Value>,
        proposed_state: Value,
        config: Value,
    ) -> Result<PlanResult, ProviderError> {
        let _ = config;
        Ok(PlanResult::diff(
            prior_state.as_ref(),
            proposed_state,
            &self.schema(),
        ))
    }

    /// Create the resource and return its state.
    async fn create(&self, planned_state: Value) -> Result<Value, ProviderError>;

    /// Refresh the resource state.
    async fn read(&self, current_state: Value) -> Result<Value, ProviderError>;

    /// Update the resource in place and return its new state.
    async fn update(&self, prior_state: Value, planned_state: Value)
        -> Result<Value, ProviderError>;

    /// Delete the resource.
    async fn delete(&self, current_state: Value) -> Result<(), ProviderError>;

    /// Build state for existing infrastructure identified by `id`.
    async fn import_state(&self, id: &str) -> Result<Value, ProviderError> {
        Err(ProviderError::Unimplemented(format!(
            "import is not supported (id: {})",
            id
        )))
    }
}
