//! The contract a read-only data source implementation satisfies.

use serde_json::Value;

use crate::error::ProviderError;
use crate::schema::{Diagnostic, Schema};

/// A read-only lookup.
#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    /// The full type name, conventionally `<provider_type_name>_<suffix>`.
    fn type_name(&self, provider_type_name: &str) -> String;

    /// The schema of this data source.
    fn schema(&self) -> Schema;

    /// Validate a configuration before reading.
    async fn validate_config(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let _ = config;
        Ok(vec![])
    }

    /// Read the data described by `config`.
    async fn read(&self, config: Value) -> Result<Value, ProviderError>;
}
