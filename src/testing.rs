//! Testing utilities for the provider factory.
//!
//! [`FactoryTester`] drives a [`ProviderFactory`] through the same
//! [`ProviderService`] calls the gRPC layer makes, without a server.
//!
//! # Example
//!
//! ```ignore
//! use hemmer_provider_puppetca::testing::FactoryTester;
//! use serde_json::json;
//!
//! #[tokio::test]
//! async fn test_create_certificate() {
//!     let tester = FactoryTester::new(new_factory("puppetca", "test", data_sources(), resources()));
//!     tester.configure(json!({"url": "https://puppet:8140"})).await.unwrap();
//!
//!     let state = tester
//!         .lifecycle_create("puppetca_certificate", json!({"name": "node1"}))
//!         .await
//!         .unwrap();
//!     assert_eq!(state["name"], "node1");
//! }
//! ```

use serde_json::Value;

use crate::error::ProviderError;
use crate::factory::ProviderFactory;
use crate::schema::{Diagnostic, ProviderSchema};
use crate::server::ProviderService;
use crate::types::PlanResult;

/// A test harness around a [`ProviderFactory`].
pub struct FactoryTester {
    factory: ProviderFactory,
}

impl FactoryTester {
    /// Wrap a factory.
    pub fn new(factory: ProviderFactory) -> Self {
        Self { factory }
    }

    /// The wrapped factory.
    pub fn factory(&self) -> &ProviderFactory {
        &self.factory
    }

    /// The full schema, as GetSchema would report it.
    pub fn schema(&self) -> Result<ProviderSchema, ProviderError> {
        self.factory.schema()
    }

    /// Resource type names in registration order.
    pub fn resource_types(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.factory.metadata()?.resources)
    }

    /// Data source type names in registration order.
    pub fn data_source_types(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.factory.metadata()?.data_sources)
    }

    /// Configure the shared provider; error diagnostics become `Err`.
    pub async fn configure(&self, config: Value) -> Result<(), TestError> {
        let diagnostics = self.factory.configure(config).await?;
        check_diagnostics(diagnostics)
    }

    /// Validate a resource configuration; error diagnostics become `Err`.
    pub async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<(), TestError> {
        let diagnostics = self
            .factory
            .validate_resource_config(resource_type, config)
            .await?;
        check_diagnostics(diagnostics)
    }

    /// Plan a create.
    pub async fn plan_create(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.factory
            .plan(resource_type, None, config.clone(), config)
            .await
    }

    /// Plan an update from `prior_state`.
    pub async fn plan_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.factory
            .plan(
                resource_type,
                Some(prior_state),
                proposed_state.clone(),
                proposed_state,
            )
            .await
    }

    /// Create a resource.
    pub async fn create(
        &self,
        resource_type: &str,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        self.factory.create(resource_type, planned_state).await
    }

    /// Read a resource.
    pub async fn read(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<Value, ProviderError> {
        self.factory.read(resource_type, current_state).await
    }

    /// Delete a resource.
    pub async fn delete(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<(), ProviderError> {
        self.factory.delete(resource_type, current_state).await
    }

    /// Read a data source.
    pub async fn read_data_source(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError> {
        self.factory
            .read_data_source(data_source_type, config)
            .await
    }

    /// Plan, create, then read back. Returns the state after read.
    pub async fn lifecycle_create(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError> {
        let plan = self.plan_create(resource_type, config).await?;
        let created = self.create(resource_type, plan.planned_state).await?;
        self.read(resource_type, created).await
    }

    /// Plan, update, then read back. Returns the state after read.
    pub async fn lifecycle_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<Value, ProviderError> {
        let plan = self
            .plan_update(resource_type, prior_state.clone(), proposed_state)
            .await?;
        let updated = self
            .factory
            .update(resource_type, prior_state, plan.planned_state)
            .await?;
        self.read(resource_type, updated).await
    }
}

/// Error type for test operations that may fail with diagnostics.
#[derive(Debug)]
pub enum TestError {
    /// The operation returned error diagnostics.
    Diagnostics(Vec<Diagnostic>),
    /// The operation failed with a provider error.
    Provider(ProviderError),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Diagnostics(diags) => {
                writeln!(f, "Operation failed with {} diagnostic(s):", diags.len())?;
                for diag in diags {
                    write!(f, "  [{:?}] {}", diag.severity, diag.summary)?;
                    if let Some(detail) = &diag.detail {
                        write!(f, ": {}", detail)?;
                    }
                    if let Some(attr) = &diag.attribute {
                        write!(f, " (at {})", attr)?;
                    }
                    writeln!(f)?;
                }
                Ok(())
            }
            TestError::Provider(e) => write!(f, "Provider error: {}", e),
        }
    }
}

impl std::error::Error for TestError {}

impl From<ProviderError> for TestError {
    fn from(e: ProviderError) -> Self {
        TestError::Provider(e)
    }
}

fn check_diagnostics(diagnostics: Vec<Diagnostic>) -> Result<(), TestError> {
    let errors: Vec<_> = diagnostics.into_iter().filter(Diagnostic::is_error).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(TestError::Diagnostics(errors))
    }
}

/// Assert that a plan replaces the resource.
///
/// # Panics
///
/// Panics if the plan does not require replacement.
pub fn assert_plan_replaces(plan: &PlanResult) {
    assert!(
        plan.requires_replace,
        "Expected plan to require replacement, changes: {:?}",
        plan.changes
    );
}

/// Assert that a plan touches `path`.
///
/// # Panics
///
/// Panics if no change has that path.
pub fn assert_plan_changes_attribute(plan: &PlanResult, path: &str) {
    assert!(
        plan.changes.iter().any(|c| c.path == path),
        "Expected plan to change attribute '{}', but changes were: {:?}",
        path,
        plan.changes.iter().map(|c| &c.path).collect::<Vec<_>>()
    );
}

/// Assert that `types` lists exactly `expected`, in order.
///
/// # Panics
///
/// Panics on any difference.
pub fn assert_type_names(types: &[String], expected: &[&str]) {
    let actual: Vec<&str> = types.iter().map(String::as_str).collect();
    assert_eq!(actual, expected, "Unexpected registered type names");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::DataSource;
    use crate::factory::new_factory;
    use crate::provider::Provider;
    use crate::registry::{DataSourceRegistry, Registry, ResourceRegistry};
    use crate::resource::Resource;
    use crate::schema::{Attribute, Schema};
    use serde_json::json;
    use std::sync::Arc;

    struct Certificate {
        provider: Arc<Provider>,
    }

    #[async_trait::async_trait]
    impl Resource for Certificate {
        fn type_name(&self, provider_type_name: &str) -> String {
            format!("{}_certificate", provider_type_name)
        }

        fn schema(&self) -> Schema {
            Schema::v0()
                .with_attribute("name", Attribute::required_string().with_force_new())
                .with_attribute("env", Attribute::optional_string())
        }

        async fn validate_config(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
            if config.get("name").and_then(Value::as_str).is_none() {
                return Ok(vec![Diagnostic::error("name is required").with_attribute("name")]);
            }
            Ok(vec![])
        }

        async fn create(&self, planned_state: Value) -> Result<Value, ProviderError> {
            let config: Value = self.provider.typed_config().await?;
            let mut state = planned_state;
            state["url"] = config["url"].clone();
            Ok(state)
        }

        async fn read(&self, current_state: Value) -> Result<Value, ProviderError> {
            Ok(current_state)
        }

        async fn update(&self, _prior: Value, planned: Value) -> Result<Value, ProviderError> {
            Ok(planned)
        }

        async fn delete(&self, _current_state: Value) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    struct Environment;

    #[async_trait::async_trait]
    impl DataSource for Environment {
        fn type_name(&self, provider_type_name: &str) -> String {
            format!("{}_environment", provider_type_name)
        }

        fn schema(&self) -> Schema {
            Schema::v0().with_attribute("name", Attribute::required_string())
        }

        async fn read(&self, config: Value) -> Result<Value, ProviderError> {
            Ok(json!({"name": config["name"], "exists": true}))
        }
    }

    fn new_certificate(provider: Arc<Provider>) -> Box<dyn Resource> {
        Box::new(Certificate { provider })
    }

    fn new_environment(_: Arc<Provider>) -> Box<dyn DataSource> {
        Box::new(Environment)
    }

    fn tester() -> FactoryTester {
        FactoryTester::new(new_factory(
            "puppetca",
            "test",
            DataSourceRegistry::builder().register(new_environment).build(),
            ResourceRegistry::builder().register(new_certificate).build(),
        ))
    }

    #[test]
    fn test_type_names() {
        let tester = tester();
        assert_type_names(&tester.resource_types().unwrap(), &["puppetca_certificate"]);
        assert_type_names(&tester.data_source_types().unwrap(), &["puppetca_environment"]);
    }

    #[test]
    fn test_empty_factory() {
        let tester = FactoryTester::new(new_factory(
            "puppetca",
            "test",
            Registry::empty(),
            Registry::empty(),
        ));
        assert!(tester.resource_types().unwrap().is_empty());
        assert!(tester.schema().unwrap().resources.is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_after_configure() {
        let tester = tester();
        tester
            .configure(json!({"url": "https://puppet:8140"}))
            .await
            .unwrap();

        let state = tester
            .lifecycle_create("puppetca_certificate", json!({"name": "node1"}))
            .await
            .unwrap();
        assert_eq!(state["url"], "https://puppet:8140");

        let state = tester
            .lifecycle_update("puppetca_certificate", state, json!({"name": "node1", "env": "prod"}))
            .await
            .unwrap();
        assert_eq!(state["env"], "prod");

        tester.delete("puppetca_certificate", state).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_before_configure_fails() {
        let err = tester()
            .create("puppetca_certificate", json!({"name": "node1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_plan_helpers() {
        let tester = tester();
        let plan = tester
            .plan_update(
                "puppetca_certificate",
                json!({"name": "node1"}),
                json!({"name": "node2"}),
            )
            .await
            .unwrap();
        assert_plan_replaces(&plan);
        assert_plan_changes_attribute(&plan, "name");
    }

    #[tokio::test]
    async fn test_validation_diagnostics() {
        let tester = tester();
        assert!(tester
            .validate_resource_config("puppetca_certificate", json!({"name": "node1"}))
            .await
            .is_ok());

        let err = tester
            .validate_resource_config("puppetca_certificate", json!({}))
            .await
            .unwrap_err();
        match err {
            TestError::Diagnostics(diags) => {
                assert_eq!(diags.len(), 1);
                assert_eq!(diags[0].attribute.as_deref(), Some("name"));
            }
            other => panic!("expected diagnostics, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_read_data_source() {
        let state = tester()
            .read_data_source("puppetca_environment", json!({"name": "production"}))
            .await
            .unwrap();
        assert_eq!(state, json!({"name": "production", "exists": true}));
    }
}
