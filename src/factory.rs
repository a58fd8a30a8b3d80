//! Binding the shared provider into every registered constructor.
//!
//! [`new_factory`] creates the single [`Provider`] and pairs it with both
//! registries. Everything the host asks for afterwards goes through a
//! [`BoundConstructor`], so every instance sees the same `Arc<Provider>`
//! and nothing reaches for a global.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tracing::{debug, info};

use crate::data_source::DataSource;
use crate::error::ProviderError;
use crate::provider::Provider;
use crate::registry::{Constructor, DataSourceRegistry, Registry, ResourceRegistry};
use crate::resource::Resource;
use crate::schema::{Diagnostic, ProviderSchema, Schema};
use crate::server::ProviderService;
use crate::types::{ImportedResource, PlanResult, ProviderMetadata};

/// A constructor paired with the provider it will be called with.
pub struct BoundConstructor<T: ?Sized> {
    provider: Arc<Provider>,
    constructor: Constructor<T>,
}

impl<T: ?Sized> BoundConstructor<T> {
    /// Build a fresh instance against the bound provider.
    pub fn instantiate(&self) -> Box<T> {
        (self.constructor)(Arc::clone(&self.provider))
    }

    /// The provider every instance receives.
    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }
}

impl<T: ?Sized> Clone for BoundConstructor<T> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            constructor: self.constructor,
        }
    }
}

impl<T: ?Sized> fmt::Debug for BoundConstructor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundConstructor")
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

/// Type names of one registry, resolved once.
#[derive(Debug)]
struct TypeIndex {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl TypeIndex {
    fn build<T: ?Sized>(
        kind: &str,
        provider: &Arc<Provider>,
        registry: &Registry<T>,
        type_name: impl Fn(&T, &str) -> String,
    ) -> Result<Self, String> {
        let mut names = Vec::with_capacity(registry.len());
        let mut positions = HashMap::with_capacity(registry.len());
        for (position, constructor) in registry.list().iter().enumerate() {
            let instance = constructor(Arc::clone(provider));
            let name = type_name(&*instance, provider.name());
            if positions.insert(name.clone(), position).is_some() {
                return Err(format!("{} type {} is registered more than once", kind, name));
            }
            names.push(name);
        }
        info!(kind, count = names.len(), "Indexed registered types");
        Ok(Self { names, positions })
    }
}

/// The object handed to the serving loop.
///
/// Holds the one provider and both registries; instances are built on
/// demand, one per host request.
pub struct ProviderFactory {
    provider: Arc<Provider>,
    data_sources: DataSourceRegistry,
    resources: ResourceRegistry,
    data_source_index: OnceLock<Result<TypeIndex, String>>,
    resource_index: OnceLock<Result<TypeIndex, String>>,
}

/// Compose the provider factory.
///
/// `name` and `version` identify the plugin and must not be empty. Empty
/// registries are fine; the provider then advertises nothing of that kind.
pub fn new_factory(
    name: impl Into<String>,
    version: impl Into<String>,
    data_sources: DataSourceRegistry,
    resources: ResourceRegistry,
) -> ProviderFactory {
    let provider = Provider::new(name, version);
    debug_assert!(!provider.name().is_empty(), "provider name is empty");
    debug_assert!(!provider.version().is_empty(), "provider version is empty");

    ProviderFactory {
        provider: Arc::new(provider),
        data_sources,
        resources,
        data_source_index: OnceLock::new(),
        resource_index: OnceLock::new(),
    }
}

impl ProviderFactory {
    /// The shared provider.
    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    /// One bound constructor per registered data source, in registration order.
    pub fn data_sources(&self) -> Vec<BoundConstructor<dyn DataSource>> {
        self.bind_all(&self.data_sources)
    }

    /// One bound constructor per registered resource, in registration order.
    pub fn resources(&self) -> Vec<BoundConstructor<dyn Resource>> {
        self.bind_all(&self.resources)
    }

    /// Instantiate the resource registered under `type_name`.
    pub fn resource(&self, type_name: &str) -> Result<Box<dyn Resource>, ProviderError> {
        let position = lookup(self.resource_index(), type_name)?;
        debug!(resource_type = %type_name, "Instantiating resource");
        Ok(self.bind(self.resources.list()[position]).instantiate())
    }

    /// Instantiate the data source registered under `type_name`.
    pub fn data_source(&self, type_name: &str) -> Result<Box<dyn DataSource>, ProviderError> {
        let position = lookup(self.data_source_index(), type_name)?;
        debug!(data_source_type = %type_name, "Instantiating data source");
        Ok(self.bind(self.data_sources.list()[position]).instantiate())
    }

    fn bind<T: ?Sized>(&self, constructor: Constructor<T>) -> BoundConstructor<T> {
        BoundConstructor {
            provider: Arc::clone(&self.provider),
            constructor,
        }
    }

    fn bind_all<T: ?Sized>(&self, registry: &Registry<T>) -> Vec<BoundConstructor<T>> {
        registry.list().iter().map(|c| self.bind(*c)).collect()
    }

    fn resource_index(&self) -> Result<&TypeIndex, ProviderError> {
        self.resource_index
            .get_or_init(|| {
                TypeIndex::build("resource", &self.provider, &self.resources, |r, p| {
                    r.type_name(p)
                })
            })
            .as_ref()
            .map_err(|e| ProviderError::Internal(e.clone()))
    }

    fn data_source_index(&self) -> Result<&TypeIndex, ProviderError> {
        self.data_source_index
            .get_or_init(|| {
                TypeIndex::build("data source", &self.provider, &self.data_sources, |d, p| {
                    d.type_name(p)
                })
            })
            .as_ref()
            .map_err(|e| ProviderError::Internal(e.clone()))
    }
}

impl fmt::Debug for ProviderFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderFactory")
            .field("provider", &self.provider)
            .field("data_sources", &self.data_sources)
            .field("resources", &self.resources)
            .finish()
    }
}

fn lookup(
    index: Result<&TypeIndex, ProviderError>,
    type_name: &str,
) -> Result<usize, ProviderError> {
    index?
        .positions
        .get(type_name)
        .copied()
        .ok_or_else(|| ProviderError::UnknownResource(type_name.to_string()))
}

#[async_trait::async_trait]
impl ProviderService for ProviderFactory {
    fn metadata(&self) -> Result<ProviderMetadata, ProviderError> {
        Ok(ProviderMetadata {
            resources: self.resource_index()?.names.clone(),
            data_sources: self.data_source_index()?.names.clone(),
            capabilities: Default::default(),
        })
    }

    fn schema(&self) -> Result<ProviderSchema, ProviderError> {
        self.resource_index()?;
        self.data_source_index()?;

        let provider_name = self.provider.name();
        let mut schema = ProviderSchema::new().with_provider_config(Schema::v0());
        for bound in self.resources() {
            let resource = bound.instantiate();
            schema = schema.with_resource(resource.type_name(provider_name), resource.schema());
        }
        for bound in self.data_sources() {
            let data_source = bound.instantiate();
            schema =
                schema.with_data_source(data_source.type_name(provider_name), data_source.schema());
        }
        Ok(schema)
    }

    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        self.provider.configure(config).await;
        Ok(vec![])
    }

    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        self.resource(resource_type)?.validate_config(config).await
    }

    async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: i64,
        state: Value,
    ) -> Result<Value, ProviderError> {
        self.resource(resource_type)?
            .upgrade_state(version, state)
            .await
    }

    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        config: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.resource(resource_type)?
            .plan(prior_state, proposed_state, config)
            .await
    }

    async fn create(
        &self,
        resource_type: &str,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        self.resource(resource_type)?.create(planned_state).await
    }

    async fn read(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<Value, ProviderError> {
        self.resource(resource_type)?.read(current_state).await
    }

    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        self.resource(resource_type)?
            .update(prior_state, planned_state)
            .await
    }

    async fn delete(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<(), ProviderError> {
        self.resource(resource_type)?.delete(current_state).await
    }

    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        let state = self.resource(resource_type)?.import_state(id).await?;
        Ok(vec![ImportedResource::new(resource_type, state)])
    }

    async fn validate_data_source_config(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        self.data_source(data_source_type)?
            .validate_config(config)
            .await
    }

    async fn read_data_source(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError> {
        self.data_source(data_source_type)?.read(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attribute;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Certificate {
        provider: Arc<Provider>,
    }

    #[async_trait::async_trait]
    impl Resource for Certificate {
        fn type_name(&self, provider_type_name: &str) -> String {
            format!("{}_certificate", provider_type_name)
        }

        fn schema(&self) -> Schema {
            Schema::v0().with_attribute("name", Attribute::required_string().with_force_new())
        }

        async fn create(&self, planned_state: Value) -> Result<Value, ProviderError> {
            let url = self
                .provider
                .config()
                .await
                .and_then(|c| c.get("url").cloned())
                .unwrap_or(Value::Null);
            let mut state = planned_state;
            state["url"] = url;
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

    struct Renamed(&'static str);

    #[async_trait::async_trait]
    impl Resource for Renamed {
        fn type_name(&self, provider_type_name: &str) -> String {
            format!("{}_{}", provider_type_name, self.0)
        }

        fn schema(&self) -> Schema {
            Schema::v0()
        }

        async fn create(&self, planned_state: Value) -> Result<Value, ProviderError> {
            Ok(planned_state)
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

    struct Lookup {
        provider: Arc<Provider>,
    }

    #[async_trait::async_trait]
    impl DataSource for Lookup {
        fn type_name(&self, provider_type_name: &str) -> String {
            format!("{}_certificate", provider_type_name)
        }

        fn schema(&self) -> Schema {
            Schema::v0().with_attribute("name", Attribute::required_string())
        }

        async fn read(&self, config: Value) -> Result<Value, ProviderError> {
            Ok(json!({"name": config["name"], "provider": self.provider.name()}))
        }
    }

    fn new_certificate(provider: Arc<Provider>) -> Box<dyn Resource> {
        Box::new(Certificate { provider })
    }

    fn new_alpha(_: Arc<Provider>) -> Box<dyn Resource> {
        Box::new(Renamed("alpha"))
    }

    fn new_lookup(provider: Arc<Provider>) -> Box<dyn DataSource> {
        Box::new(Lookup { provider })
    }

    fn factory() -> ProviderFactory {
        new_factory(
            "puppetca",
            "test",
            DataSourceRegistry::builder().register(new_lookup).build(),
            ResourceRegistry::builder()
                .register(new_certificate)
                .register(new_alpha)
                .build(),
        )
    }

    #[test]
    fn test_bound_lengths_match_registries() {
        let factory = factory();
        assert_eq!(factory.resources().len(), 2);
        assert_eq!(factory.data_sources().len(), 1);

        let empty = new_factory("puppetca", "test", Registry::empty(), Registry::empty());
        assert!(empty.resources().is_empty());
        assert!(empty.data_sources().is_empty());
    }

    #[test]
    fn test_every_bound_constructor_shares_the_provider() {
        let factory = factory();
        for bound in factory.resources() {
            assert!(Arc::ptr_eq(bound.provider(), factory.provider()));
        }
        for bound in factory.data_sources() {
            assert!(Arc::ptr_eq(bound.provider(), factory.provider()));
        }
    }

    #[test]
    fn test_instances_never_cross_factories() {
        static SEEN: AtomicUsize = AtomicUsize::new(0);

        fn capture(provider: Arc<Provider>) -> Box<dyn Resource> {
            SEEN.store(Arc::as_ptr(&provider) as usize, Ordering::SeqCst);
            Box::new(Certificate { provider })
        }

        let registry = ResourceRegistry::builder().register(capture).build();
        let first = new_factory("puppetca", "a", Registry::empty(), registry.clone());
        let second = new_factory("puppetca", "b", Registry::empty(), registry);
        assert!(!Arc::ptr_eq(first.provider(), second.provider()));

        first.resources()[0].instantiate();
        assert_eq!(
            SEEN.load(Ordering::SeqCst),
            Arc::as_ptr(first.provider()) as usize
        );

        second.resources()[0].instantiate();
        assert_eq!(
            SEEN.load(Ordering::SeqCst),
            Arc::as_ptr(second.provider()) as usize
        );
    }

    #[test]
    fn test_metadata_in_registration_order() {
        let metadata = factory().metadata().unwrap();
        assert_eq!(
            metadata.resources,
            vec!["puppetca_certificate", "puppetca_alpha"]
        );
        assert_eq!(metadata.data_sources, vec!["puppetca_certificate"]);
    }

    #[test]
    fn test_empty_factory_schema() {
        let factory = new_factory("puppetca", "test", Registry::empty(), Registry::empty());
        let schema = factory.schema().unwrap();
        assert!(schema.resources.is_empty());
        assert!(schema.data_sources.is_empty());
        assert_eq!(factory.metadata().unwrap(), ProviderMetadata::default());
    }

    #[test]
    fn test_schema_enumerates_both_registries() {
        let schema = factory().schema().unwrap();
        assert_eq!(schema.resources.len(), 2);
        assert!(schema.resources["puppetca_certificate"].forces_new("name"));
        assert!(schema.data_sources.contains_key("puppetca_certificate"));
    }

    #[test]
    fn test_duplicate_type_names_are_reported() {
        let factory = new_factory(
            "puppetca",
            "test",
            Registry::empty(),
            ResourceRegistry::builder()
                .register(new_alpha)
                .register(new_alpha)
                .build(),
        );
        let err = factory.schema().unwrap_err();
        assert!(matches!(err, ProviderError::Internal(_)));
        assert!(err.message().contains("puppetca_alpha"));
        assert!(factory.resource("puppetca_alpha").is_err());
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let factory = factory();
        let err = factory
            .create("puppetca_widget", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownResource(ref t) if t == "puppetca_widget"));

        let err = factory
            .read_data_source("puppetca_widget", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownResource(_)));
    }

    #[tokio::test]
    async fn test_configure_reaches_instances() {
        let factory = factory();
        factory
            .configure(json!({"url": "https://puppet:8140"}))
            .await
            .unwrap();

        let state = factory
            .create("puppetca_certificate", json!({"name": "node1"}))
            .await
            .unwrap();
        assert_eq!(state["url"], "https://puppet:8140");
    }

    #[tokio::test]
    async fn test_default_plan_and_import() {
        let factory = factory();
        let plan = factory
            .plan(
                "puppetca_certificate",
                Some(json!({"name": "node1"})),
                json!({"name": "node2"}),
                json!({"name": "node2"}),
            )
            .await
            .unwrap();
        assert!(plan.requires_replace);

        let err = factory
            .import_resource("puppetca_certificate", "node1")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unimplemented(_)));
    }

    #[tokio::test]
    async fn test_data_source_read() {
        let state = factory()
            .read_data_source("puppetca_certificate", json!({"name": "node1"}))
            .await
            .unwrap();
        assert_eq!(state, json!({"name": "node1", "provider": "puppetca"}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_share_provider_and_index() {
        static SEEN: std::sync::Mutex<Vec<usize>> = std::sync::Mutex::new(Vec::new());

        fn recording(provider: Arc<Provider>) -> Box<dyn Resource> {
            SEEN.lock()
                .unwrap()
                .push(Arc::as_ptr(&provider) as usize);
            Box::new(Certificate { provider })
        }

        const REQUESTS: usize = 32;
        let factory = Arc::new(new_factory(
            "puppetca",
            "test",
            Registry::empty(),
            ResourceRegistry::builder().register(recording).build(),
        ));

        let mut handles = Vec::new();
        for i in 0..REQUESTS {
            let factory = Arc::clone(&factory);
            handles.push(tokio::spawn(async move {
                let metadata = factory.metadata().unwrap();
                assert_eq!(metadata.resources, vec!["puppetca_certificate"]);
                factory
                    .create("puppetca_certificate", json!({ "name": format!("node{i}") }))
                    .await
                    .unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let state = handle.await.unwrap();
            assert_eq!(state["name"], format!("node{i}"));
        }

        let seen = SEEN.lock().unwrap();
        // One instance for the type index, one per create.
        assert_eq!(seen.len(), REQUESTS + 1);
        let expected = Arc::as_ptr(factory.provider()) as usize;
        assert!(seen.iter().all(|ptr| *ptr == expected));
    }
}
