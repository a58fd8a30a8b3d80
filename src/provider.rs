//! The shared provider instance.
//!
//! One [`Provider`] exists per [`ProviderFactory`](crate::factory::ProviderFactory)
//! and is handed to every resource and data source constructor as an
//! `Arc<Provider>`. It owns the configuration the host sends through
//! `Configure`; the lock around it is internal, callers only ever take
//! `&self`.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::ProviderError;

/// Configuration and identity shared by all resources and data sources.
#[derive(Debug)]
pub struct Provider {
    name: String,
    version: String,
    config: RwLock<Option<Value>>,
}

impl Provider {
    /// Create an unconfigured provider.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            config: RwLock::new(None),
        }
    }

    /// The provider type name, e.g. `puppetca`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The provider version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Store the configuration received from the host, replacing any previous one.
    pub async fn configure(&self, config: Value) {
        *self.config.write().await = Some(config);
    }

    /// Whether `Configure` has been received.
    pub async fn is_configured(&self) -> bool {
        self.config.read().await.is_some()
    }

    /// A copy of the raw configuration, if any.
    pub async fn config(&self) -> Option<Value> {
        self.config.read().await.clone()
    }

    /// Deserialize the configuration into a typed struct.
    ///
    /// Fails with [`ProviderError::Configuration`] before `Configure` arrives.
    pub async fn typed_config<T: DeserializeOwned>(&self) -> Result<T, ProviderError> {
        let guard = self.config.read().await;
        let config = guard.as_ref().ok_or_else(|| {
            ProviderError::Configuration(format!("provider {} is not configured", self.name))
        })?;
        Ok(T::deserialize(config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Settings {
        url: String,
    }

    #[tokio::test]
    async fn test_configure_then_read_back() {
        let provider = Provider::new("puppetca", "1.0.0");
        assert_eq!(provider.name(), "puppetca");
        assert_eq!(provider.version(), "1.0.0");
        assert!(!provider.is_configured().await);

        provider
            .configure(json!({"url": "https://puppet:8140"}))
            .await;
        assert!(provider.is_configured().await);

        let settings: Settings = provider.typed_config().await.unwrap();
        assert_eq!(settings.url, "https://puppet:8140");
    }

    #[tokio::test]
    async fn test_typed_config_before_configure() {
        let provider = Provider::new("puppetca", "dev");
        let err = provider.typed_config::<Settings>().await.unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
    }
}
