//! Ordered registries of resource and data source constructors.
//!
//! A registry is assembled once at startup with [`RegistryBuilder`] and is
//! immutable afterwards. Cloning a [`Registry`] shares the same constructor
//! list.

use std::fmt;
use std::sync::Arc;

use crate::data_source::DataSource;
use crate::provider::Provider;
use crate::resource::Resource;

/// A constructor: takes the shared provider, returns one fresh instance.
pub type Constructor<T> = fn(Arc<Provider>) -> Box<T>;

/// Constructor for a resource.
pub type ResourceConstructor = Constructor<dyn Resource>;

/// Constructor for a data source.
pub type DataSourceConstructor = Constructor<dyn DataSource>;

/// An immutable, insertion-ordered list of constructors.
pub struct Registry<T: ?Sized> {
    entries: Arc<[Constructor<T>]>,
}

/// Registry of resource constructors.
pub type ResourceRegistry = Registry<dyn Resource>;

/// Registry of data source constructors.
pub type DataSourceRegistry = Registry<dyn DataSource>;

impl<T: ?Sized> Registry<T> {
    /// Start a new registry.
    pub fn builder() -> RegistryBuilder<T> {
        RegistryBuilder::new()
    }

    /// A registry with no constructors.
    pub fn empty() -> Self {
        RegistryBuilder::new().build()
    }

    /// All constructors, in registration order.
    pub fn list(&self) -> &[Constructor<T>] {
        &self.entries
    }

    /// Number of registered constructors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: ?Sized> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Collects constructors before the registry is frozen.
pub struct RegistryBuilder<T: ?Sized> {
    entries: Vec<Constructor<T>>,
}

impl<T: ?Sized> RegistryBuilder<T> {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a constructor.
    pub fn register(mut self, constructor: Constructor<T>) -> Self {
        self.entries.push(constructor);
        self
    }

    /// Freeze the registry.
    pub fn build(self) -> Registry<T> {
        Registry {
            entries: self.entries.into(),
        }
    }
}

impl<T: ?Sized> Default for RegistryBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}
