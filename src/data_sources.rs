//! The data sources this provider registers.

use crate::registry::{DataSourceRegistry, Registry};

/// Build the data source registry.
pub fn data_sources() -> DataSourceRegistry {
    Registry::builder().build()
}
