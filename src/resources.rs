//! The resources this provider registers.
//!
//! Add a resource by appending its constructor with
//! [`RegistryBuilder::register`](crate::registry::RegistryBuilder::register).

use crate::registry::{Registry, ResourceRegistry};

/// Build the resource registry.
pub fn resources() -> ResourceRegistry {
    Registry::builder().build()
}
