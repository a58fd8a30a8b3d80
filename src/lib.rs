//! Hemmer provider plugin for the Puppet certificate authority.
//!
//! This crate is the composition and serving layer of the plugin: it collects
//! the resource and data source constructors, binds them to one shared
//! [`Provider`], and serves the result to the host over gRPC.
//!
//! # Overview
//!
//! - **Registries** ([`registry`], [`resources`], [`data_sources`]): ordered,
//!   immutable lists of constructors
//! - **Factory** ([`factory`]): [`new_factory`] pairs the registries with the
//!   provider and answers host requests through [`ProviderService`]
//! - **Serving loop** ([`server`], [`debug`]): handshake, optional debug mode,
//!   graceful shutdown
//! - **Schema types** ([`schema`]): describing resources and data sources
//!
//! # Wiring
//!
//! ```ignore
//! use hemmer_provider_puppetca::{
//!     data_sources::data_sources, new_factory, provider_address, resources::resources, serve,
//!     ServeOptions, PROVIDER_NAME, PROVIDER_VERSION,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = new_factory(PROVIDER_NAME, PROVIDER_VERSION, data_sources(), resources());
//!     serve(factory, ServeOptions::new(provider_address(PROVIDER_NAME))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Handshake Protocol
//!
//! Once the listener is bound, [`serve`] writes a handshake string to stdout:
//!
//! ```text
//! HEMMER_PROVIDER|1|127.0.0.1:50051
//! ```
//!
//! Format: `HEMMER_PROVIDER|<protocol_version>|<address>`
//!
//! The host only launches plugins with `HEMMER_PLUGIN_MAGIC_COOKIE` set; a
//! binary started by hand refuses to serve unless `--debug` is given. In debug
//! mode the plugin waits for a debugger and prints a
//! `HEMMER_REATTACH_PROVIDERS` assignment instead.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod data_source;
pub mod data_sources;
pub mod debug;
pub mod error;
pub mod factory;
pub mod logging;
pub mod provider;
pub mod registry;
pub mod resource;
pub mod resources;
pub mod schema;
pub mod server;
pub mod testing;
pub mod types;

#[allow(missing_docs)]
#[allow(clippy::all)]
pub mod generated;

// Re-export main types at crate root
pub use data_source::DataSource;
pub use debug::{DebuggerAttach, TracerPidProbe};
pub use error::{ProviderError, ServeError};
pub use factory::{new_factory, BoundConstructor, ProviderFactory};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use provider::Provider;
pub use registry::{
    DataSourceConstructor, DataSourceRegistry, Registry, RegistryBuilder, ResourceConstructor,
    ResourceRegistry,
};
pub use resource::Resource;
pub use schema::ProviderSchema;
pub use server::{serve, serve_with_shutdown, ProviderService, ServeOptions, ServeState};
pub use types::{
    provider_address, AttributeChange, ImportedResource, PlanResult, ProviderMetadata,
    ServerCapabilities, ADDRESS_NAMESPACE, HANDSHAKE_PREFIX, PROTOCOL_VERSION, PROVIDER_NAME,
    PROVIDER_VERSION,
};

// Re-export async_trait for resource implementations
pub use async_trait::async_trait;
