//! The serving loop.
//!
//! [`serve`] takes a [`ProviderService`] (normally the
//! [`ProviderFactory`](crate::factory::ProviderFactory)) and runs the gRPC
//! server the host talks to:
//!
//! 1. **Initializing**: verify the host's magic cookie, or in debug mode wait
//!    for a debugger instead; bind the listener.
//! 2. **Serving**: print the handshake line to stdout and answer requests
//!    until SIGTERM/SIGINT, the host's `Stop` call, or the caller's shutdown
//!    future.
//! 3. **Terminated**: drain in-flight requests (bounded by
//!    [`ServeOptions::shutdown_timeout`]) and call the provider's `stop()`.
//!
//! Any failure before or during serving is returned as a [`ServeError`].

use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Notify};
use tonic::transport::Server;
use tracing::{debug, error, info, instrument, warn};

use crate::debug::{DebuggerAttach, TracerPidProbe};
use crate::error::{ProviderError, ServeError};
use crate::generated;
use crate::schema::{has_errors, Diagnostic, ProviderSchema};
use crate::types::{
    ImportedResource, PlanResult, ProviderMetadata, HANDSHAKE_PREFIX, MAGIC_COOKIE_KEY,
    MAGIC_COOKIE_VALUE, PROTOCOL_VERSION, REATTACH_ENV,
};

/// The host-facing operations a provider answers.
///
/// This is a higher-level API than the raw gRPC trait, using `serde_json`
/// values instead of encoded bytes.
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync + 'static {
    // =========================================================================
    // Schema & Metadata
    // =========================================================================

    /// Resource and data source type names.
    fn metadata(&self) -> Result<ProviderMetadata, ProviderError>;

    /// The provider's schema including all resources and data sources.
    fn schema(&self) -> Result<ProviderSchema, ProviderError>;

    // =========================================================================
    // Provider Lifecycle
    // =========================================================================

    /// Validate the provider configuration before configuring.
    async fn validate_provider_config(
        &self,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let _ = config;
        Ok(vec![])
    }

    /// Configure the provider with credentials and settings.
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError>;

    /// Stop the provider gracefully.
    async fn stop(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    // =========================================================================
    // Resource Operations
    // =========================================================================

    /// Validate a resource's configuration before planning.
    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError>;

    /// Upgrade resource state from an older schema version.
    async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: i64,
        state: Value,
    ) -> Result<Value, ProviderError>;

    /// Plan changes for a resource.
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        config: Value,
    ) -> Result<PlanResult, ProviderError>;

    /// Create a new resource.
    async fn create(&self, resource_type: &str, planned_state: Value)
        -> Result<Value, ProviderError>;

    /// Read the current state of a resource.
    async fn read(&self, resource_type: &str, current_state: Value)
        -> Result<Value, ProviderError>;

    /// Update an existing resource.
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError>;

    /// Delete a resource.
    async fn delete(&self, resource_type: &str, current_state: Value)
        -> Result<(), ProviderError>;

    /// Import existing infrastructure into management.
    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError>;

    // =========================================================================
    // Data Source Operations
    // =========================================================================

    /// Validate a data source's configuration.
    async fn validate_data_source_config(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError>;

    /// Read data from an external source.
    async fn read_data_source(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError>;
}

/// Wrapper that implements the generated gRPC trait.
struct ProviderGrpcService<P: ProviderService> {
    provider: Arc<P>,
    stop_requested: Arc<Notify>,
}

fn decode(bytes: &[u8]) -> Result<Value, ProviderError> {
    if bytes.is_empty() {
        Ok(Value::Null)
    } else {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn decode_optional(bytes: &[u8]) -> Result<Option<Value>, ProviderError> {
    if bytes.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::from_slice(bytes)?))
    }
}

fn encode(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

fn diagnostics_to_proto(diagnostics: Vec<Diagnostic>) -> Vec<generated::Diagnostic> {
    diagnostics.into_iter().map(Into::into).collect()
}

fn error_to_diagnostics(err: ProviderError) -> Vec<generated::Diagnostic> {
    vec![Diagnostic::error(err.to_string()).into()]
}

/// Log a validation-style outcome and turn it into response diagnostics.
fn validation_outcome(
    operation: &'static str,
    type_name: &str,
    result: Result<Vec<Diagnostic>, ProviderError>,
) -> Vec<generated::Diagnostic> {
    match result {
        Ok(diagnostics) => {
            if has_errors(&diagnostics) {
                warn!(
                    operation,
                    type_name,
                    diagnostics = diagnostics.len(),
                    "Completed with errors"
                );
            } else {
                info!(operation, type_name, "Completed successfully");
            }
            diagnostics_to_proto(diagnostics)
        }
        Err(e) => {
            error!(operation, type_name, error = %e, "Failed");
            error_to_diagnostics(e)
        }
    }
}

impl<P: ProviderService> ProviderGrpcService<P> {
    async fn do_plan(&self, req: &generated::PlanRequest) -> Result<PlanResult, ProviderError> {
        let prior_state = decode_optional(&req.prior_state)?;
        let proposed_state = decode(&req.proposed_state)?;
        let config = decode(&req.config)?;
        self.provider
            .plan(&req.resource_type, prior_state, proposed_state, config)
            .await
    }

    async fn do_update(&self, req: &generated::UpdateRequest) -> Result<Value, ProviderError> {
        let prior_state = decode(&req.prior_state)?;
        let planned_state = decode(&req.planned_state)?;
        self.provider
            .update(&req.resource_type, prior_state, planned_state)
            .await
    }
}

#[tonic::async_trait]
impl<P: ProviderService> generated::provider_server::Provider for ProviderGrpcService<P> {
    #[instrument(skip(self, _request), name = "grpc.get_metadata")]
    async fn get_metadata(
        &self,
        _request: tonic::Request<generated::GetMetadataRequest>,
    ) -> Result<tonic::Response<generated::GetMetadataResponse>, tonic::Status> {
        debug!("GetMetadata called");
        let response = match self.provider.metadata() {
            Ok(metadata) => {
                info!(
                    resources = metadata.resources.len(),
                    data_sources = metadata.data_sources.len(),
                    "GetMetadata completed"
                );
                generated::GetMetadataResponse {
                    server_capabilities: Some(generated::ServerCapabilities {
                        plan_destroy: metadata.capabilities.plan_destroy,
                    }),
                    resources: metadata.resources,
                    data_sources: metadata.data_sources,
                    diagnostics: vec![],
                }
            }
            Err(e) => {
                error!(error = %e, "GetMetadata failed");
                generated::GetMetadataResponse {
                    diagnostics: error_to_diagnostics(e),
                    ..Default::default()
                }
            }
        };
        Ok(tonic::Response::new(response))
    }

    #[instrument(skip(self, _request), name = "grpc.get_schema")]
    async fn get_schema(
        &self,
        _request: tonic::Request<generated::GetSchemaRequest>,
    ) -> Result<tonic::Response<generated::GetSchemaResponse>, tonic::Status> {
        debug!("GetSchema called");
        let response = match self.provider.schema() {
            Ok(schema) => {
                info!(
                    resources = schema.resources.len(),
                    data_sources = schema.data_sources.len(),
                    "GetSchema completed"
                );
                generated::GetSchemaResponse {
                    provider: Some((&schema.provider).into()),
                    resources: schema
                        .resources
                        .iter()
                        .map(|(k, v)| (k.clone(), v.into()))
                        .collect(),
                    data_sources: schema
                        .data_sources
                        .iter()
                        .map(|(k, v)| (k.clone(), v.into()))
                        .collect(),
                    diagnostics: vec![],
                }
            }
            Err(e) => {
                error!(error = %e, "GetSchema failed");
                generated::GetSchemaResponse {
                    diagnostics: error_to_diagnostics(e),
                    ..Default::default()
                }
            }
        };
        Ok(tonic::Response::new(response))
    }

    #[instrument(skip(self, request), name = "grpc.validate_provider_config")]
    async fn validate_provider_config(
        &self,
        request: tonic::Request<generated::ValidateProviderConfigRequest>,
    ) -> Result<tonic::Response<generated::ValidateProviderConfigResponse>, tonic::Status> {
        debug!("ValidateProviderConfig called");
        let req = request.into_inner();
        let result = match decode(&req.config) {
            Ok(config) => self.provider.validate_provider_config(config).await,
            Err(e) => Err(e),
        };
        Ok(tonic::Response::new(
            generated::ValidateProviderConfigResponse {
                diagnostics: validation_outcome("ValidateProviderConfig", "provider", result),
            },
        ))
    }

    #[instrument(skip(self, request), name = "grpc.configure")]
    async fn configure(
        &self,
        request: tonic::Request<generated::ConfigureRequest>,
    ) -> Result<tonic::Response<generated::ConfigureResponse>, tonic::Status> {
        debug!("Configure called");
        let req = request.into_inner();
        let result = match decode(&req.config) {
            Ok(config) => self.provider.configure(config).await,
            Err(e) => Err(e),
        };
        Ok(tonic::Response::new(generated::ConfigureResponse {
            diagnostics: validation_outcome("Configure", "provider", result),
        }))
    }

    #[instrument(skip(self, _request), name = "grpc.stop")]
    async fn stop(
        &self,
        _request: tonic::Request<generated::StopRequest>,
    ) -> Result<tonic::Response<generated::StopResponse>, tonic::Status> {
        info!("Stop called");
        let error = match self.provider.stop().await {
            Ok(()) => String::new(),
            Err(e) => {
                error!(error = %e, "Stop failed");
                e.to_string()
            }
        };
        self.stop_requested.notify_one();
        Ok(tonic::Response::new(generated::StopResponse { error }))
    }

    #[instrument(skip(self, request), name = "grpc.validate_resource_config")]
    async fn validate_resource_config(
        &self,
        request: tonic::Request<generated::ValidateResourceConfigRequest>,
    ) -> Result<tonic::Response<generated::ValidateResourceConfigResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(resource_type = %req.resource_type, "ValidateResourceConfig called");
        let result = match decode(&req.config) {
            Ok(config) => {
                self.provider
                    .validate_resource_config(&req.resource_type, config)
                    .await
            }
            Err(e) => Err(e),
        };
        Ok(tonic::Response::new(
            generated::ValidateResourceConfigResponse {
                diagnostics: validation_outcome(
                    "ValidateResourceConfig",
                    &req.resource_type,
                    result,
                ),
            },
        ))
    }

    #[instrument(skip(self, request), name = "grpc.upgrade_resource_state")]
    async fn upgrade_resource_state(
        &self,
        request: tonic::Request<generated::UpgradeResourceStateRequest>,
    ) -> Result<tonic::Response<generated::UpgradeResourceStateResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(resource_type = %req.resource_type, version = req.version, "UpgradeResourceState called");
        let result = match decode(&req.raw_state) {
            Ok(state) => {
                self.provider
                    .upgrade_resource_state(&req.resource_type, req.version, state)
                    .await
            }
            Err(e) => Err(e),
        };

        let response = match result {
            Ok(upgraded) => {
                info!(resource_type = %req.resource_type, from_version = req.version, "UpgradeResourceState completed");
                generated::UpgradeResourceStateResponse {
                    upgraded_state: encode(&upgraded),
                    diagnostics: vec![],
                }
            }
            Err(e) => {
                error!(resource_type = %req.resource_type, version = req.version, error = %e, "UpgradeResourceState failed");
                generated::UpgradeResourceStateResponse {
                    upgraded_state: vec![],
                    diagnostics: error_to_diagnostics(e),
                }
            }
        };
        Ok(tonic::Response::new(response))
    }

    #[instrument(skip(self, request), name = "grpc.plan")]
    async fn plan(
        &self,
        request: tonic::Request<generated::PlanRequest>,
    ) -> Result<tonic::Response<generated::PlanResponse>, tonic::Status> {
        let req = request.into_inner();
        let is_create = req.prior_state.is_empty();
        debug!(resource_type = %req.resource_type, is_create, "Plan called");

        let response = match self.do_plan(&req).await {
            Ok(result) => {
                info!(
                    resource_type = %req.resource_type,
                    changes = result.changes.len(),
                    requires_replace = result.requires_replace,
                    "Plan completed"
                );
                generated::PlanResponse {
                    planned_state: encode(&result.planned_state),
                    changes: result.changes.into_iter().map(Into::into).collect(),
                    requires_replace: result.requires_replace,
                    diagnostics: vec![],
                }
            }
            Err(e) => {
                error!(resource_type = %req.resource_type, error = %e, "Plan failed");
                generated::PlanResponse {
                    diagnostics: error_to_diagnostics(e),
                    ..Default::default()
                }
            }
        };
        Ok(tonic::Response::new(response))
    }

    #[instrument(skip(self, request), name = "grpc.create")]
    async fn create(
        &self,
        request: tonic::Request<generated::CreateRequest>,
    ) -> Result<tonic::Response<generated::CreateResponse>, tonic::Status> {
        let req = request.into_inner();
        info!(resource_type = %req.resource_type, "Create called");
        let result = match decode(&req.planned_state) {
            Ok(planned_state) => self.provider.create(&req.resource_type, planned_state).await,
            Err(e) => Err(e),
        };

        let response = match result {
            Ok(state) => {
                info!(resource_type = %req.resource_type, "Create completed successfully");
                generated::CreateResponse {
                    state: encode(&state),
                    diagnostics: vec![],
                }
            }
            Err(e) => {
                error!(resource_type = %req.resource_type, error = %e, "Create failed");
                generated::CreateResponse {
                    state: vec![],
                    diagnostics: error_to_diagnostics(e),
                }
            }
        };
        Ok(tonic::Response::new(response))
    }

    #[instrument(skip(self, request), name = "grpc.read")]
    async fn read(
        &self,
        request: tonic::Request<generated::ReadRequest>,
    ) -> Result<tonic::Response<generated::ReadResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(resource_type = %req.resource_type, "Read called");
        let result = match decode(&req.current_state) {
            Ok(current_state) => self.provider.read(&req.resource_type, current_state).await,
            Err(e) => Err(e),
        };

        let response = match result {
            Ok(state) => {
                debug!(resource_type = %req.resource_type, "Read completed successfully");
                generated::ReadResponse {
                    state: encode(&state),
                    diagnostics: vec![],
                }
            }
            Err(e) => {
                error!(resource_type = %req.resource_type, error = %e, "Read failed");
                generated::ReadResponse {
                    state: vec![],
                    diagnostics: error_to_diagnostics(e),
                }
            }
        };
        Ok(tonic::Response::new(response))
    }

    #[instrument(skip(self, request), name = "grpc.update")]
    async fn update(
        &self,
        request: tonic::Request<generated::UpdateRequest>,
    ) -> Result<tonic::Response<generated::UpdateResponse>, tonic::Status> {
        let req = request.into_inner();
        info!(resource_type = %req.resource_type, "Update called");

        let response = match self.do_update(&req).await {
            Ok(state) => {
                info!(resource_type = %req.resource_type, "Update completed successfully");
                generated::UpdateResponse {
                    state: encode(&state),
                    diagnostics: vec![],
                }
            }
            Err(e) => {
                error!(resource_type = %req.resource_type, error = %e, "Update failed");
                generated::UpdateResponse {
                    state: vec![],
                    diagnostics: error_to_diagnostics(e),
                }
            }
        };
        Ok(tonic::Response::new(response))
    }

    #[instrument(skip(self, request), name = "grpc.delete")]
    async fn delete(
        &self,
        request: tonic::Request<generated::DeleteRequest>,
    ) -> Result<tonic::Response<generated::DeleteResponse>, tonic::Status> {
        let req = request.into_inner();
        info!(resource_type = %req.resource_type, "Delete called");
        let result = match decode(&req.current_state) {
            Ok(current_state) => self.provider.delete(&req.resource_type, current_state).await,
            Err(e) => Err(e),
        };

        let diagnostics = match result {
            Ok(()) => {
                info!(resource_type = %req.resource_type, "Delete completed successfully");
                vec![]
            }
            Err(e) => {
                error!(resource_type = %req.resource_type, error = %e, "Delete failed");
                error_to_diagnostics(e)
            }
        };
        Ok(tonic::Response::new(generated::DeleteResponse { diagnostics }))
    }

    #[instrument(skip(self, request), name = "grpc.import_resource_state")]
    async fn import_resource_state(
        &self,
        request: tonic::Request<generated::ImportResourceStateRequest>,
    ) -> Result<tonic::Response<generated::ImportResourceStateResponse>, tonic::Status> {
        let req = request.into_inner();
        info!(resource_type = %req.resource_type, id = %req.id, "ImportResourceState called");

        let response = match self
            .provider
            .import_resource(&req.resource_type, &req.id)
            .await
        {
            Ok(imported) => {
                info!(
                    resource_type = %req.resource_type,
                    id = %req.id,
                    imported_count = imported.len(),
                    "ImportResourceState completed"
                );
                generated::ImportResourceStateResponse {
                    imported: imported
                        .into_iter()
                        .map(|r| generated::ImportedResource {
                            resource_type: r.resource_type,
                            state: encode(&r.state),
                        })
                        .collect(),
                    diagnostics: vec![],
                }
            }
            Err(e) => {
                error!(resource_type = %req.resource_type, id = %req.id, error = %e, "ImportResourceState failed");
                generated::ImportResourceStateResponse {
                    imported: vec![],
                    diagnostics: error_to_diagnostics(e),
                }
            }
        };
        Ok(tonic::Response::new(response))
    }

    #[instrument(skip(self, request), name = "grpc.validate_data_source_config")]
    async fn validate_data_source_config(
        &self,
        request: tonic::Request<generated::ValidateDataSourceConfigRequest>,
    ) -> Result<tonic::Response<generated::ValidateDataSourceConfigResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(data_source_type = %req.data_source_type, "ValidateDataSourceConfig called");
        let result = match decode(&req.config) {
            Ok(config) => {
                self.provider
                    .validate_data_source_config(&req.data_source_type, config)
                    .await
            }
            Err(e) => Err(e),
        };
        Ok(tonic::Response::new(
            generated::ValidateDataSourceConfigResponse {
                diagnostics: validation_outcome(
                    "ValidateDataSourceConfig",
                    &req.data_source_type,
                    result,
                ),
            },
        ))
    }

    #[instrument(skip(self, request), name = "grpc.read_data_source")]
    async fn read_data_source(
        &self,
        request: tonic::Request<generated::ReadDataSourceRequest>,
    ) -> Result<tonic::Response<generated::ReadDataSourceResponse>, tonic::Status> {
        let req = request.into_inner();
        debug!(data_source_type = %req.data_source_type, "ReadDataSource called");
        let result = match decode(&req.config) {
            Ok(config) => {
                self.provider
                    .read_data_source(&req.data_source_type, config)
                    .await
            }
            Err(e) => Err(e),
        };

        let response = match result {
            Ok(state) => {
                info!(data_source_type = %req.data_source_type, "ReadDataSource completed successfully");
                generated::ReadDataSourceResponse {
                    state: encode(&state),
                    diagnostics: vec![],
                }
            }
            Err(e) => {
                error!(data_source_type = %req.data_source_type, error = %e, "ReadDataSource failed");
                generated::ReadDataSourceResponse {
                    state: vec![],
                    diagnostics: error_to_diagnostics(e),
                }
            }
        };
        Ok(tonic::Response::new(response))
    }
}

/// Lifecycle of the serving loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeState {
    /// Checking the launch environment and binding the listener.
    Initializing,
    /// The handshake has been printed and requests are being answered on
    /// the bound address.
    Serving(SocketAddr),
    /// The server has returned.
    Terminated,
}

/// Options for configuring the provider server.
pub struct ServeOptions {
    /// Registry address of the provider, used in debug reattach output.
    pub address: String,
    /// Wait for a debugger and skip the host handshake cookie.
    pub debug: bool,
    /// Where to listen. Default: an ephemeral port on 127.0.0.1.
    pub listen_addr: SocketAddr,
    /// After a shutdown is requested, how long in-flight requests may run.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,
    magic_cookie: Option<String>,
    debugger: Arc<dyn DebuggerAttach>,
    state: Option<watch::Sender<ServeState>>,
}

impl ServeOptions {
    /// Options for `address`, picking up the magic cookie from the environment.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            debug: false,
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            shutdown_timeout: Duration::from_secs(30),
            magic_cookie: std::env::var(MAGIC_COOKIE_KEY).ok(),
            debugger: Arc::new(TracerPidProbe::default()),
            state: None,
        }
    }

    /// Enable or disable debug mode.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Listen on a specific address.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Override the magic cookie read from the environment.
    pub fn with_magic_cookie(mut self, cookie: Option<String>) -> Self {
        self.magic_cookie = cookie;
        self
    }

    /// Replace how debug mode waits for a debugger.
    pub fn with_debugger(mut self, debugger: Arc<dyn DebuggerAttach>) -> Self {
        self.debugger = debugger;
        self
    }

    /// Publish lifecycle transitions on `state`.
    pub fn with_state_sender(mut self, state: watch::Sender<ServeState>) -> Self {
        self.state = Some(state);
        self
    }

    fn set_state(&self, state: ServeState) {
        if let Some(sender) = &self.state {
            sender.send_replace(state);
        }
        debug!(?state, "Serve state changed");
    }
}

impl fmt::Debug for ServeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServeOptions")
            .field("address", &self.address)
            .field("debug", &self.debug)
            .field("listen_addr", &self.listen_addr)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("magic_cookie", &self.magic_cookie.is_some())
            .finish_non_exhaustive()
    }
}

/// Check the cookie the host sets before launching a plugin.
pub fn verify_magic_cookie(cookie: Option<&str>) -> Result<(), ServeError> {
    match cookie {
        Some(value) if value == MAGIC_COOKIE_VALUE => Ok(()),
        _ => Err(ServeError::NotLaunchedByHost),
    }
}

/// The handshake line the host reads from stdout.
pub fn handshake_line(addr: SocketAddr) -> String {
    format!("{}|{}|{}", HANDSHAKE_PREFIX, PROTOCOL_VERSION, addr)
}

/// The environment assignment that points the host at a debug-mode plugin.
pub fn reattach_line(address: &str, addr: SocketAddr) -> String {
    let mut providers = serde_json::Map::new();
    providers.insert(
        address.to_string(),
        json!({
            "protocol": "grpc",
            "protocol_version": PROTOCOL_VERSION,
            "pid": std::process::id(),
            "test": true,
            "addr": {
                "network": "tcp",
                "string": addr.to_string(),
            },
        }),
    );
    format!("{}='{}'", REATTACH_ENV, Value::Object(providers))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownReason {
    Signal(&'static str),
    StopRequested,
    Requested,
}

#[cfg(unix)]
struct ShutdownSignals {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "CTRL+C",
            Err(_) => std::future::pending().await,
        }
    }
}

/// Serve a provider until a signal or the host's `Stop` call.
///
/// See the module documentation for the lifecycle.
pub async fn serve<P: ProviderService>(provider: P, options: ServeOptions) -> Result<(), ServeError> {
    serve_with_shutdown(provider, options, std::future::pending()).await
}

/// Like [`serve`], additionally returning once `shutdown` completes.
pub async fn serve_with_shutdown<P, F>(
    provider: P,
    options: ServeOptions,
    shutdown: F,
) -> Result<(), ServeError>
where
    P: ProviderService,
    F: Future<Output = ()>,
{
    options.set_state(ServeState::Initializing);
    let result = run(provider, &options, shutdown).await;
    options.set_state(ServeState::Terminated);
    result
}

async fn run<P, F>(provider: P, options: &ServeOptions, shutdown: F) -> Result<(), ServeError>
where
    P: ProviderService,
    F: Future<Output = ()>,
{
    if options.debug {
        options.debugger.wait_for_attach().await?;
    } else {
        verify_magic_cookie(options.magic_cookie.as_deref())?;
    }

    let listener = TcpListener::bind(options.listen_addr)
        .await
        .map_err(|source| ServeError::Bind {
            addr: options.listen_addr,
            source,
        })?;
    let addr = listener.local_addr()?;
    let mut signals = ShutdownSignals::install()?;

    if options.debug {
        println!("Provider started. To attach the host, set {} to:", REATTACH_ENV);
        println!();
        println!("\t{}", reattach_line(&options.address, addr));
    } else {
        println!("{}", handshake_line(addr));
    }
    info!(address = %options.address, listen = %addr, debug = options.debug, "Provider server starting");

    let provider = Arc::new(provider);
    let stop_requested = Arc::new(Notify::new());
    let grpc_service = ProviderGrpcService {
        provider: Arc::clone(&provider),
        stop_requested: Arc::clone(&stop_requested),
    };

    let (drain_tx, drain_rx) = oneshot::channel::<()>();
    let server_future = Server::builder()
        .add_service(generated::provider_server::ProviderServer::new(grpc_service))
        .serve_with_incoming_shutdown(
            tokio_stream::wrappers::TcpListenerStream::new(listener),
            async {
                let _ = drain_rx.await;
            },
        );
    tokio::pin!(server_future);
    tokio::pin!(shutdown);
    options.set_state(ServeState::Serving(addr));

    let reason = tokio::select! {
        result = &mut server_future => {
            // The server never returns on its own without a transport error.
            result?;
            warn!("Server returned without a shutdown request");
            return Ok(());
        }
        _ = stop_requested.notified() => ShutdownReason::StopRequested,
        name = signals.recv() => ShutdownReason::Signal(name),
        _ = &mut shutdown => ShutdownReason::Requested,
    };
    info!(?reason, "Provider server shutting down");

    let _ = drain_tx.send(());
    match tokio::time::timeout(options.shutdown_timeout, server_future).await {
        Ok(Ok(())) => info!("Server shutdown complete"),
        Ok(Err(e)) => {
            error!(error = %e, "Server error during shutdown");
            return Err(e.into());
        }
        Err(_) => warn!(
            timeout = ?options.shutdown_timeout,
            "Shutdown timeout exceeded, forcing shutdown"
        ),
    }

    // The Stop RPC already called stop() on the provider.
    if reason != ShutdownReason::StopRequested {
        debug!("Calling provider stop()");
        if let Err(e) = provider.stop().await {
            warn!(error = %e, "Provider stop() returned error");
        }
    }

    info!("Provider shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_cookie() {
        assert!(verify_magic_cookie(Some(MAGIC_COOKIE_VALUE)).is_ok());
        assert!(matches!(
            verify_magic_cookie(Some("wrong")),
            Err(ServeError::NotLaunchedByHost)
        ));
        assert!(matches!(
            verify_magic_cookie(None),
            Err(ServeError::NotLaunchedByHost)
        ));
    }

    #[test]
    fn test_handshake_line() {
        let addr: SocketAddr = "127.0.0.1:50051".parse().unwrap();
        assert_eq!(handshake_line(addr), "HEMMER_PROVIDER|1|127.0.0.1:50051");
    }

    #[test]
    fn test_reattach_line() {
        let addr: SocketAddr = "127.0.0.1:50051".parse().unwrap();
        let line = reattach_line("registry.hemmer.io/camptocamp/puppetca", addr);

        let json = line
            .strip_prefix("HEMMER_REATTACH_PROVIDERS='")
            .and_then(|rest| rest.strip_suffix('\''))
            .expect("quoted assignment");
        let parsed: Value = serde_json::from_str(json).unwrap();
        let entry = &parsed["registry.hemmer.io/camptocamp/puppetca"];
        assert_eq!(entry["protocol_version"], 1);
        assert_eq!(entry["pid"], std::process::id());
        assert_eq!(entry["addr"]["string"], "127.0.0.1:50051");
    }

    #[test]
    fn test_decode() {
        assert_eq!(decode(b"").unwrap(), Value::Null);
        assert_eq!(decode(br#"{"a":1}"#).unwrap(), json!({"a": 1}));
        assert!(matches!(
            decode(b"{").unwrap_err(),
            ProviderError::Serialization(_)
        ));
        assert_eq!(decode_optional(b"").unwrap(), None);
    }

    #[test]
    fn test_serve_options_defaults() {
        let options = ServeOptions::new("registry.hemmer.io/camptocamp/puppetca");
        assert!(!options.debug);
        assert_eq!(options.listen_addr.port(), 0);
        assert!(options.listen_addr.ip().is_loopback());
        assert_eq!(options.shutdown_timeout, Duration::from_secs(30));

        let options = options
            .with_debug(true)
            .with_shutdown_timeout(Duration::from_secs(1));
        assert!(options.debug);
        assert_eq!(options.shutdown_timeout, Duration::from_secs(1));
    }
}
