//! Error types for the provider plugin.
//!
//! [`ProviderError`] is returned by resources, data sources and the factory
//! while answering a single host request. [`ServeError`] covers everything that
//! can stop the serving loop itself; there is no recovery from those.

use std::net::SocketAddr;

use thiserror::Error;

/// Errors that can occur while handling a host request.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The requested resource was not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A validation error occurred.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An internal error in the plugin composition layer.
    #[error("Internal error: {0}")]
    Internal(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested resource or data source type is not registered.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource already exists (create conflict).
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied (authentication/authorization failure).
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Service temporarily unavailable.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Operation failed due to current state (precondition not met).
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Operation not implemented.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),
}

impl ProviderError {
    /// Get the error message without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(msg)
            | Self::Validation(msg)
            | Self::Internal(msg)
            | Self::Configuration(msg)
            | Self::UnknownResource(msg)
            | Self::AlreadyExists(msg)
            | Self::PermissionDenied(msg)
            | Self::Unavailable(msg)
            | Self::FailedPrecondition(msg)
            | Self::Unimplemented(msg) => msg,
            Self::Serialization(_err) => "serialization error (see Debug output)",
        }
    }
}

impl From<ProviderError> for tonic::Status {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(msg) => tonic::Status::not_found(msg),
            ProviderError::Validation(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::Internal(msg) => tonic::Status::internal(msg),
            ProviderError::Configuration(msg) => tonic::Status::failed_precondition(msg),
            ProviderError::UnknownResource(msg) => tonic::Status::not_found(msg),
            ProviderError::Serialization(err) => {
                tonic::Status::invalid_argument(format!("Serialization error: {}", err))
            }
            ProviderError::AlreadyExists(msg) => tonic::Status::already_exists(msg),
            ProviderError::PermissionDenied(msg) => tonic::Status::permission_denied(msg),
            ProviderError::Unavailable(msg) => tonic::Status::unavailable(msg),
            ProviderError::FailedPrecondition(msg) => tonic::Status::failed_precondition(msg),
            ProviderError::Unimplemented(msg) => tonic::Status::unimplemented(msg),
        }
    }
}

/// Errors that terminate the serving loop.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The binary was started without the host's handshake cookie.
    #[error(
        "This binary is a plugin. These are not meant to be executed directly. \
         Please execute the program that consumes these plugins, which will \
         load any plugins automatically"
    )]
    NotLaunchedByHost,

    /// The listener could not be bound.
    #[error("failed to bind provider listener on {addr}: {source}")]
    Bind {
        /// The address that was requested.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Waiting for a debugger failed.
    #[error("debugger attach failed: {0}")]
    Debugger(String),

    /// An I/O error occurred while serving.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The gRPC transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProviderError::NotFound("cert-123".to_string());
        assert_eq!(format!("{}", err), "Resource not found: cert-123");

        let err = ProviderError::UnknownResource("puppetca_widget".to_string());
        assert_eq!(format!("{}", err), "Unknown resource type: puppetca_widget");

        let err = ProviderError::Internal("duplicate type".to_string());
        assert_eq!(format!("{}", err), "Internal error: duplicate type");
    }

    #[test]
    fn test_error_to_status() {
        let status: tonic::Status = ProviderError::NotFound("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = ProviderError::UnknownResource("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = ProviderError::Configuration("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status: tonic::Status = ProviderError::Internal("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::Internal);

        let status: tonic::Status = ProviderError::Unimplemented("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::Unimplemented);
    }

    #[test]
    fn test_message_method() {
        let err = ProviderError::Configuration("missing url".to_string());
        assert_eq!(err.message(), "missing url");

        let err: ProviderError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.message(), "serialization error (see Debug output)");
    }

    #[test]
    fn test_serve_error_display() {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let err = ServeError::Bind {
            addr,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
        };
        assert_eq!(
            err.to_string(),
            "failed to bind provider listener on 127.0.0.1:7000: address in use"
        );

        assert!(ServeError::NotLaunchedByHost
            .to_string()
            .starts_with("This binary is a plugin"));
    }
}
