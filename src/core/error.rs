//! # Error Handling Module
//!
//! This module defines every error the gateway can produce, using the `thiserror` crate.
//! Errors fall into two families:
//!
//! - **Selection errors** (`NotFound`, `NoEndpointsAvailable`, `ShuttingDown`) are returned
//!   straight to whoever called the router. The core never retries them.
//! - **Reconciliation errors** (`UnsupportedStrategy`, `ConfigParse`, `WatchStream`) are
//!   contained to a single service or a single event, logged, and never halt the update
//!   pipelines.
//!
//! ## Rust Concepts Used
//!
//! - `Result<T, E>` instead of exceptions; the `?` operator propagates failures upward
//! - `#[derive(Error)]` implements `Display` and `std::error::Error` from the `#[error]` attributes
//! - `From` implementations let `?` convert library errors into `GatewayError` automatically

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// All error conditions surfaced by the routing core and its update pipelines
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The service key has no registry entry
    #[error("Service not found: {service}")]
    NotFound { service: String },

    /// The service exists but its pool is currently empty
    #[error("No endpoints available for service: {service}")]
    NoEndpointsAvailable { service: String },

    /// Configuration names a load balancer kind that is not implemented
    #[error("Unsupported load balancer '{strategy}' for service: {service}")]
    UnsupportedStrategy { service: String, strategy: String },

    /// The routing configuration snapshot could not be parsed
    #[error("Failed to parse routing config: {message}")]
    ConfigParse { message: String },

    /// An orchestrator watch stream broke and must be resubscribed
    #[error("Watch stream for {resource} failed: {message}")]
    WatchStream { resource: String, message: String },

    /// Invalid process settings (bad listen address, missing path, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// I/O errors (file operations, sockets)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Orchestrator client failures outside of an established watch
    #[error("Kubernetes error: {message}")]
    Kubernetes { message: String },

    /// Upstream request failed after an endpoint was selected
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },

    /// Routing refused because shutdown has begun
    #[error("Gateway is shutting down")]
    ShuttingDown,
}

impl GatewayError {
    /// Create a not found error for a service key
    pub fn not_found<S: Into<String>>(service: S) -> Self {
        Self::NotFound {
            service: service.into(),
        }
    }

    /// Create a no endpoints error for a service key
    pub fn no_endpoints<S: Into<String>>(service: S) -> Self {
        Self::NoEndpointsAvailable {
            service: service.into(),
        }
    }

    /// Create an unsupported strategy error
    pub fn unsupported_strategy<S: Into<String>, T: Into<String>>(service: S, strategy: T) -> Self {
        Self::UnsupportedStrategy {
            service: service.into(),
            strategy: strategy.into(),
        }
    }

    /// Create a config parse error with a custom message
    pub fn config_parse<S: Into<String>>(message: S) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// Create a watch stream error for a resource collection
    pub fn watch_stream<S: Into<String>, T: Into<String>>(resource: S, message: T) -> Self {
        Self::WatchStream {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::NoEndpointsAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::HttpClient { .. } => StatusCode::BAD_GATEWAY,
            Self::UnsupportedStrategy { .. }
            | Self::ConfigParse { .. }
            | Self::WatchStream { .. }
            | Self::Configuration { .. }
            | Self::Io { .. }
            | Self::Kubernetes { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error was produced by endpoint selection
    pub fn is_selection_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::NoEndpointsAvailable { .. }
        )
    }

    /// Get a string representation of the error type for API responses and log fields
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::NoEndpointsAvailable { .. } => "no_endpoints_available",
            Self::UnsupportedStrategy { .. } => "unsupported_strategy",
            Self::ConfigParse { .. } => "config_parse_error",
            Self::WatchStream { .. } => "watch_stream_error",
            Self::Configuration { .. } => "configuration_error",
            Self::Io { .. } => "io_error",
            Self::Kubernetes { .. } => "kubernetes_error",
            Self::HttpClient { .. } => "http_client_error",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::ConfigParse {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigParse {
            message: err.to_string(),
        }
    }
}

impl From<kube::Error> for GatewayError {
    fn from(err: kube::Error) -> Self {
        Self::Kubernetes {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

impl From<notify::Error> for GatewayError {
    fn from(err: notify::Error) -> Self {
        Self::Io {
            message: format!("file watcher: {}", err),
        }
    }
}

/// Render errors as a JSON body with the mapped status code
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}
