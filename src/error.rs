//! Error types for the Router Broker
//!
//! Provides structured error types for the policy drivers, the binding
//! store, the resource broker and the request router.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the broker
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Policy Driver Errors
    // =========================================================================
    #[error("No more resources of type {resource_type}")]
    NoMoreResources { resource_type: String },

    #[error("Wrong resource id: {resource_id}")]
    WrongResourceId { resource_id: String },

    // =========================================================================
    // Binding Errors
    // =========================================================================
    #[error("Wrong object id: {object_id}")]
    WrongObjectId { object_id: String },

    #[error("Object id was not bound to resource {resource_id}")]
    MissingObjectId { resource_id: String },

    #[error("Binding already exists for object {object_id}")]
    DuplicateBinding { object_id: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Unknown backend descriptor: {descriptor}")]
    UnknownDescriptor { descriptor: String },

    #[error("Operation {operation} is not supported by backend {backend}")]
    UnsupportedOperation { backend: String, operation: String },

    #[error("Router {router_id} not found on backend {backend}")]
    RouterNotFound { backend: String, router_id: String },

    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    BackendOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Connectivity Errors
    // =========================================================================
    #[error("HTTP connection error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote service returned {status}: {reason}")]
    RemoteService { status: u16, reason: String },

    #[error("Malformed response from remote service: {0}")]
    MalformedResponse(String),

    #[error("Operation {operation} timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an error, used by the API surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The referenced object, resource or backend does not exist
    NotFound,
    /// The request collides with existing state
    Conflict,
    /// The policy driver has nothing left to hand out
    Exhausted,
    /// A remote service, the database or a backend could not be reached in time
    Connectivity,
    /// The caller asked for something that cannot be served
    InvalidRequest,
    /// Anything else
    Internal,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WrongObjectId { .. }
            | Error::WrongResourceId { .. }
            | Error::UnknownDescriptor { .. }
            | Error::RouterNotFound { .. } => ErrorKind::NotFound,

            Error::DuplicateBinding { .. } => ErrorKind::Conflict,

            Error::NoMoreResources { .. } => ErrorKind::Exhausted,

            Error::Http(_)
            | Error::RemoteService { .. }
            | Error::MalformedResponse(_)
            | Error::Timeout { .. }
            | Error::Database(_)
            | Error::BackendOperationFailed { .. } => ErrorKind::Connectivity,

            Error::UnsupportedOperation { .. }
            | Error::MissingObjectId { .. }
            | Error::JsonParse(_) => ErrorKind::InvalidRequest,

            Error::Internal(_)
            | Error::Configuration(_)
            | Error::YamlParse(_)
            | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error came from a network, database or backend boundary
    pub fn is_connectivity(&self) -> bool {
        self.kind() == ErrorKind::Connectivity
    }

    /// Short machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Error::Internal(_) => "internal",
            Error::Configuration(_) => "configuration",
            Error::NoMoreResources { .. } => "no_more_resources",
            Error::WrongResourceId { .. } => "wrong_resource_id",
            Error::WrongObjectId { .. } => "wrong_object_id",
            Error::MissingObjectId { .. } => "missing_object_id",
            Error::DuplicateBinding { .. } => "duplicate_binding",
            Error::Database(_) => "database",
            Error::UnknownDescriptor { .. } => "unknown_descriptor",
            Error::UnsupportedOperation { .. } => "unsupported_operation",
            Error::RouterNotFound { .. } => "router_not_found",
            Error::BackendOperationFailed { .. } => "backend_failed",
            Error::Http(_) => "http",
            Error::RemoteService { .. } => "remote_service",
            Error::MalformedResponse(_) => "malformed_response",
            Error::Timeout { .. } => "timeout",
            Error::JsonParse(_) => "json_parse",
            Error::YamlParse(_) => "yaml_parse",
            Error::Io(_) => "io",
        }
    }
}

/// Result type alias for the broker
pub type Result<T> = std::result::Result<T, Error>;
