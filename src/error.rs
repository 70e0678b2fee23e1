//! Error types for the simulation engine.

use std::net::SocketAddr;
use thiserror::Error;

/// Result alias used across the crate.
pub type SimulatorResult<T> = Result<T, SimulatorError>;

/// Errors raised by the engine, its configuration store and the listener.
#[derive(Error, Debug)]
pub enum SimulatorError {
    /// No endpoint matches the request. A normal outcome, not logged as an error.
    #[error("no endpoint matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// The endpoint exists but declares no responses.
    #[error("endpoint {endpoint} has no responses configured")]
    NoResponsesConfigured { endpoint: String },

    /// Operator control targeted an unknown endpoint.
    #[error("endpoint not found: {endpoint}")]
    EndpointNotFound { endpoint: String },

    /// Operator control targeted an unknown response id.
    #[error("response {response_id} not found on endpoint {endpoint}")]
    ResponseNotFound {
        endpoint: String,
        response_id: String,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The configuration document could not be decoded.
    #[error("failed to parse configuration from {source_name}: {message}")]
    ConfigParse {
        source_name: String,
        message: String,
    },

    /// The configuration decoded but violates an invariant.
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    /// The configuration source could not be read.
    #[error("failed to read configuration from {source_name}: {message}")]
    ConfigSource {
        source_name: String,
        message: String,
    },

    /// The listener could not bind its address.
    #[error("failed to bind listener on {addr}: {source}")]
    ListenerBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while rendering a response body template.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown template engine: {0}")]
    UnknownEngine(String),

    #[error("{engine} template error: {message}")]
    Render { engine: String, message: String },
}
