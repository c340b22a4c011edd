//! Error types for meshbed-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for meshbed-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (fatal at entity construction)
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Console session errors
    #[error("console error: {0}")]
    Console(#[from] ConsoleError),

    /// Backend command execution errors
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Control channel errors
    #[error("control channel error: {0}")]
    Control(#[from] ControlError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors (network inspection payloads)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config file {path}: {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A required key is absent from a device config file
    #[error("missing key `{key}` in {path}")]
    MissingKey { key: String, path: String },

    /// A key is present but its value does not parse
    #[error("malformed value for `{key}` in {path}: {value:?}")]
    MalformedValue {
        key: String,
        path: String,
        value: String,
    },

    /// Harness config file did not parse as TOML
    #[error("failed to parse config: {0}")]
    ParseFailed(String),

    /// Harness config parsed but holds invalid values
    #[error("validation error: {0}")]
    Validation(String),
}

/// Console-session specific errors
#[derive(Error, Debug)]
pub enum ConsoleError {
    /// Underlying transport failed (disconnect, write error)
    #[error("console transport error: {0}")]
    Transport(String),

    /// The idle prompt did not return after an interrupt
    #[error("console prompt did not return after interrupt")]
    PromptLost,
}

/// Backend command execution errors
#[derive(Error, Debug)]
pub enum BackendError {
    /// Container runtime binary not found in PATH
    #[error("container runtime not found in PATH")]
    RuntimeNotFound,

    /// Command exited non-zero; payload is the captured stderr
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// Command did not finish within the backend timeout
    #[error("command timed out after {0} seconds")]
    Timeout(u64),

    /// Container network could not be inspected, even after one create attempt.
    /// Carries the full inspection payload to aid diagnosis.
    #[error("network {name} could not be inspected: {payload}")]
    NetworkInspect { name: String, payload: String },

    /// Backend output did not match the expected shape
    #[error("failed to parse backend output: {0}")]
    ParseError(String),

    /// The operation has no implementation on this backend
    #[error("operation not supported on this backend: {0}")]
    Unsupported(&'static str),
}

/// Control channel errors
#[derive(Error, Debug)]
pub enum ControlError {
    /// Could not reach the control endpoint
    #[error("failed to connect to control endpoint {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// The device reported a terminal error status
    #[error("control command failed: {0}")]
    CommandFailed(String),

    /// The reply completed but did not carry the requested parameter
    #[error("parameter `{0}` missing from control reply")]
    MissingParameter(String),

    /// No complete reply within the exchange timeout
    #[error("control exchange timed out after {0} seconds")]
    Timeout(u64),
}
