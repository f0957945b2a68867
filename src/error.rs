//! Custom error types for the application.
//!
//! This module defines the primary error type, `NomicError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to name
//! the failures that operating procedures need to react to, from configuration
//! problems to an open phase loop in the middle of a setpoint search.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type errors.
//! - **`Configuration`**: Semantic errors in a configuration that parsed fine
//!   (e.g. an even number of scan points).
//! - **`InvalidPath` / `PropertyNotFound` / `TypeMismatch`**: Problems addressing
//!   a property on the device-control server.
//! - **`InterlockOpen`**: The phase loop reported open; procedures abort on it.
//! - **`CameraBusy`**: The camera is still integrating when a procedure needs it idle.
//! - **`Timeout`**: A wait on a server property did not complete in time.
//! - **`SetpointNotConverged`**: The setpoint search hit its iteration cap.
//! - **`Cancelled`**: Cooperative cancellation was requested.
//!
//! Capability traits and procedures return `anyhow::Result`. They raise these
//! variants with `?`/`into()`, and callers that care about a specific failure
//! recover it with `anyhow::Error::downcast_ref::<NomicError>()`.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, NomicError>;

/// Failures raised by device access and operating procedures.
#[derive(Error, Debug)]
pub enum NomicError {
    /// Configuration could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but holds invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A property path was not of the form `Device.Property.Element`.
    #[error("Invalid property path '{0}': expected Device.Property.Element")]
    InvalidPath(String),

    /// The server has no property at this path.
    #[error("Property not found: {0}")]
    PropertyNotFound(String),

    /// The property exists but holds a different kind of value.
    #[error("Property {path} is {actual}, expected {expected}")]
    TypeMismatch {
        /// Full property path
        path: String,
        /// Requested value kind
        expected: &'static str,
        /// Kind actually stored
        actual: &'static str,
    },

    /// The server refused a property update.
    #[error("Server rejected update of {path}: {reason}")]
    Rejected {
        /// Device.Property that was being set
        path: String,
        /// Reason reported by the server
        reason: String,
    },

    /// The phase loop is open; data taken now would be invalid.
    #[error("Phase loop open: {0}")]
    InterlockOpen(String),

    /// The camera is still integrating.
    #[error("Camera is still integrating")]
    CameraBusy,

    /// A wait on the server did not complete.
    #[error("Timed out after {seconds:.1}s waiting for {what}")]
    Timeout {
        /// What was being waited on
        what: String,
        /// Timeout that elapsed
        seconds: f64,
    },

    /// The setpoint search exhausted its iteration budget.
    #[error("Setpoint search did not converge after {iterations} iterations (last setpoint {last_setpoint:.1} deg)")]
    SetpointNotConverged {
        /// Iterations performed
        iterations: u32,
        /// Scan center when the search gave up
        last_setpoint: f64,
    },

    /// Cancellation requested by the caller.
    #[error("Cancelled by user")]
    Cancelled,
}

impl From<figment::Error> for NomicError {
    fn from(value: figment::Error) -> Self {
        NomicError::Config(Box::new(value))
    }
}

impl NomicError {
    /// Whether an operator can reasonably retry after fixing the situation
    /// (closing a loop, waiting for the camera).
    pub fn can_recover(&self) -> bool {
        matches!(
            self,
            NomicError::InterlockOpen(_)
                | NomicError::CameraBusy
                | NomicError::Timeout { .. }
                | NomicError::Rejected { .. }
                | NomicError::Cancelled
        )
    }
}
