//! Error types for handlink.
//!
//! Consumer-facing failures are mostly communicated through typed events or
//! invalid sentinel values; `Error` covers the small set of calls that can
//! fail synchronously.

use thiserror::Error;

use crate::service::ServiceError;

#[derive(Error, Debug)]
pub enum Error {
    /// The underlying service call failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The operation requires a running connection.
    #[error("connection is not running")]
    NotRunning,
}

/// Result type alias for handlink operations.
pub type Result<T> = std::result::Result<T, Error>;
