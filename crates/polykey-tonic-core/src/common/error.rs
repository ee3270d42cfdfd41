//! Error types for the Polykey key service.
//!
//! This module defines the central `Error` enum returned by key handlers. It
//! implements `From<Error>` for `tonic::Status` so handler failures reach
//! clients with the matching gRPC status code.
//!
//! ## Error Cases
//! - `KeyNotFound`: No key is stored under the requested identifier.
//! - `InvalidRequest`: The client request was malformed.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the key service handlers.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The requested key does not exist.
    #[error("Key not found: {key_id}")]
    KeyNotFound { key_id: String },

    /// The client request was invalid.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::KeyNotFound { key_id } => Status::not_found(format!("Key not found: {key_id}")),
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
        }
    }
}
