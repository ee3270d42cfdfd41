//! Shared types and error definitions used by the Polykey server and its
//! clients.
//!
//! ## Submodules
//!
//! - [`error`] - Business error type and its mapping onto `tonic::Status`.
//! - [`types`] - Service names and key identifiers.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
