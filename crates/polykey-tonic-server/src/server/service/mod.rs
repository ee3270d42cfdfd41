//! Business services served by the host.
//!
//! ## Structure
//!
//! - [`handler`] - In-memory `PolykeyService` (`MockKeyService`).

pub mod handler;
