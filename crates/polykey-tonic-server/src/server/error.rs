//! Failures of the service host itself.
//!
//! Handler errors are not represented here: they travel to the caller as a
//! `tonic::Status` and are only observed by the call interceptor. Every
//! variant below is fatal for the process.

use std::io;

pub type Result<T> = core::result::Result<T, HostError>;

#[derive(thiserror::Error, Debug)]
pub enum HostError {
    /// The listen address could not be bound (in use, permission denied,
    /// unresolvable).
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The transport failed after a successful bind.
    #[error("server failed: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The reflection service rejected the registered descriptors.
    #[error("failed to build reflection service: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    /// A registered file descriptor set could not be decoded.
    #[error("invalid file descriptor set: {0}")]
    Descriptor(#[from] prost::DecodeError),

    /// The serve task panicked or was cancelled outside the drain path.
    #[error("serve task failed: {0}")]
    ServeTask(#[from] tokio::task::JoinError),

    /// The accept loop returned although no shutdown was requested.
    #[error("server exited without a shutdown request")]
    UnexpectedExit,
}
