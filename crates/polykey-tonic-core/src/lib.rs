#![doc = include_str!("../README.md")]

mod common;
pub use common::*;

/// gRPC service and message definitions for the `polykey.v2` package.
///
/// ## Service
///
/// - `PolykeyService/CreateKey` - Stores a key description and returns its
///   generated identifier.
/// - `PolykeyService/GetKey` - Looks a key up by identifier.
///
/// The server trait lives in [`polykey_service_server`] and the client in
/// [`polykey_service_client`].
pub mod proto {
    tonic::include_proto!("polykey.v2");

    /// Encoded `FileDescriptorSet` for the `polykey.v2` package.
    ///
    /// Registered with the reflection service and used by the host to list
    /// the methods it serves.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("polykey_descriptor");
}
