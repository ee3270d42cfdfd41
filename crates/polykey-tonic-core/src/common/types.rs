//! # Service Identity and Key Identifiers
//!
//! Constants shared by the server and clients so both sides agree on the
//! names used for routing and health reporting.
//!
//! - [`SERVICE_NAME`] - Fully-qualified gRPC service name, also the key used
//!   in the health map.
//! - [`KeyId`] - Identifier handed out by `CreateKey`.

use core::fmt;

/// Fully-qualified name of the key service, as used in gRPC paths and health
/// checks.
pub const SERVICE_NAME: &str = "polykey.v2.PolykeyService";

/// Prefix of every generated key identifier.
pub const KEY_ID_PREFIX: &str = "pk_";

/// Identifier of a stored key.
///
/// Rendered as [`KEY_ID_PREFIX`] followed by a zero-padded sequence number,
/// e.g. `pk_0000000000000001`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(u64);

impl KeyId {
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub const fn sequence(self) -> u64 {
        self.0
    }

    /// Parses an identifier previously produced by [`KeyId`]'s `Display`.
    pub fn parse(raw: &str) -> Option<Self> {
        let digits = raw.strip_prefix(KEY_ID_PREFIX)?;
        if digits.len() != 16 {
            return None;
        }
        digits.parse().ok().map(Self)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{KEY_ID_PREFIX}{:016}", self.0)
    }
}
