//! Identifiers shared across layers.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::borrow::Borrow;
use std::fmt;
use std::net::SocketAddr;

/// Opaque, stable identifier of one connection.
///
/// Derived once from the peer address, a per-server serial number and the
/// server secret; never reassigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Hash `ip`, `port`, `serial` and `secret` into a hex id.
    #[must_use]
    pub fn derive(peer: &SocketAddr, serial: u64, secret: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(peer.ip().to_string().as_bytes());
        hasher.update(peer.port().to_string().as_bytes());
        hasher.update(serial.to_string().as_bytes());
        hasher.update(secret.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Borrow the id text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for ConnectionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}
