use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of bytes a client sends as its handshake.
pub const CLIENT_ID_LEN: usize = 16;

/// 128-bit identifier a client presents as the first 16 bytes of a connection.
///
/// The bytes are taken in big-endian (RFC 4122) order, so the wire bytes
/// `00 00 .. 00 01` display as `00000000-0000-0000-0000-000000000001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub const fn from_bytes(bytes: [u8; CLIENT_ID_LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Random identifier, used by the heartbeat client when none is given.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// The exact bytes a client writes during the handshake.
    pub fn to_bytes(self) -> [u8; CLIENT_ID_LEN] {
        *self.0.as_bytes()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for ClientId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}
