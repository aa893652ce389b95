//! Node service identity and client transport kinds.

use serde::{Deserialize, Serialize};

/// The role a node plays in the mesh. Carried in every `RoutePacket` so the
/// receiving side of the mesh can classify inbound traffic without
/// consulting the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceId {
    /// Stateful node hosting Stages.
    Play = 1,
    /// Stateless request-handling node.
    Api = 2,
}

impl ServiceId {
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ServiceId {
    type Error = InvalidServiceId;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Play),
            2 => Ok(Self::Api),
            other => Err(InvalidServiceId(other)),
        }
    }
}

/// Error returned when an unknown service id byte is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidServiceId(pub u8);

impl core::fmt::Display for InvalidServiceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "invalid service id {}", self.0)
    }
}

impl std::error::Error for InvalidServiceId {}

/// Client-facing transport a session was accepted on. Purely informational
/// (for logging/metrics) — the framed packet contract is identical across
/// all four.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TransportKind {
    #[must_use]
    pub const fn is_encrypted(self) -> bool {
        matches!(self, Self::Tls | Self::Wss)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tls => "tls",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }
}

impl core::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_id_round_trips() {
        assert_eq!(ServiceId::try_from(1u8).unwrap(), ServiceId::Play);
        assert_eq!(ServiceId::try_from(2u8).unwrap(), ServiceId::Api);
        assert!(ServiceId::try_from(3u8).is_err());
    }

    #[test]
    fn tls_and_wss_are_encrypted() {
        assert!(TransportKind::Tls.is_encrypted());
        assert!(TransportKind::Wss.is_encrypted());
        assert!(!TransportKind::Tcp.is_encrypted());
        assert!(!TransportKind::Ws.is_encrypted());
    }
}
