//! Wire protocol shared between every PlayHouse node: the client frame
//! codec, the inter-node `RoutePacket` envelope, and the framework error
//! taxonomy.

pub mod channel;
pub mod codec;
pub mod error;
pub mod model;

pub use channel::{ServiceId, TransportKind};
pub use codec::CodecError;
pub use error::ErrorCode;
pub use model::{NodeId, Packet, RoutePacket, MAX_FRAME_BODY_BYTES, MAX_MSG_ID_LEN};

/// Returns the protocol crate version string.
#[must_use]
pub fn protocol_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_matches_pkg() {
        assert_eq!(protocol_version(), env!("CARGO_PKG_VERSION"));
    }
}
