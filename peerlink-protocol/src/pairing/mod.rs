//! Device Pairing
//!
//! Pairing is trust-on-first-use: the first time two hosts agree to pair, each
//! pins the SHA-256 fingerprint of the certificate the other presented during
//! the TLS handshake. Later connections from the same device id must present
//! the same certificate or they are refused.
//!
//! ## Pairing Protocol
//!
//! 1. **Connection**: a TLS channel is established (see [`crate::transport`])
//! 2. **Request**: one side sends `pair` with `pair: true`
//! 3. **Verification**: users compare fingerprints on both hosts
//! 4. **Response**: the other side answers `pair: true` (accept) or
//!    `pair: false` (reject) within [`PAIRING_TIMEOUT`]
//! 5. **Pinning**: both sides store the peer fingerprint in their [`TrustStore`]
//!
//! Either side may later send `unpair`, which removes the pinned fingerprint
//! on both hosts.

mod certificate;
mod trust;

pub use certificate::{calculate_fingerprint, device_id_from_certificate, CertificateInfo};
pub use trust::{MemoryTrustStore, TrustRecords, TrustStore};

#[cfg(test)]
pub(crate) use certificate::tests::test_certificate;

use crate::packet::{PACKET_TYPE_PAIR, PACKET_TYPE_UNPAIR};
use crate::Packet;
use serde_json::json;
use std::time::Duration;

/// Default pairing timeout
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Pairing message carried by a control packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPacket {
    /// `pair` with `pair: true`: a request, or the acceptance of one
    Pair,
    /// `pair` with `pair: false`: a rejection, or a withdrawal of trust
    Reject,
    /// `unpair`
    Unpair,
}

impl PairingPacket {
    /// Interpret a control packet; `None` for anything else
    pub fn from_packet(packet: &Packet) -> Option<Self> {
        match packet.packet_type.as_str() {
            PACKET_TYPE_PAIR => match packet.get_body_field::<bool>("pair") {
                Some(true) => Some(PairingPacket::Pair),
                Some(false) => Some(PairingPacket::Reject),
                None => None,
            },
            PACKET_TYPE_UNPAIR => Some(PairingPacket::Unpair),
            _ => None,
        }
    }

    pub fn to_packet(self) -> Packet {
        match self {
            PairingPacket::Pair => Packet::new(PACKET_TYPE_PAIR, json!({ "pair": true })),
            PairingPacket::Reject => Packet::new(PACKET_TYPE_PAIR, json!({ "pair": false })),
            PairingPacket::Unpair => Packet::new(PACKET_TYPE_UNPAIR, json!({})),
        }
    }
}
