//! peerlink Protocol Engine
//!
//! Discovery, trust-on-first-use pairing and capability dispatch for LAN
//! device companions. Hosts announce themselves over UDP, open mutually
//! authenticated TLS channels over TCP, pin each other's certificate
//! fingerprints when users agree to pair, and exchange typed packets that are
//! routed to capability plugins.
//!
//! The [`DeviceRegistry`] is the entry point: it owns the listeners and one
//! state machine per remote device, and reports everything through
//! [`DeviceEvent`]s.

pub mod device;
pub mod discovery;
pub mod events;
pub mod packet;
pub mod pairing;
pub mod plugins;
pub mod registry;
pub mod transport;

mod error;
pub use device::{DeviceSnapshot, DeviceState};
pub use discovery::{DeviceInfo, DeviceType, DiscoveryConfig, DiscoveryService};
pub use error::{ProtocolError, Result};
pub use events::{DeviceEvent, EventBus};
pub use packet::{current_timestamp, next_packet_id, Packet, PacketCodec, MAX_PACKET_SIZE};
pub use pairing::{CertificateInfo, MemoryTrustStore, PairingPacket, TrustRecords, TrustStore};
pub use plugins::{NotificationEvent, Plugin, PluginContext, PluginFactory, PluginRegistry};
pub use registry::{DeviceRegistry, RegistryConfig};

/// Protocol version we implement
pub const PROTOCOL_VERSION: u32 = 7;
