//! Device Discovery
//!
//! Hosts announce themselves by broadcasting an identity packet over UDP and
//! listen for the announcements of others.
//!
//! ## Identity Packet Format
//!
//! Identity packets (`identity`) contain:
//! - `deviceId`: stable identifier, equal to the CN of the device certificate
//! - `deviceName`: human-readable device name
//! - `deviceType`: desktop, laptop, phone or tablet
//! - `protocolVersion`: protocol version (currently 7)
//! - `incomingCapabilities`: packet types this device can receive
//! - `outgoingCapabilities`: packet types this device can send
//! - `tcpPort`: TCP port accepting channel connections
//!
//! ## Port Configuration
//!
//! - UDP 1716 for announcements, on every interface
//! - Announcements go to the IPv4 limited broadcast address

mod service;

pub use service::{Announcement, DiscoveryConfig, DiscoveryService};

use crate::packet::PACKET_TYPE_IDENTITY;
use crate::{Packet, ProtocolError, Result, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::Ipv4Addr;

/// Default UDP port for device discovery
pub const DISCOVERY_PORT: u16 = 1716;

/// Broadcast address for IPv4
pub const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

/// Upper bound on device id length accepted from the network
const MAX_DEVICE_ID_LEN: usize = 128;

/// Device types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "desktop" => Ok(DeviceType::Desktop),
            "laptop" => Ok(DeviceType::Laptop),
            "phone" => Ok(DeviceType::Phone),
            "tablet" => Ok(DeviceType::Tablet),
            other => Err(ProtocolError::MalformedPacket(format!(
                "Unknown device type: {}",
                other
            ))),
        }
    }
}

/// Device identity information
///
/// The content of an identity packet. Built once for the local host at
/// startup; only `device_name` changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Unique device identifier (certificate CN)
    pub device_id: String,

    /// Human-readable device name
    pub device_name: String,

    /// Type of device
    pub device_type: DeviceType,

    /// Protocol version
    pub protocol_version: u32,

    /// Packet types this device can receive
    pub incoming_capabilities: Vec<String>,

    /// Packet types this device can send
    pub outgoing_capabilities: Vec<String>,

    /// TCP port for connections
    pub tcp_port: u16,
}

impl DeviceInfo {
    /// Create a DeviceInfo with an explicit device ID
    ///
    /// ```
    /// use peerlink_protocol::discovery::{DeviceInfo, DeviceType};
    ///
    /// let info = DeviceInfo::new("alice", "Alice's Laptop", DeviceType::Laptop, 1716)
    ///     .with_incoming_capability("ping");
    /// assert_eq!(info.incoming_capabilities, vec!["ping"]);
    /// ```
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        tcp_port: u16,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port,
        }
    }

    /// Add an incoming capability
    pub fn with_incoming_capability(mut self, capability: impl Into<String>) -> Self {
        self.incoming_capabilities.push(capability.into());
        self
    }

    /// Add an outgoing capability
    pub fn with_outgoing_capability(mut self, capability: impl Into<String>) -> Self {
        self.outgoing_capabilities.push(capability.into());
        self
    }

    /// Set all incoming capabilities at once
    pub fn with_incoming_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.incoming_capabilities = capabilities;
        self
    }

    /// Set all outgoing capabilities at once
    pub fn with_outgoing_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.outgoing_capabilities = capabilities;
        self
    }

    /// Convert DeviceInfo to an identity packet with a fresh packet id
    pub fn to_identity_packet(&self) -> Packet {
        Packet::new(
            PACKET_TYPE_IDENTITY,
            json!({
                "deviceId": self.device_id,
                "deviceName": self.device_name,
                "deviceType": self.device_type.as_str(),
                "protocolVersion": self.protocol_version,
                "incomingCapabilities": self.incoming_capabilities,
                "outgoingCapabilities": self.outgoing_capabilities,
                "tcpPort": self.tcp_port,
            }),
        )
    }

    /// Parse DeviceInfo from an identity packet
    pub fn from_identity_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(ProtocolError::MalformedPacket(format!(
                "Expected identity packet, got {}",
                packet.packet_type
            )));
        }

        let device_id = packet
            .get_body_field::<String>("deviceId")
            .ok_or_else(|| ProtocolError::MalformedPacket("Missing deviceId".to_string()))?;

        if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
            return Err(ProtocolError::MalformedPacket(format!(
                "Invalid deviceId length: {}",
                device_id.len()
            )));
        }

        let device_name = packet
            .get_body_field::<String>("deviceName")
            .ok_or_else(|| ProtocolError::MalformedPacket("Missing deviceName".to_string()))?;

        let device_type = packet
            .get_body_field::<String>("deviceType")
            .ok_or_else(|| ProtocolError::MalformedPacket("Missing deviceType".to_string()))?
            .parse()?;

        let protocol_version = packet
            .get_body_field::<u32>("protocolVersion")
            .unwrap_or(PROTOCOL_VERSION);

        let tcp_port = packet
            .get_body_field::<u16>("tcpPort")
            .ok_or_else(|| ProtocolError::MalformedPacket("Missing tcpPort".to_string()))?;

        let incoming_capabilities = packet
            .get_body_field::<Vec<String>>("incomingCapabilities")
            .unwrap_or_default();

        let outgoing_capabilities = packet
            .get_body_field::<Vec<String>>("outgoingCapabilities")
            .unwrap_or_default();

        Ok(Self {
            device_id,
            device_name,
            device_type,
            protocol_version,
            incoming_capabilities,
            outgoing_capabilities,
            tcp_port,
        })
    }
}
