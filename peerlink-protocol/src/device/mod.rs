//! Device Management
//!
//! One [`DeviceState`] machine per remote device, each driven by its own task
//! (see [`actor`]). The registry talks to a device only through its command
//! queue and reads its state from a published [`DeviceSnapshot`].
//!
//! ## State Transitions
//!
//! ```text
//! Discovered ──connect──▶ Connecting ──channel──▶ ConnectedUnpaired
//!     ▲                                          │        ▲
//!     │ unpair                       request/recv pair    │ reject/timeout
//!     │                                          ▼        │
//! PairedConnected ◀──────accept────── PairRequestedOut / PairRequestedIn
//!     │      ▲
//!  loss│      │ channel with matching fingerprint
//!     ▼      │
//! PairedDisconnected
//! ```

pub(crate) mod actor;

use crate::discovery::DeviceInfo;
use crate::events::EventBus;
use crate::pairing::TrustStore;
use crate::plugins::PluginRegistry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub(crate) use actor::{DeviceCommand, DeviceHandle, DeviceSender};

/// Device state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Known, no channel
    Discovered,
    /// Outbound connection attempt in progress
    Connecting,
    /// Channel up, not paired
    ConnectedUnpaired,
    /// We asked to pair and wait for an answer
    PairRequestedOut,
    /// The peer asked to pair and waits for our answer
    PairRequestedIn,
    /// Paired, channel up: capability packets flow
    PairedConnected,
    /// Paired, no channel
    PairedDisconnected,
}

impl DeviceState {
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            DeviceState::ConnectedUnpaired
                | DeviceState::PairRequestedOut
                | DeviceState::PairRequestedIn
                | DeviceState::PairedConnected
        )
    }

    pub fn is_paired(&self) -> bool {
        matches!(
            self,
            DeviceState::PairedConnected | DeviceState::PairedDisconnected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Discovered => "discovered",
            DeviceState::Connecting => "connecting",
            DeviceState::ConnectedUnpaired => "connected_unpaired",
            DeviceState::PairRequestedOut => "pair_requested_out",
            DeviceState::PairRequestedIn => "pair_requested_in",
            DeviceState::PairedConnected => "paired_connected",
            DeviceState::PairedDisconnected => "paired_disconnected",
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a device, published after every change
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub device_id: String,
    /// Last identity received; absent for devices only known by id
    pub info: Option<DeviceInfo>,
    pub state: DeviceState,
    pub remote_addr: Option<SocketAddr>,
    /// Fingerprint of the certificate on the live channel
    pub fingerprint: Option<String>,
    /// Names of the active plugins
    pub plugins: Vec<String>,
    pub accepts_notifications: bool,
}

impl DeviceSnapshot {
    pub fn name(&self) -> &str {
        self.info
            .as_ref()
            .map(|info| info.device_name.as_str())
            .unwrap_or(&self.device_id)
    }

    pub fn is_paired(&self) -> bool {
        self.state.is_paired()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }
}

/// What every device actor shares
pub(crate) struct DeviceContext {
    pub trust: Arc<dyn TrustStore>,
    pub plugins: Arc<PluginRegistry>,
    pub events: EventBus,
    pub pairing_timeout: Duration,
    pub max_packet_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(DeviceState::PairedConnected.is_connected());
        assert!(DeviceState::PairedConnected.is_paired());
        assert!(DeviceState::PairedDisconnected.is_paired());
        assert!(!DeviceState::PairedDisconnected.is_connected());
        assert!(DeviceState::PairRequestedIn.is_connected());
        assert!(!DeviceState::PairRequestedIn.is_paired());
        assert!(!DeviceState::Connecting.is_connected());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&DeviceState::PairRequestedOut).unwrap();
        assert_eq!(json, "\"pair_requested_out\"");
        assert_eq!(DeviceState::PairRequestedOut.to_string(), "pair_requested_out");
    }
}
