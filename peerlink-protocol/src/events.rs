//! Device Events
//!
//! Everything the engine reports to the host application. Every subscriber
//! receives every event emitted after it subscribed, in emission order.

use crate::device::DeviceState;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A device was added to or removed from the registry
    DeviceListChanged { device_ids: Vec<String> },

    /// A device moved to a new state
    StateChanged {
        device_id: String,
        state: DeviceState,
    },

    /// A connected device asked to pair; answer with accept or reject
    PairingRequested {
        device_id: String,
        device_name: String,
        /// Fingerprint of the requesting device, for the user to compare
        fingerprint: String,
    },

    /// Pairing completed; the fingerprint is now pinned
    Paired {
        device_id: String,
        fingerprint: String,
    },

    /// A pairing request was declined, by either side
    PairingRejected { device_id: String, reason: String },

    /// A pairing request expired without an answer
    PairingTimeout { device_id: String },

    /// Trust was removed, by either side
    Unpaired { device_id: String },

    /// A paired device presented a different certificate
    TrustViolation {
        device_id: String,
        expected: String,
        actual: String,
    },

    /// A connection attempt failed
    ConnectionFailed {
        device_id: Option<String>,
        remote_addr: SocketAddr,
        message: String,
    },

    /// A live channel went away
    ConnectionLost {
        device_id: String,
        reason: String,
        paired: bool,
    },
}

impl DeviceEvent {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            DeviceEvent::DeviceListChanged { .. } => None,
            DeviceEvent::ConnectionFailed { device_id, .. } => device_id.as_deref(),
            DeviceEvent::StateChanged { device_id, .. }
            | DeviceEvent::PairingRequested { device_id, .. }
            | DeviceEvent::Paired { device_id, .. }
            | DeviceEvent::PairingRejected { device_id, .. }
            | DeviceEvent::PairingTimeout { device_id }
            | DeviceEvent::Unpaired { device_id }
            | DeviceEvent::TrustViolation { device_id, .. }
            | DeviceEvent::ConnectionLost { device_id, .. } => Some(device_id),
        }
    }

    /// Events worth interrupting the user for
    pub fn is_user_visible(&self) -> bool {
        match self {
            DeviceEvent::PairingRequested { .. }
            | DeviceEvent::PairingRejected { .. }
            | DeviceEvent::PairingTimeout { .. }
            | DeviceEvent::TrustViolation { .. } => true,
            DeviceEvent::ConnectionLost { paired, .. } => *paired,
            _ => false,
        }
    }
}

/// Fan-out of device events to any number of subscribers
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<DeviceEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DeviceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Deliver to every live subscriber, dropping those that went away
    pub fn emit(&self, event: DeviceEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}
