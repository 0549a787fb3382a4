//! Per-device packet dispatch

use super::{NotificationEvent, PacketSender, Plugin, PluginContext, PluginFactory};
use crate::discovery::DeviceInfo;
use crate::{Packet, ProtocolError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Plugin instances active on one device
pub struct DevicePlugins {
    device_id: String,
    plugins: Vec<Box<dyn Plugin>>,
    /// packet type -> index into `plugins`
    routes: HashMap<String, usize>,
    /// packet types we may send to this peer
    sendable: HashSet<String>,
}

impl DevicePlugins {
    /// No plugins: every capability packet is a mismatch
    pub fn empty(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            plugins: Vec::new(),
            routes: HashMap::new(),
            sendable: HashSet::new(),
        }
    }

    pub(crate) async fn activate(
        factories: Vec<Arc<dyn PluginFactory>>,
        peer: &DeviceInfo,
        sender: PacketSender,
    ) -> Self {
        let mut active = Self::empty(peer.device_id.clone());
        let peer_incoming: HashSet<&str> =
            peer.incoming_capabilities.iter().map(String::as_str).collect();

        for factory in factories {
            let mut plugin = factory.create();
            let context = PluginContext {
                device_id: peer.device_id.clone(),
                device_name: peer.device_name.clone(),
                sender: sender.clone(),
            };

            if let Err(e) = plugin.init(context).await {
                error!(
                    "Failed to initialize plugin {} for device {}: {}",
                    factory.name(),
                    peer.device_id,
                    e
                );
                continue;
            }

            if let Err(e) = plugin.start().await {
                error!(
                    "Failed to start plugin {} for device {}: {}",
                    factory.name(),
                    peer.device_id,
                    e
                );
                continue;
            }

            let index = active.plugins.len();
            for capability in factory.incoming_capabilities() {
                active.routes.insert(capability, index);
            }
            active.sendable.extend(
                factory
                    .outgoing_capabilities()
                    .into_iter()
                    .filter(|c| peer_incoming.contains(c.as_str())),
            );
            active.plugins.push(plugin);
        }

        debug!(
            "Device {} has {} active plugins",
            active.device_id,
            active.plugins.len()
        );
        active
    }

    /// Route a packet to the plugin registered for its type
    ///
    /// Returns `CapabilityMismatch` when no plugin is registered, and
    /// `Handler` when the plugin fails. Neither affects later packets.
    pub async fn dispatch(&mut self, packet: &Packet) -> Result<()> {
        let index = *self
            .routes
            .get(&packet.packet_type)
            .ok_or_else(|| ProtocolError::CapabilityMismatch(packet.packet_type.clone()))?;

        let plugin = &mut self.plugins[index];
        debug!(
            "Routing packet {} to plugin {} for device {}",
            packet.packet_type,
            plugin.name(),
            self.device_id
        );

        plugin
            .handle_packet(packet)
            .await
            .map_err(|e| ProtocolError::Handler {
                plugin: plugin.name().to_string(),
                message: e.to_string(),
            })
    }

    /// Whether the peer accepts packets of this type from one of our plugins
    pub fn can_send(&self, packet_type: &str) -> bool {
        self.sendable.contains(packet_type)
    }

    pub fn accepts_notifications(&self) -> bool {
        self.plugins.iter().any(|p| p.accepts_notifications())
    }

    /// Hand a host notification to every notification-capable plugin
    ///
    /// Returns how many plugins took it.
    pub async fn relay_notification(&mut self, notification: &NotificationEvent) -> usize {
        let mut relayed = 0;
        for plugin in self.plugins.iter_mut().filter(|p| p.accepts_notifications()) {
            match plugin.relay_notification(notification).await {
                Ok(()) => relayed += 1,
                Err(e) => warn!(
                    "Plugin {} failed to relay notification to {}: {}",
                    plugin.name(),
                    self.device_id,
                    e
                ),
            }
        }
        relayed
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Stop and release every plugin
    pub async fn shutdown(&mut self) {
        for plugin in self.plugins.iter_mut() {
            if let Err(e) = plugin.stop().await {
                warn!(
                    "Plugin {} failed to stop for {}: {}",
                    plugin.name(),
                    self.device_id,
                    e
                );
            }
        }
        if !self.plugins.is_empty() {
            debug!("Released {} plugins for {}", self.plugins.len(), self.device_id);
        }
        self.plugins.clear();
        self.routes.clear();
        self.sendable.clear();
    }
}
