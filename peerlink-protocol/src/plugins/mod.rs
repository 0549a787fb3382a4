//! Capability Plugin System
//!
//! A plugin implements one feature (ping, notifications, ...) and declares the
//! packet types it can receive (incoming capabilities) and send (outgoing
//! capabilities). The union of every registered plugin's declarations is what
//! the local identity advertises.
//!
//! ## Architecture
//!
//! - [`PluginFactory`]: registered once at startup, creates plugin instances
//! - [`PluginRegistry`]: validates factories and negotiates with each peer
//! - [`DevicePlugins`]: the plugin instances active on one paired device, and
//!   the dispatcher routing that device's packets to them
//!
//! ## Activation
//!
//! A plugin is activated for a peer when the peer sends something the plugin
//! receives, or the plugin sends something the peer receives. Instances exist
//! only while the device is paired and connected; they are stopped and dropped
//! when the channel goes away.
//!
//! ## Example Plugin
//!
//! ```rust
//! use async_trait::async_trait;
//! use peerlink_protocol::plugins::{Plugin, PluginContext, PluginFactory};
//! use peerlink_protocol::{Packet, Result};
//!
//! struct PingPlugin {
//!     context: Option<PluginContext>,
//! }
//!
//! #[async_trait]
//! impl Plugin for PingPlugin {
//!     fn name(&self) -> &str {
//!         "ping"
//!     }
//!
//!     async fn init(&mut self, context: PluginContext) -> Result<()> {
//!         self.context = Some(context);
//!         Ok(())
//!     }
//!
//!     async fn handle_packet(&mut self, packet: &Packet) -> Result<()> {
//!         println!("ping: {:?}", packet.body.get("message"));
//!         Ok(())
//!     }
//! }
//!
//! struct PingPluginFactory;
//!
//! impl PluginFactory for PingPluginFactory {
//!     fn name(&self) -> &str {
//!         "ping"
//!     }
//!
//!     fn incoming_capabilities(&self) -> Vec<String> {
//!         vec!["ping".to_string()]
//!     }
//!
//!     fn outgoing_capabilities(&self) -> Vec<String> {
//!         vec!["ping".to_string()]
//!     }
//!
//!     fn create(&self) -> Box<dyn Plugin> {
//!         Box::new(PingPlugin { context: None })
//!     }
//! }
//! ```

mod dispatch;

pub use dispatch::DevicePlugins;

use crate::discovery::DeviceInfo;
use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Creates per-device plugin instances
pub trait PluginFactory: Send + Sync {
    /// Unique plugin name
    fn name(&self) -> &str;

    /// Packet types this plugin can receive
    fn incoming_capabilities(&self) -> Vec<String>;

    /// Packet types this plugin can send
    fn outgoing_capabilities(&self) -> Vec<String>;

    /// Create a fresh instance for one device
    fn create(&self) -> Box<dyn Plugin>;
}

/// A capability handler bound to one device
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Called once after creation, before any packet is delivered
    async fn init(&mut self, context: PluginContext) -> Result<()>;

    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handle one incoming packet of a type this plugin declared
    ///
    /// Errors are logged by the dispatcher and never affect the channel.
    async fn handle_packet(&mut self, packet: &Packet) -> Result<()>;

    /// Whether this plugin forwards host notifications to the device
    fn accepts_notifications(&self) -> bool {
        false
    }

    /// Forward a host notification to the device
    async fn relay_notification(&mut self, _notification: &NotificationEvent) -> Result<()> {
        Ok(())
    }
}

/// What a plugin instance knows about its device
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub device_id: String,
    pub device_name: String,
    pub sender: PacketSender,
}

/// Sends packets to the device a plugin is bound to
///
/// Packets go through the device, which drops them unless it is paired and
/// connected and the peer declared the type as incoming.
#[derive(Debug, Clone)]
pub struct PacketSender {
    tx: mpsc::UnboundedSender<Packet>,
}

impl PacketSender {
    pub fn new(tx: mpsc::UnboundedSender<Packet>) -> Self {
        Self { tx }
    }

    pub fn send(&self, packet: Packet) -> Result<()> {
        self.tx
            .send(packet)
            .map_err(|_| ProtocolError::InvalidState("device is gone".to_string()))
    }
}

/// A notification raised on the host, to be relayed to paired devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    /// Stable id so updates replace earlier notifications
    pub id: String,
    pub app_name: String,
    pub title: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Registry of plugin factories
///
/// Rejects a factory whose name is taken, whose declarations repeat a
/// capability, or which claims an incoming capability already owned by
/// another factory.
#[derive(Default)]
pub struct PluginRegistry {
    factories: Vec<Arc<dyn PluginFactory>>,
    /// incoming capability -> factory name
    capability_map: HashMap<String, String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_factory(&mut self, factory: Arc<dyn PluginFactory>) -> Result<()> {
        let name = factory.name().to_string();

        if self.factories.iter().any(|f| f.name() == name) {
            return Err(ProtocolError::Plugin(format!(
                "Plugin factory '{}' is already registered",
                name
            )));
        }

        let incoming = factory.incoming_capabilities();
        let outgoing = factory.outgoing_capabilities();
        ensure_unique(&name, "incoming", &incoming)?;
        ensure_unique(&name, "outgoing", &outgoing)?;

        for capability in &incoming {
            if let Some(existing) = self.capability_map.get(capability) {
                return Err(ProtocolError::Plugin(format!(
                    "Capability '{}' already handled by plugin '{}'",
                    capability, existing
                )));
            }
        }

        for capability in incoming {
            self.capability_map.insert(capability, name.clone());
        }

        info!("Registered plugin factory: {}", name);
        self.factories.push(factory);
        Ok(())
    }

    /// Sorted union of every factory's incoming capabilities
    pub fn incoming_capabilities(&self) -> Vec<String> {
        self.factories
            .iter()
            .flat_map(|f| f.incoming_capabilities())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Sorted union of every factory's outgoing capabilities
    pub fn outgoing_capabilities(&self) -> Vec<String> {
        self.factories
            .iter()
            .flat_map(|f| f.outgoing_capabilities())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Factories worth activating for `peer`
    pub fn negotiate(&self, peer: &DeviceInfo) -> Vec<Arc<dyn PluginFactory>> {
        let peer_incoming: HashSet<&str> =
            peer.incoming_capabilities.iter().map(String::as_str).collect();
        let peer_outgoing: HashSet<&str> =
            peer.outgoing_capabilities.iter().map(String::as_str).collect();

        self.factories
            .iter()
            .filter(|factory| {
                let receives = factory
                    .incoming_capabilities()
                    .iter()
                    .any(|c| peer_outgoing.contains(c.as_str()));
                let sends = factory
                    .outgoing_capabilities()
                    .iter()
                    .any(|c| peer_incoming.contains(c.as_str()));
                receives || sends
            })
            .cloned()
            .collect()
    }

    /// Create, initialize and start the negotiated plugins for a device
    ///
    /// A plugin that fails to initialize or start is skipped.
    pub async fn activate(&self, peer: &DeviceInfo, sender: PacketSender) -> DevicePlugins {
        let factories = self.negotiate(peer);
        debug!(
            "Activating {} of {} plugins for {}",
            factories.len(),
            self.factories.len(),
            peer.device_id
        );
        DevicePlugins::activate(factories, peer, sender).await
    }

    pub fn factory_count(&self) -> usize {
        self.factories.len()
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.factories.iter().map(|f| f.name().to_string()).collect()
    }
}

fn ensure_unique(plugin: &str, direction: &str, capabilities: &[String]) -> Result<()> {
    let mut seen = HashSet::new();
    for capability in capabilities {
        if !seen.insert(capability.as_str()) {
            return Err(ProtocolError::Plugin(format!(
                "Plugin '{}' declares {} capability '{}' twice",
                plugin, direction, capability
            )));
        }
    }
    Ok(())
}
