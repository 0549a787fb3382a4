//! Capability plugins shipped with the daemon

use async_trait::async_trait;
use peerlink_protocol::plugins::{PacketSender, Plugin, PluginContext, PluginFactory};
use peerlink_protocol::{NotificationEvent, Packet, ProtocolError, Result};
use tracing::{debug, info};

pub const PACKET_TYPE_PING: &str = "ping";
pub const PACKET_TYPE_NOTIFICATION: &str = "notification";

/// Logs and counts pings
#[derive(Default)]
pub struct PingPlugin {
    context: Option<PluginContext>,
    received: u64,
}

impl PingPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Plugin for PingPlugin {
    fn name(&self) -> &str {
        "ping"
    }

    async fn init(&mut self, context: PluginContext) -> Result<()> {
        debug!("Ping plugin initialized for {}", context.device_name);
        self.context = Some(context);
        Ok(())
    }

    async fn handle_packet(&mut self, packet: &Packet) -> Result<()> {
        self.received += 1;
        let from = self
            .context
            .as_ref()
            .map(|c| c.device_name.as_str())
            .unwrap_or("unknown device");

        match packet.get_body_field::<String>("message") {
            Some(message) => info!("Ping from {}: {}", from, message),
            None => info!("Ping from {}", from),
        }
        debug!("{} pings received from {}", self.received, from);
        Ok(())
    }
}

pub struct PingPluginFactory;

impl PluginFactory for PingPluginFactory {
    fn name(&self) -> &str {
        "ping"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_PING.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_PING.to_string()]
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(PingPlugin::new())
    }
}

/// Forwards host notifications to the device and logs the device's own
#[derive(Default)]
pub struct NotificationPlugin {
    sender: Option<PacketSender>,
    device_name: String,
}

impl NotificationPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Plugin for NotificationPlugin {
    fn name(&self) -> &str {
        "notification"
    }

    async fn init(&mut self, context: PluginContext) -> Result<()> {
        self.device_name = context.device_name;
        self.sender = Some(context.sender);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.sender = None;
        Ok(())
    }

    async fn handle_packet(&mut self, packet: &Packet) -> Result<()> {
        let notification: NotificationEvent = serde_json::from_value(packet.body.clone())
            .map_err(|e| ProtocolError::Plugin(format!("Invalid notification: {}", e)))?;

        info!(
            "Notification from {} ({}): {} - {}",
            self.device_name, notification.app_name, notification.title, notification.text
        );
        Ok(())
    }

    fn accepts_notifications(&self) -> bool {
        true
    }

    async fn relay_notification(&mut self, notification: &NotificationEvent) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| ProtocolError::Plugin("notification plugin stopped".to_string()))?;

        let body = serde_json::to_value(notification)?;
        sender.send(Packet::new(PACKET_TYPE_NOTIFICATION, body))
    }
}

pub struct NotificationPluginFactory;

impl PluginFactory for NotificationPluginFactory {
    fn name(&self) -> &str {
        "notification"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_NOTIFICATION.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_NOTIFICATION.to_string()]
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(NotificationPlugin::new())
    }
}
