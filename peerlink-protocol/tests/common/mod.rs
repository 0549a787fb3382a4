//! Shared helpers for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use peerlink_protocol::discovery::DiscoveryConfig;
use peerlink_protocol::{
    CertificateInfo, DeviceEvent, DeviceRegistry, DeviceState, MemoryTrustStore, Packet, Plugin,
    PluginContext, PluginFactory, PluginRegistry, RegistryConfig, Result,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Self-signed certificate whose CN is `device_id`
pub fn create_test_certificate(device_id: &str) -> CertificateInfo {
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, device_id);
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();

    CertificateInfo::from_pem(cert.pem().as_bytes(), key.serialize_pem().as_bytes()).unwrap()
}

/// Loopback-only config; announcements go to `broadcast_addr`
pub fn create_test_config(name: &str, broadcast_addr: SocketAddr) -> RegistryConfig {
    RegistryConfig {
        device_name: name.to_string(),
        discovery: DiscoveryConfig {
            bind_addr: loopback(),
            broadcast_addr,
            ..DiscoveryConfig::default()
        },
        tcp_bind_addr: loopback(),
        ..RegistryConfig::default()
    }
}

/// Nobody listens on the discard port
pub fn nowhere() -> SocketAddr {
    "127.0.0.1:9".parse().unwrap()
}

/// Plugin that forwards every packet it receives to a channel
pub struct RecordingPlugin {
    received: mpsc::UnboundedSender<Packet>,
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn name(&self) -> &str {
        "ping"
    }

    async fn init(&mut self, _context: PluginContext) -> Result<()> {
        Ok(())
    }

    async fn handle_packet(&mut self, packet: &Packet) -> Result<()> {
        let _ = self.received.send(packet.clone());
        Ok(())
    }
}

pub struct RecordingPluginFactory {
    received: mpsc::UnboundedSender<Packet>,
}

impl PluginFactory for RecordingPluginFactory {
    fn name(&self) -> &str {
        "ping"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec!["ping".to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec!["ping".to_string()]
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(RecordingPlugin {
            received: self.received.clone(),
        })
    }
}

/// Plugin registry with the ping recorder, and where its packets end up
pub fn create_ping_plugins() -> (PluginRegistry, mpsc::UnboundedReceiver<Packet>) {
    let (received, rx) = mpsc::unbounded_channel();
    let mut plugins = PluginRegistry::new();
    plugins
        .register_factory(Arc::new(RecordingPluginFactory { received }))
        .unwrap();
    (plugins, rx)
}

pub fn create_test_registry(
    device_id: &str,
    broadcast_addr: SocketAddr,
    plugins: PluginRegistry,
    trust: Arc<MemoryTrustStore>,
) -> DeviceRegistry {
    DeviceRegistry::new(
        create_test_certificate(device_id),
        create_test_config(device_id, broadcast_addr),
        plugins,
        trust,
    )
    .unwrap()
}

/// Wait until `device_id` exists in `registry` and reaches `state`
pub async fn wait_for_state(registry: &DeviceRegistry, device_id: &str, state: DeviceState) {
    timeout(WAIT, async {
        let mut watch = loop {
            match registry.watch_device(device_id).await {
                Ok(watch) => break watch,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        };
        watch.wait_for(|s| s.state == state).await.unwrap();
    })
    .await
    .unwrap_or_else(|_| panic!("{} never reached {}", device_id, state));
}

/// Skip events until one matches
pub async fn expect_event(
    events: &mut mpsc::UnboundedReceiver<DeviceEvent>,
    matches: impl Fn(&DeviceEvent) -> bool,
) -> DeviceEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event never arrived")
}
