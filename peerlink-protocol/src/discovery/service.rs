//! Async Discovery Service
//!
//! Owns the UDP socket. Sends identity announcements on demand and runs one
//! receive loop that turns valid announcements from other hosts into
//! [`Announcement`]s for the device registry.

use super::{DeviceInfo, BROADCAST_ADDR, DISCOVERY_PORT};
use crate::packet::PACKET_TYPE_IDENTITY;
use crate::{Packet, ProtocolError, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Largest datagram accepted as an announcement
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// Configuration for the discovery service
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Local address of the UDP socket
    pub bind_addr: SocketAddr,

    /// Destination of identity broadcasts
    pub broadcast_addr: SocketAddr,

    /// Datagrams larger than this are dropped
    pub max_datagram_size: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DISCOVERY_PORT),
            broadcast_addr: SocketAddr::new(IpAddr::V4(BROADCAST_ADDR), DISCOVERY_PORT),
            max_datagram_size: MAX_DATAGRAM_SIZE,
        }
    }
}

/// A valid identity announcement received from another host
#[derive(Debug, Clone)]
pub struct Announcement {
    pub info: DeviceInfo,
    pub addr: SocketAddr,
}

/// UDP discovery service
///
/// The receive loop always runs once spawned; [`stop_listening`] makes it
/// ignore everything it receives until [`start_listening`] is called again.
///
/// [`start_listening`]: DiscoveryService::start_listening
/// [`stop_listening`]: DiscoveryService::stop_listening
pub struct DiscoveryService {
    socket: Arc<UdpSocket>,
    config: DiscoveryConfig,
    local_device_id: String,
    listening: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryService {
    /// Bind the discovery socket
    ///
    /// Failing to bind is fatal for the caller: a host that cannot hear
    /// announcements cannot be discovered.
    pub async fn bind(config: DiscoveryConfig, local_device_id: impl Into<String>) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|source| ProtocolError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        socket.set_broadcast(true)?;

        info!("Discovery socket bound to {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            config,
            local_device_id: local_device_id.into(),
            listening: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
        })
    }

    /// Actual bound address (useful when binding port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send our identity as one broadcast datagram
    pub async fn broadcast(&self, identity: &Packet) -> Result<()> {
        self.send_to(identity, self.config.broadcast_addr).await
    }

    /// Send our identity to a single host
    pub async fn send_to(&self, identity: &Packet, addr: SocketAddr) -> Result<()> {
        let bytes = identity.to_bytes()?;
        self.socket.send_to(&bytes, addr).await?;
        debug!("Sent identity to {}", addr);
        Ok(())
    }

    /// React to a network-change signal
    ///
    /// Broadcasts once when the network is available. Returns whether a
    /// broadcast was sent.
    pub async fn on_network_changed(&self, available: bool, identity: &Packet) -> Result<bool> {
        if !available {
            debug!("Network unavailable, not announcing");
            return Ok(false);
        }
        info!("Network available, announcing identity");
        self.broadcast(identity).await?;
        Ok(true)
    }

    pub fn start_listening(&self) {
        self.listening.store(true, Ordering::SeqCst);
    }

    pub fn stop_listening(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Spawn the receive loop, delivering announcements to `events`
    ///
    /// The loop never waits on its consumer: the channel is unbounded.
    pub fn spawn(&self, events: mpsc::UnboundedSender<Announcement>) {
        let socket = self.socket.clone();
        let listening = self.listening.clone();
        let local_device_id = self.local_device_id.clone();
        let max_size = self.config.max_datagram_size;

        let handle = tokio::spawn(async move {
            receive_loop(socket, listening, local_device_id, max_size, events).await;
        });

        if let Ok(mut receiver) = self.receiver.lock() {
            if let Some(previous) = receiver.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Abort the receive loop
    pub fn shutdown(&self) {
        self.stop_listening();
        if let Ok(mut receiver) = self.receiver.lock() {
            if let Some(handle) = receiver.take() {
                handle.abort();
            }
        }
        debug!("Discovery service stopped");
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    listening: Arc<AtomicBool>,
    local_device_id: String,
    max_size: usize,
    events: mpsc::UnboundedSender<Announcement>,
) {
    // One extra byte so oversized datagrams are detectable.
    let mut buf = vec![0u8; max_size + 1];

    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("Discovery receive error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        if !listening.load(Ordering::SeqCst) {
            continue;
        }

        if len > max_size {
            debug!("Dropping oversized datagram ({} bytes) from {}", len, addr);
            continue;
        }

        let info = match parse_announcement(&buf[..len]) {
            Ok(info) => info,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", addr, e);
                continue;
            }
        };

        if info.device_id == local_device_id {
            continue;
        }

        debug!("Announcement from {} ({}) at {}", info.device_name, info.device_id, addr);

        if events.send(Announcement { info, addr }).is_err() {
            debug!("Announcement consumer gone, stopping receive loop");
            break;
        }
    }
}

/// Parse a datagram that must hold exactly one identity record
fn parse_announcement(data: &[u8]) -> Result<DeviceInfo> {
    let record = match data.iter().position(|b| *b == b'\n') {
        Some(end) => {
            if data[end + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                return Err(ProtocolError::MalformedPacket(
                    "datagram holds more than one record".to_string(),
                ));
            }
            &data[..=end]
        }
        None => data,
    };

    let packet = Packet::from_bytes(record)?;
    if !packet.is_type(PACKET_TYPE_IDENTITY) {
        return Err(ProtocolError::MalformedPacket(format!(
            "unexpected {} datagram",
            packet.packet_type
        )));
    }

    DeviceInfo::from_identity_packet(&packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DeviceType;
    use tokio::time::timeout;

    fn loopback_config() -> DiscoveryConfig {
        DiscoveryConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            broadcast_addr: "127.0.0.1:9".parse().unwrap(),
            max_datagram_size: MAX_DATAGRAM_SIZE,
        }
    }

    fn identity(id: &str) -> Packet {
        DeviceInfo::new(id, id, DeviceType::Desktop, 1716).to_identity_packet()
    }

    #[test]
    fn test_default_config() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.bind_addr.port(), 1716);
        assert_eq!(config.broadcast_addr.ip(), IpAddr::V4(BROADCAST_ADDR));
    }

    #[test]
    fn test_parse_announcement_rejects_multiple_records() {
        let mut data = identity("a").to_bytes().unwrap();
        data.extend(identity("b").to_bytes().unwrap());
        assert!(parse_announcement(&data).is_err());

        let single = identity("a").to_bytes().unwrap();
        assert_eq!(parse_announcement(&single).unwrap().device_id, "a");
    }

    #[tokio::test]
    async fn test_receives_announcements_only_while_listening() {
        let service = DiscoveryService::bind(loopback_config(), "me").await.unwrap();
        let target = service.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        service.spawn(tx);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Not listening yet
        sender
            .send_to(&identity("ignored").to_bytes().unwrap(), target)
            .await
            .unwrap();
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

        service.start_listening();
        sender.send_to(b"garbage\n", target).await.unwrap();
        sender
            .send_to(&identity("me").to_bytes().unwrap(), target)
            .await
            .unwrap();
        sender
            .send_to(&identity("peer").to_bytes().unwrap(), target)
            .await
            .unwrap();

        let announcement = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(announcement.info.device_id, "peer");
        assert_eq!(announcement.addr, sender.local_addr().unwrap());

        service.stop_listening();
        sender
            .send_to(&identity("late").to_bytes().unwrap(), target)
            .await
            .unwrap();
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_network_change_broadcasts_only_when_available() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = DiscoveryConfig {
            broadcast_addr: receiver.local_addr().unwrap(),
            ..loopback_config()
        };
        let service = DiscoveryService::bind(config, "me").await.unwrap();
        let packet = identity("me");

        assert!(!service.on_network_changed(false, &packet).await.unwrap());
        assert!(service.on_network_changed(true, &packet).await.unwrap());

        let mut buf = [0u8; 2048];
        let (len, _) = timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parse_announcement(&buf[..len]).unwrap().device_id, "me");

        // Exactly one datagram
        assert!(timeout(Duration::from_millis(200), receiver.recv_from(&mut buf))
            .await
            .is_err());
    }
}
