//! Device Registry
//!
//! Owns every device actor and both listener loops. This is the surface the
//! host application talks to: it looks devices up by id, starts pairing,
//! relays notifications and receives [`DeviceEvent`]s.
//!
//! ## Connections
//!
//! Announcements and completed handshakes are routed by one task. A peer that
//! announces itself and is not connected gets dialed by whichever host has
//! the smaller device id; the other host answers the announcement with a
//! directed identity so the dialing side hears about it. Explicit
//! [`DeviceRegistry::connect_to`] calls dial unconditionally. Whatever the
//! source, the handshake that completes last for an id owns that id's
//! channel.

use crate::device::{DeviceCommand, DeviceContext, DeviceHandle, DeviceSender, DeviceSnapshot};
use crate::discovery::{Announcement, DeviceInfo, DeviceType, DiscoveryConfig, DiscoveryService};
use crate::events::{DeviceEvent, EventBus};
use crate::pairing::{CertificateInfo, TrustStore, PAIRING_TIMEOUT};
use crate::plugins::{NotificationEvent, PluginRegistry};
use crate::transport::{
    self, ChannelListener, HandshakeOutcome, HandshakeParams, LinkDirection, TlsContext,
    HANDSHAKE_TIMEOUT,
};
use crate::{Packet, ProtocolError, Result, MAX_PACKET_SIZE};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default TCP port for channels
pub const DEFAULT_TCP_PORT: u16 = 1716;

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Name announced to peers
    pub device_name: String,
    pub device_type: DeviceType,
    pub discovery: DiscoveryConfig,
    /// Local address of the channel listener; port 0 picks a free port
    pub tcp_bind_addr: SocketAddr,
    pub pairing_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_packet_size: usize,
    /// Whether discovery starts enabled
    pub discovering: bool,
}

impl RegistryConfig {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pairing_timeout.is_zero() {
            return Err(ProtocolError::Configuration(
                "pairing timeout must be positive".to_string(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ProtocolError::Configuration(
                "handshake timeout must be positive".to_string(),
            ));
        }
        if self.max_packet_size == 0 || self.discovery.max_datagram_size == 0 {
            return Err(ProtocolError::Configuration(
                "packet size limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            device_name: "peerlink".to_string(),
            device_type: DeviceType::Desktop,
            discovery: DiscoveryConfig::default(),
            tcp_bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_TCP_PORT),
            pairing_timeout: PAIRING_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            max_packet_size: MAX_PACKET_SIZE,
            discovering: true,
        }
    }
}

/// Everything that only exists once the registry is started
struct Running {
    discovery: DiscoveryService,
    tcp_addr: SocketAddr,
}

struct RegistryInner {
    config: RegistryConfig,
    certificate: CertificateInfo,
    identity: watch::Sender<DeviceInfo>,
    devices: RwLock<HashMap<String, DeviceHandle>>,
    context: Arc<DeviceContext>,
    params: HandshakeParams,
    discovering: AtomicBool,
    running: OnceLock<Running>,
    /// Device ids with an outbound dial in flight
    dialing: Mutex<HashSet<String>>,
    outbound: Mutex<JoinSet<()>>,
    outcomes: mpsc::UnboundedSender<HandshakeOutcome>,
    pending_outcomes: Mutex<Option<mpsc::UnboundedReceiver<HandshakeOutcome>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Registry of known devices
///
/// Cheap to clone; every clone addresses the same registry.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl DeviceRegistry {
    /// Create a registry for the host identified by `certificate`
    ///
    /// The device id is the certificate's CN. The local identity advertises
    /// the union of every registered plugin's capabilities.
    pub fn new(
        certificate: CertificateInfo,
        config: RegistryConfig,
        plugins: PluginRegistry,
        trust: Arc<dyn TrustStore>,
    ) -> Result<Self> {
        config.validate()?;
        let tls = TlsContext::new(&certificate)?;

        let identity = DeviceInfo::new(
            certificate.device_id.clone(),
            config.device_name.clone(),
            config.device_type,
            config.tcp_bind_addr.port(),
        )
        .with_incoming_capabilities(plugins.incoming_capabilities())
        .with_outgoing_capabilities(plugins.outgoing_capabilities());

        let context = Arc::new(DeviceContext {
            trust,
            plugins: Arc::new(plugins),
            events: EventBus::new(),
            pairing_timeout: config.pairing_timeout,
            max_packet_size: config.max_packet_size,
        });

        let params = HandshakeParams {
            tls,
            timeout: config.handshake_timeout,
        };
        let (outcomes, pending_outcomes) = mpsc::unbounded_channel();

        info!(
            "Local device {} ({}) fingerprint {}",
            identity.device_id, identity.device_name, certificate.fingerprint
        );

        Ok(Self {
            inner: Arc::new(RegistryInner {
                discovering: AtomicBool::new(config.discovering),
                config,
                certificate,
                identity: watch::Sender::new(identity),
                devices: RwLock::new(HashMap::new()),
                context,
                params,
                running: OnceLock::new(),
                dialing: Mutex::new(HashSet::new()),
                outbound: Mutex::new(JoinSet::new()),
                outcomes,
                pending_outcomes: Mutex::new(Some(pending_outcomes)),
                tasks: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Bind both listeners, load known devices and announce ourselves
    ///
    /// A bind failure is returned after releasing whatever was bound.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let outcomes_rx = inner
            .pending_outcomes
            .lock()
            .map_err(|_| lock_poisoned())?
            .take()
            .ok_or_else(|| ProtocolError::InvalidState("registry already started".to_string()))?;

        let listener = ChannelListener::bind(inner.config.tcp_bind_addr).await?;
        let tcp_addr = listener.local_addr()?;
        inner
            .identity
            .send_modify(|identity| identity.tcp_port = tcp_addr.port());

        let discovery =
            DiscoveryService::bind(inner.config.discovery.clone(), self.device_id()).await?;

        let (announcements_tx, announcements_rx) = mpsc::unbounded_channel();
        discovery.spawn(announcements_tx);

        let listener_task = listener.spawn(
            inner.params.clone(),
            inner.identity.subscribe(),
            inner.outcomes.clone(),
            inner.shutdown.child_token(),
        );
        let router_task = tokio::spawn(route(
            Arc::downgrade(inner),
            announcements_rx,
            outcomes_rx,
            inner.shutdown.clone(),
        ));

        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.push(listener_task);
            tasks.push(router_task);
        }

        if inner.running.set(Running { discovery, tcp_addr }).is_err() {
            return Err(ProtocolError::InvalidState(
                "registry already started".to_string(),
            ));
        }

        self.load_known_devices().await;

        if self.is_discovering() {
            if let Some(running) = inner.running.get() {
                running.discovery.start_listening();
            }
            if let Err(e) = self.broadcast_local_identity().await {
                warn!("Initial announcement failed: {}", e);
            }
        }

        info!("Device registry started, channels on {}", tcp_addr);
        Ok(())
    }

    /// Stop both listeners, abort in-flight handshakes, then close every
    /// device
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!("Shutting down device registry");
        inner.shutdown.cancel();

        if let Some(running) = inner.running.get() {
            running.discovery.shutdown();
        }

        let tasks = inner
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        for task in tasks {
            let _ = task.await;
        }

        let mut outbound = inner
            .outbound
            .lock()
            .map(|mut outbound| std::mem::take(&mut *outbound))
            .unwrap_or_default();
        outbound.shutdown().await;

        let devices: Vec<DeviceHandle> = inner.devices.write().await.drain().map(|(_, d)| d).collect();
        let count = devices.len();
        for device in devices {
            device.shutdown().await;
        }
        debug!("Released {} devices", count);
    }

    pub fn device_id(&self) -> String {
        self.inner.certificate.device_id.clone()
    }

    /// The identity we announce
    pub fn local_identity(&self) -> DeviceInfo {
        self.inner.identity.borrow().clone()
    }

    /// Fingerprint of the local certificate, for users to compare
    pub fn fingerprint(&self) -> &str {
        &self.inner.certificate.fingerprint
    }

    /// Channel listener address, once started
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.inner.running.get().map(|running| running.tcp_addr)
    }

    /// Discovery socket address, once started
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.inner
            .running
            .get()
            .and_then(|running| running.discovery.local_addr().ok())
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DeviceEvent> {
        self.inner.context.events.subscribe()
    }

    /// Record an identity, with the link it arrived on if any
    ///
    /// Creates the device on first sight. Returns whether it was created.
    pub async fn upsert_from_identity(
        &self,
        info: DeviceInfo,
        link: Option<transport::EstablishedLink>,
    ) -> Result<bool> {
        self.inner.upsert_from_identity(info, link).await
    }

    /// Close the device and forget it
    ///
    /// The pinned fingerprint is kept; only the known-device entry goes.
    pub async fn remove(&self, device_id: &str) -> Result<()> {
        let device = self
            .inner
            .devices
            .write()
            .await
            .remove(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        device.shutdown().await;

        let trust = &self.inner.context.trust;
        let mut known = trust.known_devices()?;
        known.retain(|id| id != device_id);
        trust.set_known_devices(&known)?;

        info!("Removed device {}", device_id);
        self.inner.emit_device_list().await;
        Ok(())
    }

    /// Broadcast our identity once
    pub async fn broadcast_local_identity(&self) -> Result<()> {
        let running = self.inner.running()?;
        let identity = self.inner.identity_packet();
        running.discovery.broadcast(&identity).await
    }

    /// Snapshots of every device, ordered by id
    pub async fn list_devices(&self) -> Vec<DeviceSnapshot> {
        let mut devices: Vec<DeviceSnapshot> = self
            .inner
            .devices
            .read()
            .await
            .values()
            .map(DeviceHandle::snapshot)
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    pub async fn device(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.inner
            .devices
            .read()
            .await
            .get(device_id)
            .map(DeviceHandle::snapshot)
    }

    /// Watch a device's snapshot as it changes
    pub async fn watch_device(&self, device_id: &str) -> Result<watch::Receiver<DeviceSnapshot>> {
        self.inner
            .devices
            .read()
            .await
            .get(device_id)
            .map(DeviceHandle::watch)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))
    }

    /// Names of the plugins active on a device
    pub async fn device_plugins(&self, device_id: &str) -> Result<Vec<String>> {
        self.device(device_id)
            .await
            .map(|snapshot| snapshot.plugins)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))
    }

    /// Relay a host notification to every paired, connected device with a
    /// notification-capable plugin
    ///
    /// Returns how many plugins took it.
    pub async fn relay_notification(&self, notification: NotificationEvent) -> usize {
        let targets: Vec<DeviceSender> = self
            .inner
            .devices
            .read()
            .await
            .values()
            .filter(|device| {
                let snapshot = device.snapshot();
                snapshot.state == crate::device::DeviceState::PairedConnected
                    && snapshot.accepts_notifications
            })
            .map(DeviceHandle::sender)
            .collect();

        let relayed: usize = join_all(
            targets
                .iter()
                .map(|device| device.relay_notification(notification.clone())),
        )
        .await
        .into_iter()
        .sum();
        debug!("Notification {} relayed {} times", notification.id, relayed);
        relayed
    }

    pub async fn request_pairing(&self, device_id: &str) -> Result<()> {
        self.inner.sender(device_id).await?.request_pair().await
    }

    pub async fn accept_pairing(&self, device_id: &str) -> Result<()> {
        self.inner.sender(device_id).await?.accept_pair().await
    }

    pub async fn reject_pairing(&self, device_id: &str) -> Result<()> {
        self.inner.sender(device_id).await?.reject_pair().await
    }

    pub async fn unpair(&self, device_id: &str) -> Result<()> {
        self.inner.sender(device_id).await?.unpair().await
    }

    /// Send a capability packet to a paired, connected device
    pub async fn send_packet(&self, device_id: &str, packet: Packet) -> Result<()> {
        self.inner.sender(device_id).await?.send_packet(packet).await
    }

    /// Dial a host directly, whatever its device id turns out to be
    pub fn connect_to(&self, addr: SocketAddr) -> Result<()> {
        self.inner.running()?;
        if self.inner.shutdown.is_cancelled() {
            return Err(ProtocolError::Cancelled(
                "registry is shutting down".to_string(),
            ));
        }
        self.inner.dial(addr, None);
        Ok(())
    }

    pub fn is_discovering(&self) -> bool {
        self.inner.discovering.load(Ordering::SeqCst)
    }

    /// Turn discovery on or off
    ///
    /// Turning it on announces us; turning it off prunes the known-device
    /// list.
    pub async fn set_discovering(&self, discovering: bool) -> Result<()> {
        let was = self.inner.discovering.swap(discovering, Ordering::SeqCst);
        if was == discovering {
            return Ok(());
        }
        info!("Discovery {}", if discovering { "enabled" } else { "disabled" });

        let Some(running) = self.inner.running.get() else {
            return Ok(());
        };
        if discovering {
            running.discovery.start_listening();
            self.broadcast_local_identity().await
        } else {
            running.discovery.stop_listening();
            self.prune_known_devices().await
        }
    }

    /// Rename the local device and announce the new name
    pub async fn set_device_name(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        let changed = self.inner.identity.send_if_modified(|identity| {
            if identity.device_name == name {
                false
            } else {
                identity.device_name = name.clone();
                true
            }
        });
        if !changed {
            return Ok(());
        }
        info!("Local device renamed to {}", name);
        if self.inner.running.get().is_some() {
            self.broadcast_local_identity().await?;
        }
        Ok(())
    }

    /// React to a network change; announces once when the network is up
    pub async fn network_changed(&self, available: bool) -> Result<bool> {
        let running = self.inner.running()?;
        let identity = self.inner.identity_packet();
        running.discovery.on_network_changed(available, &identity).await
    }

    /// Drop unpaired, disconnected devices from the persisted known-device
    /// list
    ///
    /// They stay in the registry until removed.
    pub async fn prune_known_devices(&self) -> Result<()> {
        let stale: HashSet<String> = self
            .list_devices()
            .await
            .into_iter()
            .filter(|device| !device.is_paired() && !device.is_connected())
            .map(|device| device.device_id)
            .collect();

        let trust = &self.inner.context.trust;
        let mut known = trust.known_devices()?;
        let before = known.len();
        known.retain(|id| !stale.contains(id));
        if known.len() != before {
            trust.set_known_devices(&known)?;
            info!("Pruned {} known devices", before - known.len());
        }
        Ok(())
    }

    async fn load_known_devices(&self) {
        let known = match self.inner.context.trust.known_devices() {
            Ok(known) => known,
            Err(e) => {
                warn!("Failed to load known devices: {}", e);
                return;
            }
        };

        let local_id = self.device_id();
        let mut devices = self.inner.devices.write().await;
        for device_id in known {
            if device_id == local_id || devices.contains_key(&device_id) {
                continue;
            }
            let device = DeviceHandle::spawn(device_id.clone(), None, self.inner.context.clone());
            devices.insert(device_id, device);
        }
        let count = devices.len();
        drop(devices);

        info!("{} devices loaded from the trust store", count);
        if count > 0 {
            self.inner.emit_device_list().await;
        }
    }
}

impl RegistryInner {
    fn running(&self) -> Result<&Running> {
        self.running
            .get()
            .ok_or_else(|| ProtocolError::InvalidState("registry is not started".to_string()))
    }

    /// Sender for one device; the device map is not held while it is used
    async fn sender(&self, device_id: &str) -> Result<DeviceSender> {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(DeviceHandle::sender)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))
    }

    fn local_id(&self) -> &str {
        &self.certificate.device_id
    }

    fn identity_packet(&self) -> Packet {
        self.identity.borrow().to_identity_packet()
    }

    async fn upsert_from_identity(
        &self,
        info: DeviceInfo,
        link: Option<transport::EstablishedLink>,
    ) -> Result<bool> {
        if info.device_id == self.local_id() {
            return Err(ProtocolError::InvalidState(
                "identity is our own".to_string(),
            ));
        }

        let device_id = info.device_id.clone();
        let mut devices = self.devices.write().await;
        let created = match devices.get(&device_id) {
            Some(device) => {
                device.notify(DeviceCommand::Identity(info));
                false
            }
            None => {
                let device =
                    DeviceHandle::spawn(device_id.clone(), Some(info), self.context.clone());
                devices.insert(device_id.clone(), device);
                true
            }
        };

        if let Some(link) = link {
            if let Some(device) = devices.get(&device_id) {
                device.notify(DeviceCommand::Link(link));
            }
        }
        drop(devices);

        if created {
            info!("Added device {}", device_id);
            self.remember(&device_id);
            self.emit_device_list().await;
        }
        Ok(created)
    }

    /// Append a device id to the persisted known-device list
    fn remember(&self, device_id: &str) {
        let trust = &self.context.trust;
        let result = trust.known_devices().and_then(|mut known| {
            if known.iter().any(|id| id == device_id) {
                return Ok(());
            }
            known.push(device_id.to_string());
            trust.set_known_devices(&known)
        });
        if let Err(e) = result {
            warn!("Failed to record known device {}: {}", device_id, e);
        }
    }

    async fn emit_device_list(&self) {
        let mut device_ids: Vec<String> = self.devices.read().await.keys().cloned().collect();
        device_ids.sort();
        self.context
            .events
            .emit(DeviceEvent::DeviceListChanged { device_ids });
    }

    /// Start an outbound handshake; the outcome is routed like an inbound one
    fn dial(&self, addr: SocketAddr, expected_id: Option<String>) {
        let identity = self.identity_packet();
        let params = self.params.clone();
        let outcomes = self.outcomes.clone();

        let Ok(mut outbound) = self.outbound.lock() else {
            return;
        };
        while outbound.try_join_next().is_some() {}

        debug!("Dialing {} ({:?})", addr, expected_id);
        outbound.spawn(async move {
            let result =
                transport::connect(addr, expected_id.as_deref(), &identity, &params).await;
            let _ = outcomes.send(HandshakeOutcome {
                remote_addr: addr,
                direction: LinkDirection::Outbound,
                expected_id,
                result,
            });
        });
    }

    async fn on_announcement(&self, announcement: Announcement) {
        let Announcement { info, addr } = announcement;
        let device_id = info.device_id.clone();
        let tcp_port = info.tcp_port;
        debug!("Announcement from {} at {}", device_id, addr);

        let created = match self.upsert_from_identity(info, None).await {
            Ok(created) => created,
            Err(e) => {
                debug!("Ignoring announcement from {}: {}", addr, e);
                return;
            }
        };

        let connected = self
            .devices
            .read()
            .await
            .get(&device_id)
            .map(|device| device.snapshot().is_connected())
            .unwrap_or(false);
        let dials = self.local_id() < device_id.as_str();

        if created || (!connected && !dials) {
            self.reply_to(addr).await;
        }

        if connected || !dials || tcp_port == 0 {
            return;
        }

        match self.dialing.lock() {
            Ok(mut dialing) => {
                if !dialing.insert(device_id.clone()) {
                    return;
                }
            }
            Err(_) => return,
        }

        if let Some(device) = self.devices.read().await.get(&device_id) {
            device.notify(DeviceCommand::Connecting);
        }
        self.dial(SocketAddr::new(addr.ip(), tcp_port), Some(device_id));
    }

    async fn reply_to(&self, addr: SocketAddr) {
        let Some(running) = self.running.get() else {
            return;
        };
        if let Err(e) = running
            .discovery
            .send_to(&self.identity_packet(), addr)
            .await
        {
            debug!("Failed to answer {}: {}", addr, e);
        }
    }

    async fn on_outcome(&self, outcome: HandshakeOutcome) {
        let HandshakeOutcome {
            remote_addr,
            direction,
            expected_id,
            result,
        } = outcome;

        if let Some(expected) = &expected_id {
            if let Ok(mut dialing) = self.dialing.lock() {
                dialing.remove(expected);
            }
        }

        match result {
            Ok(link) => {
                debug!("{:?} handshake with {} completed", direction, link.device_id());
                let info = link.identity.clone();
                if let Err(e) = self.upsert_from_identity(info, Some(link)).await {
                    warn!("Dropping link from {}: {}", remote_addr, e);
                }
            }
            Err(e) => {
                if e.is_recoverable() {
                    warn!("{:?} handshake with {} failed: {}", direction, remote_addr, e);
                } else {
                    error!("{:?} handshake with {} failed: {}", direction, remote_addr, e);
                }
                if let Some(expected) = &expected_id {
                    if let Some(device) = self.devices.read().await.get(expected) {
                        device.notify(DeviceCommand::ConnectFailed(e.to_string()));
                    }
                }
                self.context.events.emit(DeviceEvent::ConnectionFailed {
                    device_id: expected_id,
                    remote_addr,
                    message: e.to_string(),
                });
            }
        }
    }
}

/// Route announcements and handshake outcomes to devices
async fn route(
    inner: Weak<RegistryInner>,
    mut announcements: mpsc::UnboundedReceiver<Announcement>,
    mut outcomes: mpsc::UnboundedReceiver<HandshakeOutcome>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(announcement) = announcements.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.on_announcement(announcement).await;
            }
            Some(outcome) = outcomes.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.on_outcome(outcome).await;
            }
            else => break,
        }
    }
    debug!("Registry router stopped");
}

fn lock_poisoned() -> ProtocolError {
    error!("Registry lock poisoned");
    ProtocolError::InvalidState("registry lock poisoned".to_string())
}
