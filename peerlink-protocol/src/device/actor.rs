//! Per-device actor
//!
//! Every device is owned by one task. Discovery, the accept loop, outbound
//! handshakes, the device's own channel and API callers all reach it through
//! its command queue, so transitions for one device id are serialized without
//! locks.

use super::{DeviceContext, DeviceSnapshot, DeviceState};
use crate::discovery::DeviceInfo;
use crate::events::DeviceEvent;
use crate::pairing::PairingPacket;
use crate::plugins::{DevicePlugins, NotificationEvent, PacketSender};
use crate::transport::{Channel, ChannelEvent, EstablishedLink};
use crate::{Packet, ProtocolError, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

pub(crate) enum DeviceCommand {
    /// Fresh identity from discovery or a handshake
    Identity(DeviceInfo),
    /// An outbound connection attempt started
    Connecting,
    /// The outbound connection attempt failed
    ConnectFailed(String),
    /// A handshake completed for this device
    Link(EstablishedLink),
    Channel(ChannelEvent),
    RequestPair(oneshot::Sender<Result<()>>),
    AcceptPair(oneshot::Sender<Result<()>>),
    RejectPair(oneshot::Sender<Result<()>>),
    Unpair(oneshot::Sender<Result<()>>),
    Send(Packet, oneshot::Sender<Result<()>>),
    RelayNotification(NotificationEvent, oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<()>),
}

impl From<ChannelEvent> for DeviceCommand {
    fn from(event: ChannelEvent) -> Self {
        DeviceCommand::Channel(event)
    }
}

/// Cloneable sender for one device's command queue
///
/// Callers wait on replies through this, never while holding the registry's
/// device map.
#[derive(Clone)]
pub(crate) struct DeviceSender {
    device_id: Arc<str>,
    tx: mpsc::UnboundedSender<DeviceCommand>,
}

impl DeviceSender {
    /// Queue a command without waiting for it to be handled
    pub(crate) fn notify(&self, command: DeviceCommand) {
        if self.tx.send(command).is_err() {
            debug!("Device {} is gone, command dropped", self.device_id);
        }
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> DeviceCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| self.stopped())?;
        response.await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> ProtocolError {
        ProtocolError::Cancelled(format!("device {} has stopped", self.device_id))
    }

    pub(crate) async fn request_pair(&self) -> Result<()> {
        self.call(DeviceCommand::RequestPair).await?
    }

    pub(crate) async fn accept_pair(&self) -> Result<()> {
        self.call(DeviceCommand::AcceptPair).await?
    }

    pub(crate) async fn reject_pair(&self) -> Result<()> {
        self.call(DeviceCommand::RejectPair).await?
    }

    pub(crate) async fn unpair(&self) -> Result<()> {
        self.call(DeviceCommand::Unpair).await?
    }

    pub(crate) async fn send_packet(&self, packet: Packet) -> Result<()> {
        self.call(|reply| DeviceCommand::Send(packet, reply)).await?
    }

    pub(crate) async fn relay_notification(&self, notification: NotificationEvent) -> usize {
        self.call(|reply| DeviceCommand::RelayNotification(notification, reply))
            .await
            .unwrap_or(0)
    }
}

/// Registry-side handle to a running device actor
pub(crate) struct DeviceHandle {
    sender: DeviceSender,
    snapshot: watch::Receiver<DeviceSnapshot>,
    task: JoinHandle<()>,
}

impl DeviceHandle {
    /// Start the actor for a device
    ///
    /// The device starts `PairedDisconnected` when the trust store holds a
    /// fingerprint for it, `Discovered` otherwise.
    pub(crate) fn spawn(
        device_id: impl Into<String>,
        info: Option<DeviceInfo>,
        context: Arc<DeviceContext>,
    ) -> Self {
        let device_id = device_id.into();
        let paired = match context.trust.fingerprint(&device_id) {
            Ok(fingerprint) => fingerprint.is_some(),
            Err(e) => {
                warn!("Failed to read trust for {}: {}", device_id, e);
                false
            }
        };
        let state = if paired {
            DeviceState::PairedDisconnected
        } else {
            DeviceState::Discovered
        };

        let (tx, commands) = mpsc::unbounded_channel();
        let (plugin_tx, plugin_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(DeviceSnapshot {
            device_id: device_id.clone(),
            info: info.clone(),
            state,
            remote_addr: None,
            fingerprint: None,
            plugins: Vec::new(),
            accepts_notifications: false,
        });

        let actor = DeviceActor {
            device_id: device_id.clone(),
            info,
            state,
            channel: None,
            plugins: DevicePlugins::empty(device_id.clone()),
            plugin_tx,
            pairing_deadline: None,
            context,
            self_tx: tx.downgrade(),
            snapshot: snapshot_tx,
        };

        debug!("Device {} created in state {}", device_id, state);
        let task = tokio::spawn(actor.run(commands, plugin_rx));

        Self {
            sender: DeviceSender {
                device_id: device_id.into(),
                tx,
            },
            snapshot,
            task,
        }
    }

    pub(crate) fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.clone()
    }

    pub(crate) fn sender(&self) -> DeviceSender {
        self.sender.clone()
    }

    pub(crate) fn notify(&self, command: DeviceCommand) {
        self.sender.notify(command);
    }

    /// Close the channel, release plugins and wait for the task to end
    pub(crate) async fn shutdown(self) {
        let (done, finished) = oneshot::channel();
        if self.sender.tx.send(DeviceCommand::Shutdown(done)).is_ok() {
            let _ = finished.await;
        }
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!("Device {} task panicked", self.sender.device_id);
            }
        }
    }
}

struct DeviceActor {
    device_id: String,
    info: Option<DeviceInfo>,
    state: DeviceState,
    channel: Option<Channel>,
    plugins: DevicePlugins,
    /// Handed to plugins; drained by the actor
    plugin_tx: mpsc::UnboundedSender<Packet>,
    pairing_deadline: Option<Instant>,
    context: Arc<DeviceContext>,
    /// Weak so that the actor does not keep its own queue open
    self_tx: mpsc::WeakUnboundedSender<DeviceCommand>,
    snapshot: watch::Sender<DeviceSnapshot>,
}

impl DeviceActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<DeviceCommand>,
        mut plugin_rx: mpsc::UnboundedReceiver<Packet>,
    ) {
        loop {
            let deadline = self.pairing_deadline;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle(command).await {
                            return;
                        }
                    }
                    None => {
                        self.teardown().await;
                        return;
                    }
                },
                Some(packet) = plugin_rx.recv() => {
                    if let Err(e) = self.send(packet) {
                        debug!("Dropping plugin packet for {}: {}", self.device_id, e);
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.pairing_expired();
                }
            }

            self.publish();
        }
    }

    /// Returns false once the actor should stop
    async fn handle(&mut self, command: DeviceCommand) -> bool {
        match command {
            DeviceCommand::Identity(info) => {
                if self.info.as_ref() != Some(&info) {
                    debug!("Identity of {} updated", self.device_id);
                    self.info = Some(info);
                }
            }
            DeviceCommand::Connecting => {
                if self.state == DeviceState::Discovered {
                    self.set_state(DeviceState::Connecting);
                }
            }
            DeviceCommand::ConnectFailed(reason) => {
                debug!("Connection to {} failed: {}", self.device_id, reason);
                if self.state == DeviceState::Connecting {
                    self.set_state(DeviceState::Discovered);
                }
            }
            DeviceCommand::Link(link) => self.on_link(link).await,
            DeviceCommand::Channel(ChannelEvent::Packet { channel, packet }) => {
                if self.is_current(channel) {
                    self.on_packet(packet).await;
                }
            }
            DeviceCommand::Channel(ChannelEvent::Closed { channel, reason }) => {
                if self.is_current(channel) {
                    self.on_channel_lost(reason).await;
                }
            }
            DeviceCommand::RequestPair(reply) => {
                let _ = reply.send(self.request_pair().await);
            }
            DeviceCommand::AcceptPair(reply) => {
                let _ = reply.send(self.accept_pair().await);
            }
            DeviceCommand::RejectPair(reply) => {
                let _ = reply.send(self.reject_pair());
            }
            DeviceCommand::Unpair(reply) => {
                let _ = reply.send(self.unpair().await);
            }
            DeviceCommand::Send(packet, reply) => {
                let _ = reply.send(self.send(packet));
            }
            DeviceCommand::RelayNotification(notification, reply) => {
                let relayed = if self.state == DeviceState::PairedConnected {
                    self.plugins.relay_notification(&notification).await
                } else {
                    0
                };
                let _ = reply.send(relayed);
            }
            DeviceCommand::Shutdown(done) => {
                self.teardown().await;
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn is_current(&self, channel: u64) -> bool {
        self.channel.as_ref().map(Channel::id) == Some(channel)
    }

    async fn on_link(&mut self, link: EstablishedLink) {
        let stored = match self.context.trust.fingerprint(&self.device_id) {
            Ok(stored) => stored,
            Err(e) => {
                error!("Refusing link to {}: trust store failed: {}", self.device_id, e);
                return;
            }
        };

        if let Some(expected) = stored.as_deref() {
            if expected != link.fingerprint {
                warn!(
                    "Device {} presented fingerprint {}, expected {}; closing",
                    self.device_id, link.fingerprint, expected
                );
                self.context.events.emit(DeviceEvent::TrustViolation {
                    device_id: self.device_id.clone(),
                    expected: expected.to_string(),
                    actual: link.fingerprint.clone(),
                });
                return;
            }
        }

        let Some(events) = self.self_tx.upgrade() else {
            return;
        };

        if let Some(old) = self.channel.take() {
            info!(
                "Replacing channel {} to {} with a newer connection",
                old.id(),
                self.device_id
            );
            old.close();
        }
        self.cancel_pending_pairing("connection replaced");
        self.plugins.shutdown().await;
        self.pairing_deadline = None;

        self.info = Some(link.identity.clone());
        let fingerprint = link.fingerprint.clone();
        let remote_addr = link.remote_addr;
        let channel = Channel::spawn(
            link.into_stream(),
            remote_addr,
            fingerprint,
            self.context.max_packet_size,
            events,
        );
        info!(
            "Device {} connected from {} on channel {}",
            self.device_id,
            remote_addr,
            channel.id()
        );
        self.channel = Some(channel);

        if stored.is_some() {
            self.activate_plugins().await;
            self.set_state(DeviceState::PairedConnected);
        } else {
            self.set_state(DeviceState::ConnectedUnpaired);
        }
    }

    async fn on_channel_lost(&mut self, reason: String) {
        self.channel = None;
        self.cancel_pending_pairing("connection lost");
        self.pairing_deadline = None;
        self.plugins.shutdown().await;

        let paired = self.state.is_paired();
        info!("Lost connection to {}: {}", self.device_id, reason);
        self.set_state(if paired {
            DeviceState::PairedDisconnected
        } else {
            DeviceState::Discovered
        });
        self.context.events.emit(DeviceEvent::ConnectionLost {
            device_id: self.device_id.clone(),
            reason,
            paired,
        });
    }

    async fn on_packet(&mut self, packet: Packet) {
        if let Some(pairing) = PairingPacket::from_packet(&packet) {
            self.on_pairing_packet(pairing).await;
            return;
        }

        if packet.is_control() {
            debug!(
                "Ignoring {} packet from {} on a live channel",
                packet.packet_type, self.device_id
            );
            return;
        }

        if self.state != DeviceState::PairedConnected {
            debug!(
                "Dropping {} packet from unpaired device {}",
                packet.packet_type, self.device_id
            );
            return;
        }

        match self.plugins.dispatch(&packet).await {
            Ok(()) => {}
            Err(ProtocolError::CapabilityMismatch(packet_type)) => {
                warn!(
                    "No handler for {} packets from {}, dropped",
                    packet_type, self.device_id
                );
            }
            Err(e) => warn!("Packet from {} failed: {}", self.device_id, e),
        }
    }

    async fn on_pairing_packet(&mut self, pairing: PairingPacket) {
        debug!("Pairing packet {:?} from {} in {}", pairing, self.device_id, self.state);

        match (self.state, pairing) {
            (DeviceState::ConnectedUnpaired, PairingPacket::Pair) => {
                self.pairing_deadline = Some(Instant::now() + self.context.pairing_timeout);
                self.set_state(DeviceState::PairRequestedIn);
                info!("Device {} requested pairing", self.device_id);
                self.context.events.emit(DeviceEvent::PairingRequested {
                    device_id: self.device_id.clone(),
                    device_name: self.name(),
                    fingerprint: self.channel_fingerprint().unwrap_or_default(),
                });
            }
            (DeviceState::PairRequestedOut, PairingPacket::Pair) => {
                if let Err(e) = self.complete_pairing(false).await {
                    error!("Failed to pair with {}: {}", self.device_id, e);
                }
            }
            (DeviceState::PairRequestedOut, _) => {
                self.abandon_pairing();
                self.context.events.emit(DeviceEvent::PairingRejected {
                    device_id: self.device_id.clone(),
                    reason: "rejected by peer".to_string(),
                });
            }
            (DeviceState::PairRequestedIn, PairingPacket::Pair) => {
                debug!("Duplicate pairing request from {}", self.device_id);
            }
            (DeviceState::PairRequestedIn, _) => {
                self.abandon_pairing();
                self.context.events.emit(DeviceEvent::PairingRejected {
                    device_id: self.device_id.clone(),
                    reason: "request withdrawn by peer".to_string(),
                });
            }
            (DeviceState::PairedConnected, PairingPacket::Pair) => {
                // The peer lost its pairing state; confirm ours.
                self.send_control(PairingPacket::Pair);
            }
            (DeviceState::PairedConnected, _) => {
                info!("Device {} unpaired us", self.device_id);
                if let Err(e) = self.context.trust.remove_fingerprint(&self.device_id) {
                    error!("Failed to forget {}: {}", self.device_id, e);
                }
                self.drop_channel().await;
                self.set_state(DeviceState::Discovered);
                self.context.events.emit(DeviceEvent::Unpaired {
                    device_id: self.device_id.clone(),
                });
            }
            (state, pairing) => {
                debug!("Ignoring {:?} from {} in {}", pairing, self.device_id, state);
            }
        }
    }

    async fn request_pair(&mut self) -> Result<()> {
        match self.state {
            DeviceState::ConnectedUnpaired => {
                self.send_control(PairingPacket::Pair);
                self.pairing_deadline = Some(Instant::now() + self.context.pairing_timeout);
                self.set_state(DeviceState::PairRequestedOut);
                info!("Requested pairing with {}", self.device_id);
                Ok(())
            }
            DeviceState::PairRequestedIn => self.accept_pair().await,
            DeviceState::PairRequestedOut | DeviceState::PairedConnected => Ok(()),
            _ => Err(ProtocolError::InvalidState(format!(
                "device {} is not connected",
                self.device_id
            ))),
        }
    }

    async fn accept_pair(&mut self) -> Result<()> {
        if self.state != DeviceState::PairRequestedIn {
            return Err(ProtocolError::InvalidState(format!(
                "no pairing request pending from {}",
                self.device_id
            )));
        }
        self.complete_pairing(true).await
    }

    fn reject_pair(&mut self) -> Result<()> {
        match self.state {
            DeviceState::PairRequestedIn | DeviceState::PairRequestedOut => {
                self.send_control(PairingPacket::Reject);
                self.abandon_pairing();
                self.context.events.emit(DeviceEvent::PairingRejected {
                    device_id: self.device_id.clone(),
                    reason: "rejected locally".to_string(),
                });
                Ok(())
            }
            _ => Err(ProtocolError::InvalidState(format!(
                "no pairing in progress with {}",
                self.device_id
            ))),
        }
    }

    async fn unpair(&mut self) -> Result<()> {
        self.context.trust.remove_fingerprint(&self.device_id)?;
        if self.channel.is_some() {
            self.send_control(PairingPacket::Unpair);
        }
        self.drop_channel().await;
        self.set_state(DeviceState::Discovered);
        info!("Unpaired {}", self.device_id);
        self.context.events.emit(DeviceEvent::Unpaired {
            device_id: self.device_id.clone(),
        });
        Ok(())
    }

    fn pairing_expired(&mut self) {
        self.pairing_deadline = None;
        match self.state {
            DeviceState::PairRequestedIn => self.send_control(PairingPacket::Unpair),
            DeviceState::PairRequestedOut => self.send_control(PairingPacket::Reject),
            _ => return,
        }
        info!("Pairing with {} timed out", self.device_id);
        self.set_state(DeviceState::ConnectedUnpaired);
        self.context.events.emit(DeviceEvent::PairingTimeout {
            device_id: self.device_id.clone(),
        });
    }

    /// Pin the channel's fingerprint and enter `PairedConnected`
    ///
    /// With `confirm`, our `pair: true` goes out only once the fingerprint is
    /// stored. A fingerprint that cannot be stored rejects the request.
    async fn complete_pairing(&mut self, confirm: bool) -> Result<()> {
        let fingerprint = self.channel_fingerprint().ok_or_else(|| {
            ProtocolError::InvalidState(format!("no channel to {}", self.device_id))
        })?;
        if let Err(e) = self
            .context
            .trust
            .store_fingerprint(&self.device_id, &fingerprint)
        {
            self.send_control(PairingPacket::Reject);
            self.abandon_pairing();
            self.context.events.emit(DeviceEvent::PairingRejected {
                device_id: self.device_id.clone(),
                reason: format!("fingerprint could not be stored: {}", e),
            });
            return Err(e);
        }
        if confirm {
            self.send_control(PairingPacket::Pair);
        }
        self.pairing_deadline = None;

        self.activate_plugins().await;
        self.set_state(DeviceState::PairedConnected);
        info!("Paired with {} ({})", self.device_id, fingerprint);
        self.context.events.emit(DeviceEvent::Paired {
            device_id: self.device_id.clone(),
            fingerprint,
        });
        Ok(())
    }

    /// Report a request that ended without an answer because its channel went
    fn cancel_pending_pairing(&mut self, reason: &str) {
        if !matches!(
            self.state,
            DeviceState::PairRequestedIn | DeviceState::PairRequestedOut
        ) {
            return;
        }
        self.pairing_deadline = None;
        info!("Pairing with {} abandoned: {}", self.device_id, reason);
        self.context.events.emit(DeviceEvent::PairingRejected {
            device_id: self.device_id.clone(),
            reason: reason.to_string(),
        });
    }

    fn abandon_pairing(&mut self) {
        self.pairing_deadline = None;
        self.set_state(DeviceState::ConnectedUnpaired);
    }

    /// Send a capability packet, subject to pairing and the peer's
    /// declared incoming types
    fn send(&self, packet: Packet) -> Result<()> {
        if packet.is_control() {
            return Err(ProtocolError::InvalidState(format!(
                "{} packets are managed by the device",
                packet.packet_type
            )));
        }
        if self.state != DeviceState::PairedConnected {
            return Err(ProtocolError::NotPaired);
        }
        if !self.plugins.can_send(&packet.packet_type) {
            return Err(ProtocolError::CapabilityMismatch(packet.packet_type));
        }
        match &self.channel {
            Some(channel) => channel.send(packet),
            None => Err(ProtocolError::NotPaired),
        }
    }

    fn send_control(&self, pairing: PairingPacket) {
        let Some(channel) = &self.channel else {
            return;
        };
        if let Err(e) = channel.send(pairing.to_packet()) {
            debug!("Failed to send {:?} to {}: {}", pairing, self.device_id, e);
        }
    }

    async fn activate_plugins(&mut self) {
        let Some(info) = &self.info else {
            return;
        };
        self.plugins = self
            .context
            .plugins
            .activate(info, PacketSender::new(self.plugin_tx.clone()))
            .await;
    }

    /// Close the channel without raising a connection-lost event
    async fn drop_channel(&mut self) {
        self.pairing_deadline = None;
        self.plugins.shutdown().await;
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }

    async fn teardown(&mut self) {
        self.drop_channel().await;
        debug!("Device {} released", self.device_id);
    }

    fn set_state(&mut self, state: DeviceState) {
        if self.state == state {
            return;
        }
        debug!("Device {}: {} -> {}", self.device_id, self.state, state);
        self.state = state;
        self.context.events.emit(DeviceEvent::StateChanged {
            device_id: self.device_id.clone(),
            state,
        });
    }

    fn channel_fingerprint(&self) -> Option<String> {
        self.channel.as_ref().map(|c| c.fingerprint().to_string())
    }

    fn name(&self) -> String {
        self.info
            .as_ref()
            .map(|info| info.device_name.clone())
            .unwrap_or_else(|| self.device_id.clone())
    }

    fn publish(&self) {
        let snapshot = DeviceSnapshot {
            device_id: self.device_id.clone(),
            info: self.info.clone(),
            state: self.state,
            remote_addr: self.channel.as_ref().map(Channel::remote_addr),
            fingerprint: self.channel_fingerprint(),
            plugins: self.plugins.names(),
            accepts_notifications: self.plugins.accepts_notifications(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DeviceType;
    use crate::events::EventBus;
    use crate::pairing::{MemoryTrustStore, TrustStore};
    use crate::plugins::tests::MockPluginFactory;
    use crate::plugins::PluginRegistry;
    use crate::transport::LinkDirection;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{
        AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
    };
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    /// The remote end of a link, speaking raw packets
    struct Peer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn send(&mut self, packet: Packet) {
            self.writer.write_all(&packet.to_bytes().unwrap()).await.unwrap();
        }

        /// Next packet, or `None` once the stream is closed
        async fn next(&mut self) -> Option<Packet> {
            let line = timeout(WAIT, self.lines.next_line()).await.unwrap().unwrap()?;
            Some(Packet::from_bytes(line.as_bytes()).unwrap())
        }

        async fn expect_quiet(&mut self, duration: Duration) {
            if let Ok(Ok(Some(line))) = timeout(duration, self.lines.next_line()).await {
                panic!("unexpected packet: {}", line);
            }
        }
    }

    fn bob() -> DeviceInfo {
        DeviceInfo::new("bob", "Bob's Phone", DeviceType::Phone, 1716)
            .with_incoming_capabilities(vec!["ping".to_string()])
            .with_outgoing_capabilities(vec!["ping".to_string()])
    }

    fn open_link(fingerprint: &str) -> (EstablishedLink, Peer) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (read, writer) = tokio::io::split(remote);
        let link = EstablishedLink::new(
            bob(),
            fingerprint,
            "127.0.0.1:40000".parse().unwrap(),
            LinkDirection::Inbound,
            Box::new(local),
        );
        let peer = Peer {
            lines: BufReader::new(read).lines(),
            writer,
        };
        (link, peer)
    }

    /// Reads work; pinning always fails
    struct ReadOnlyTrustStore;

    impl TrustStore for ReadOnlyTrustStore {
        fn fingerprint(&self, _device_id: &str) -> Result<Option<String>> {
            Ok(None)
        }

        fn store_fingerprint(&self, _device_id: &str, _fingerprint: &str) -> Result<()> {
            Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "trust store is read-only",
            )))
        }

        fn remove_fingerprint(&self, _device_id: &str) -> Result<()> {
            Ok(())
        }

        fn known_devices(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn set_known_devices(&self, _device_ids: &[String]) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        handle: DeviceHandle,
        trust: Arc<dyn TrustStore>,
        events: mpsc::UnboundedReceiver<DeviceEvent>,
    }

    impl Harness {
        fn new(
            trust: impl TrustStore + 'static,
            plugins: PluginRegistry,
            pairing_timeout: Duration,
        ) -> Self {
            let trust: Arc<dyn TrustStore> = Arc::new(trust);
            let bus = EventBus::new();
            let events = bus.subscribe();
            let context = Arc::new(DeviceContext {
                trust: trust.clone(),
                plugins: Arc::new(plugins),
                events: bus,
                pairing_timeout,
                max_packet_size: crate::packet::MAX_PACKET_SIZE,
            });
            let handle = DeviceHandle::spawn("bob", Some(bob()), context);
            Self {
                handle,
                trust,
                events,
            }
        }

        fn unpaired() -> Self {
            Self::new(MemoryTrustStore::new(), PluginRegistry::new(), Duration::from_secs(30))
        }

        fn paired(fingerprint: &str, plugins: PluginRegistry) -> Self {
            let trust = MemoryTrustStore::new();
            trust.store_fingerprint("bob", fingerprint).unwrap();
            Self::new(trust, plugins, Duration::from_secs(30))
        }

        async fn wait_for(&self, state: DeviceState) {
            let mut watch = self.handle.watch();
            timeout(WAIT, watch.wait_for(|s| s.state == state))
                .await
                .unwrap_or_else(|_| panic!("device never reached {}", state))
                .unwrap();
        }

        async fn expect_event(&mut self, matches: impl Fn(&DeviceEvent) -> bool) -> DeviceEvent {
            loop {
                let event = timeout(WAIT, self.events.recv()).await.unwrap().unwrap();
                if matches(&event) {
                    return event;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_link_without_trust_is_connected_unpaired() {
        let harness = Harness::unpaired();
        assert_eq!(harness.handle.snapshot().state, DeviceState::Discovered);

        let (link, _peer) = open_link("AA");
        harness.handle.notify(DeviceCommand::Link(link));
        harness.wait_for(DeviceState::ConnectedUnpaired).await;

        let snapshot = harness.handle.snapshot();
        assert_eq!(snapshot.fingerprint.as_deref(), Some("AA"));
        assert!(snapshot.plugins.is_empty());
    }

    #[tokio::test]
    async fn test_incoming_request_expires_with_single_unpair() {
        let mut harness = Harness::new(
            MemoryTrustStore::new(),
            PluginRegistry::new(),
            Duration::from_millis(200),
        );
        let (link, mut peer) = open_link("AA");
        harness.handle.notify(DeviceCommand::Link(link));
        harness.wait_for(DeviceState::ConnectedUnpaired).await;

        peer.send(PairingPacket::Pair.to_packet()).await;
        match harness
            .expect_event(|e| matches!(e, DeviceEvent::PairingRequested { .. }))
            .await
        {
            DeviceEvent::PairingRequested {
                device_name,
                fingerprint,
                ..
            } => {
                assert_eq!(device_name, "Bob's Phone");
                assert_eq!(fingerprint, "AA");
            }
            _ => unreachable!(),
        }

        harness
            .expect_event(|e| matches!(e, DeviceEvent::PairingTimeout { .. }))
            .await;
        assert_eq!(harness.handle.snapshot().state, DeviceState::ConnectedUnpaired);

        let packet = peer.next().await.unwrap();
        assert_eq!(
            PairingPacket::from_packet(&packet),
            Some(PairingPacket::Unpair)
        );
        peer.expect_quiet(Duration::from_millis(500)).await;
        assert_eq!(harness.trust.fingerprint("bob").unwrap(), None);
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_is_trust_violation() {
        let mut harness = Harness::paired("AA", PluginRegistry::new());
        assert_eq!(harness.handle.snapshot().state, DeviceState::PairedDisconnected);

        let (link, mut peer) = open_link("BB");
        harness.handle.notify(DeviceCommand::Link(link));

        match harness
            .expect_event(|e| matches!(e, DeviceEvent::TrustViolation { .. }))
            .await
        {
            DeviceEvent::TrustViolation {
                expected, actual, ..
            } => {
                assert_eq!(expected, "AA");
                assert_eq!(actual, "BB");
            }
            _ => unreachable!(),
        }

        // The impostor's stream is dropped without any packet.
        assert!(peer.next().await.is_none());
        assert_eq!(harness.handle.snapshot().state, DeviceState::PairedDisconnected);
        assert_eq!(harness.trust.fingerprint("bob").unwrap().as_deref(), Some("AA"));
    }

    #[tokio::test]
    async fn test_newer_link_replaces_older() {
        let mut harness = Harness::unpaired();

        let (first, mut first_peer) = open_link("AA");
        harness.handle.notify(DeviceCommand::Link(first));
        harness.wait_for(DeviceState::ConnectedUnpaired).await;

        let (second, mut second_peer) = open_link("AA");
        harness.handle.notify(DeviceCommand::Link(second));

        assert!(first_peer.next().await.is_none());

        // The surviving channel carries pairing traffic.
        second_peer.send(PairingPacket::Pair.to_packet()).await;
        harness.wait_for(DeviceState::PairRequestedIn).await;

        // Replacing a channel is not a connection loss.
        while let Ok(event) = harness.events.try_recv() {
            assert!(!matches!(event, DeviceEvent::ConnectionLost { .. }));
        }
    }

    #[tokio::test]
    async fn test_accept_pins_fingerprint() {
        let mut harness = Harness::unpaired();
        let (link, mut peer) = open_link("AA:BB");
        harness.handle.notify(DeviceCommand::Link(link));
        harness.wait_for(DeviceState::ConnectedUnpaired).await;

        // Nothing to accept yet
        assert!(harness.handle.sender().accept_pair().await.is_err());

        peer.send(PairingPacket::Pair.to_packet()).await;
        harness.wait_for(DeviceState::PairRequestedIn).await;
        harness.handle.sender().accept_pair().await.unwrap();

        assert_eq!(
            PairingPacket::from_packet(&peer.next().await.unwrap()),
            Some(PairingPacket::Pair)
        );
        assert_eq!(harness.handle.snapshot().state, DeviceState::PairedConnected);
        assert_eq!(
            harness.trust.fingerprint("bob").unwrap().as_deref(),
            Some("AA:BB")
        );
        harness
            .expect_event(|e| matches!(e, DeviceEvent::Paired { .. }))
            .await;
    }

    #[tokio::test]
    async fn test_accept_rejects_when_fingerprint_cannot_be_stored() {
        let mut harness = Harness::new(
            ReadOnlyTrustStore,
            PluginRegistry::new(),
            Duration::from_secs(30),
        );
        let (link, mut peer) = open_link("AA");
        harness.handle.notify(DeviceCommand::Link(link));
        harness.wait_for(DeviceState::ConnectedUnpaired).await;

        peer.send(PairingPacket::Pair.to_packet()).await;
        harness.wait_for(DeviceState::PairRequestedIn).await;
        assert!(harness.handle.sender().accept_pair().await.is_err());

        // The peer never sees an acceptance we could not back up.
        assert_eq!(
            PairingPacket::from_packet(&peer.next().await.unwrap()),
            Some(PairingPacket::Reject)
        );
        peer.expect_quiet(Duration::from_millis(300)).await;
        assert_eq!(harness.handle.snapshot().state, DeviceState::ConnectedUnpaired);
        harness
            .expect_event(|e| matches!(e, DeviceEvent::PairingRejected { .. }))
            .await;
    }

    #[tokio::test]
    async fn test_replacing_link_abandons_pending_request() {
        let mut harness = Harness::unpaired();
        let (first, mut first_peer) = open_link("AA");
        harness.handle.notify(DeviceCommand::Link(first));
        harness.wait_for(DeviceState::ConnectedUnpaired).await;

        first_peer.send(PairingPacket::Pair.to_packet()).await;
        harness
            .expect_event(|e| matches!(e, DeviceEvent::PairingRequested { .. }))
            .await;

        let (second, _second_peer) = open_link("AA");
        harness.handle.notify(DeviceCommand::Link(second));

        match harness
            .expect_event(|e| matches!(e, DeviceEvent::PairingRejected { .. }))
            .await
        {
            DeviceEvent::PairingRejected { reason, .. } => {
                assert_eq!(reason, "connection replaced")
            }
            _ => unreachable!(),
        }
        harness.wait_for(DeviceState::ConnectedUnpaired).await;
        assert!(harness.handle.sender().accept_pair().await.is_err());
    }

    #[tokio::test]
    async fn test_outgoing_request_accepted_and_rejected() {
        let mut harness = Harness::unpaired();
        let (link, mut peer) = open_link("AA");
        harness.handle.notify(DeviceCommand::Link(link));
        harness.wait_for(DeviceState::ConnectedUnpaired).await;

        harness.handle.sender().request_pair().await.unwrap();
        assert_eq!(harness.handle.snapshot().state, DeviceState::PairRequestedOut);
        assert_eq!(
            PairingPacket::from_packet(&peer.next().await.unwrap()),
            Some(PairingPacket::Pair)
        );

        peer.send(PairingPacket::Reject.to_packet()).await;
        harness
            .expect_event(|e| matches!(e, DeviceEvent::PairingRejected { .. }))
            .await;
        assert_eq!(harness.handle.snapshot().state, DeviceState::ConnectedUnpaired);

        harness.handle.sender().request_pair().await.unwrap();
        peer.next().await.unwrap();
        peer.send(PairingPacket::Pair.to_packet()).await;
        harness.wait_for(DeviceState::PairedConnected).await;
        assert_eq!(harness.trust.fingerprint("bob").unwrap().as_deref(), Some("AA"));
    }

    #[tokio::test]
    async fn test_outgoing_request_expires_with_rejection() {
        let mut harness = Harness::new(
            MemoryTrustStore::new(),
            PluginRegistry::new(),
            Duration::from_millis(200),
        );
        let (link, mut peer) = open_link("AA");
        harness.handle.notify(DeviceCommand::Link(link));
        harness.wait_for(DeviceState::ConnectedUnpaired).await;

        harness.handle.sender().request_pair().await.unwrap();
        peer.next().await.unwrap();

        harness
            .expect_event(|e| matches!(e, DeviceEvent::PairingTimeout { .. }))
            .await;
        assert_eq!(
            PairingPacket::from_packet(&peer.next().await.unwrap()),
            Some(PairingPacket::Reject)
        );
        assert_eq!(harness.handle.snapshot().state, DeviceState::ConnectedUnpaired);
    }

    #[tokio::test]
    async fn test_local_unpair_sends_unpair_and_closes() {
        let mut harness = Harness::paired("AA", PluginRegistry::new());
        let (link, mut peer) = open_link("AA");
        harness.handle.notify(DeviceCommand::Link(link));
        harness.wait_for(DeviceState::PairedConnected).await;

        harness.handle.sender().unpair().await.unwrap();

        assert_eq!(
            PairingPacket::from_packet(&peer.next().await.unwrap()),
            Some(PairingPacket::Unpair)
        );
        assert!(peer.next().await.is_none());
        assert_eq!(harness.handle.snapshot().state, DeviceState::Discovered);
        assert_eq!(harness.trust.fingerprint("bob").unwrap(), None);
        harness
            .expect_event(|e| matches!(e, DeviceEvent::Unpaired { .. }))
            .await;
    }

    #[tokio::test]
    async fn test_remote_unpair_forgets_device() {
        let mut harness = Harness::paired("AA", PluginRegistry::new());
        let (link, mut peer) = open_link("AA");
        harness.handle.notify(DeviceCommand::Link(link));
        harness.wait_for(DeviceState::PairedConnected).await;

        peer.send(PairingPacket::Reject.to_packet()).await;
        harness.wait_for(DeviceState::Discovered).await;
        assert!(peer.next().await.is_none());
        assert_eq!(harness.trust.fingerprint("bob").unwrap(), None);
        harness
            .expect_event(|e| matches!(e, DeviceEvent::Unpaired { .. }))
            .await;
    }

    #[tokio::test]
    async fn test_unhandled_packet_keeps_channel_open() {
        let harness = Harness::paired("AA", PluginRegistry::new());
        let (link, mut peer) = open_link("AA");
        harness.handle.notify(DeviceCommand::Link(link));
        harness.wait_for(DeviceState::PairedConnected).await;

        peer.send(Packet::new("ping", json!({}))).await;

        // A pair request on a paired channel is confirmed, so the channel
        // must still be serving packets.
        peer.send(PairingPacket::Pair.to_packet()).await;
        assert_eq!(
            PairingPacket::from_packet(&peer.next().await.unwrap()),
            Some(PairingPacket::Pair)
        );
        assert_eq!(harness.handle.snapshot().state, DeviceState::PairedConnected);
    }

    #[tokio::test]
    async fn test_paired_dispatch_and_send_rules() {
        let factory = Arc::new(MockPluginFactory::new("ping", vec!["ping"], vec!["ping"]));
        let log = factory.log.clone();
        let mut plugins = PluginRegistry::new();
        plugins.register_factory(factory).unwrap();

        let harness = Harness::paired("AA", plugins);

        // Not connected yet
        assert!(matches!(
            harness.handle.sender().send_packet(Packet::new("ping", json!({}))).await,
            Err(ProtocolError::NotPaired)
        ));

        let (link, mut peer) = open_link("AA");
        harness.handle.notify(DeviceCommand::Link(link));
        harness.wait_for(DeviceState::PairedConnected).await;
        assert_eq!(harness.handle.snapshot().plugins, vec!["ping"]);

        peer.send(Packet::new("ping", json!({"fail": true}))).await;
        peer.send(Packet::new("ping", json!({}))).await;

        harness
            .handle
            .sender()
            .send_packet(Packet::new("ping", json!({"message": "hi"})))
            .await
            .unwrap();
        let sent = peer.next().await.unwrap();
        assert_eq!(sent.packet_type, "ping");

        assert!(matches!(
            harness.handle.sender().send_packet(Packet::new("share", json!({}))).await,
            Err(ProtocolError::CapabilityMismatch(_))
        ));

        // The failing packet did not stop the one after it.
        timeout(WAIT, async {
            while !log.lock().unwrap().contains(&"packet:ping".to_string()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(log.lock().unwrap()[0], "init:bob");
    }

    #[tokio::test]
    async fn test_channel_loss_keeps_pairing() {
        let factory = Arc::new(MockPluginFactory::new("ping", vec!["ping"], vec![]));
        let log = factory.log.clone();
        let mut plugins = PluginRegistry::new();
        plugins.register_factory(factory).unwrap();

        let mut harness = Harness::paired("AA", plugins);
        let (link, peer) = open_link("AA");
        harness.handle.notify(DeviceCommand::Link(link));
        harness.wait_for(DeviceState::PairedConnected).await;

        drop(peer);
        harness.wait_for(DeviceState::PairedDisconnected).await;

        match harness
            .expect_event(|e| matches!(e, DeviceEvent::ConnectionLost { .. }))
            .await
        {
            DeviceEvent::ConnectionLost { paired, .. } => assert!(paired),
            _ => unreachable!(),
        }
        assert!(harness.handle.snapshot().plugins.is_empty());
        assert!(log.lock().unwrap().contains(&"stop".to_string()));

        // Reconnecting with the pinned certificate restores the pairing.
        let (link, _peer) = open_link("AA");
        harness.handle.notify(DeviceCommand::Link(link));
        harness.wait_for(DeviceState::PairedConnected).await;
    }

    #[tokio::test]
    async fn test_connect_failure_reverts_to_discovered() {
        let harness = Harness::unpaired();
        harness.handle.notify(DeviceCommand::Connecting);
        harness.wait_for(DeviceState::Connecting).await;
        harness
            .handle
            .notify(DeviceCommand::ConnectFailed("refused".to_string()));
        harness.wait_for(DeviceState::Discovered).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_channel() {
        let harness = Harness::paired("AA", PluginRegistry::new());
        let (link, mut peer) = open_link("AA");
        harness.handle.notify(DeviceCommand::Link(link));
        harness.wait_for(DeviceState::PairedConnected).await;

        let sender = harness.handle.sender();
        harness.handle.shutdown().await;
        assert!(peer.next().await.is_none());
        assert!(matches!(
            sender.unpair().await,
            Err(ProtocolError::Cancelled(_))
        ));
    }
}
