//! Live channel to a device
//!
//! A [`Channel`] owns an established stream through two tasks: a read loop
//! that frames incoming packets and forwards them to the owning device, and a
//! write loop that drains an outbound queue. Closing the channel aborts the
//! read loop at once. The write loop gets `CLOSE_FLUSH_TIMEOUT` to flush what
//! was already queued and shut the stream down; after that the stream is
//! dropped whether or not the peer is reading.

use super::LinkStream;
use crate::packet::PacketCodec;
use crate::{Packet, ProtocolError, Result};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bound on flushing queued packets once a channel is closed
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique channel identifier
pub type ChannelId = u64;

/// Events raised by a channel's read loop
#[derive(Debug)]
pub enum ChannelEvent {
    /// A well-formed packet arrived
    Packet { channel: ChannelId, packet: Packet },

    /// The stream ended or failed; no more packets will follow
    Closed { channel: ChannelId, reason: String },
}

/// Handle to a running channel
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    remote_addr: SocketAddr,
    fingerprint: String,
    outbound: mpsc::UnboundedSender<Packet>,
    reader: JoinHandle<()>,
    closing: CancellationToken,
}

impl Channel {
    /// Start the read and write loops over `stream`
    ///
    /// Events are delivered to `events`, converted into the owner's message
    /// type.
    pub fn spawn<T>(
        stream: Box<dyn LinkStream>,
        remote_addr: SocketAddr,
        fingerprint: impl Into<String>,
        max_packet_size: usize,
        events: mpsc::UnboundedSender<T>,
    ) -> Self
    where
        T: From<ChannelEvent> + Send + 'static,
    {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let closing = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            id,
            remote_addr,
            FramedRead::new(read_half, PacketCodec::new(max_packet_size)),
            events,
        ));

        tokio::spawn(write_loop(
            id,
            FramedWrite::new(write_half, PacketCodec::new(max_packet_size)),
            outbound_rx,
            closing.clone(),
        ));

        debug!("Channel {} to {} started", id, remote_addr);

        Self {
            id,
            remote_addr,
            fingerprint: fingerprint.into(),
            outbound,
            reader,
            closing,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Queue a packet for sending
    pub fn send(&self, packet: Packet) -> Result<()> {
        self.outbound
            .send(packet)
            .map_err(|_| ProtocolError::NetworkError(format!("channel {} is closed", self.id)))
    }

    /// Close the channel
    ///
    /// Packets queued before the call are still flushed, within
    /// `CLOSE_FLUSH_TIMEOUT`.
    pub fn close(self) {
        debug!("Closing channel {} to {}", self.id, self.remote_addr);
        // Drop does the work.
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.reader.abort();
        self.closing.cancel();
    }
}

async fn read_loop<R, T>(
    id: ChannelId,
    remote_addr: SocketAddr,
    mut frames: FramedRead<R, PacketCodec>,
    events: mpsc::UnboundedSender<T>,
) where
    R: tokio::io::AsyncRead + Unpin,
    T: From<ChannelEvent>,
{
    let reason = loop {
        match frames.next().await {
            Some(Ok(Ok(packet))) => {
                if events
                    .send(ChannelEvent::Packet { channel: id, packet }.into())
                    .is_err()
                {
                    return;
                }
            }
            Some(Ok(Err(e))) => {
                warn!("Dropping packet from {}: {}", remote_addr, e);
            }
            Some(Err(e)) => break e.to_string(),
            None => break "closed by peer".to_string(),
        }
    };

    debug!("Channel {} to {} ended: {}", id, remote_addr, reason);
    let _ = events.send(ChannelEvent::Closed { channel: id, reason }.into());
}

async fn write_loop<W>(
    id: ChannelId,
    mut sink: FramedWrite<W, PacketCodec>,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
    closing: CancellationToken,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    tokio::select! {
        result = forward(&mut sink, &mut outbound) => {
            if let Err(e) = result {
                debug!("Channel {} write failed: {}", id, e);
                return;
            }
        }
        _ = closing.cancelled() => {}
    }

    let drain = async {
        outbound.close();
        while let Some(packet) = outbound.recv().await {
            sink.feed(packet).await?;
        }
        sink.close().await
    };
    match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, drain).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Channel {} failed to flush: {}", id, e),
        Err(_) => debug!("Channel {} did not flush in time, dropping the stream", id),
    }
}

async fn forward<W>(
    sink: &mut FramedWrite<W, PacketCodec>,
    outbound: &mut mpsc::UnboundedReceiver<Packet>,
) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(packet) = outbound.recv().await {
        sink.send(packet).await?;
    }
    Ok(())
}
