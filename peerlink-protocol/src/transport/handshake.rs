//! Channel establishment
//!
//! ## Outbound (we connect)
//! 1. TCP connect to the peer's advertised port
//! 2. Send our identity in plaintext
//! 3. TLS handshake as client
//!
//! ## Inbound (peer connects)
//! 1. Accept TCP
//! 2. Read the peer's plaintext identity
//! 3. TLS handshake as server
//!
//! In both directions the identities are then exchanged again over TLS. The
//! device id must not change between the two identities and must match the
//! CN of the certificate the peer presented. The whole sequence is bounded by
//! the handshake timeout.

use super::tls::TlsContext;
use super::LinkStream;
use crate::discovery::DeviceInfo;
use crate::packet::PACKET_TYPE_IDENTITY;
use crate::pairing::{calculate_fingerprint, device_id_from_certificate};
use crate::{Packet, ProtocolError, Result};
use rustls::pki_types::{CertificateDer, ServerName};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Default bound on channel establishment
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest identity record accepted during the handshake
const MAX_IDENTITY_SIZE: usize = 64 * 1024;

/// Which side opened the TCP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    Outbound,
    Inbound,
}

/// Parameters shared by every handshake of the local host
#[derive(Clone)]
pub struct HandshakeParams {
    pub tls: TlsContext,
    pub timeout: Duration,
}

/// An authenticated TLS stream together with what the peer proved about
/// itself
pub struct EstablishedLink {
    pub identity: DeviceInfo,
    pub fingerprint: String,
    pub remote_addr: SocketAddr,
    pub direction: LinkDirection,
    stream: Box<dyn LinkStream>,
}

impl EstablishedLink {
    pub fn new(
        identity: DeviceInfo,
        fingerprint: impl Into<String>,
        remote_addr: SocketAddr,
        direction: LinkDirection,
        stream: Box<dyn LinkStream>,
    ) -> Self {
        Self {
            identity,
            fingerprint: fingerprint.into(),
            remote_addr,
            direction,
            stream,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn into_stream(self) -> Box<dyn LinkStream> {
        self.stream
    }
}

impl fmt::Debug for EstablishedLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstablishedLink")
            .field("device_id", &self.identity.device_id)
            .field("fingerprint", &self.fingerprint)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

/// Connect to a peer and run the outbound handshake
///
/// `expected_id`, when known from discovery, must match the identity the peer
/// proves over TLS.
pub async fn connect(
    addr: SocketAddr,
    expected_id: Option<&str>,
    identity: &Packet,
    params: &HandshakeParams,
) -> Result<EstablishedLink> {
    let attempt = async {
        let mut tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "connecting"))?;
        tcp.set_nodelay(true)?;

        write_packet(&mut tcp, identity).await?;

        let server_name = ServerName::from(addr.ip());
        let mut tls = params
            .tls
            .connector()
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProtocolError::HandshakeFailed(format!("TLS handshake: {}", e)))?;

        let peer_cert = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.clone().into_owned())
            .ok_or_else(|| ProtocolError::HandshakeFailed("peer sent no certificate".to_string()))?;

        let peer = exchange_identities(&mut tls, identity).await?;

        if let Some(expected) = expected_id {
            if peer.device_id != expected {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "expected {}, peer identified as {}",
                    expected, peer.device_id
                )));
            }
        }

        finish(peer, &peer_cert, addr, LinkDirection::Outbound, Box::new(tls))
    };

    match timeout(params.timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::HandshakeTimeout(format!(
            "outbound to {} after {:?}",
            addr, params.timeout
        ))),
    }
}

/// Run the inbound handshake on an accepted TCP connection
pub async fn accept(
    mut tcp: TcpStream,
    remote_addr: SocketAddr,
    identity: &Packet,
    params: &HandshakeParams,
) -> Result<EstablishedLink> {
    let attempt = async {
        tcp.set_nodelay(true)?;

        // Read byte by byte: the TLS ClientHello follows immediately and must
        // stay in the socket for the TLS layer.
        let plaintext = read_identity(&mut tcp).await?;
        debug!(
            "Plaintext identity from {} claims {}",
            remote_addr, plaintext.device_id
        );

        let mut tls = params
            .tls
            .acceptor()
            .accept(tcp)
            .await
            .map_err(|e| ProtocolError::HandshakeFailed(format!("TLS handshake: {}", e)))?;

        let peer_cert = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.clone().into_owned())
            .ok_or_else(|| ProtocolError::HandshakeFailed("peer sent no certificate".to_string()))?;

        let peer = exchange_identities(&mut tls, identity).await?;

        if peer.device_id != plaintext.device_id {
            return Err(ProtocolError::HandshakeFailed(format!(
                "device id changed during handshake: {} -> {}",
                plaintext.device_id, peer.device_id
            )));
        }

        finish(peer, &peer_cert, remote_addr, LinkDirection::Inbound, Box::new(tls))
    };

    match timeout(params.timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::HandshakeTimeout(format!(
            "inbound from {} after {:?}",
            remote_addr, params.timeout
        ))),
    }
}

fn finish(
    peer: DeviceInfo,
    peer_cert: &CertificateDer<'static>,
    remote_addr: SocketAddr,
    direction: LinkDirection,
    stream: Box<dyn LinkStream>,
) -> Result<EstablishedLink> {
    let common_name = device_id_from_certificate(peer_cert.as_ref())?;
    if common_name != peer.device_id {
        return Err(ProtocolError::HandshakeFailed(format!(
            "certificate CN {} does not match device id {}",
            common_name, peer.device_id
        )));
    }

    let fingerprint = calculate_fingerprint(peer_cert.as_ref());
    info!(
        "Established {:?} channel with {} ({}) at {}",
        direction, peer.device_name, peer.device_id, remote_addr
    );

    Ok(EstablishedLink::new(peer, fingerprint, remote_addr, direction, stream))
}

/// Both sides send first, then read. Identities are small enough to sit in
/// the socket buffers, so this cannot deadlock.
async fn exchange_identities<S>(stream: &mut S, identity: &Packet) -> Result<DeviceInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_packet(stream, identity).await?;
    read_identity(stream).await
}

async fn write_packet<S>(stream: &mut S, packet: &Packet) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&packet.to_bytes()?)
        .await
        .map_err(|e| ProtocolError::from_io_error(e, "sending identity"))?;
    stream.flush().await?;
    Ok(())
}

async fn read_identity<S>(stream: &mut S) -> Result<DeviceInfo>
where
    S: AsyncRead + Unpin,
{
    let line = read_line_unbuffered(stream, MAX_IDENTITY_SIZE).await?;
    let packet = Packet::from_bytes(&line)
        .map_err(|e| ProtocolError::HandshakeFailed(format!("identity exchange: {}", e)))?;

    if !packet.is_type(PACKET_TYPE_IDENTITY) {
        return Err(ProtocolError::HandshakeFailed(format!(
            "expected identity, got {}",
            packet.packet_type
        )));
    }

    DeviceInfo::from_identity_packet(&packet)
        .map_err(|e| ProtocolError::HandshakeFailed(format!("identity exchange: {}", e)))
}

/// Read up to and including the next newline without reading past it
async fn read_line_unbuffered<S>(stream: &mut S, max_size: usize) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(512);
    let mut byte = [0u8; 1];

    loop {
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "reading identity"))?;
        if n == 0 {
            return Err(ProtocolError::HandshakeFailed(
                "connection closed during identity exchange".to_string(),
            ));
        }

        line.push(byte[0]);
        if byte[0] == b'\n' {
            return Ok(line);
        }
        if line.len() > max_size {
            return Err(ProtocolError::PacketSizeExceeded(line.len(), max_size));
        }
    }
}
