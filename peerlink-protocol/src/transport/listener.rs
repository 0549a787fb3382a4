//! TCP accept loop
//!
//! Accepts connections on the advertised port and runs each inbound
//! handshake in its own task. Handshake tasks are owned by the loop, so
//! cancelling it aborts every in-flight handshake and waits for them.

use super::handshake::{self, EstablishedLink, HandshakeParams, LinkDirection};
use crate::discovery::DeviceInfo;
use crate::{ProtocolError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one connection attempt, inbound or outbound
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub remote_addr: SocketAddr,
    pub direction: LinkDirection,
    /// Device id the attempt was aimed at, when known beforehand
    pub expected_id: Option<String>,
    pub result: Result<EstablishedLink>,
}

pub struct ChannelListener {
    listener: TcpListener,
}

impl ChannelListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProtocolError::Bind { addr, source })?;
        info!("Channel listener bound to {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop until `shutdown` is cancelled
    pub fn spawn(
        self,
        params: HandshakeParams,
        identity: watch::Receiver<DeviceInfo>,
        outcomes: mpsc::UnboundedSender<HandshakeOutcome>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(accept_loop(self.listener, params, identity, outcomes, shutdown))
    }
}

async fn accept_loop(
    listener: TcpListener,
    params: HandshakeParams,
    identity: watch::Receiver<DeviceInfo>,
    outcomes: mpsc::UnboundedSender<HandshakeOutcome>,
    shutdown: CancellationToken,
) {
    let mut handshakes = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
            accepted = listener.accept() => {
                let (tcp, remote_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                debug!("Incoming connection from {}", remote_addr);
                let identity_packet = identity.borrow().to_identity_packet();
                let params = params.clone();
                let outcomes = outcomes.clone();

                handshakes.spawn(async move {
                    let result = handshake::accept(tcp, remote_addr, &identity_packet, &params).await;
                    let _ = outcomes.send(HandshakeOutcome {
                        remote_addr,
                        direction: LinkDirection::Inbound,
                        expected_id: None,
                        result,
                    });
                });
            }
        }
    }

    let pending = handshakes.len();
    handshakes.shutdown().await;
    debug!("Channel listener stopped ({} handshakes aborted)", pending);
}
