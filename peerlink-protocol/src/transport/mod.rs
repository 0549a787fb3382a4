//! Transport Layer
//!
//! TCP connections upgraded to mutually authenticated TLS, and the channels
//! that carry packets over them once established.

mod channel;
mod handshake;
mod listener;
mod tls;

pub use channel::{Channel, ChannelEvent, ChannelId};
pub use handshake::{
    accept, connect, EstablishedLink, HandshakeParams, LinkDirection, HANDSHAKE_TIMEOUT,
};
pub use listener::{ChannelListener, HandshakeOutcome};
pub use tls::{create_client_config, create_server_config, TlsContext};

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream a channel can run over
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> LinkStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}
