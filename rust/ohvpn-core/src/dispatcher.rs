use crate::config::SniffingConfig;
use crate::error::Result;
use async_trait::async_trait;
use ohvpn_netstack::TransportProtocol;
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl From<TransportProtocol> for Network {
    fn from(protocol: TransportProtocol) -> Self {
        match protocol {
            TransportProtocol::Tcp => Self::Tcp,
            TransportProtocol::Udp => Self::Udp,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    pub network: Network,
    pub address: SocketAddr,
}

impl Destination {
    pub fn new(network: Network, address: SocketAddr) -> Self {
        Self { network, address }
    }

    pub fn tcp(address: SocketAddr) -> Self {
        Self::new(Network::Tcp, address)
    }

    pub fn udp(address: SocketAddr) -> Self {
        Self::new(Network::Udp, address)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}

/// Upstream connection a flow is bridged to. The two halves are used from
/// separate copy directions.
pub struct Link {
    pub reader: Box<dyn AsyncRead + Unpin + Send>,
    pub writer: Box<dyn AsyncWrite + Unpin + Send>,
}

impl Link {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Split one duplex stream into a link.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// What the dispatcher knows about the flow besides its destination.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub inbound_tag: String,
    pub source: SocketAddr,
    pub sniffing: SniffingConfig,
    /// Cancelled when the flow is torn down
    pub cancel: CancellationToken,
}

/// Resolves a destination to an upstream link. Called concurrently from
/// every flow.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, ctx: &DispatchContext, destination: Destination) -> Result<Link>;
}
