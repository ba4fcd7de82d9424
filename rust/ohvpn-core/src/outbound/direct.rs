use super::{connect_tcp, connect_udp};
use crate::dispatcher::{Destination, DispatchContext, Dispatcher, Link, Network};
use crate::error::{Error, Result};
use crate::platform::PlatformSupport;
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(16);

/// Connects every flow straight to its destination.
pub struct DirectDispatcher {
    platform: Arc<dyn PlatformSupport>,
    connect_timeout: Duration,
}

impl DirectDispatcher {
    pub fn new(platform: Arc<dyn PlatformSupport>) -> Self {
        Self {
            platform,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn outbound_interface(&self) -> Option<String> {
        match self.platform.default_interface_name() {
            Ok(name) => Some(name),
            Err(e) => {
                tracing::debug!("No default interface, sockets stay unbound: {}", e);
                None
            }
        }
    }

    async fn dial_tcp(&self, destination: Destination, device: Option<&str>) -> Result<Link> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            connect_tcp(destination.address, device),
        )
        .await
        .map_err(|_| Error::timeout(format!("Connecting to {} timed out", destination)))?
        .map_err(|e| {
            Error::network_with_source(format!("Failed to connect to {}", destination), e)
        })?;

        let (reader, writer) = stream.into_split();
        Ok(Link::new(reader, writer))
    }

    fn dial_udp(&self, destination: Destination, device: Option<&str>) -> Result<Link> {
        let socket = connect_udp(destination.address, device).map_err(|e| {
            Error::network_with_source(format!("Failed to open UDP socket to {}", destination), e)
        })?;
        let socket = Arc::new(socket);
        Ok(Link::new(
            DatagramReader(socket.clone()),
            DatagramWriter(socket),
        ))
    }
}

#[async_trait]
impl Dispatcher for DirectDispatcher {
    async fn dispatch(&self, ctx: &DispatchContext, destination: Destination) -> Result<Link> {
        let device = self.outbound_interface();
        tracing::debug!(
            "[{}] {} -> {} direct{}",
            ctx.inbound_tag,
            ctx.source,
            destination,
            device
                .as_deref()
                .map(|d| format!(" via {}", d))
                .unwrap_or_default()
        );

        match destination.network {
            Network::Tcp => self.dial_tcp(destination, device.as_deref()).await,
            Network::Udp => self.dial_udp(destination, device.as_deref()),
        }
    }
}

/// Each read yields one datagram.
///
/// Empty datagrams are skipped, since a zero-length read means EOF to the
/// copy loops.
pub struct DatagramReader(Arc<UdpSocket>);

impl AsyncRead for DatagramReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            let before = buf.filled().len();
            ready!(self.0.poll_recv(cx, buf))?;
            if buf.filled().len() > before {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

/// Each write sends one datagram.
pub struct DatagramWriter(Arc<UdpSocket>);

impl AsyncWrite for DatagramWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    // UDP has no half-close
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
