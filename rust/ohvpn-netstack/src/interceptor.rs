//! Turns forwarder requests into flows
//!
//! Every accepted request is handled on its own task. There is no admission
//! control here; the handler decides what to do with each flow.

use crate::packet::TransportProtocol;
use crate::stack::Stack;
use crate::tcp::{TcpForwarder, DEFAULT_MAX_IN_FLIGHT};
use crate::udp::UdpForwarder;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Idle time after which a UDP flow is reclaimed
pub const UDP_LINGER: Duration = Duration::from_secs(15);

/// The local end of an intercepted flow.
pub trait FlowStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> FlowStream for T {}

pub struct Flow {
    pub protocol: TransportProtocol,
    /// The application that opened the flow
    pub source: SocketAddr,
    /// Where the application wanted to go
    pub destination: SocketAddr,
    pub conn: Box<dyn FlowStream>,
    /// Cancelled when the interface shuts down
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("protocol", &self.protocol)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .finish()
    }
}

#[async_trait]
pub trait FlowHandler: Send + Sync + 'static {
    async fn handle_flow(&self, flow: Flow);
}

pub struct FlowInterceptor {
    handler: Arc<dyn FlowHandler>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl FlowInterceptor {
    pub fn new(
        handler: Arc<dyn FlowHandler>,
        shutdown: CancellationToken,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            handler,
            shutdown,
            tasks,
        }
    }

    /// Register the TCP and UDP forwarders on `stack`.
    pub fn install(self, stack: &Stack) {
        let this = Arc::new(self);

        let tcp = this.clone();
        stack.set_tcp_forwarder(TcpForwarder::new(DEFAULT_MAX_IN_FLIGHT, move |request| {
            let interceptor = tcp.clone();
            tcp.tasks.spawn(async move {
                let id = request.id();
                let conn = match request.create_endpoint().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        // the request was consumed, so the SYN has been reset
                        warn!("failed to create TCP endpoint for {}: {}", id, e);
                        return;
                    }
                };
                conn.set_keep_alive(true);
                interceptor
                    .handler
                    .handle_flow(Flow {
                        protocol: TransportProtocol::Tcp,
                        source: conn.remote_addr(),
                        destination: conn.local_addr(),
                        conn: Box::new(conn),
                        cancel: interceptor.shutdown.child_token(),
                    })
                    .await;
            });
        }));

        let udp = this;
        stack.set_udp_forwarder(UdpForwarder::new(move |request| {
            let interceptor = udp.clone();
            udp.tasks.spawn(async move {
                let id = request.id();
                let mut conn = match request.create_endpoint() {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!("failed to create UDP endpoint for {}: {}", id, e);
                        return;
                    }
                };
                conn.set_linger(UDP_LINGER);
                interceptor
                    .handler
                    .handle_flow(Flow {
                        protocol: TransportProtocol::Udp,
                        source: conn.remote_addr(),
                        destination: conn.local_addr(),
                        conn: Box::new(conn),
                        cancel: interceptor.shutdown.child_token(),
                    })
                    .await;
            });
        }));
    }
}
