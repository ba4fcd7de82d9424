//! ohvpn network stack
//!
//! Bridges a TUN file descriptor to an embedded userspace IP stack and
//! surfaces every TCP connection and UDP flow the stack sees as a [`Flow`].
//!
//! This crate provides:
//! - [`PacketPort`]: whole-packet reads and vectored writes on the descriptor
//! - [`LinkEndpoint`]: the inbound and outbound packet loops
//! - [`Stack`]: the smoltcp-based stack and its ordered [`StackOption`]s
//! - [`FlowInterceptor`]: TCP/UDP forwarders feeding a [`FlowHandler`]
//!
//! # Example
//!
//! ```rust,no_run
//! use ohvpn_netstack::{
//!     apply_all, FdPacketPort, Flow, FlowHandler, FlowInterceptor, LinkEndpoint, Stack,
//!     StackOption,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use tokio_util::task::TaskTracker;
//!
//! struct Discard;
//!
//! #[async_trait::async_trait]
//! impl FlowHandler for Discard {
//!     async fn handle_flow(&self, _flow: Flow) {}
//! }
//!
//! async fn run(fd: i32) -> ohvpn_netstack::Result<()> {
//!     let port = Arc::new(FdPacketPort::from_raw_fd(fd)?);
//!     let link = LinkEndpoint::new(port, 1500);
//!     let stack = Stack::new();
//!     let interceptor =
//!         FlowInterceptor::new(Arc::new(Discard), CancellationToken::new(), TaskTracker::new());
//!
//!     apply_all(
//!         &stack,
//!         vec![
//!             StackOption::Forwarding(true),
//!             StackOption::CreatingNic(1, link),
//!             StackOption::PromiscuousMode(1, true),
//!             StackOption::Spoofing(1, true),
//!             StackOption::RouteTable(1),
//!             StackOption::TransportHandler(interceptor),
//!         ],
//!     )?;
//!     stack.wait().await;
//!     Ok(())
//! }
//! ```

pub mod endpoint;
pub mod error;
pub mod interceptor;
pub mod option;
pub mod packet;
pub mod port;
pub mod stack;
pub mod tcp;
pub mod udp;

// Re-exports
pub use endpoint::{LinkEndpoint, LinkStats, NetworkDispatcher, PacketBuffer, DEFAULT_QUEUE_SIZE};
pub use error::{NetStackError, Result};
pub use interceptor::{Flow, FlowHandler, FlowInterceptor, FlowStream, UDP_LINGER};
pub use option::{apply_all, StackOption};
pub use packet::{FlowId, NetworkProtocol, TransportProtocol};
pub use port::{FdPacketPort, PacketPort};
pub use stack::{
    BufferSizeRange, CongestionControl, NicId, Route, Stack, StackSettings, StackStats,
    TcpRecovery, TcpSettings,
};
pub use tcp::{TcpConn, TcpForwarder, TcpForwarderRequest};
pub use udp::{UdpConn, UdpForwarder, UdpForwarderRequest};

#[cfg(test)]
mod tests {
    mod property_tests;
}
