//! Ordered stack configuration
//!
//! A stack is brought up by applying a list of [`StackOption`]s in order.
//! Later options may depend on earlier ones: the NIC options need the NIC,
//! the route table needs every NIC it names.

use crate::endpoint::LinkEndpoint;
use crate::error::Result;
use crate::interceptor::FlowInterceptor;
use crate::packet::NetworkProtocol;
use crate::stack::{BufferSizeRange, NicId, Route, Stack, TcpRecovery};
use std::sync::Arc;
use tracing::debug;

pub enum StackOption {
    /// Default TTL (IPv4) and hop limit (IPv6)
    DefaultTtl(u8),
    Forwarding(bool),
    IcmpBurst(usize),
    /// ICMP packets per second
    IcmpLimit(f64),
    TcpSendBufferSizeRange(BufferSizeRange),
    TcpReceiveBufferSizeRange(BufferSizeRange),
    TcpCongestionControl(String),
    TcpDelay(bool),
    TcpModerateReceiveBuffer(bool),
    TcpSackEnabled(bool),
    TcpRecovery(TcpRecovery),
    CreatingNic(NicId, Arc<LinkEndpoint>),
    PromiscuousMode(NicId, bool),
    Spoofing(NicId, bool),
    /// Default IPv4 and IPv6 routes through the NIC
    RouteTable(NicId),
    TransportHandler(FlowInterceptor),
}

impl StackOption {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DefaultTtl(_) => "default TTL",
            Self::Forwarding(_) => "forwarding",
            Self::IcmpBurst(_) => "ICMP burst",
            Self::IcmpLimit(_) => "ICMP limit",
            Self::TcpSendBufferSizeRange(_) => "TCP send buffer size range",
            Self::TcpReceiveBufferSizeRange(_) => "TCP receive buffer size range",
            Self::TcpCongestionControl(_) => "TCP congestion control",
            Self::TcpDelay(_) => "TCP delay",
            Self::TcpModerateReceiveBuffer(_) => "TCP moderate receive buffer",
            Self::TcpSackEnabled(_) => "TCP SACK",
            Self::TcpRecovery(_) => "TCP recovery",
            Self::CreatingNic(..) => "creating NIC",
            Self::PromiscuousMode(..) => "promiscuous mode",
            Self::Spoofing(..) => "spoofing",
            Self::RouteTable(_) => "route table",
            Self::TransportHandler(_) => "transport handler",
        }
    }

    pub fn apply(self, stack: &Stack) -> Result<()> {
        match self {
            Self::DefaultTtl(ttl) => {
                stack.set_default_ttl(NetworkProtocol::Ipv4, ttl)?;
                stack.set_default_ttl(NetworkProtocol::Ipv6, ttl)
            }
            Self::Forwarding(enabled) => {
                stack.set_forwarding(NetworkProtocol::Ipv4, enabled);
                stack.set_forwarding(NetworkProtocol::Ipv6, enabled);
                Ok(())
            }
            Self::IcmpBurst(burst) => {
                stack.set_icmp_burst(burst);
                Ok(())
            }
            Self::IcmpLimit(limit) => stack.set_icmp_limit(limit),
            Self::TcpSendBufferSizeRange(range) => stack.set_tcp_send_buffer_range(range),
            Self::TcpReceiveBufferSizeRange(range) => stack.set_tcp_receive_buffer_range(range),
            Self::TcpCongestionControl(name) => stack.set_tcp_congestion_control(&name),
            Self::TcpDelay(enabled) => {
                stack.set_tcp_delay(enabled);
                Ok(())
            }
            Self::TcpModerateReceiveBuffer(enabled) => {
                stack.set_tcp_moderate_receive_buffer(enabled);
                Ok(())
            }
            Self::TcpSackEnabled(enabled) => stack.set_tcp_sack_enabled(enabled),
            Self::TcpRecovery(recovery) => stack.set_tcp_recovery(recovery),
            Self::CreatingNic(id, link) => stack.create_nic(id, link),
            Self::PromiscuousMode(id, enabled) => stack.set_promiscuous_mode(id, enabled),
            Self::Spoofing(id, enabled) => stack.set_spoofing(id, enabled),
            Self::RouteTable(id) => stack.set_route_table(Route::defaults(id)),
            Self::TransportHandler(interceptor) => {
                interceptor.install(stack);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for StackOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Apply `options` in order, stopping at the first failure.
pub fn apply_all(stack: &Stack, options: Vec<StackOption>) -> Result<()> {
    for option in options {
        let name = option.name();
        option.apply(stack)?;
        debug!("stack option applied: {}", name);
    }
    Ok(())
}
