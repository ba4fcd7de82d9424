//! The embedded network stack
//!
//! [`Stack`] owns the protocol settings, the single NIC, the route table and
//! the installed forwarders. Packet processing runs in one engine task per
//! stack, started when the NIC is created.

mod engine;
pub mod settings;

use crate::endpoint::{LinkEndpoint, NetworkDispatcher, PacketBuffer};
use crate::error::{NetStackError, Result};
use crate::packet::{self, FlowId, NetworkProtocol};
use crate::tcp::{TcpConn, TcpForwarder};
use crate::udp::{UdpFlow, UdpForwarder};
use bytes::Bytes;
use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

pub use settings::{
    BufferSizeRange, CongestionControl, IcmpRateLimiter, StackSettings, TcpRecovery, TcpSettings,
};

pub type NicId = u32;

/// Inbound packets buffered between the link and the engine
const INBOUND_QUEUE_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: IpNet,
    pub nic: NicId,
}

impl Route {
    /// `0.0.0.0/0` and `::/0` through `nic`
    pub fn defaults(nic: NicId) -> Vec<Route> {
        vec![
            Route {
                destination: IpNet::V4(Default::default()),
                nic,
            },
            Route {
                destination: IpNet::V6(Default::default()),
                nic,
            },
        ]
    }
}

pub(crate) struct Nic {
    pub(crate) id: NicId,
    pub(crate) link: Arc<LinkEndpoint>,
    promiscuous: AtomicBool,
    spoofing: AtomicBool,
}

impl Nic {
    pub(crate) fn promiscuous(&self) -> bool {
        self.promiscuous.load(Ordering::Acquire)
    }

    pub(crate) fn spoofing(&self) -> bool {
        self.spoofing.load(Ordering::Acquire)
    }
}

/// Stack counters
#[derive(Debug, Default)]
pub struct StackStats {
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
    no_route: AtomicU64,
    tcp_accepted: AtomicU64,
    tcp_rejected: AtomicU64,
    udp_flows: AtomicU64,
    udp_dropped: AtomicU64,
    icmp_rate_limited: AtomicU64,
}

macro_rules! counter {
    ($($name:ident => $record:ident),* $(,)?) => {
        impl StackStats {
            $(
                pub fn $name(&self) -> u64 {
                    self.$name.load(Ordering::Relaxed)
                }

                pub(crate) fn $record(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    packets_received => record_received,
    packets_dropped => record_dropped,
    no_route => record_no_route,
    tcp_accepted => record_tcp_accepted,
    tcp_rejected => record_tcp_rejected,
    udp_flows => record_udp_flow,
    udp_dropped => record_udp_dropped,
    icmp_rate_limited => record_icmp_rate_limited,
}

pub(crate) enum Control {
    CreateTcp {
        id: FlowId,
        reply: oneshot::Sender<Result<TcpConn>>,
    },
    CompleteTcp {
        id: FlowId,
        reset: bool,
    },
}

pub(crate) struct StackInner {
    settings: RwLock<StackSettings>,
    nic: RwLock<Option<Arc<Nic>>>,
    routes: RwLock<Vec<Route>>,
    tcp_forwarder: RwLock<Option<Arc<TcpForwarder>>>,
    udp_forwarder: RwLock<Option<Arc<UdpForwarder>>>,
    udp_flows: DashMap<FlowId, UdpFlow>,
    icmp_limiter: Mutex<IcmpRateLimiter>,
    inbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<Control>>>,
    /// Wakes the engine when a connection has work
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    stats: StackStats,
}

/// Handle to a stack instance. Cheap to clone.
#[derive(Clone)]
pub struct Stack {
    inner: Arc<StackInner>,
}

impl Default for Stack {
    fn default() -> Self {
        Self::new()
    }
}

impl Stack {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(StackInner {
                settings: RwLock::new(StackSettings::default()),
                nic: RwLock::new(None),
                routes: RwLock::new(Vec::new()),
                tcp_forwarder: RwLock::new(None),
                udp_forwarder: RwLock::new(None),
                udp_flows: DashMap::new(),
                icmp_limiter: Mutex::new(IcmpRateLimiter::default()),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                control_tx,
                control_rx: Mutex::new(Some(control_rx)),
                wake: Arc::new(Notify::new()),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                stats: StackStats::default(),
            }),
        }
    }

    pub fn settings(&self) -> StackSettings {
        self.inner.settings.read().clone()
    }

    pub fn stats(&self) -> &StackStats {
        &self.inner.stats
    }

    pub fn set_default_ttl(&self, protocol: NetworkProtocol, ttl: u8) -> Result<()> {
        let option = match protocol {
            NetworkProtocol::Ipv4 => "ipv4 default TTL",
            NetworkProtocol::Ipv6 => "ipv6 default TTL",
        };
        if ttl == 0 {
            return Err(NetStackError::invalid_option(option, "TTL must be non-zero"));
        }
        let mut settings = self.inner.settings.write();
        match protocol {
            NetworkProtocol::Ipv4 => settings.ipv4_ttl = ttl,
            NetworkProtocol::Ipv6 => settings.ipv6_hop_limit = ttl,
        }
        Ok(())
    }

    pub fn set_forwarding(&self, protocol: NetworkProtocol, enabled: bool) {
        let mut settings = self.inner.settings.write();
        match protocol {
            NetworkProtocol::Ipv4 => settings.ipv4_forwarding = enabled,
            NetworkProtocol::Ipv6 => settings.ipv6_forwarding = enabled,
        }
    }

    pub(crate) fn forwarding_enabled(&self, protocol: NetworkProtocol) -> bool {
        self.inner.settings.read().forwarding(protocol)
    }

    pub fn set_icmp_burst(&self, burst: usize) {
        self.inner.icmp_limiter.lock().set_burst(burst);
    }

    /// ICMP packets per second
    pub fn set_icmp_limit(&self, limit: f64) -> Result<()> {
        if !limit.is_finite() || limit < 0.0 {
            return Err(NetStackError::invalid_option(
                "ICMP limit",
                format!("{} is not a valid rate", limit),
            ));
        }
        self.inner.icmp_limiter.lock().set_limit(limit);
        Ok(())
    }

    pub fn icmp_rate(&self) -> (usize, f64) {
        let limiter = self.inner.icmp_limiter.lock();
        (limiter.burst(), limiter.limit())
    }

    pub fn set_tcp_send_buffer_range(&self, range: BufferSizeRange) -> Result<()> {
        range.validate("TCP send buffer size range")?;
        self.inner.settings.write().tcp.send_buffer = range;
        Ok(())
    }

    pub fn set_tcp_receive_buffer_range(&self, range: BufferSizeRange) -> Result<()> {
        range.validate("TCP receive buffer size range")?;
        self.inner.settings.write().tcp.receive_buffer = range;
        Ok(())
    }

    pub fn set_tcp_congestion_control(&self, name: &str) -> Result<()> {
        let cc: CongestionControl = name.parse()?;
        self.inner.settings.write().tcp.congestion_control = cc;
        Ok(())
    }

    pub fn set_tcp_delay(&self, enabled: bool) {
        self.inner.settings.write().tcp.delay = enabled;
    }

    pub fn set_tcp_moderate_receive_buffer(&self, enabled: bool) {
        self.inner.settings.write().tcp.moderate_receive_buffer = enabled;
    }

    pub fn set_tcp_sack_enabled(&self, enabled: bool) -> Result<()> {
        let mut settings = self.inner.settings.write();
        if !enabled && settings.tcp.recovery == TcpRecovery::RackLossDetection {
            return Err(NetStackError::invalid_option(
                "TCP SACK",
                "RACK loss detection requires SACK",
            ));
        }
        settings.tcp.sack = enabled;
        Ok(())
    }

    pub fn set_tcp_recovery(&self, recovery: TcpRecovery) -> Result<()> {
        let mut settings = self.inner.settings.write();
        if recovery == TcpRecovery::RackLossDetection && !settings.tcp.sack {
            return Err(NetStackError::invalid_option(
                "TCP recovery",
                "RACK loss detection requires SACK",
            ));
        }
        settings.tcp.recovery = recovery;
        Ok(())
    }

    /// Create the stack's NIC on top of `link`, attach the link and start
    /// the engine. Must be called from within a tokio runtime.
    pub fn create_nic(&self, id: NicId, link: Arc<LinkEndpoint>) -> Result<()> {
        if self.is_closed() {
            return Err(NetStackError::StackClosed);
        }

        let nic = {
            let mut slot = self.inner.nic.write();
            match slot.as_ref() {
                Some(existing) if existing.id == id => {
                    return Err(NetStackError::DuplicateNic(id));
                }
                Some(_) => {
                    return Err(NetStackError::invalid_option(
                        "creating NIC",
                        "the stack supports a single NIC",
                    ));
                }
                None => {}
            }
            let nic = Arc::new(Nic {
                id,
                link: link.clone(),
                promiscuous: AtomicBool::new(false),
                spoofing: AtomicBool::new(false),
            });
            *slot = Some(nic.clone());
            nic
        };

        let inbound_rx = self.inner.inbound_rx.lock().take();
        let control_rx = self.inner.control_rx.lock().take();
        let (Some(inbound_rx), Some(control_rx)) = (inbound_rx, control_rx) else {
            return Err(NetStackError::InvalidEndpointState);
        };

        let engine = engine::Engine::new(self.clone(), nic, inbound_rx, control_rx);
        self.inner.tasks.spawn(engine.run());

        link.attach(Arc::new(StackDispatcher(Arc::downgrade(&self.inner))));
        info!("NIC {} created with MTU {}", id, link.mtu());
        Ok(())
    }

    fn nic(&self, id: NicId) -> Result<Arc<Nic>> {
        match self.inner.nic.read().as_ref() {
            Some(nic) if nic.id == id => Ok(nic.clone()),
            _ => Err(NetStackError::UnknownNic(id)),
        }
    }

    pub fn set_promiscuous_mode(&self, id: NicId, enabled: bool) -> Result<()> {
        self.nic(id)?.promiscuous.store(enabled, Ordering::Release);
        self.inner.wake.notify_one();
        Ok(())
    }

    pub fn set_spoofing(&self, id: NicId, enabled: bool) -> Result<()> {
        self.nic(id)?.spoofing.store(enabled, Ordering::Release);
        Ok(())
    }

    /// Replace the route table. Every referenced NIC must exist.
    pub fn set_route_table(&self, routes: Vec<Route>) -> Result<()> {
        for route in &routes {
            self.nic(route.nic)?;
        }
        *self.inner.routes.write() = routes;
        self.inner.wake.notify_one();
        Ok(())
    }

    pub fn route_table(&self) -> Vec<Route> {
        self.inner.routes.read().clone()
    }

    /// The most specific route covering `addr`
    pub fn find_route(&self, addr: IpAddr) -> Option<Route> {
        self.inner
            .routes
            .read()
            .iter()
            .filter(|r| r.destination.contains(&addr))
            .max_by_key(|r| r.destination.prefix_len())
            .cloned()
    }

    pub fn set_tcp_forwarder(&self, forwarder: TcpForwarder) {
        *self.inner.tcp_forwarder.write() = Some(Arc::new(forwarder));
    }

    pub fn set_udp_forwarder(&self, forwarder: UdpForwarder) {
        *self.inner.udp_forwarder.write() = Some(Arc::new(forwarder));
    }

    pub(crate) fn tcp_forwarder(&self) -> Option<Arc<TcpForwarder>> {
        self.inner.tcp_forwarder.read().clone()
    }

    pub(crate) fn udp_forwarder(&self) -> Option<Arc<UdpForwarder>> {
        self.inner.udp_forwarder.read().clone()
    }

    /// Active UDP flows
    pub fn udp_flow_count(&self) -> usize {
        self.inner.udp_flows.len()
    }

    pub(crate) fn udp_flows(&self) -> &DashMap<FlowId, UdpFlow> {
        &self.inner.udp_flows
    }

    pub(crate) fn remove_udp_flow(&self, id: &FlowId, generation: u64) {
        self.inner
            .udp_flows
            .remove_if(id, |_, flow| crate::udp::same_generation(flow, generation));
    }

    pub(crate) fn allow_icmp(&self) -> bool {
        self.inner.icmp_limiter.lock().allow()
    }

    pub(crate) fn wake_handle(&self) -> Arc<Notify> {
        self.inner.wake.clone()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    pub(crate) fn send_control(&self, control: Control) -> Result<()> {
        if self.is_closed() {
            return Err(NetStackError::StackClosed);
        }
        self.inner
            .control_tx
            .send(control)
            .map_err(|_| NetStackError::StackClosed)
    }

    /// Flow endpoints are bound to addresses the stack does not own.
    pub(crate) fn check_spoofing(&self) -> Result<()> {
        match self.inner.nic.read().as_ref() {
            Some(nic) if nic.spoofing() => Ok(()),
            Some(nic) => Err(NetStackError::SpoofingDisabled(nic.id)),
            None => Err(NetStackError::InvalidEndpointState),
        }
    }

    /// Emit one UDP datagram from `src` to `dst` through the NIC.
    pub(crate) fn send_udp(&self, src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<()> {
        let nic = self
            .inner
            .nic
            .read()
            .clone()
            .ok_or(NetStackError::InvalidEndpointState)?;
        if self.is_closed() {
            return Err(NetStackError::StackClosed);
        }
        if !nic.spoofing() {
            return Err(NetStackError::SpoofingDisabled(nic.id));
        }
        if self.find_route(dst.ip()).is_none() {
            return Err(NetStackError::NoRoute(dst.ip()));
        }

        let protocol = NetworkProtocol::of(&dst.ip());
        let max = packet::max_udp_payload(nic.link.mtu(), protocol);
        if payload.len() > max {
            return Err(NetStackError::MessageTooLong {
                len: payload.len(),
                max,
            });
        }

        let ttl = self.inner.settings.read().ttl(protocol);
        let header = packet::build_udp_header(src, dst, payload, ttl)?;
        nic.link.write_packet(PacketBuffer::from_segments(vec![
            header,
            Bytes::copy_from_slice(payload),
        ]))
    }

    fn deliver(&self, packet: Bytes) {
        self.inner.stats.record_received();
        if let Err(e) = self.inner.inbound_tx.try_send(packet) {
            trace!("engine queue rejected packet: {}", e);
            self.inner.stats.record_dropped();
        }
    }

    /// Tear the stack down: TCP endpoints are aborted, UDP flows end, and the
    /// link endpoint stops. Safe to call more than once.
    pub fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        debug!("closing stack");
        self.inner.shutdown.cancel();
        self.inner.udp_flows.clear();
        if let Some(nic) = self.inner.nic.read().as_ref() {
            nic.link.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Wait for the engine and the link loops to exit.
    pub async fn wait(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        let link = self.inner.nic.read().as_ref().map(|nic| nic.link.clone());
        if let Some(link) = link {
            link.wait().await;
        }
    }
}

/// Receives packets from the link on behalf of the stack.
struct StackDispatcher(Weak<StackInner>);

impl NetworkDispatcher for StackDispatcher {
    fn deliver_network_packet(&self, _protocol: NetworkProtocol, packet: Bytes) {
        if let Some(inner) = self.0.upgrade() {
            Stack { inner }.deliver(packet);
        }
    }
}

#[cfg(test)]
mod tests;
