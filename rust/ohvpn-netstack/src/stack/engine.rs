use super::{Control, Nic, Stack};
use crate::endpoint::PacketBuffer;
use crate::error::{NetStackError, Result};
use crate::packet::{self, FlowId, NetworkProtocol, ParsedPacket, TransportInfo};
use crate::tcp::{self, TcpConn, TcpEntry, TcpForwarderRequest, TcpShared};
use crate::udp::{self, Delivery, UdpFlow, UdpForwarderRequest};
use bytes::Bytes;
use smoltcp::iface::{Config as InterfaceConfig, Interface, SocketSet};
use smoltcp::phy::{self, Checksum, Device, DeviceCapabilities, Medium};
use smoltcp::socket::tcp as smol_tcp;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{
    HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint, Ipv4Address, Ipv6Address,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Inbound packets handled per wakeup before the interface is polled
const INBOUND_BATCH: usize = 64;

/// Upper bound on sleeping when no socket has a timer pending
const IDLE_POLL: Duration = Duration::from_secs(1);

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_ICMPV6: u8 = 58;

/// Packet queues standing in for the wire on smoltcp's side.
struct QueueDevice {
    rx: VecDeque<Bytes>,
    tx: VecDeque<Vec<u8>>,
    mtu: usize,
}

struct RxToken(Bytes);

struct TxToken<'a>(&'a mut VecDeque<Vec<u8>>);

impl phy::RxToken for RxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0[..])
    }
}

impl<'a> phy::TxToken for TxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len];
        let result = f(&mut frame);
        self.0.push_back(frame);
        result
    }
}

impl Device for QueueDevice {
    type RxToken<'a> = RxToken where Self: 'a;
    type TxToken<'a> = TxToken<'a> where Self: 'a;

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.rx.pop_front()?;
        Some((RxToken(packet), TxToken(&mut self.tx)))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(TxToken(&mut self.tx))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        // The TUN side hands over packets the kernel already checksummed.
        caps.checksum.ipv4 = Checksum::Tx;
        caps.checksum.tcp = Checksum::Tx;
        caps.checksum.udp = Checksum::Tx;
        caps.checksum.icmpv4 = Checksum::Tx;
        caps.checksum.icmpv6 = Checksum::Tx;
        caps
    }
}

fn is_icmp(frame: &[u8]) -> bool {
    match NetworkProtocol::from_packet(frame) {
        Some(NetworkProtocol::Ipv4) => frame.get(9) == Some(&IPPROTO_ICMP),
        Some(NetworkProtocol::Ipv6) => frame.get(6) == Some(&IPPROTO_ICMPV6),
        None => false,
    }
}

/// Drives the smoltcp interface, the TCP sockets and the UDP flow table.
pub(super) struct Engine {
    stack: Stack,
    nic: Arc<Nic>,
    iface: Interface,
    device: QueueDevice,
    sockets: SocketSet<'static>,
    connections: HashMap<FlowId, TcpEntry>,
    /// SYNs of requests handed to the forwarder and not yet decided
    pending: HashMap<FlowId, Bytes>,
    inbound_rx: mpsc::Receiver<Bytes>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl Engine {
    pub(super) fn new(
        stack: Stack,
        nic: Arc<Nic>,
        inbound_rx: mpsc::Receiver<Bytes>,
        control_rx: mpsc::UnboundedReceiver<Control>,
    ) -> Self {
        let mut device = QueueDevice {
            rx: VecDeque::new(),
            tx: VecDeque::new(),
            mtu: nic.link.mtu(),
        };

        let mut config = InterfaceConfig::new(HardwareAddress::Ip);
        config.random_seed = rand::random();
        let mut iface = Interface::new(config, &mut device, SmolInstant::now());

        // Placeholder addresses act as gateways so that any_ip accepts every
        // routed destination.
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(IpAddress::v4(0, 0, 0, 1), 0));
            let _ = addrs.push(IpCidr::new(IpAddress::v6(0, 0, 0, 0, 0, 0, 0, 1), 0));
        });
        let _ = iface
            .routes_mut()
            .add_default_ipv4_route(Ipv4Address::new(0, 0, 0, 1));
        let _ = iface
            .routes_mut()
            .add_default_ipv6_route(Ipv6Address::new(0, 0, 0, 0, 0, 0, 0, 1));

        Self {
            stack,
            nic,
            iface,
            device,
            sockets: SocketSet::new(vec![]),
            connections: HashMap::new(),
            pending: HashMap::new(),
            inbound_rx,
            control_rx,
        }
    }

    pub(super) async fn run(mut self) {
        let shutdown = self.stack.shutdown_token().clone();
        let wake = self.stack.wake_handle();
        info!("stack engine started on NIC {}", self.nic.id);

        loop {
            let delay = self
                .iface
                .poll_delay(SmolInstant::now(), &self.sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
                .unwrap_or(IDLE_POLL)
                .min(IDLE_POLL);

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(control) = self.control_rx.recv() => self.handle_control(control),
                Some(packet) = self.inbound_rx.recv() => {
                    self.handle_inbound(packet);
                    for _ in 1..INBOUND_BATCH {
                        match self.inbound_rx.try_recv() {
                            Ok(packet) => self.handle_inbound(packet),
                            Err(_) => break,
                        }
                    }
                }
                _ = wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }

            self.process();
        }

        self.abort_all();
        info!("stack engine stopped");
    }

    fn poll(&mut self) {
        self.iface.set_any_ip(self.nic.promiscuous());
        let _ = self
            .iface
            .poll(SmolInstant::now(), &mut self.device, &mut self.sockets);
    }

    /// Poll the interface, pump every connection and push out what smoltcp
    /// produced.
    fn process(&mut self) {
        let now = Instant::now();
        self.poll();

        let mut closed = Vec::new();
        for (id, entry) in self.connections.iter_mut() {
            let socket = self.sockets.get_mut::<smol_tcp::Socket>(entry.handle);
            if tcp::pump(entry, socket, now) {
                closed.push(*id);
            }
        }
        for id in closed {
            if let Some(entry) = self.connections.remove(&id) {
                self.sockets.remove(entry.handle);
                trace!("tcp connection {} closed", id);
            }
        }

        self.poll();
        self.flush_transmit();
    }

    fn flush_transmit(&mut self) {
        while let Some(frame) = self.device.tx.pop_front() {
            if is_icmp(&frame) && !self.stack.allow_icmp() {
                self.stack.stats().record_icmp_rate_limited();
                continue;
            }
            match self.nic.link.write_packet(PacketBuffer::from(frame)) {
                Ok(()) => {}
                Err(NetStackError::QueueFull) => trace!("link queue full, dropping outbound packet"),
                Err(e) => {
                    trace!("dropping outbound packet: {}", e);
                }
            }
        }
    }

    fn admit(&self, parsed: &ParsedPacket) -> bool {
        // No address is local to the stack, so every packet is forwarded.
        if !self.nic.promiscuous() || !self.stack.forwarding_enabled(parsed.protocol) {
            trace!("not forwarding packet to {}", parsed.dst_addr);
            self.stack.stats().record_dropped();
            return false;
        }
        if self.stack.find_route(parsed.dst_addr).is_none() {
            trace!("no route to {}", parsed.dst_addr);
            self.stack.stats().record_no_route();
            return false;
        }
        true
    }

    fn handle_inbound(&mut self, packet: Bytes) {
        let parsed = match packet::parse_packet(&packet) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!("dropping packet: {}", e);
                self.stack.stats().record_dropped();
                return;
            }
        };
        if !self.admit(&parsed) {
            return;
        }

        let Some(id) = parsed.flow_id() else {
            self.device.rx.push_back(packet);
            return;
        };
        match &parsed.transport {
            TransportInfo::Tcp { .. } => self.handle_tcp(id, &parsed, packet),
            TransportInfo::Udp { payload, .. } => {
                let payload = packet.slice(payload.clone());
                self.handle_udp(id, payload);
            }
            _ => self.device.rx.push_back(packet),
        }
    }

    fn handle_tcp(&mut self, id: FlowId, parsed: &ParsedPacket, packet: Bytes) {
        if self.connections.contains_key(&id) || !parsed.is_tcp_syn() {
            // smoltcp answers segments of unknown connections with RST.
            self.device.rx.push_back(packet);
            return;
        }
        if self.pending.contains_key(&id) {
            trace!("absorbed SYN retransmission for {}", id);
            return;
        }

        let forwarder = self.stack.tcp_forwarder();
        let permit = forwarder.as_ref().and_then(|f| f.try_acquire());
        match (forwarder, permit) {
            (Some(forwarder), Some(permit)) => {
                self.pending.insert(id, packet);
                self.stack.stats().record_tcp_accepted();
                forwarder.dispatch(TcpForwarderRequest::new(id, self.stack.clone(), permit));
            }
            _ => {
                debug!("rejecting {}: no forwarder capacity", id);
                self.stack.stats().record_tcp_rejected();
                self.device.rx.push_back(packet);
            }
        }
    }

    fn handle_udp(&mut self, id: FlowId, payload: Bytes) {
        let delivery = self
            .stack
            .udp_flows()
            .get(&id)
            .map(|flow| udp::deliver(&flow, payload.clone()));

        match delivery {
            Some(Delivery::Queued) => {}
            Some(Delivery::Dropped) => {
                trace!("udp flow {} queue full, datagram dropped", id);
                self.stack.stats().record_udp_dropped();
            }
            Some(Delivery::NewFlow(payload)) => {
                self.stack.udp_flows().remove(&id);
                self.open_udp(id, payload);
            }
            None => self.open_udp(id, payload),
        }
    }

    fn open_udp(&mut self, id: FlowId, payload: Bytes) {
        let Some(forwarder) = self.stack.udp_forwarder() else {
            trace!("no udp forwarder, dropping datagram for {}", id);
            self.stack.stats().record_udp_dropped();
            return;
        };

        let (flow, rx, generation) = UdpFlow::open();
        let _ = flow.tx.try_send(payload);
        self.stack.udp_flows().insert(id, flow);
        self.stack.stats().record_udp_flow();
        forwarder.dispatch(UdpForwarderRequest::new(id, generation, rx, self.stack.clone()));
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::CreateTcp { id, reply } => {
                let result = self.create_tcp(id);
                if let Err(e) = &result {
                    debug!("failed to create endpoint for {}: {}", id, e);
                }
                // A dropped receiver drops the conn, which closes it.
                let _ = reply.send(result);
            }
            Control::CompleteTcp { id, reset } => {
                if let Some(syn) = self.pending.remove(&id) {
                    if reset {
                        self.device.rx.push_back(syn);
                    }
                }
            }
        }
    }

    fn create_tcp(&mut self, id: FlowId) -> Result<TcpConn> {
        let syn = self
            .pending
            .remove(&id)
            .ok_or(NetStackError::InvalidEndpointState)?;

        if let Err(e) = self.stack.check_spoofing() {
            self.device.rx.push_back(syn);
            return Err(e);
        }

        // Let smoltcp see whatever was queued ahead of the SYN first.
        self.poll();

        let settings = self.stack.settings();
        let profile = &settings.tcp;
        let mut socket = smol_tcp::Socket::new(
            smol_tcp::SocketBuffer::new(vec![0; profile.receive_buffer_size()]),
            smol_tcp::SocketBuffer::new(vec![0; profile.send_buffer_size()]),
        );
        socket.set_congestion_control(profile.congestion_control.into());
        socket.set_nagle_enabled(profile.delay);
        socket.set_ack_delay(
            profile
                .ack_delay()
                .map(|d| smoltcp::time::Duration::from_millis(d.as_millis() as u64)),
        );
        let ttl = settings.ttl(NetworkProtocol::of(&id.local.ip()));
        socket.set_hop_limit(Some(ttl));

        let listen = IpListenEndpoint {
            addr: Some(IpAddress::from(id.local.ip())),
            port: id.local.port(),
        };
        socket
            .listen(listen)
            .map_err(|_| NetStackError::InvalidEndpointState)?;

        let handle = self.sockets.add(socket);
        self.device.rx.push_back(syn);
        self.poll();

        let expected = IpEndpoint::new(IpAddress::from(id.remote.ip()), id.remote.port());
        let socket = self.sockets.get::<smol_tcp::Socket>(handle);
        let accepted =
            socket.state() != smol_tcp::State::Listen && socket.remote_endpoint() == Some(expected);
        if !accepted {
            self.sockets.remove(handle);
            return Err(NetStackError::ConnectionRefused);
        }

        let shared = TcpShared::new(self.stack.wake_handle());
        self.connections
            .insert(id, TcpEntry::new(handle, shared.clone()));
        trace!("tcp endpoint created for {}", id);
        Ok(TcpConn::new(id, shared))
    }

    fn abort_all(&mut self) {
        for entry in self.connections.values() {
            self.sockets
                .get_mut::<smol_tcp::Socket>(entry.handle)
                .abort();
            entry.shared.reset();
        }
        if !self.connections.is_empty() {
            debug!("aborted {} tcp connections", self.connections.len());
        }
        self.poll();
        self.flush_transmit();
        self.connections.clear();
        self.pending.clear();

        self.control_rx.close();
        while let Ok(control) = self.control_rx.try_recv() {
            if let Control::CreateTcp { reply, .. } = control {
                let _ = reply.send(Err(NetStackError::StackClosed));
            }
        }
        if !self.device.rx.is_empty() {
            warn!("{} inbound packets discarded at shutdown", self.device.rx.len());
        }
    }
}
