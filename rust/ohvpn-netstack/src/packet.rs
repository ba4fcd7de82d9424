//! IP packet classification and UDP datagram framing using smoltcp wire types

use crate::error::{NetStackError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::Range;

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const UDP_HEADER_LEN: usize = 8;

/// Network layer protocol of a raw packet, as selected by the version nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkProtocol {
    Ipv4,
    Ipv6,
}

impl NetworkProtocol {
    /// Classify a raw packet by the high nibble of its first byte.
    pub fn from_packet(data: &[u8]) -> Option<Self> {
        match data.first().map(|b| b >> 4) {
            Some(4) => Some(Self::Ipv4),
            Some(6) => Some(Self::Ipv6),
            _ => None,
        }
    }

    /// EtherType number the protocol is registered under.
    pub fn number(self) -> u16 {
        match self {
            Self::Ipv4 => 0x0800,
            Self::Ipv6 => 0x86dd,
        }
    }

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    pub fn header_len(self) -> usize {
        match self {
            Self::Ipv4 => IPV4_HEADER_LEN,
            Self::Ipv6 => IPV6_HEADER_LEN,
        }
    }
}

impl fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "ipv4"),
            Self::Ipv6 => write!(f, "ipv6"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Identity of an intercepted flow.
///
/// `remote` is the application on the device side of the TUN interface,
/// `local` is the address it was trying to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    pub protocol: TransportProtocol,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.remote, self.local)
    }
}

#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub protocol: NetworkProtocol,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub transport: TransportInfo,
}

#[derive(Debug, Clone)]
pub enum TransportInfo {
    Tcp {
        src_port: u16,
        dst_port: u16,
        syn: bool,
        ack: bool,
        rst: bool,
    },
    Udp {
        src_port: u16,
        dst_port: u16,
        /// Byte range of the datagram payload inside the original packet
        payload: Range<usize>,
    },
    Icmp,
    Other(u8),
}

impl ParsedPacket {
    pub fn flow_id(&self) -> Option<FlowId> {
        let (protocol, src_port, dst_port) = match &self.transport {
            TransportInfo::Tcp {
                src_port, dst_port, ..
            } => (TransportProtocol::Tcp, *src_port, *dst_port),
            TransportInfo::Udp {
                src_port, dst_port, ..
            } => (TransportProtocol::Udp, *src_port, *dst_port),
            _ => return None,
        };
        Some(FlowId {
            protocol,
            local: SocketAddr::new(self.dst_addr, dst_port),
            remote: SocketAddr::new(self.src_addr, src_port),
        })
    }

    /// A connection opening segment: SYN without ACK or RST.
    pub fn is_tcp_syn(&self) -> bool {
        matches!(
            self.transport,
            TransportInfo::Tcp {
                syn: true,
                ack: false,
                rst: false,
                ..
            }
        )
    }
}

/// Parse the network and transport headers of an IP packet
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket> {
    match NetworkProtocol::from_packet(data) {
        Some(NetworkProtocol::Ipv4) => parse_ipv4(data),
        Some(NetworkProtocol::Ipv6) => parse_ipv6(data),
        None => Err(NetStackError::UnsupportedProtocol(format!(
            "IP version {}",
            data.first().map(|b| b >> 4).unwrap_or(0)
        ))),
    }
}

fn parse_ipv4(data: &[u8]) -> Result<ParsedPacket> {
    let pkt = Ipv4Packet::new_checked(data)
        .map_err(|e| NetStackError::InvalidPacket(format!("IPv4: {}", e)))?;
    let header_len = pkt.header_len() as usize;
    let fragmented = pkt.more_frags() || pkt.frag_offset() != 0;

    let transport = if fragmented {
        TransportInfo::Other(pkt.next_header().into())
    } else {
        parse_transport(pkt.next_header(), pkt.payload(), header_len)?
    };

    Ok(ParsedPacket {
        protocol: NetworkProtocol::Ipv4,
        src_addr: IpAddr::V4(pkt.src_addr()),
        dst_addr: IpAddr::V4(pkt.dst_addr()),
        transport,
    })
}

fn parse_ipv6(data: &[u8]) -> Result<ParsedPacket> {
    let pkt = Ipv6Packet::new_checked(data)
        .map_err(|e| NetStackError::InvalidPacket(format!("IPv6: {}", e)))?;
    let transport = parse_transport(pkt.next_header(), pkt.payload(), IPV6_HEADER_LEN)?;

    Ok(ParsedPacket {
        protocol: NetworkProtocol::Ipv6,
        src_addr: IpAddr::V6(pkt.src_addr()),
        dst_addr: IpAddr::V6(pkt.dst_addr()),
        transport,
    })
}

fn parse_transport(protocol: IpProtocol, payload: &[u8], offset: usize) -> Result<TransportInfo> {
    match protocol {
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(payload)
                .map_err(|e| NetStackError::InvalidPacket(format!("TCP: {}", e)))?;
            Ok(TransportInfo::Tcp {
                src_port: tcp.src_port(),
                dst_port: tcp.dst_port(),
                syn: tcp.syn(),
                ack: tcp.ack(),
                rst: tcp.rst(),
            })
        }
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(payload)
                .map_err(|e| NetStackError::InvalidPacket(format!("UDP: {}", e)))?;
            let start = offset + UDP_HEADER_LEN;
            Ok(TransportInfo::Udp {
                src_port: udp.src_port(),
                dst_port: udp.dst_port(),
                payload: start..start + udp.payload().len(),
            })
        }
        IpProtocol::Icmp | IpProtocol::Icmpv6 => Ok(TransportInfo::Icmp),
        other => Ok(TransportInfo::Other(other.into())),
    }
}

/// Largest UDP payload that fits a single packet of `mtu` bytes.
pub fn max_udp_payload(mtu: usize, protocol: NetworkProtocol) -> usize {
    mtu.saturating_sub(protocol.header_len() + UDP_HEADER_LEN)
}

/// Build the IP and UDP headers for a datagram carrying `payload`.
///
/// The returned buffer holds only the headers; the caller sends the payload
/// as a separate segment. Both checksums cover the payload.
pub fn build_udp_header(
    src: SocketAddr,
    dst: SocketAddr,
    payload: &[u8],
    hop_limit: u8,
) -> Result<Bytes> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    if udp_len > u16::MAX as usize {
        return Err(NetStackError::MessageTooLong {
            len: payload.len(),
            max: u16::MAX as usize - UDP_HEADER_LEN,
        });
    }

    let mut udp = [0u8; UDP_HEADER_LEN];
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());

    let mut sum = pseudo_header_sum(&src.ip(), &dst.ip(), 17, udp_len)?;
    sum = sum_words(&udp, sum);
    sum = sum_words(payload, sum);
    let mut udp_cksum = fold(sum);
    if udp_cksum == 0 {
        udp_cksum = 0xffff;
    }
    udp[6..8].copy_from_slice(&udp_cksum.to_be_bytes());

    let mut header = BytesMut::with_capacity(IPV6_HEADER_LEN + UDP_HEADER_LEN);
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let total_len = IPV4_HEADER_LEN + udp_len;
            if total_len > u16::MAX as usize {
                return Err(NetStackError::MessageTooLong {
                    len: payload.len(),
                    max: u16::MAX as usize - IPV4_HEADER_LEN - UDP_HEADER_LEN,
                });
            }
            let mut ip = [0u8; IPV4_HEADER_LEN];
            ip[0] = 0x45;
            ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
            ip[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
            ip[8] = hop_limit;
            ip[9] = 17;
            ip[12..16].copy_from_slice(&s.octets());
            ip[16..20].copy_from_slice(&d.octets());
            let ip_cksum = fold(sum_words(&ip, 0));
            ip[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
            header.put_slice(&ip);
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            header.put_u32(0x6000_0000);
            header.put_u16(udp_len as u16);
            header.put_u8(17);
            header.put_u8(hop_limit);
            header.put_slice(&s.octets());
            header.put_slice(&d.octets());
        }
        _ => unreachable!("address families checked by pseudo_header_sum"),
    }
    header.put_slice(&udp);
    Ok(header.freeze())
}

fn pseudo_header_sum(src: &IpAddr, dst: &IpAddr, proto: u8, len: usize) -> Result<u32> {
    let sum = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => sum_words(&d.octets(), sum_words(&s.octets(), 0)),
        (IpAddr::V6(s), IpAddr::V6(d)) => sum_words(&d.octets(), sum_words(&s.octets(), 0)),
        _ => {
            return Err(NetStackError::InvalidPacket(format!(
                "mixed address families {} -> {}",
                src, dst
            )))
        }
    };
    Ok(sum
        .wrapping_add(proto as u32)
        .wrapping_add((len as u32) >> 16)
        .wrapping_add((len as u32) & 0xffff))
}

/// Add `data` as big-endian 16-bit words onto `sum`. Odd trailing bytes are
/// padded with zero, so only the last chunk of a message may be odd.
fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
        sum = (sum & 0xffff) + (sum >> 16);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
