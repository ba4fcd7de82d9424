use super::*;
use crate::endpoint::tests::ChannelPort;
use crate::packet::{parse_packet, ParsedPacket, TransportInfo};
use crate::tcp::TcpForwarderRequest;
use crate::udp::UdpForwarderRequest;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const NIC: NicId = 1;
const MTU: usize = 1500;

type Inject = mpsc::UnboundedSender<io::Result<Vec<u8>>>;

fn app() -> SocketAddrV4 {
    "10.0.0.2:50000".parse().unwrap()
}

fn server() -> SocketAddrV4 {
    "93.184.216.34:443".parse().unwrap()
}

fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, transport: &[u8]) -> Vec<u8> {
    let total = 20 + transport.len();
    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[6] = 0x40;
    packet[8] = 64;
    packet[9] = proto;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet.extend_from_slice(transport);
    packet
}

fn tcp_segment(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut tcp = vec![0u8; 20];
    tcp[0..2].copy_from_slice(&src.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&64240u16.to_be_bytes());
    tcp.extend_from_slice(payload);
    ipv4_packet(*src.ip(), *dst.ip(), 6, &tcp)
}

const SYN: u8 = 0x02;
const ACK: u8 = 0x10;
const PSH_ACK: u8 = 0x18;

fn udp_datagram(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let mut udp = vec![0u8; 8];
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    udp.extend_from_slice(payload);
    ipv4_packet(*src.ip(), *dst.ip(), 17, &udp)
}

fn tcp_seq(packet: &[u8]) -> u32 {
    let offset = ((packet[0] & 0x0f) as usize) * 4;
    u32::from_be_bytes([
        packet[offset + 4],
        packet[offset + 5],
        packet[offset + 6],
        packet[offset + 7],
    ])
}

async fn setup() -> (Stack, Arc<ChannelPort>, Inject) {
    let (port, inject) = ChannelPort::new();
    let link = LinkEndpoint::new(port.clone(), MTU);
    let stack = Stack::new();
    stack.set_forwarding(NetworkProtocol::Ipv4, true);
    stack.set_forwarding(NetworkProtocol::Ipv6, true);
    stack.create_nic(NIC, link).unwrap();
    stack.set_promiscuous_mode(NIC, true).unwrap();
    stack.set_spoofing(NIC, true).unwrap();
    stack.set_route_table(Route::defaults(NIC)).unwrap();
    (stack, port, inject)
}

fn capture_tcp(stack: &Stack) -> mpsc::UnboundedReceiver<TcpForwarderRequest> {
    let (tx, rx) = mpsc::unbounded_channel();
    stack.set_tcp_forwarder(TcpForwarder::new(16, move |request| {
        let _ = tx.send(request);
    }));
    rx
}

fn capture_udp(stack: &Stack) -> mpsc::UnboundedReceiver<UdpForwarderRequest> {
    let (tx, rx) = mpsc::unbounded_channel();
    stack.set_udp_forwarder(UdpForwarder::new(move |request| {
        let _ = tx.send(request);
    }));
    rx
}

async fn wait_for_packet<F>(port: &ChannelPort, matches: F) -> Vec<u8>
where
    F: Fn(&ParsedPacket, &[u8]) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let found = port.written().into_iter().find(|packet| {
                parse_packet(packet)
                    .map(|parsed| matches(&parsed, packet))
                    .unwrap_or(false)
            });
            if let Some(packet) = found {
                return packet;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("expected packet was not written")
}

fn is_syn_ack(parsed: &ParsedPacket) -> bool {
    matches!(
        parsed.transport,
        TransportInfo::Tcp {
            syn: true,
            ack: true,
            rst: false,
            ..
        }
    )
}

fn is_rst(parsed: &ParsedPacket) -> bool {
    matches!(parsed.transport, TransportInfo::Tcp { rst: true, .. })
}

#[test]
fn test_nic_options_need_the_nic() {
    let stack = Stack::new();
    assert!(matches!(
        stack.set_promiscuous_mode(NIC, true),
        Err(NetStackError::UnknownNic(NIC))
    ));
    assert!(matches!(
        stack.set_spoofing(NIC, true),
        Err(NetStackError::UnknownNic(NIC))
    ));
    assert!(matches!(
        stack.set_route_table(Route::defaults(NIC)),
        Err(NetStackError::UnknownNic(NIC))
    ));
}

#[test]
fn test_protocol_option_validation() {
    let stack = Stack::new();
    assert!(stack.set_default_ttl(NetworkProtocol::Ipv4, 0).is_err());
    stack.set_default_ttl(NetworkProtocol::Ipv6, 32).unwrap();
    assert_eq!(stack.settings().ipv6_hop_limit, 32);

    assert!(stack.set_tcp_recovery(TcpRecovery::RackLossDetection).is_err());
    stack.set_tcp_sack_enabled(true).unwrap();
    stack.set_tcp_recovery(TcpRecovery::RackLossDetection).unwrap();
    assert!(stack.set_tcp_sack_enabled(false).is_err());

    assert!(stack.set_tcp_congestion_control("bbr").is_err());
    stack.set_tcp_congestion_control("cubic").unwrap();
    assert_eq!(stack.settings().tcp.congestion_control, CongestionControl::Cubic);

    assert!(stack.set_icmp_limit(f64::NAN).is_err());
    assert!(stack.set_icmp_limit(-1.0).is_err());
    stack.set_icmp_burst(10);
    stack.set_icmp_limit(50.0).unwrap();
    assert_eq!(stack.icmp_rate(), (10, 50.0));
}

#[tokio::test]
async fn test_second_nic_is_rejected() {
    let (stack, _port, _inject) = setup().await;
    let (other, _tx) = ChannelPort::new();
    let other = LinkEndpoint::new(other, MTU);
    assert!(matches!(
        stack.create_nic(NIC, other.clone()),
        Err(NetStackError::DuplicateNic(NIC))
    ));
    assert!(matches!(
        stack.create_nic(2, other),
        Err(NetStackError::InvalidOption { .. })
    ));
    stack.close();
}

#[tokio::test]
async fn test_longest_prefix_route_wins() {
    let (stack, _port, _inject) = setup().await;
    let mut routes = Route::defaults(NIC);
    routes.push(Route {
        destination: "10.0.0.0/8".parse().unwrap(),
        nic: NIC,
    });
    stack.set_route_table(routes).unwrap();

    let route = stack.find_route("10.1.2.3".parse().unwrap()).unwrap();
    assert_eq!(route.destination.prefix_len(), 8);
    let route = stack.find_route("2001:db8::1".parse().unwrap()).unwrap();
    assert_eq!(route.destination.prefix_len(), 0);

    stack.set_route_table(Vec::new()).unwrap();
    assert!(stack.find_route("10.1.2.3".parse().unwrap()).is_none());
    stack.close();
}

#[tokio::test]
async fn test_accepted_syn_is_answered_and_data_flows() {
    let (stack, port, inject) = setup().await;
    let mut requests = capture_tcp(&stack);

    inject
        .send(Ok(tcp_segment(app(), server(), 1000, 0, SYN, b"")))
        .unwrap();
    let request = requests.recv().await.unwrap();
    assert_eq!(request.id().local, SocketAddr::V4(server()));
    assert_eq!(request.id().remote, SocketAddr::V4(app()));

    // retransmitted SYN while the request is pending
    inject
        .send(Ok(tcp_segment(app(), server(), 1000, 0, SYN, b"")))
        .unwrap();

    let mut conn = request.create_endpoint().await.unwrap();
    let syn_ack = wait_for_packet(&port, |parsed, _| {
        is_syn_ack(parsed) && parsed.src_addr == IpAddr::V4(*server().ip())
    })
    .await;
    let server_seq = tcp_seq(&syn_ack);

    inject
        .send(Ok(tcp_segment(app(), server(), 1001, server_seq.wrapping_add(1), ACK, b"")))
        .unwrap();
    inject
        .send(Ok(tcp_segment(
            app(),
            server(),
            1001,
            server_seq.wrapping_add(1),
            PSH_ACK,
            b"hello",
        )))
        .unwrap();

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"hello");

    conn.write_all(b"world").await.unwrap();
    wait_for_packet(&port, |parsed, packet| {
        matches!(parsed.transport, TransportInfo::Tcp { .. }) && packet.ends_with(b"world")
    })
    .await;

    assert!(requests.try_recv().is_err());
    assert_eq!(stack.stats().tcp_accepted(), 1);
    stack.close();
    stack.wait().await;
}

#[tokio::test]
async fn test_syn_without_forwarder_is_reset() {
    let (stack, port, inject) = setup().await;

    inject
        .send(Ok(tcp_segment(app(), server(), 1000, 0, SYN, b"")))
        .unwrap();
    wait_for_packet(&port, |parsed, _| is_rst(parsed)).await;
    assert_eq!(stack.stats().tcp_rejected(), 1);
    stack.close();
}

#[tokio::test]
async fn test_dropped_request_is_reset() {
    let (stack, port, inject) = setup().await;
    stack.set_tcp_forwarder(TcpForwarder::new(16, drop));

    inject
        .send(Ok(tcp_segment(app(), server(), 1000, 0, SYN, b"")))
        .unwrap();
    wait_for_packet(&port, |parsed, _| is_rst(parsed)).await;
    stack.close();
}

#[tokio::test]
async fn test_endpoint_needs_spoofing() {
    let (stack, port, inject) = setup().await;
    stack.set_spoofing(NIC, false).unwrap();
    let mut requests = capture_tcp(&stack);

    inject
        .send(Ok(tcp_segment(app(), server(), 1000, 0, SYN, b"")))
        .unwrap();
    let request = requests.recv().await.unwrap();
    let err = request.create_endpoint().await.unwrap_err();
    assert!(matches!(err, NetStackError::SpoofingDisabled(NIC)));
    wait_for_packet(&port, |parsed, _| is_rst(parsed)).await;
    stack.close();
}

#[tokio::test]
async fn test_udp_flow_round_trip() {
    let (stack, port, inject) = setup().await;
    let mut requests = capture_udp(&stack);
    let dns: SocketAddrV4 = "8.8.8.8:53".parse().unwrap();

    inject.send(Ok(udp_datagram(app(), dns, b"query"))).unwrap();
    let request = requests.recv().await.unwrap();
    let mut conn = request.create_endpoint().unwrap();
    assert_eq!(conn.local_addr(), SocketAddr::V4(dns));

    let mut buf = [0u8; 64];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"query");

    // a second datagram of the same flow reaches the same endpoint
    inject.send(Ok(udp_datagram(app(), dns, b"again"))).unwrap();
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"again");
    assert!(requests.try_recv().is_err());

    conn.write_all(b"answer").await.unwrap();
    let reply = wait_for_packet(&port, |parsed, _| {
        matches!(parsed.transport, TransportInfo::Udp { .. })
    })
    .await;
    let parsed = parse_packet(&reply).unwrap();
    assert_eq!(
        parsed.flow_id().unwrap().remote,
        SocketAddr::V4(dns),
        "reply must come from the original destination"
    );
    assert_eq!(parsed.dst_addr, IpAddr::V4(*app().ip()));
    assert!(reply.ends_with(b"answer"));

    let err = conn.write(&vec![0u8; MTU]).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

    drop(conn);
    assert_eq!(stack.udp_flow_count(), 0);
    stack.close();
}

#[tokio::test(start_paused = true)]
async fn test_udp_linger_ends_idle_flow() {
    let (stack, _port, inject) = setup().await;
    let mut requests = capture_udp(&stack);
    let dns: SocketAddrV4 = "1.1.1.1:53".parse().unwrap();

    inject.send(Ok(udp_datagram(app(), dns, b"q"))).unwrap();
    let request = requests.recv().await.unwrap();
    let mut conn = request.create_endpoint().unwrap();
    conn.set_linger(Duration::from_secs(15));

    let mut buf = [0u8; 8];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 1);
    assert_eq!(stack.udp_flow_count(), 1);

    // nothing arrives: the read returns EOF once the linger runs out
    assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    assert_eq!(stack.udp_flow_count(), 0);
    stack.close();
}

#[tokio::test]
async fn test_packets_dropped_without_forwarding() {
    let (stack, _port, inject) = setup().await;
    stack.set_forwarding(NetworkProtocol::Ipv4, false);
    let mut requests = capture_udp(&stack);

    inject
        .send(Ok(udp_datagram(app(), "8.8.8.8:53".parse().unwrap(), b"q")))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while stack.stats().packets_dropped() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(requests.try_recv().is_err());
    stack.close();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (stack, _port, _inject) = setup().await;
    stack.close();
    stack.close();
    assert!(stack.is_closed());
    tokio::time::timeout(Duration::from_secs(5), stack.wait())
        .await
        .unwrap();
}
