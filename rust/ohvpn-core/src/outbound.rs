//! Outbound sockets that bypass the TUN interface

mod direct;

pub use direct::{DatagramReader, DatagramWriter, DirectDispatcher, DEFAULT_CONNECT_TIMEOUT};

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{TcpStream, UdpSocket};

/// Pin `socket` to `device` so its traffic leaves through the physical
/// interface instead of looping back into the TUN.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn bind_to_device(socket: &Socket, device: &str) -> io::Result<()> {
    socket.bind_device(Some(device.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn bind_to_device(_socket: &Socket, _device: &str) -> io::Result<()> {
    Ok(())
}

fn protect(socket: &Socket, device: Option<&str>) {
    let Some(device) = device else {
        return;
    };
    if let Err(e) = bind_to_device(socket, device) {
        tracing::warn!(
            "Failed to bind socket to {}: {}, connection may loop through the TUN",
            device,
            e
        );
    }
}

/// Non-blocking connect; the caller applies the timeout.
pub async fn connect_tcp(addr: SocketAddr, device: Option<&str>) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    protect(&socket, device);

    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)?;

    stream.writable().await?;
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }

    stream.set_nodelay(true)?;
    Ok(stream)
}

/// A UDP socket connected to `addr`, so it only exchanges datagrams with it.
pub fn connect_udp(addr: SocketAddr, device: Option<&str>) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    protect(&socket, device);

    socket.set_nonblocking(true)?;
    let local: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    socket.bind(&local.into())?;
    socket.connect(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}
