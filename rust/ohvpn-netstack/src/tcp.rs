//! TCP forwarder and flow endpoints
//!
//! New connections surface as [`TcpForwarderRequest`]s. Accepting one yields
//! a [`TcpConn`], an `AsyncRead + AsyncWrite` stream whose buffers the engine
//! pumps into and out of the matching smoltcp socket.

use crate::error::{NetStackError, Result};
use crate::packet::FlowId;
use crate::stack::{Control, Stack};
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{oneshot, Notify};

/// Pending connection requests allowed at once
pub const DEFAULT_MAX_IN_FLIGHT: usize = 65535;

/// Staging buffer between a [`TcpConn`] and its socket, per direction
const STAGING_BUFFER_SIZE: usize = 64 * 1024;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(75);
const KEEPALIVE_PROBES: u64 = 9;

/// How long a closed-by-us connection may wait for the peer's FIN
const FIN_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

type RequestHandler = dyn Fn(TcpForwarderRequest) + Send + Sync;

/// Surfaces connection attempts to application code.
pub struct TcpForwarder {
    max_in_flight: usize,
    in_flight: Arc<AtomicUsize>,
    handler: Box<RequestHandler>,
}

impl TcpForwarder {
    pub fn new<F>(max_in_flight: usize, handler: F) -> Self
    where
        F: Fn(TcpForwarderRequest) + Send + Sync + 'static,
    {
        Self {
            max_in_flight,
            in_flight: Arc::new(AtomicUsize::new(0)),
            handler: Box::new(handler),
        }
    }

    /// Requests handed out and not yet completed
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn try_acquire(&self) -> Option<InFlightPermit> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_in_flight).then_some(n + 1)
            })
            .ok()
            .map(|_| InFlightPermit(self.in_flight.clone()))
    }

    pub(crate) fn dispatch(&self, request: TcpForwarderRequest) {
        (self.handler)(request)
    }
}

pub(crate) struct InFlightPermit(Arc<AtomicUsize>);

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A SYN waiting for a decision.
///
/// Dropping an unfinished request resets the connection.
pub struct TcpForwarderRequest {
    id: FlowId,
    stack: Stack,
    permit: Option<InFlightPermit>,
}

impl TcpForwarderRequest {
    pub(crate) fn new(id: FlowId, stack: Stack, permit: InFlightPermit) -> Self {
        Self {
            id,
            stack,
            permit: Some(permit),
        }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    /// Accept the connection and return its local endpoint.
    pub async fn create_endpoint(mut self) -> Result<TcpConn> {
        let (reply, rx) = oneshot::channel();
        self.stack.send_control(Control::CreateTcp { id: self.id, reply })?;
        self.permit.take();
        rx.await.map_err(|_| NetStackError::StackClosed)?
    }

    /// Finish the request without an endpoint. With `reset` the SYN is
    /// answered with RST, otherwise it is dropped and the peer retries.
    pub fn complete(mut self, reset: bool) {
        self.finish(reset);
    }

    fn finish(&mut self, reset: bool) {
        if self.permit.take().is_some() {
            let _ = self
                .stack
                .send_control(Control::CompleteTcp { id: self.id, reset });
        }
    }
}

impl Drop for TcpForwarderRequest {
    fn drop(&mut self) {
        self.finish(true);
    }
}

#[derive(Default)]
struct ConnState {
    /// stack -> application
    recv_buf: BytesMut,
    /// application -> stack
    send_buf: BytesMut,
    read_eof: bool,
    write_closed: bool,
    released: bool,
    reset: bool,
    /// the engine dropped the socket; nothing drains `send_buf` any more
    closed: bool,
    keep_alive: Option<bool>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl ConnState {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

/// State shared between a [`TcpConn`] and the engine.
pub(crate) struct TcpShared {
    state: Mutex<ConnState>,
    engine: Arc<Notify>,
}

impl TcpShared {
    pub(crate) fn new(engine: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConnState::default()),
            engine,
        })
    }

    /// Mark the connection as reset and wake both directions.
    pub(crate) fn reset(&self) {
        let mut state = self.state.lock();
        state.reset = true;
        state.wake_reader();
        state.wake_writer();
    }
}

/// Local endpoint of an intercepted TCP connection.
pub struct TcpConn {
    id: FlowId,
    shared: Arc<TcpShared>,
}

impl TcpConn {
    pub(crate) fn new(id: FlowId, shared: Arc<TcpShared>) -> Self {
        Self { id, shared }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    /// The address the application connected to
    pub fn local_addr(&self) -> SocketAddr {
        self.id.local
    }

    /// The application's own address
    pub fn remote_addr(&self) -> SocketAddr {
        self.id.remote
    }

    pub fn set_keep_alive(&self, enabled: bool) {
        self.shared.state.lock().keep_alive = Some(enabled);
        self.shared.engine.notify_one();
    }
}

impl std::fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConn").field("id", &self.id).finish()
    }
}

impl AsyncRead for TcpConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.shared.state.lock();

        if !state.recv_buf.is_empty() {
            let len = std::cmp::min(buf.remaining(), state.recv_buf.len());
            buf.put_slice(&state.recv_buf.split_to(len));
            drop(state);
            self.shared.engine.notify_one();
            return Poll::Ready(Ok(()));
        }

        if state.reset {
            return Poll::Ready(Err(NetStackError::ConnectionReset.into()));
        }

        if state.read_eof {
            return Poll::Ready(Ok(())); // EOF
        }

        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.shared.state.lock();

        if state.reset {
            return Poll::Ready(Err(NetStackError::ConnectionReset.into()));
        }
        if state.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write half closed",
            )));
        }
        if state.closed {
            return Poll::Ready(Err(connection_closed()));
        }

        let room = STAGING_BUFFER_SIZE.saturating_sub(state.send_buf.len());
        if room == 0 {
            state.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = std::cmp::min(room, buf.len());
        state.send_buf.extend_from_slice(&buf[..n]);
        drop(state);
        self.shared.engine.notify_one();
        Poll::Ready(Ok(n))
    }

    /// Resolves once every written byte has been handed to the stack.
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.shared.state.lock();
        if state.send_buf.is_empty() {
            return Poll::Ready(Ok(()));
        }
        if state.reset {
            return Poll::Ready(Err(NetStackError::ConnectionReset.into()));
        }
        if state.closed {
            return Poll::Ready(Err(connection_closed()));
        }
        state.write_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.state.lock().write_closed = true;
        self.shared.engine.notify_one();
        Poll::Ready(Ok(()))
    }
}

fn connection_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
}

impl Drop for TcpConn {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.released = true;
        state.recv_buf.clear();
        drop(state);
        self.shared.engine.notify_one();
    }
}

/// Engine-side bookkeeping for one accepted connection.
pub(crate) struct TcpEntry {
    pub(crate) handle: SocketHandle,
    pub(crate) shared: Arc<TcpShared>,
    fin_sent: bool,
    released_at: Option<Instant>,
}

impl TcpEntry {
    pub(crate) fn new(handle: SocketHandle, shared: Arc<TcpShared>) -> Self {
        Self {
            handle,
            shared,
            fin_sent: false,
            released_at: None,
        }
    }
}

fn handshake_done(state: tcp::State) -> bool {
    !matches!(
        state,
        tcp::State::Listen | tcp::State::SynSent | tcp::State::SynReceived
    )
}

fn smol_duration(d: Duration) -> smoltcp::time::Duration {
    smoltcp::time::Duration::from_millis(d.as_millis() as u64)
}

/// Move data between a connection's staging buffers and its socket.
///
/// Returns `true` once the socket is closed and the entry can be removed.
pub(crate) fn pump(entry: &mut TcpEntry, socket: &mut tcp::Socket<'_>, now: Instant) -> bool {
    let mut state = entry.shared.state.lock();

    if let Some(enabled) = state.keep_alive.take() {
        if enabled {
            socket.set_keep_alive(Some(smol_duration(KEEPALIVE_INTERVAL)));
            socket.set_timeout(Some(smol_duration(KEEPALIVE_INTERVAL * KEEPALIVE_PROBES as u32)));
        } else {
            socket.set_keep_alive(None);
            socket.set_timeout(None);
        }
    }

    // stack -> application
    let mut received = false;
    while socket.can_recv() {
        let released = state.released;
        let room = if released {
            usize::MAX
        } else {
            STAGING_BUFFER_SIZE.saturating_sub(state.recv_buf.len())
        };
        if room == 0 {
            break;
        }
        let result = socket.recv(|data| {
            let n = std::cmp::min(room, data.len());
            if !released {
                state.recv_buf.extend_from_slice(&data[..n]);
            }
            (n, n)
        });
        match result {
            Ok(0) | Err(_) => break,
            Ok(_) => received = true,
        }
    }
    if !state.read_eof
        && handshake_done(socket.state())
        && !socket.may_recv()
        && !socket.can_recv()
    {
        state.read_eof = true;
        received = true;
    }
    if received {
        state.wake_reader();
    }

    // application -> stack
    let mut sent = false;
    while !state.send_buf.is_empty() && socket.can_send() {
        match socket.send_slice(&state.send_buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                state.send_buf.advance(n);
                sent = true;
            }
        }
    }
    if sent {
        state.wake_writer();
    }

    if state.released && entry.released_at.is_none() {
        entry.released_at = Some(now);
    }

    if (state.write_closed || state.released)
        && state.send_buf.is_empty()
        && !entry.fin_sent
        && handshake_done(socket.state())
    {
        socket.close();
        entry.fin_sent = true;
    }

    if let Some(released_at) = entry.released_at {
        if socket.state() != tcp::State::Closed
            && now.saturating_duration_since(released_at) > FIN_WAIT_TIMEOUT
        {
            socket.abort();
        }
    }

    if socket.state() == tcp::State::Closed {
        if !state.read_eof {
            state.reset = true;
        }
        state.closed = true;
        state.wake_reader();
        state.wake_writer();
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn conn() -> (TcpConn, Arc<TcpShared>) {
        let id = FlowId {
            protocol: crate::packet::TransportProtocol::Tcp,
            local: "93.184.216.34:443".parse().unwrap(),
            remote: "10.0.0.2:50000".parse().unwrap(),
        };
        let shared = TcpShared::new(Arc::new(Notify::new()));
        (TcpConn::new(id, shared.clone()), shared)
    }

    #[tokio::test]
    async fn test_read_buffered_then_eof() {
        let (mut conn, shared) = conn();
        {
            let mut state = shared.state.lock();
            state.recv_buf.extend_from_slice(b"hello");
            state.read_eof = true;
        }

        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_reset_surfaces_after_buffered_data() {
        let (mut conn, shared) = conn();
        shared.state.lock().recv_buf.extend_from_slice(b"ab");
        shared.reset();

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 2);
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        let err = conn.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_write_is_bounded_by_staging_buffer() {
        let (mut conn, shared) = conn();
        let data = vec![7u8; STAGING_BUFFER_SIZE + 10];

        let n = conn.write(&data).await.unwrap();
        assert_eq!(n, STAGING_BUFFER_SIZE);
        assert_eq!(shared.state.lock().send_buf.len(), STAGING_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_shutdown_then_write_fails() {
        let (mut conn, shared) = conn();
        conn.shutdown().await.unwrap();
        assert!(shared.state.lock().write_closed);
        let err = conn.write(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_writes_fail_once_socket_closed_after_fin() {
        use smoltcp::iface::SocketSet;

        let (mut conn, shared) = conn();
        shared.state.lock().send_buf.extend_from_slice(b"unsent");

        let mut sockets = SocketSet::new(vec![]);
        // a fresh socket is Closed, as after FIN then RST
        let handle = sockets.add(tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0; 64]),
            tcp::SocketBuffer::new(vec![0; 64]),
        ));
        let mut entry = TcpEntry::new(handle, shared.clone());
        assert!(pump(
            &mut entry,
            sockets.get_mut::<tcp::Socket>(handle),
            Instant::now()
        ));
        {
            let state = shared.state.lock();
            assert!(state.read_eof);
            assert!(!state.reset);
        }

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        let err = conn.write(b"lost bytes").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let err = conn.flush().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_drop_releases() {
        let (conn, shared) = conn();
        conn.set_keep_alive(true);
        drop(conn);
        let state = shared.state.lock();
        assert!(state.released);
        assert_eq!(state.keep_alive, Some(true));
    }

    #[test]
    fn test_in_flight_limit() {
        let forwarder = TcpForwarder::new(2, |_| {});
        let a = forwarder.try_acquire().unwrap();
        let _b = forwarder.try_acquire().unwrap();
        assert!(forwarder.try_acquire().is_none());
        drop(a);
        assert_eq!(forwarder.in_flight(), 1);
        assert!(forwarder.try_acquire().is_some());
    }
}
