//! UDP forwarder and flow endpoints
//!
//! UDP never reaches smoltcp. The engine keys datagrams by [`FlowId`] in a
//! flow table; the first datagram of an unknown flow opens a
//! [`UdpForwarderRequest`] and later ones are queued to its [`UdpConn`].

use crate::error::{NetStackError, Result};
use crate::packet::FlowId;
use crate::stack::Stack;
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tracing::trace;

/// Datagrams queued per flow before new ones are dropped
pub const FLOW_QUEUE_SIZE: usize = 256;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

type RequestHandler = dyn Fn(UdpForwarderRequest) + Send + Sync;

/// Flow table entry
pub(crate) struct UdpFlow {
    pub(crate) tx: mpsc::Sender<Bytes>,
    generation: u64,
}

impl UdpFlow {
    pub(crate) fn open() -> (Self, mpsc::Receiver<Bytes>, u64) {
        let (tx, rx) = mpsc::channel(FLOW_QUEUE_SIZE);
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        (Self { tx, generation }, rx, generation)
    }
}

/// Surfaces new UDP flows to application code.
pub struct UdpForwarder {
    handler: Box<RequestHandler>,
}

impl UdpForwarder {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(UdpForwarderRequest) + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
        }
    }

    pub(crate) fn dispatch(&self, request: UdpForwarderRequest) {
        (self.handler)(request)
    }
}

/// A new flow waiting for an endpoint. Dropping it forgets the flow.
pub struct UdpForwarderRequest {
    id: FlowId,
    generation: u64,
    rx: Option<mpsc::Receiver<Bytes>>,
    stack: Stack,
}

impl UdpForwarderRequest {
    pub(crate) fn new(id: FlowId, generation: u64, rx: mpsc::Receiver<Bytes>, stack: Stack) -> Self {
        Self {
            id,
            generation,
            rx: Some(rx),
            stack,
        }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn create_endpoint(mut self) -> Result<UdpConn> {
        self.stack.check_spoofing()?;
        let rx = self.rx.take().ok_or(NetStackError::RequestCompleted)?;
        Ok(UdpConn {
            id: self.id,
            generation: self.generation,
            rx,
            stack: self.stack.clone(),
            linger: None,
            linger_timer: None,
            closed: false,
        })
    }
}

impl Drop for UdpForwarderRequest {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.stack.remove_udp_flow(&self.id, self.generation);
        }
    }
}

/// Local endpoint of an intercepted UDP flow.
///
/// Each read yields one datagram and each write emits one datagram.
pub struct UdpConn {
    id: FlowId,
    generation: u64,
    rx: mpsc::Receiver<Bytes>,
    stack: Stack,
    linger: Option<Duration>,
    linger_timer: Option<Pin<Box<Sleep>>>,
    closed: bool,
}

impl UdpConn {
    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.id.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.id.remote
    }

    /// End the flow after `linger` without an inbound datagram.
    pub fn set_linger(&mut self, linger: Duration) {
        self.linger = Some(linger);
        self.linger_timer = Some(Box::pin(tokio::time::sleep(linger)));
    }

    fn touch(&mut self) {
        if let (Some(linger), Some(timer)) = (self.linger, self.linger_timer.as_mut()) {
            timer.as_mut().reset(Instant::now() + linger);
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.rx.close();
            self.stack.remove_udp_flow(&self.id, self.generation);
        }
    }
}

impl std::fmt::Debug for UdpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpConn")
            .field("id", &self.id)
            .field("linger", &self.linger)
            .finish()
    }
}

impl AsyncRead for UdpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }

        loop {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(datagram)) => {
                    if datagram.is_empty() {
                        continue;
                    }
                    let n = std::cmp::min(buf.remaining(), datagram.len());
                    buf.put_slice(&datagram[..n]);
                    self.touch();
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(None) => {
                    self.close();
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => break,
            }
        }

        if let Some(timer) = self.linger_timer.as_mut() {
            if timer.as_mut().poll(cx).is_ready() {
                trace!("udp flow {} lingered out", self.id);
                self.close();
                return Poll::Ready(Ok(()));
            }
        }
        Poll::Pending
    }
}

impl AsyncWrite for UdpConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // Replies travel from the flow's local address back to the application.
        match self.stack.send_udp(self.id.local, self.id.remote, buf) {
            Ok(()) => {
                self.touch();
                Poll::Ready(Ok(buf.len()))
            }
            Err(NetStackError::QueueFull) => {
                trace!("udp flow {}: outbound queue full, datagram dropped", self.id);
                Poll::Ready(Ok(buf.len()))
            }
            Err(e) => Poll::Ready(Err(e.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        self.close();
    }
}

/// Hand a datagram to its flow, or report that a new flow is needed.
pub(crate) enum Delivery {
    Queued,
    Dropped,
    NewFlow(Bytes),
}

pub(crate) fn deliver(flow: &UdpFlow, payload: Bytes) -> Delivery {
    match flow.tx.try_send(payload) {
        Ok(()) => Delivery::Queued,
        Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
        Err(mpsc::error::TrySendError::Closed(payload)) => Delivery::NewFlow(payload),
    }
}

pub(crate) fn same_generation(flow: &UdpFlow, generation: u64) -> bool {
    flow.generation == generation
}
