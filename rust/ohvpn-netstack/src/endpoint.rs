//! Link endpoint bridging a [`PacketPort`] and the embedded stack.
//!
//! Two loops run for the lifetime of the interface. The inbound loop reads
//! packets from the port and hands them to the attached
//! [`NetworkDispatcher`]; the outbound loop drains the queue the stack
//! writes into and pushes every packet back to the port.

use crate::error::{NetStackError, Result};
use crate::packet::NetworkProtocol;
use crate::port::PacketPort;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Outbound queue depth
pub const DEFAULT_QUEUE_SIZE: usize = 1 << 10;

/// Receiver of inbound packets, implemented by the stack.
pub trait NetworkDispatcher: Send + Sync {
    fn deliver_network_packet(&self, protocol: NetworkProtocol, packet: Bytes);
}

/// An outbound packet as an ordered list of segments.
#[derive(Debug, Clone, Default)]
pub struct PacketBuffer {
    segments: Vec<Bytes>,
}

impl PacketBuffer {
    pub fn from_segments(segments: Vec<Bytes>) -> Self {
        Self { segments }
    }

    pub fn as_slices(&self) -> Vec<&[u8]> {
        self.segments.iter().map(|s| s.as_ref()).collect()
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Bytes> for PacketBuffer {
    fn from(packet: Bytes) -> Self {
        Self {
            segments: vec![packet],
        }
    }
}

impl From<Vec<u8>> for PacketBuffer {
    fn from(packet: Vec<u8>) -> Self {
        Bytes::from(packet).into()
    }
}

/// Link counters
#[derive(Debug, Default)]
pub struct LinkStats {
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    dropped_in: AtomicU64,
    dropped_out: AtomicU64,
    write_errors: AtomicU64,
}

impl LinkStats {
    pub fn packets_in(&self) -> u64 {
        self.packets_in.load(Ordering::Relaxed)
    }

    pub fn packets_out(&self) -> u64 {
        self.packets_out.load(Ordering::Relaxed)
    }

    /// Inbound packets discarded for size, version, or while detached
    pub fn dropped_in(&self) -> u64 {
        self.dropped_in.load(Ordering::Relaxed)
    }

    /// Outbound packets discarded because the queue was full or closed
    pub fn dropped_out(&self) -> u64 {
        self.dropped_out.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }
}

pub struct LinkEndpoint {
    port: Arc<dyn PacketPort>,
    mtu: usize,
    dispatcher: RwLock<Option<Arc<dyn NetworkDispatcher>>>,
    outbound_tx: mpsc::Sender<PacketBuffer>,
    outbound_rx: Mutex<Option<mpsc::Receiver<PacketBuffer>>>,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    stats: LinkStats,
}

impl LinkEndpoint {
    pub fn new(port: Arc<dyn PacketPort>, mtu: usize) -> Arc<Self> {
        Self::with_queue_size(port, mtu, DEFAULT_QUEUE_SIZE)
    }

    pub fn with_queue_size(port: Arc<dyn PacketPort>, mtu: usize, queue_size: usize) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_size.max(1));
        Arc::new(Self {
            port,
            mtu,
            dispatcher: RwLock::new(None),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            stats: LinkStats::default(),
        })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Attach the stack and start both loops. Only the first call starts
    /// the loops; later calls just swap the dispatcher.
    pub fn attach(self: &Arc<Self>, dispatcher: Arc<dyn NetworkDispatcher>) {
        *self.dispatcher.write() = Some(dispatcher);

        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let Some(outbound_rx) = self.outbound_rx.lock().take() else {
            return;
        };
        let outbound_stop = self.shutdown.child_token();

        self.tasks
            .spawn(self.clone().inbound_loop(outbound_stop.clone()));
        self.tasks
            .spawn(self.clone().outbound_loop(outbound_rx, outbound_stop));
    }

    /// Stop delivering inbound packets. The loops keep running.
    pub fn detach(&self) {
        *self.dispatcher.write() = None;
    }

    pub fn is_attached(&self) -> bool {
        self.dispatcher.read().is_some()
    }

    /// Queue a packet produced by the stack.
    pub fn write_packet(&self, packet: PacketBuffer) -> Result<()> {
        if self.shutdown.is_cancelled() {
            self.stats.dropped_out.fetch_add(1, Ordering::Relaxed);
            return Err(NetStackError::StackClosed);
        }
        self.outbound_tx.try_send(packet).map_err(|e| {
            self.stats.dropped_out.fetch_add(1, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(_) => NetStackError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => NetStackError::StackClosed,
            }
        })
    }

    /// Tear the link down: both loops exit and the dispatcher is dropped.
    pub fn close(&self) {
        self.detach();
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until both loops have exited. Returns immediately if they were
    /// never started.
    pub async fn wait(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn inbound_loop(self: Arc<Self>, outbound_stop: CancellationToken) {
        // Whatever ends this loop also ends the outbound loop.
        let _stop_outbound = outbound_stop.drop_guard();
        info!("TUN inbound loop started");

        // One spare byte so that oversized packets are seen as such instead of
        // being silently truncated to the MTU.
        let mut buf = vec![0u8; self.mtu + 1];

        loop {
            let n = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.port.read_packet(&mut buf) => match result {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("TUN read error, interface down: {}", e);
                        break;
                    }
                },
            };
            self.handle_inbound(&buf[..n]);
        }

        info!("TUN inbound loop stopped");
    }

    pub(crate) fn handle_inbound(&self, packet: &[u8]) {
        if packet.is_empty() || packet.len() > self.mtu {
            trace!("dropping inbound packet of {} bytes", packet.len());
            self.stats.dropped_in.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let Some(dispatcher) = self.dispatcher.read().clone() else {
            self.stats.dropped_in.fetch_add(1, Ordering::Relaxed);
            return;
        };

        match NetworkProtocol::from_packet(packet) {
            Some(protocol) => {
                self.stats.packets_in.fetch_add(1, Ordering::Relaxed);
                dispatcher.deliver_network_packet(protocol, Bytes::copy_from_slice(packet));
            }
            None => {
                trace!("dropping inbound packet with version nibble {}", packet[0] >> 4);
                self.stats.dropped_in.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn outbound_loop(
        self: Arc<Self>,
        mut outbound_rx: mpsc::Receiver<PacketBuffer>,
        stop: CancellationToken,
    ) {
        info!("TUN outbound loop started");

        loop {
            let packet = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                packet = outbound_rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };

            let result = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                result = self.write_to_port(&packet) => result,
            };
            if let Err(e) = result {
                debug!("TUN write of {} bytes failed: {}", packet.len(), e);
                self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        info!("TUN outbound loop stopped");
    }

    async fn write_to_port(&self, packet: &PacketBuffer) -> Result<()> {
        let slices = packet.as_slices();
        match self.port.write_packets(&slices).await {
            Ok(_) => {
                self.stats.packets_out.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                trace!("vectored write error: {}", e);
                Err(NetStackError::InvalidEndpointState)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Port fed from a channel; records every write.
    pub(crate) struct ChannelPort {
        inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<Vec<u8>>>>,
        pub(crate) written: Mutex<Vec<Vec<u8>>>,
        pub(crate) write_notify: Notify,
        fail_writes: AtomicBool,
        block_writes: AtomicBool,
    }

    impl ChannelPort {
        pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedSender<io::Result<Vec<u8>>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let port = Arc::new(Self {
                inbound: tokio::sync::Mutex::new(rx),
                written: Mutex::new(Vec::new()),
                write_notify: Notify::new(),
                fail_writes: AtomicBool::new(false),
                block_writes: AtomicBool::new(false),
            });
            (port, tx)
        }

        pub(crate) fn written(&self) -> Vec<Vec<u8>> {
            self.written.lock().clone()
        }
    }

    #[async_trait]
    impl PacketPort for ChannelPort {
        async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
            match self.inbound.lock().await.recv().await {
                Some(Ok(packet)) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => std::future::pending().await,
            }
        }

        async fn write_packets(&self, segments: &[&[u8]]) -> io::Result<usize> {
            if self.block_writes.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "fd closed"));
            }
            let packet = segments.concat();
            let n = packet.len();
            self.written.lock().push(packet);
            self.write_notify.notify_waiters();
            Ok(n)
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingDispatcher {
        pub(crate) delivered: Mutex<Vec<(NetworkProtocol, Bytes)>>,
        notify: Notify,
    }

    impl NetworkDispatcher for RecordingDispatcher {
        fn deliver_network_packet(&self, protocol: NetworkProtocol, packet: Bytes) {
            self.delivered.lock().push((protocol, packet));
            self.notify.notify_waiters();
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_inbound_classification_and_drops() {
        let (port, tx) = ChannelPort::new();
        let endpoint = LinkEndpoint::new(port, 100);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        endpoint.attach(dispatcher.clone());

        tx.send(Ok(vec![])).unwrap();
        tx.send(Ok(vec![0x45; 101])).unwrap();
        tx.send(Ok(vec![0x50, 1, 2])).unwrap();
        tx.send(Ok(vec![0x45, 0, 0, 20])).unwrap();
        tx.send(Ok(vec![0x60; 100])).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.delivered.lock().len() < 2 {
                settle().await;
            }
        })
        .await
        .unwrap();

        let delivered = dispatcher.delivered.lock().clone();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].0, NetworkProtocol::Ipv4);
        assert_eq!(&delivered[0].1[..], &[0x45, 0, 0, 20]);
        assert_eq!(delivered[1].0, NetworkProtocol::Ipv6);
        assert_eq!(delivered[1].1.len(), 100);
        assert_eq!(endpoint.stats().dropped_in(), 3);
        endpoint.close();
        endpoint.wait().await;
    }

    #[tokio::test]
    async fn test_detached_endpoint_drops_inbound() {
        let (port, tx) = ChannelPort::new();
        let endpoint = LinkEndpoint::new(port, 1500);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        endpoint.attach(dispatcher.clone());
        endpoint.detach();
        assert!(!endpoint.is_attached());

        tx.send(Ok(vec![0x45, 0, 0, 20])).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while endpoint.stats().dropped_in() == 0 {
                settle().await;
            }
        })
        .await
        .unwrap();
        assert!(dispatcher.delivered.lock().is_empty());
        endpoint.close();
        endpoint.wait().await;
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let (port, tx) = ChannelPort::new();
        let endpoint = LinkEndpoint::new(port, 1500);
        let first = Arc::new(RecordingDispatcher::default());
        let second = Arc::new(RecordingDispatcher::default());
        endpoint.attach(first.clone());
        endpoint.attach(second.clone());

        tx.send(Ok(vec![0x45, 0, 0, 20])).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while second.delivered.lock().is_empty() {
                settle().await;
            }
        })
        .await
        .unwrap();
        assert!(first.delivered.lock().is_empty());
        endpoint.close();
        endpoint.wait().await;
    }

    #[tokio::test]
    async fn test_outbound_writes_segments_in_order() {
        let (port, _tx) = ChannelPort::new();
        let endpoint = LinkEndpoint::new(port.clone(), 1500);
        endpoint.attach(Arc::new(RecordingDispatcher::default()));

        let packet = PacketBuffer::from_segments(vec![
            Bytes::from_static(&[0x45, 0]),
            Bytes::new(),
            Bytes::from_static(&[1, 2, 3]),
        ]);
        endpoint.write_packet(packet).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while port.written().is_empty() {
                settle().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(port.written(), vec![vec![0x45, 0, 1, 2, 3]]);
        endpoint.close();
        endpoint.wait().await;
    }

    #[tokio::test]
    async fn test_write_failure_does_not_stop_outbound_loop() {
        let (port, _tx) = ChannelPort::new();
        let endpoint = LinkEndpoint::new(port.clone(), 1500);
        endpoint.attach(Arc::new(RecordingDispatcher::default()));

        port.fail_writes.store(true, Ordering::SeqCst);
        endpoint.write_packet(vec![0x45, 1].into()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while endpoint.stats().write_errors() == 0 {
                settle().await;
            }
        })
        .await
        .unwrap();

        port.fail_writes.store(false, Ordering::SeqCst);
        endpoint.write_packet(vec![0x45, 2].into()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while port.written().is_empty() {
                settle().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(port.written(), vec![vec![0x45, 2]]);
        endpoint.close();
        endpoint.wait().await;
    }

    #[tokio::test]
    async fn test_read_error_stops_both_loops() {
        let (port, tx) = ChannelPort::new();
        let endpoint = LinkEndpoint::new(port, 1500);
        endpoint.attach(Arc::new(RecordingDispatcher::default()));

        tx.send(Err(io::Error::new(io::ErrorKind::Other, "EBADF")))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), endpoint.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_with_queued_packets() {
        let (port, _tx) = ChannelPort::new();
        port.block_writes.store(true, Ordering::SeqCst);
        let endpoint = LinkEndpoint::with_queue_size(port, 1500, 8);
        endpoint.attach(Arc::new(RecordingDispatcher::default()));

        for i in 0..8u8 {
            let _ = endpoint.write_packet(vec![0x45, i].into());
        }
        settle().await;

        endpoint.close();
        tokio::time::timeout(Duration::from_secs(5), endpoint.wait())
            .await
            .unwrap();
        assert!(matches!(
            endpoint.write_packet(vec![0x45].into()),
            Err(NetStackError::StackClosed)
        ));
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let (port, _tx) = ChannelPort::new();
        let endpoint = LinkEndpoint::with_queue_size(port, 1500, 1);

        endpoint.write_packet(vec![0x45].into()).unwrap();
        assert!(matches!(
            endpoint.write_packet(vec![0x45].into()),
            Err(NetStackError::QueueFull)
        ));
        assert_eq!(endpoint.stats().dropped_out(), 1);
    }

    #[tokio::test]
    async fn test_wait_without_attach_returns() {
        let (port, _tx) = ChannelPort::new();
        let endpoint = LinkEndpoint::new(port, 1500);
        tokio::time::timeout(Duration::from_secs(1), endpoint.wait())
            .await
            .unwrap();
    }
}
