//! Per-flow proxy loop
//!
//! Each intercepted flow is dispatched to an upstream [`Link`] and bytes are
//! copied in both directions until both finish, one fails, or the flow goes
//! idle. The upstream writer is half-closed only once the request direction
//! has been copied in full.

use crate::access_log::{AccessLog, AccessRecord};
use crate::config::SniffingConfig;
use crate::dispatcher::{Destination, DispatchContext, Dispatcher, Link, Network};
use crate::error::Error;
use crate::policy::PolicyManager;
use crate::timer::ActivityTimer;
use async_trait::async_trait;
use ohvpn_netstack::{Flow, FlowHandler};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const TCP_BUFFER_SIZE: usize = 32 * 1024;
/// Large enough that a datagram is never split
pub const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// Policy level used for every intercepted flow
const FLOW_LEVEL: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    /// Both directions reached EOF
    Completed,
    /// No upstream was opened
    DispatchFailed,
    /// A copy direction failed or the flow was cancelled
    Interrupted,
}

pub struct ProxyLoop {
    dispatcher: Arc<dyn Dispatcher>,
    policy: Arc<dyn PolicyManager>,
    access_log: Arc<dyn AccessLog>,
    inbound_tag: String,
    sniffing: SniffingConfig,
}

impl ProxyLoop {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        policy: Arc<dyn PolicyManager>,
        access_log: Arc<dyn AccessLog>,
    ) -> Self {
        Self {
            dispatcher,
            policy,
            access_log,
            inbound_tag: "tun".to_string(),
            sniffing: SniffingConfig::default(),
        }
    }

    pub fn with_inbound<S: Into<String>>(mut self, tag: S, sniffing: SniffingConfig) -> Self {
        self.inbound_tag = tag.into();
        self.sniffing = sniffing;
        self
    }

    pub async fn handle(&self, flow: Flow) -> FlowOutcome {
        let Flow {
            protocol,
            source,
            destination,
            conn,
            cancel,
        } = flow;
        let destination = Destination::new(protocol.into(), destination);
        let policy = self.policy.for_level(FLOW_LEVEL);

        let ctx = DispatchContext {
            inbound_tag: self.inbound_tag.clone(),
            source,
            sniffing: self.sniffing.clone(),
            cancel: cancel.clone(),
        };

        debug!("processing {} from {}", destination, source);

        let dispatched = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::dispatch_to("flow cancelled", &destination)),
            result = self.dispatcher.dispatch(&ctx, destination) => result,
        };

        let link = match dispatched {
            Ok(link) => {
                self.access_log
                    .record(AccessRecord::accepted(source, destination));
                link
            }
            Err(e) => {
                self.access_log
                    .record(AccessRecord::rejected(source, destination, e.to_string()));
                warn!("failed to dispatch {} from {}: {}", destination, source, e);
                drop(conn);
                return FlowOutcome::DispatchFailed;
            }
        };

        let buffer_size = match destination.network {
            Network::Tcp => TCP_BUFFER_SIZE,
            Network::Udp => UDP_BUFFER_SIZE,
        };
        let timer =
            ActivityTimer::cancel_after_inactivity(cancel.clone(), policy.timeouts.connection_idle);

        let Link {
            reader: mut upstream_reader,
            writer: mut upstream_writer,
        } = link;
        let (mut local_reader, mut local_writer) = tokio::io::split(conn);

        let request = async {
            let copied = copy_with_activity(
                &mut local_reader,
                &mut upstream_writer,
                buffer_size,
                &timer,
                &cancel,
            )
            .await;
            timer.set_timeout(policy.timeouts.downlink_only);
            copied?;
            until_cancelled(&cancel, upstream_writer.shutdown()).await
        };

        let response = async {
            let copied = copy_with_activity(
                &mut upstream_reader,
                &mut local_writer,
                buffer_size,
                &timer,
                &cancel,
            )
            .await;
            timer.set_timeout(policy.timeouts.uplink_only);
            copied?;
            until_cancelled(&cancel, local_writer.flush()).await
        };

        let result = tokio::try_join!(request, response);

        // Stops the activity checker; the interface token is untouched
        cancel.cancel();
        drop(upstream_reader);
        drop(upstream_writer);

        match result {
            Ok(_) => {
                debug!("{} from {} finished", destination, source);
                FlowOutcome::Completed
            }
            Err(e) => {
                debug!("connection ends {} from {}: {}", destination, source, e);
                FlowOutcome::Interrupted
            }
        }
    }
}

#[async_trait]
impl FlowHandler for ProxyLoop {
    async fn handle_flow(&self, flow: Flow) {
        self.handle(flow).await;
    }
}

fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "flow cancelled")
}

async fn until_cancelled<F>(cancel: &CancellationToken, op: F) -> io::Result<()>
where
    F: std::future::Future<Output = io::Result<()>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(cancelled_error()),
        result = op => result,
    }
}

/// Copy until EOF, marking the timer on every chunk. Cancellation
/// interrupts a pending read or write.
async fn copy_with_activity<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    timer: &ActivityTimer,
    cancel: &CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled_error()),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            return Ok(total);
        }
        timer.update();

        until_cancelled(cancel, writer.write_all(&buf[..n])).await?;
        timer.update();
        total += n as u64;
    }
}
