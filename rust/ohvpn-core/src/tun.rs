//! TUN inbound
//!
//! Owns the packet link, the embedded stack and the flow tasks for one
//! TUN descriptor.

use crate::app::Feature;
use crate::config::InboundConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use ohvpn_netstack::stack::settings::{DEFAULT_ICMP_BURST, DEFAULT_ICMP_LIMIT, DEFAULT_TTL};
use ohvpn_netstack::{
    apply_all, BufferSizeRange, FdPacketPort, FlowHandler, FlowInterceptor, LinkEndpoint, NicId,
    PacketPort, Stack, StackOption, TcpRecovery,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

/// The only NIC of the stack
pub const NIC_ID: NicId = 1;

struct Running {
    stack: Stack,
    link: Arc<LinkEndpoint>,
    shutdown: CancellationToken,
    flows: TaskTracker,
}

pub struct Tun {
    inbound: InboundConfig,
    handler: Arc<dyn FlowHandler>,
    running: Mutex<Option<Running>>,
}

impl Tun {
    pub fn new(inbound: InboundConfig, handler: Arc<dyn FlowHandler>) -> Self {
        Self {
            inbound,
            handler,
            running: Mutex::new(None),
        }
    }

    /// Stack options in the order they must be applied.
    pub fn default_options(link: Arc<LinkEndpoint>, interceptor: FlowInterceptor) -> Vec<StackOption> {
        vec![
            StackOption::DefaultTtl(DEFAULT_TTL),
            StackOption::Forwarding(true),
            StackOption::IcmpBurst(DEFAULT_ICMP_BURST),
            StackOption::IcmpLimit(DEFAULT_ICMP_LIMIT),
            StackOption::TcpSendBufferSizeRange(BufferSizeRange::send_defaults()),
            StackOption::TcpReceiveBufferSizeRange(BufferSizeRange::receive_defaults()),
            StackOption::TcpCongestionControl("cubic".to_string()),
            StackOption::TcpDelay(false),
            StackOption::TcpModerateReceiveBuffer(false),
            StackOption::TcpSackEnabled(true),
            StackOption::TcpRecovery(TcpRecovery::RackLossDetection),
            StackOption::CreatingNic(NIC_ID, link),
            StackOption::PromiscuousMode(NIC_ID, true),
            StackOption::Spoofing(NIC_ID, true),
            StackOption::RouteTable(NIC_ID),
            StackOption::TransportHandler(interceptor),
        ]
    }

    /// Bring the interface up on the configured descriptor.
    pub async fn start_tun(&self) -> Result<()> {
        let port = FdPacketPort::from_raw_fd(self.inbound.fd)?;
        self.start_with_port(Arc::new(port))
    }

    pub fn start_with_port(&self, port: Arc<dyn PacketPort>) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(Error::internal("TUN is already started"));
        }

        let mtu = self.inbound.config.mtu as usize;
        let link = LinkEndpoint::new(port, mtu);
        let stack = Stack::new();
        let shutdown = CancellationToken::new();
        let flows = TaskTracker::new();
        let interceptor = FlowInterceptor::new(self.handler.clone(), shutdown.clone(), flows.clone());

        if let Err(e) = apply_all(&stack, Self::default_options(link.clone(), interceptor)) {
            // nothing is rolled back beyond releasing what was built here
            stack.close();
            link.close();
            return Err(e.into());
        }

        info!("TUN {} started on fd {} (mtu {})", self.inbound.tag, self.inbound.fd, mtu);
        *running = Some(Running {
            stack,
            link,
            shutdown,
            flows,
        });
        Ok(())
    }

    pub fn stack(&self) -> Option<Stack> {
        self.running.lock().as_ref().map(|r| r.stack.clone())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Resolves once the packet loops exit, either through [`close`] or
    /// because the descriptor failed. Returns at once if not started.
    ///
    /// [`close`]: Feature::close
    pub async fn wait(&self) {
        let link = self.running.lock().as_ref().map(|r| r.link.clone());
        if let Some(link) = link {
            link.wait().await;
        }
    }

    async fn shutdown(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        running.shutdown.cancel();
        running.stack.close();
        running.stack.wait().await;

        running.flows.close();
        running.flows.wait().await;
        info!("TUN {} stopped", self.inbound.tag);
    }
}

#[async_trait]
impl Feature for Tun {
    fn name(&self) -> &'static str {
        "tun"
    }

    async fn start(&self) -> Result<()> {
        self.start_tun().await
    }

    async fn close(&self) -> Result<()> {
        self.shutdown().await;
        Ok(())
    }
}
