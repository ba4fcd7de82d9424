//! ohvpn core
//!
//! Turns every flow surfaced by [`ohvpn_netstack`] into a proxied
//! connection: the [`Dispatcher`] picks the upstream, [`ProxyLoop`] copies
//! bytes under the [`PolicyManager`]'s timeouts and records one
//! [`AccessRecord`] per flow. [`Tun`] and [`ControlServer`] are the
//! [`Feature`]s an [`Instance`] brings up for one launch configuration.

pub mod access_log;
pub mod app;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod outbound;
pub mod platform;
pub mod policy;
pub mod proxy;
pub mod server;
pub mod timer;
pub mod tun;

#[cfg(test)]
mod tests {
    mod lifecycle_tests;
    mod property_tests;
}

pub use access_log::{AccessLog, AccessRecord, AccessStatus, TracingAccessLog};
pub use app::{Feature, Instance};
pub use config::{
    InboundConfig, LaunchConfig, LevelPolicyConfig, LogLevel, PolicyConfig, ProxyConfig,
    SniffingConfig, TunConfig,
};
pub use dispatcher::{Destination, DispatchContext, Dispatcher, Link, Network};
pub use error::{Error, Result};
pub use outbound::DirectDispatcher;
pub use platform::{LinuxPlatform, PlatformSupport};
pub use policy::{LevelPolicyManager, Policy, PolicyManager, Timeouts};
pub use proxy::{FlowOutcome, ProxyLoop};
pub use server::ControlServer;
pub use timer::ActivityTimer;
pub use tun::Tun;

use std::sync::Arc;

/// Everything needed to run one launch configuration.
pub struct Ohvpn {
    config: LaunchConfig,
    instance: Instance,
    tun: Arc<Tun>,
}

impl Ohvpn {
    /// Wire the default collaborators: direct dispatch on `platform`,
    /// policies from the proxy configuration file, tracing access log.
    pub fn new(config: LaunchConfig, platform: Arc<dyn PlatformSupport>) -> Result<Self> {
        config.validate()?;

        let proxy_config = ProxyConfig::load(config.proxy_config_path())?;
        let policy = Arc::new(LevelPolicyManager::from_config(&proxy_config.policy));
        let dispatcher = Arc::new(DirectDispatcher::new(platform));

        Ok(Self::with_parts(
            config,
            dispatcher,
            policy,
            Arc::new(TracingAccessLog),
        ))
    }

    pub fn with_parts(
        config: LaunchConfig,
        dispatcher: Arc<dyn Dispatcher>,
        policy: Arc<dyn PolicyManager>,
        access_log: Arc<dyn AccessLog>,
    ) -> Self {
        let proxy = ProxyLoop::new(dispatcher, policy, access_log).with_inbound(
            config.inbound.tag.clone(),
            config.inbound.sniffing.clone(),
        );
        let tun = Arc::new(Tun::new(config.inbound.clone(), Arc::new(proxy)));

        let mut instance = Instance::new();
        instance.add_feature(Arc::new(ControlServer::new(config.control_socket_path())));
        instance.add_feature(tun.clone());

        Self {
            config,
            instance,
            tun,
        }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("Starting ohvpn {}", self.config.id);
        self.instance.start().await
    }

    /// Resolves when the TUN interface goes down.
    pub async fn wait(&self) {
        self.tun.wait().await
    }

    pub async fn close(&mut self) {
        self.instance.close().await;
        tracing::info!("ohvpn {} stopped", self.config.id);
    }
}
