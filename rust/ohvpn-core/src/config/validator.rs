use crate::config::*;
use crate::error::{Error, Result};

/// Smallest MTU every IPv4 host must accept
pub const MIN_MTU: u32 = 576;
pub const MAX_MTU: u32 = 65535;

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &LaunchConfig) -> Result<()> {
        if config.id.trim().is_empty() {
            return Err(Error::config("id cannot be empty"));
        }
        if config.id.contains(['/', '\\']) {
            return Err(Error::config(format!(
                "id must not contain path separators: {}",
                config.id
            )));
        }

        Self::validate_inbound(&config.inbound)?;

        for (name, dir) in [
            ("filesDir", &config.files_dir),
            ("cacheDir", &config.cache_dir),
            ("tempDir", &config.temp_dir),
        ] {
            if dir.as_os_str().is_empty() {
                return Err(Error::config(format!("{} cannot be empty", name)));
            }
        }

        Ok(())
    }

    fn validate_inbound(inbound: &InboundConfig) -> Result<()> {
        if inbound.tag.is_empty() {
            return Err(Error::config("inbound tag cannot be empty"));
        }

        if inbound.fd < 0 {
            return Err(Error::config(format!(
                "Invalid TUN file descriptor: {}",
                inbound.fd
            )));
        }

        let mtu = inbound.config.mtu;
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(Error::config(format!(
                "Invalid mtu {}: must be between {} and {}",
                mtu, MIN_MTU, MAX_MTU
            )));
        }

        Ok(())
    }
}
