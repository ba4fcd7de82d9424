pub mod validator;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_MTU: u32 = 1500;
pub const CONTROL_SOCKET_NAME: &str = "vpn.sock";

/// Document the process is launched with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfig {
    pub id: String,
    pub inbound: InboundConfig,
    pub files_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl LaunchConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::config_with_source("Invalid launch configuration", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::config_with_source(format!("Failed to read {}", path.display()), e)
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        validator::ConfigValidator::validate(self)
    }

    /// `{tempDir}/{id}.json`
    pub fn proxy_config_path(&self) -> PathBuf {
        self.temp_dir.join(format!("{}.json", self.id))
    }

    /// `{filesDir}/vpn.sock`
    pub fn control_socket_path(&self) -> PathBuf {
        self.files_dir.join(CONTROL_SOCKET_NAME)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundConfig {
    #[serde(default = "default_inbound_tag")]
    pub tag: String,
    /// TUN descriptor; owned by the launcher
    pub fd: i32,
    #[serde(default)]
    pub config: TunConfig,
    #[serde(default)]
    pub sniffing: SniffingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunConfig {
    #[serde(default = "default_mtu")]
    pub mtu: u32,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self { mtu: DEFAULT_MTU }
    }
}

/// Protocol sniffing requested for flows of this inbound. Carried to the
/// dispatcher untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SniffingConfig {
    // launchers in the wild send the misspelt key
    #[serde(default, alias = "enbale", alias = "enable")]
    pub enabled: bool,
    #[serde(default)]
    pub override_destination_for_protocol: Vec<String>,
    #[serde(default)]
    pub metadata_only: bool,
    #[serde(default)]
    pub route_only: bool,
}

fn default_inbound_tag() -> String {
    "tun".to_string()
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

/// The part of the proxy configuration file read here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl ProxyConfig {
    /// The host writes this file before launch, so a missing one is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::config_with_source(format!("Failed to read {}", path.display()), e)
        })?;
        serde_json::from_str(&json).map_err(|e| {
            Error::config_with_source(format!("Invalid proxy configuration {}", path.display()), e)
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Keyed by the level number as a string
    #[serde(default)]
    pub levels: HashMap<String, LevelPolicyConfig>,
}

/// Timeouts of one policy level, in seconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelPolicyConfig {
    pub handshake: Option<u32>,
    pub conn_idle: Option<u32>,
    pub uplink_only: Option<u32>,
    pub downlink_only: Option<u32>,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
    Debug,
    Trace,
    Silent,
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            "silent" | "none" => Ok(Self::Silent),
            other => Err(Error::config(format!("Unknown log level: {}", other))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Debug => "debug",
            Self::Trace => "trace",
            Self::Silent => "silent",
        };
        f.write_str(name)
    }
}
