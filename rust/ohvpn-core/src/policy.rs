use crate::config::{LevelPolicyConfig, PolicyConfig};
use std::collections::HashMap;
use std::time::Duration;

/// Per-flow timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub handshake: Duration,
    /// No traffic in either direction
    pub connection_idle: Duration,
    /// After the response direction finishes
    pub uplink_only: Duration,
    /// After the request direction finishes
    pub downlink_only: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(4),
            connection_idle: Duration::from_secs(300),
            uplink_only: Duration::from_secs(1),
            downlink_only: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Policy {
    pub timeouts: Timeouts,
}

pub trait PolicyManager: Send + Sync + 'static {
    fn for_level(&self, level: u32) -> Policy;
}

/// Policies keyed by user level; unknown levels get the defaults.
#[derive(Debug, Clone, Default)]
pub struct LevelPolicyManager {
    levels: HashMap<u32, Policy>,
}

impl LevelPolicyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        let mut levels = HashMap::new();
        for (key, level) in &config.levels {
            match key.parse::<u32>() {
                Ok(number) => {
                    levels.insert(number, Self::policy_from(level));
                }
                Err(_) => tracing::warn!("Ignoring policy for invalid level '{}'", key),
            }
        }
        Self { levels }
    }

    pub fn set_level(&mut self, level: u32, policy: Policy) {
        self.levels.insert(level, policy);
    }

    fn policy_from(config: &LevelPolicyConfig) -> Policy {
        let defaults = Timeouts::default();
        let secs = |value: Option<u32>, default: Duration| {
            value.map(|s| Duration::from_secs(s as u64)).unwrap_or(default)
        };
        Policy {
            timeouts: Timeouts {
                handshake: secs(config.handshake, defaults.handshake),
                connection_idle: secs(config.conn_idle, defaults.connection_idle),
                uplink_only: secs(config.uplink_only, defaults.uplink_only),
                downlink_only: secs(config.downlink_only, defaults.downlink_only),
            },
        }
    }
}

impl PolicyManager for LevelPolicyManager {
    fn for_level(&self, level: u32) -> Policy {
        self.levels.get(&level).copied().unwrap_or_default()
    }
}
