//! Stack-wide protocol settings and the ICMP rate limiter.

use crate::error::{NetStackError, Result};
use crate::packet::NetworkProtocol;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Smallest TCP buffer the stack accepts
pub const MIN_BUFFER_SIZE: usize = 4 << 10;
/// Largest TCP buffer the stack accepts
pub const MAX_BUFFER_SIZE: usize = 4 << 20;
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 256 << 10;
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 256 << 10;

pub const DEFAULT_TTL: u8 = 64;
pub const DEFAULT_ICMP_BURST: usize = 50;
pub const DEFAULT_ICMP_LIMIT: f64 = 1000.0;

/// Delayed ACK timeout used while TCP delay is enabled
pub const DEFAULT_ACK_DELAY: Duration = Duration::from_millis(10);

/// `{min, default, max}` bounds of a TCP buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizeRange {
    pub min: usize,
    pub default: usize,
    pub max: usize,
}

impl BufferSizeRange {
    pub fn new(min: usize, default: usize, max: usize) -> Self {
        Self { min, default, max }
    }

    pub fn send_defaults() -> Self {
        Self::new(MIN_BUFFER_SIZE, DEFAULT_SEND_BUFFER_SIZE, MAX_BUFFER_SIZE)
    }

    pub fn receive_defaults() -> Self {
        Self::new(MIN_BUFFER_SIZE, DEFAULT_RECEIVE_BUFFER_SIZE, MAX_BUFFER_SIZE)
    }

    pub(crate) fn validate(&self, option: &'static str) -> Result<()> {
        if self.min < MIN_BUFFER_SIZE || self.max > MAX_BUFFER_SIZE {
            return Err(NetStackError::invalid_option(
                option,
                format!(
                    "range {}..{} outside {}..{}",
                    self.min, self.max, MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
                ),
            ));
        }
        if !(self.min <= self.default && self.default <= self.max) {
            return Err(NetStackError::invalid_option(
                option,
                format!(
                    "expected min <= default <= max, got {} / {} / {}",
                    self.min, self.default, self.max
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionControl {
    Cubic,
    Reno,
    None,
}

impl FromStr for CongestionControl {
    type Err = NetStackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cubic" => Ok(Self::Cubic),
            "reno" => Ok(Self::Reno),
            "none" => Ok(Self::None),
            other => Err(NetStackError::invalid_option(
                "TCP congestion control",
                format!("unknown algorithm {:?}", other),
            )),
        }
    }
}

impl fmt::Display for CongestionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cubic => write!(f, "cubic"),
            Self::Reno => write!(f, "reno"),
            Self::None => write!(f, "none"),
        }
    }
}

impl From<CongestionControl> for smoltcp::socket::tcp::CongestionControl {
    fn from(cc: CongestionControl) -> Self {
        match cc {
            CongestionControl::Cubic => Self::Cubic,
            CongestionControl::Reno => Self::Reno,
            CongestionControl::None => Self::None,
        }
    }
}

/// Loss recovery algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpRecovery {
    Disabled,
    RackLossDetection,
}

/// TCP profile applied to every endpoint the forwarder creates.
#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub send_buffer: BufferSizeRange,
    pub receive_buffer: BufferSizeRange,
    pub congestion_control: CongestionControl,
    /// Nagle and delayed ACKs
    pub delay: bool,
    pub moderate_receive_buffer: bool,
    pub sack: bool,
    pub recovery: TcpRecovery,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            send_buffer: BufferSizeRange::send_defaults(),
            receive_buffer: BufferSizeRange::receive_defaults(),
            congestion_control: CongestionControl::Reno,
            delay: true,
            moderate_receive_buffer: true,
            sack: false,
            recovery: TcpRecovery::Disabled,
        }
    }
}

impl TcpSettings {
    pub fn send_buffer_size(&self) -> usize {
        self.send_buffer.default
    }

    pub fn receive_buffer_size(&self) -> usize {
        if self.moderate_receive_buffer {
            self.receive_buffer.max
        } else {
            self.receive_buffer.default
        }
    }

    pub fn ack_delay(&self) -> Option<Duration> {
        self.delay.then_some(DEFAULT_ACK_DELAY)
    }
}

#[derive(Debug, Clone)]
pub struct StackSettings {
    pub ipv4_ttl: u8,
    pub ipv6_hop_limit: u8,
    pub ipv4_forwarding: bool,
    pub ipv6_forwarding: bool,
    pub tcp: TcpSettings,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            ipv4_ttl: DEFAULT_TTL,
            ipv6_hop_limit: DEFAULT_TTL,
            ipv4_forwarding: false,
            ipv6_forwarding: false,
            tcp: TcpSettings::default(),
        }
    }
}

impl StackSettings {
    pub fn ttl(&self, protocol: NetworkProtocol) -> u8 {
        match protocol {
            NetworkProtocol::Ipv4 => self.ipv4_ttl,
            NetworkProtocol::Ipv6 => self.ipv6_hop_limit,
        }
    }

    pub fn forwarding(&self, protocol: NetworkProtocol) -> bool {
        match protocol {
            NetworkProtocol::Ipv4 => self.ipv4_forwarding,
            NetworkProtocol::Ipv6 => self.ipv6_forwarding,
        }
    }
}

/// Token bucket gating ICMP packets emitted by the stack.
#[derive(Debug)]
pub struct IcmpRateLimiter {
    burst: usize,
    /// tokens per second
    limit: f64,
    tokens: f64,
    last: Instant,
}

impl IcmpRateLimiter {
    pub fn new(burst: usize, limit: f64) -> Self {
        Self {
            burst,
            limit,
            tokens: burst as f64,
            last: Instant::now(),
        }
    }

    pub fn burst(&self) -> usize {
        self.burst
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    pub fn set_burst(&mut self, burst: usize) {
        self.burst = burst;
        self.tokens = self.tokens.min(burst as f64);
    }

    pub fn set_limit(&mut self, limit: f64) {
        self.limit = limit;
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.limit).min(self.burst as f64);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for IcmpRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_ICMP_BURST, DEFAULT_ICMP_LIMIT)
    }
}
