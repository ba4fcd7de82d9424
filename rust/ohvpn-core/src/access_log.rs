use crate::dispatcher::Destination;
use std::fmt;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Accepted,
    Rejected,
}

impl fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => f.write_str("accepted"),
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

/// One entry per flow, written when dispatch settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub source: SocketAddr,
    pub destination: Destination,
    pub status: AccessStatus,
    pub reason: Option<String>,
}

impl AccessRecord {
    pub fn accepted(source: SocketAddr, destination: Destination) -> Self {
        Self {
            source,
            destination,
            status: AccessStatus::Accepted,
            reason: None,
        }
    }

    pub fn rejected<R: Into<String>>(source: SocketAddr, destination: Destination, reason: R) -> Self {
        Self {
            source,
            destination,
            status: AccessStatus::Rejected,
            reason: Some(reason.into()),
        }
    }
}

impl fmt::Display for AccessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "from {} {} {}", self.source, self.status, self.destination)?;
        if let Some(reason) = &self.reason {
            write!(f, " {}", reason)?;
        }
        Ok(())
    }
}

pub trait AccessLog: Send + Sync + 'static {
    fn record(&self, record: AccessRecord);
}

/// Writes access records as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAccessLog;

impl AccessLog for TracingAccessLog {
    fn record(&self, record: AccessRecord) {
        tracing::info!(target: "ohvpn_core::access", "{}", record);
    }
}
