use thiserror::Error;

use crate::stack::NicId;

/// Network stack specific errors
#[derive(Error, Debug)]
pub enum NetStackError {
    #[error("set {option}: {reason}")]
    InvalidOption { option: &'static str, reason: String },

    #[error("NIC {0} does not exist")]
    UnknownNic(NicId),

    #[error("NIC {0} already exists")]
    DuplicateNic(NicId),

    #[error("no route to {0}")]
    NoRoute(std::net::IpAddr),

    #[error("endpoint is in invalid state")]
    InvalidEndpointState,

    #[error("address spoofing is disabled on NIC {0}")]
    SpoofingDisabled(NicId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("message too long: {len} bytes exceeds {max}")]
    MessageTooLong { len: usize, max: usize },

    #[error("outbound queue full")]
    QueueFull,

    #[error("forwarder request already completed")]
    RequestCompleted,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Connection reset")]
    ConnectionReset,

    #[error("Stack closed")]
    StackClosed,
}

impl NetStackError {
    pub(crate) fn invalid_option<S: Into<String>>(option: &'static str, reason: S) -> Self {
        Self::InvalidOption {
            option,
            reason: reason.into(),
        }
    }
}

impl From<smoltcp::wire::Error> for NetStackError {
    fn from(e: smoltcp::wire::Error) -> Self {
        NetStackError::InvalidPacket(e.to_string())
    }
}

impl From<NetStackError> for std::io::Error {
    fn from(e: NetStackError) -> Self {
        use std::io::ErrorKind;

        let kind = match &e {
            NetStackError::Io(inner) => return std::io::Error::new(inner.kind(), e.to_string()),
            NetStackError::ConnectionRefused => ErrorKind::ConnectionRefused,
            NetStackError::ConnectionReset => ErrorKind::ConnectionReset,
            NetStackError::StackClosed | NetStackError::InvalidEndpointState => {
                ErrorKind::NotConnected
            }
            NetStackError::MessageTooLong { .. } | NetStackError::InvalidPacket(_) => {
                ErrorKind::InvalidInput
            }
            NetStackError::QueueFull => ErrorKind::WouldBlock,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

pub type Result<T> = std::result::Result<T, NetStackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_error_message() {
        let err = NetStackError::invalid_option("ipv4 default TTL", "ttl must be non-zero");
        assert_eq!(err.to_string(), "set ipv4 default TTL: ttl must be non-zero");
    }

    #[test]
    fn test_io_error_kind_mapping() {
        let err: std::io::Error = NetStackError::ConnectionReset.into();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

        let err: std::io::Error = NetStackError::MessageTooLong { len: 9000, max: 1472 }.into();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
