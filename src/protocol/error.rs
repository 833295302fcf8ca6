//! Protocol error types

use std::fmt;

/// Protocol-level errors raised while processing a connection's packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Protocol violation
    ProtocolViolation(&'static str),
    /// Packet type not valid in the current connection state
    UnexpectedPacket(&'static str),
    /// Keep alive timeout
    KeepAliveTimeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::UnexpectedPacket(msg) => write!(f, "unexpected packet: {}", msg),
            Self::KeepAliveTimeout => write!(f, "keep alive timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
