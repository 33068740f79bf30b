use std::net::SocketAddr;

/// Failure to interpret a relay payload as an [`Envelope`](crate::envelope::Envelope).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown message type {0}")]
    UnknownKind(u8),
    #[error("envelope is not valid UTF-8")]
    NotUtf8,
}

/// Failures of the internal relay between ingestion and dispatch.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to bind relay ingress on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to connect relay egress to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("relay payload of {size} bytes exceeds the {limit} byte datagram limit")]
    Oversized { size: usize, limit: usize },
    #[error("relay closed")]
    Closed,
    #[error("relay io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind",
            Self::Connect { .. } => "connect",
            Self::Oversized { .. } => "oversized",
            Self::Closed => "closed",
            Self::Io(_) => "io",
        }
    }

    /// The relay can carry no further messages. `Oversized` and `Io` only
    /// lose the message at hand.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Bind { .. } | Self::Connect { .. } | Self::Closed)
    }
}
