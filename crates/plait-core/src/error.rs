use std::fmt;

/// Machine-readable error codes shared by every plait error type.
///
/// Each concern-specific error enum (`EventError`, `StoreError`,
/// `QueryError`, `NetError`, `ReplicaError`, `NodeError`) maps its variants
/// onto this table through a `code()` method, so callers at the service edge
/// can branch on a stable identifier instead of matching nested enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    UnknownTopic,
    UnsupportedTopics,
    CursorNotFound,
    EventDigestFailed,
    EventDecodeFailed,
    InvalidCid,
    CorruptIndex,
    StoreBackendFailure,
    StoreSchemaMismatch,
    StoreWorkerFailed,
    TransportClosed,
    TransportCancelled,
    NoReachablePeer,
    TransportFailure,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::UnknownTopic => "E2001",
            Self::UnsupportedTopics => "E2002",
            Self::CursorNotFound => "E2003",
            Self::EventDigestFailed => "E3001",
            Self::EventDecodeFailed => "E3002",
            Self::InvalidCid => "E3003",
            Self::CorruptIndex => "E4001",
            Self::StoreBackendFailure => "E4002",
            Self::StoreSchemaMismatch => "E4003",
            Self::StoreWorkerFailed => "E4004",
            Self::TransportClosed => "E5001",
            Self::TransportCancelled => "E5002",
            Self::NoReachablePeer => "E5003",
            Self::TransportFailure => "E5004",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::UnknownTopic => "Unknown topic",
            Self::UnsupportedTopics => "Query must name exactly one topic",
            Self::CursorNotFound => "Cursor not found in queried range",
            Self::EventDigestFailed => "Event digest failed",
            Self::EventDecodeFailed => "Event decode failed",
            Self::InvalidCid => "Invalid content identifier",
            Self::CorruptIndex => "Corrupt time index",
            Self::StoreBackendFailure => "Storage backend failure",
            Self::StoreSchemaMismatch => "Storage schema mismatch",
            Self::StoreWorkerFailed => "Storage worker failed",
            Self::TransportClosed => "Transport closed",
            Self::TransportCancelled => "Transport operation cancelled",
            Self::NoReachablePeer => "No reachable peer",
            Self::TransportFailure => "Transport failure",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in plait.toml and retry."),
            Self::UnknownTopic => Some("Publish to or subscribe to the topic before reading it."),
            Self::UnsupportedTopics => Some("Split multi-topic reads into one query per topic."),
            Self::CursorNotFound => {
                Some("Restart pagination without a cursor, or reuse the original range.")
            }
            Self::EventDigestFailed | Self::EventDecodeFailed | Self::InvalidCid => None,
            Self::CorruptIndex => Some("Rebuild the store from peers; the time index is damaged."),
            Self::StoreBackendFailure => Some("Check disk space and write permissions."),
            Self::StoreSchemaMismatch => {
                Some("Upgrade plait; the database was written by a newer version.")
            }
            Self::StoreWorkerFailed => Some("Retry once. If persistent, report a bug with logs."),
            Self::TransportClosed | Self::TransportCancelled => None,
            Self::NoReachablePeer => Some("Check connectivity; links are retried on repair."),
            Self::TransportFailure => Some("Retry after the transport reconnects."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
