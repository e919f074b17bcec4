use std::fmt;
use std::time::Duration;

use crate::ordering::FragmentId;

/// Machine-readable error codes for callers deciding how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConnectionLost,
    RateLimited,
    ServerRejected,
    RequestAborted,
    StorageFailure,
    CorruptPayload,
    AmbiguousOrder,
    UnknownFragment,
    FragmentLinkConflict,
    StaleGapToken,
    InvalidResponse,
    KeySpaceExhausted,
    TransactionMisuse,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConnectionLost => "E1001",
            Self::RateLimited => "E1002",
            Self::ServerRejected => "E1003",
            Self::RequestAborted => "E1004",
            Self::StorageFailure => "E2001",
            Self::CorruptPayload => "E2002",
            Self::TransactionMisuse => "E2003",
            Self::AmbiguousOrder => "E3001",
            Self::UnknownFragment => "E3002",
            Self::FragmentLinkConflict => "E3003",
            Self::StaleGapToken => "E3004",
            Self::InvalidResponse => "E3005",
            Self::KeySpaceExhausted => "E3006",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConnectionLost => "Homeserver unreachable",
            Self::RateLimited => "Request rate limited",
            Self::ServerRejected => "Homeserver rejected request",
            Self::RequestAborted => "Request aborted",
            Self::StorageFailure => "Storage operation failed",
            Self::CorruptPayload => "Stored or received payload is not valid JSON",
            Self::TransactionMisuse => "Store accessed outside its transaction scope",
            Self::AmbiguousOrder => "Fragments are on different islands",
            Self::UnknownFragment => "Unknown fragment id",
            Self::FragmentLinkConflict => "Contradictory fragment link",
            Self::StaleGapToken => "Gap token no longer current",
            Self::InvalidResponse => "Malformed homeserver response",
            Self::KeySpaceExhausted => "Event index space exhausted",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConnectionLost => Some("Wait for the reconnector to report Online."),
            Self::RateLimited => Some("Retry after the server-provided delay."),
            Self::StaleGapToken => Some("Re-read the fragment boundary and request the gap again."),
            Self::AmbiguousOrder => {
                Some("Fill the gap between the fragments before comparing across it.")
            }
            Self::FragmentLinkConflict => {
                Some("The local timeline store is inconsistent; clear the room cache.")
            }
            Self::TransactionMisuse => Some("Open the transaction with every store it touches."),
            Self::ServerRejected
            | Self::RequestAborted
            | Self::StorageFailure
            | Self::CorruptPayload
            | Self::UnknownFragment
            | Self::InvalidResponse
            | Self::KeySpaceExhausted => None,
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// `errcode` the homeserver returns when a client exceeds its rate limit.
pub const LIMIT_EXCEEDED: &str = "M_LIMIT_EXCEEDED";

/// Every failure the timeline engine can surface.
///
/// Transient variants (`Connection`, rate-limited `Server`) are recovered by
/// the send scheduler and reconnector. `Aborted` means "no effect occurred".
/// The ordering and link variants signal corrupted or misused state and are
/// never retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("homeserver returned {status} {errcode}: {message}")]
    Server {
        status: u16,
        errcode: String,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("request aborted")]
    Aborted,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store `{store}` is not part of this transaction")]
    StoreNotInScope { store: &'static str },

    #[error("store `{store}` was opened read-only")]
    ReadOnlyTransaction { store: &'static str },

    #[error("fragments {a} and {b} are on different islands, order is undefined")]
    AmbiguousOrder { a: FragmentId, b: FragmentId },

    #[error("unknown fragment {fragment_id} in {room_id}")]
    UnknownFragment {
        room_id: String,
        fragment_id: FragmentId,
    },

    #[error(
        "refusing to change {direction} link of fragment {fragment_id} from {existing} to {attempted} in {room_id}"
    )]
    FragmentLinkConflict {
        room_id: String,
        fragment_id: FragmentId,
        direction: &'static str,
        existing: FragmentId,
        attempted: FragmentId,
    },

    #[error("gap token mismatch: fragment has {expected:?}, response starts at {actual:?}")]
    StaleGapToken {
        expected: Option<String>,
        actual: String,
    },

    #[error("invalid homeserver response: {0}")]
    InvalidResponse(String),

    #[error("event index space exhausted in fragment {0}")]
    KeySpaceExhausted(FragmentId),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Connection(_) => ErrorCode::ConnectionLost,
            Self::Server { .. } if self.is_rate_limited() => ErrorCode::RateLimited,
            Self::Server { .. } => ErrorCode::ServerRejected,
            Self::Aborted => ErrorCode::RequestAborted,
            Self::Storage(_) | Self::Io(_) => ErrorCode::StorageFailure,
            Self::Serde(_) => ErrorCode::CorruptPayload,
            Self::StoreNotInScope { .. } | Self::ReadOnlyTransaction { .. } => {
                ErrorCode::TransactionMisuse
            }
            Self::AmbiguousOrder { .. } => ErrorCode::AmbiguousOrder,
            Self::UnknownFragment { .. } => ErrorCode::UnknownFragment,
            Self::FragmentLinkConflict { .. } => ErrorCode::FragmentLinkConflict,
            Self::StaleGapToken { .. } => ErrorCode::StaleGapToken,
            Self::InvalidResponse(_) => ErrorCode::InvalidResponse,
            Self::KeySpaceExhausted(_) => ErrorCode::KeySpaceExhausted,
            Self::Internal(_) => ErrorCode::InternalUnexpected,
        }
    }

    /// Returns `true` for an `M_LIMIT_EXCEEDED` server response.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Server {
                status, errcode, ..
            } => *status == 429 || errcode == LIMIT_EXCEEDED,
            _ => false,
        }
    }

    /// Returns `true` when the homeserver could not be reached at all.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Returns `true` for intentional cancellation.
    #[must_use]
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Server-mandated delay before retrying a rate-limited request.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Server { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Convenience constructor for a rate-limit response.
    #[must_use]
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::Server {
            status: 429,
            errcode: LIMIT_EXCEEDED.to_string(),
            message: "Too many requests".to_string(),
            retry_after,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
