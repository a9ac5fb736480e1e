//! Error taxonomy for the synchronization engine.
//!
//! Authorization and validation failures are returned synchronously to
//! the offending client and never touch durable state. Transient network
//! failures drive the client's reconnect path; queued edits survive
//! them. A corrupted snapshot is fatal for its workspace until manually
//! recovered.

use uuid::Uuid;

/// Engine-level errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Bad or missing token; the connection is refused before any join.
    Unauthenticated,
    /// Connection admission rejected by the per-address limiter.
    RateLimited,
    /// The member's role lacks permission for the attempted mutation.
    Forbidden,
    /// Workspace or member absent.
    NotFound(Uuid),
    /// Duplicate idempotency key. Benign — the previously assigned
    /// version is returned and nothing is re-applied.
    Conflict { assigned_version: u64 },
    /// Connectivity failure; recoverable via reconnect + resync.
    Transient(String),
    /// A stored snapshot failed its integrity check. The workspace is
    /// unavailable until manually recovered.
    CorruptedSnapshot(Uuid),
    /// Wire encode/decode failure.
    Protocol(String),
    /// Persistence layer failure.
    Storage(String),
    /// The room's inbox is gone (room shut down mid-request).
    RoomClosed,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Unauthenticated => write!(f, "Unauthenticated"),
            SyncError::RateLimited => write!(f, "Rate limited"),
            SyncError::Forbidden => write!(f, "Forbidden"),
            SyncError::NotFound(id) => write!(f, "Not found: {id}"),
            SyncError::Conflict { assigned_version } => {
                write!(f, "Duplicate change, already applied at version {assigned_version}")
            }
            SyncError::Transient(e) => write!(f, "Transient network failure: {e}"),
            SyncError::CorruptedSnapshot(id) => {
                write!(f, "Corrupted snapshot for workspace {id}")
            }
            SyncError::Protocol(e) => write!(f, "Protocol error: {e}"),
            SyncError::Storage(e) => write!(f, "Storage error: {e}"),
            SyncError::RoomClosed => write!(f, "Workspace room closed"),
        }
    }
}

impl std::error::Error for SyncError {}

/// Wire-level error code carried in `Error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum ErrorKind {
    Unauthenticated = 1,
    RateLimited = 2,
    Forbidden = 3,
    NotFound = 4,
    Protocol = 5,
    Unavailable = 6,
}

impl SyncError {
    /// Map to the wire code sent back to the offending client.
    pub fn wire_kind(&self) -> ErrorKind {
        match self {
            SyncError::Unauthenticated => ErrorKind::Unauthenticated,
            SyncError::RateLimited => ErrorKind::RateLimited,
            SyncError::Forbidden => ErrorKind::Forbidden,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Protocol(_) => ErrorKind::Protocol,
            SyncError::Conflict { .. }
            | SyncError::Transient(_)
            | SyncError::CorruptedSnapshot(_)
            | SyncError::Storage(_)
            | SyncError::RoomClosed => ErrorKind::Unavailable,
        }
    }
}
