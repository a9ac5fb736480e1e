//! Binary wire protocol for workspace synchronization.
//!
//! Envelope format (bincode-encoded):
//! ```text
//! ┌──────────┬──────────────┬──────────┬──────────┐
//! │ kind     │ workspace_id │ sender   │ payload  │
//! │ 1 byte   │ 16 bytes     │ 16 bytes │ variable │
//! └──────────┴──────────────┴──────────┴──────────┘
//! ```
//!
//! Fixed-shape payloads (auth, cursor, ack-less control frames) are
//! bincode inside the envelope. Document-bearing payloads (change
//! records, diffs, snapshots) are serde_json because they carry
//! arbitrary nested JSON values, which a non-self-describing format
//! cannot decode.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conflux_core::diff::{ChangeRecord, Snapshot, VersionedDiff};

use crate::error::{ErrorKind, SyncError};
use crate::presence::{CursorPos, MemberInfo};

/// Message kinds for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// First client frame: token handshake
    Authenticate = 1,
    /// Server reply to a successful handshake
    Welcome = 2,
    /// Attach to a workspace room
    JoinWorkspace = 3,
    /// Detach from a workspace room
    LeaveWorkspace = 4,
    /// A change record carrying a pipeline diff
    PipelineUpdate = 5,
    /// Versioned diff fanned out to other members
    StateUpdate = 6,
    /// Acknowledgement to the update's origin
    Ack = 7,
    /// Client asks for diffs since a known version
    RequestSync = 8,
    /// Missed diffs inside the retained window
    SyncDiffs = 9,
    /// Complete snapshot plus member roster
    FullState = 10,
    /// Advisory cursor position (both directions)
    CursorMove = 11,
    /// A member came online
    UserJoined = 12,
    /// A member went offline
    UserLeft = 13,
    /// Rejection or failure notice to one client
    Error = 14,
    /// Heartbeat
    Ping = 15,
    /// Heartbeat reply
    Pong = 16,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub kind: MessageKind,
    /// Workspace the message concerns; nil for pre-join traffic.
    pub workspace_id: Uuid,
    /// Originating user; nil when the server itself is the source.
    pub sender: Uuid,
    pub payload: Vec<u8>,
}

// ─── Payload types ──────────────────────────────────────────────────

/// Credentials presented on the first frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
    /// Display name shown next to this user's cursor.
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub connection_id: Uuid,
    pub user_id: Uuid,
}

/// Acknowledgement for one accepted (or deduplicated) change.
///
/// `missed` carries the diffs between the sender's `base_version` and
/// the version assigned to its change — empty when the sender was
/// current, `None` when the gap fell outside the retained-history
/// window (the client must then request a full resync).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub idempotency_key: Uuid,
    pub version: u64,
    pub duplicate: bool,
    pub missed: Option<Vec<VersionedDiff>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestSyncPayload {
    pub since_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDiffsPayload {
    pub diffs: Vec<VersionedDiff>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullStatePayload {
    pub snapshot: Snapshot,
    pub members: Vec<MemberInfo>,
}

/// Advisory cursor position. Unversioned, latest-value-wins.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPayload {
    pub user_id: Uuid,
    pub position: CursorPos,
    /// Sender-monotonic counter so receivers can drop reordered frames.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub detail: String,
    /// Set when the error rejects a specific pending change.
    pub idempotency_key: Option<Uuid>,
}

// ─── Constructors ───────────────────────────────────────────────────

impl WireMessage {
    pub fn authenticate(token: impl Into<String>, display_name: impl Into<String>) -> Self {
        let payload = AuthPayload {
            token: token.into(),
            display_name: display_name.into(),
        };
        Self {
            kind: MessageKind::Authenticate,
            workspace_id: Uuid::nil(),
            sender: Uuid::nil(),
            payload: encode_bincode(&payload),
        }
    }

    pub fn welcome(connection_id: Uuid, user_id: Uuid) -> Self {
        Self {
            kind: MessageKind::Welcome,
            workspace_id: Uuid::nil(),
            sender: Uuid::nil(),
            payload: encode_bincode(&WelcomePayload { connection_id, user_id }),
        }
    }

    pub fn join_workspace(workspace_id: Uuid, user_id: Uuid) -> Self {
        Self {
            kind: MessageKind::JoinWorkspace,
            workspace_id,
            sender: user_id,
            payload: Vec::new(),
        }
    }

    pub fn leave_workspace(workspace_id: Uuid, user_id: Uuid) -> Self {
        Self {
            kind: MessageKind::LeaveWorkspace,
            workspace_id,
            sender: user_id,
            payload: Vec::new(),
        }
    }

    pub fn pipeline_update(record: &ChangeRecord) -> Result<Self, SyncError> {
        Ok(Self {
            kind: MessageKind::PipelineUpdate,
            workspace_id: record.workspace_id,
            sender: record.origin_user_id,
            payload: encode_json(record)?,
        })
    }

    pub fn state_update(workspace_id: Uuid, diff: &VersionedDiff) -> Result<Self, SyncError> {
        Ok(Self {
            kind: MessageKind::StateUpdate,
            workspace_id,
            sender: diff.origin_user_id,
            payload: encode_json(diff)?,
        })
    }

    pub fn ack(workspace_id: Uuid, ack: &AckPayload) -> Result<Self, SyncError> {
        Ok(Self {
            kind: MessageKind::Ack,
            workspace_id,
            sender: Uuid::nil(),
            payload: encode_json(ack)?,
        })
    }

    pub fn request_sync(workspace_id: Uuid, user_id: Uuid, since_version: u64) -> Self {
        Self {
            kind: MessageKind::RequestSync,
            workspace_id,
            sender: user_id,
            payload: encode_bincode(&RequestSyncPayload { since_version }),
        }
    }

    pub fn sync_diffs(workspace_id: Uuid, diffs: Vec<VersionedDiff>) -> Result<Self, SyncError> {
        Ok(Self {
            kind: MessageKind::SyncDiffs,
            workspace_id,
            sender: Uuid::nil(),
            payload: encode_json(&SyncDiffsPayload { diffs })?,
        })
    }

    pub fn full_state(snapshot: Snapshot, members: Vec<MemberInfo>) -> Result<Self, SyncError> {
        Ok(Self {
            kind: MessageKind::FullState,
            workspace_id: snapshot.workspace_id,
            sender: Uuid::nil(),
            payload: encode_json(&FullStatePayload { snapshot, members })?,
        })
    }

    pub fn cursor_move(workspace_id: Uuid, cursor: CursorPayload) -> Self {
        Self {
            kind: MessageKind::CursorMove,
            workspace_id,
            sender: cursor.user_id,
            payload: encode_bincode(&cursor),
        }
    }

    pub fn user_joined(workspace_id: Uuid, member: &MemberInfo) -> Result<Self, SyncError> {
        Ok(Self {
            kind: MessageKind::UserJoined,
            workspace_id,
            sender: member.user_id,
            payload: encode_json(member)?,
        })
    }

    pub fn user_left(workspace_id: Uuid, user_id: Uuid) -> Self {
        Self {
            kind: MessageKind::UserLeft,
            workspace_id,
            sender: user_id,
            payload: Vec::new(),
        }
    }

    pub fn error(kind: ErrorKind, detail: impl Into<String>, idempotency_key: Option<Uuid>) -> Self {
        let payload = ErrorPayload {
            kind,
            detail: detail.into(),
            idempotency_key,
        };
        Self {
            kind: MessageKind::Error,
            workspace_id: Uuid::nil(),
            sender: Uuid::nil(),
            payload: encode_bincode(&payload),
        }
    }

    pub fn ping(user_id: Uuid) -> Self {
        Self {
            kind: MessageKind::Ping,
            workspace_id: Uuid::nil(),
            sender: user_id,
            payload: Vec::new(),
        }
    }

    pub fn pong(user_id: Uuid) -> Self {
        Self {
            kind: MessageKind::Pong,
            workspace_id: Uuid::nil(),
            sender: user_id,
            payload: Vec::new(),
        }
    }

    // ─── Encode / decode ────────────────────────────────────────────

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Protocol(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Protocol(e.to_string()))?;
        Ok(msg)
    }

    // ─── Typed payload accessors ────────────────────────────────────

    pub fn auth(&self) -> Result<AuthPayload, SyncError> {
        self.expect_kind(MessageKind::Authenticate)?;
        decode_bincode(&self.payload)
    }

    pub fn welcome_payload(&self) -> Result<WelcomePayload, SyncError> {
        self.expect_kind(MessageKind::Welcome)?;
        decode_bincode(&self.payload)
    }

    pub fn change_record(&self) -> Result<ChangeRecord, SyncError> {
        self.expect_kind(MessageKind::PipelineUpdate)?;
        decode_json(&self.payload)
    }

    pub fn versioned_diff(&self) -> Result<VersionedDiff, SyncError> {
        self.expect_kind(MessageKind::StateUpdate)?;
        decode_json(&self.payload)
    }

    pub fn ack_payload(&self) -> Result<AckPayload, SyncError> {
        self.expect_kind(MessageKind::Ack)?;
        decode_json(&self.payload)
    }

    pub fn request_sync_payload(&self) -> Result<RequestSyncPayload, SyncError> {
        self.expect_kind(MessageKind::RequestSync)?;
        decode_bincode(&self.payload)
    }

    pub fn sync_diffs_payload(&self) -> Result<SyncDiffsPayload, SyncError> {
        self.expect_kind(MessageKind::SyncDiffs)?;
        decode_json(&self.payload)
    }

    pub fn full_state_payload(&self) -> Result<FullStatePayload, SyncError> {
        self.expect_kind(MessageKind::FullState)?;
        decode_json(&self.payload)
    }

    pub fn cursor_payload(&self) -> Result<CursorPayload, SyncError> {
        self.expect_kind(MessageKind::CursorMove)?;
        decode_bincode(&self.payload)
    }

    pub fn member_payload(&self) -> Result<MemberInfo, SyncError> {
        self.expect_kind(MessageKind::UserJoined)?;
        decode_json(&self.payload)
    }

    pub fn error_payload(&self) -> Result<ErrorPayload, SyncError> {
        self.expect_kind(MessageKind::Error)?;
        decode_bincode(&self.payload)
    }

    fn expect_kind(&self, kind: MessageKind) -> Result<(), SyncError> {
        if self.kind != kind {
            return Err(SyncError::Protocol(format!(
                "expected {kind:?} payload, message is {:?}",
                self.kind
            )));
        }
        Ok(())
    }
}

fn encode_bincode<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap_or_default()
}

fn decode_bincode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, SyncError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| SyncError::Protocol(e.to_string()))?;
    Ok(value)
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, SyncError> {
    serde_json::to_vec(value).map_err(|e| SyncError::Protocol(e.to_string()))
}

fn decode_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, SyncError> {
    serde_json::from_slice(bytes).map_err(|e| SyncError::Protocol(e.to_string()))
}
