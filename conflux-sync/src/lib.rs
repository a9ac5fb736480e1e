//! # conflux-sync — collaborative workspace synchronization engine
//!
//! Lets several users concurrently view and edit the same analysis
//! workspace — shared pipeline graph, live cursors, presence — with
//! low-latency propagation, safe reconnection, and deterministic
//! convergence after partial failure.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │    binary frames    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ PipelineDoc │                     │ Room (actor)│
//! │ (replica)   │                     │ (authority) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │  FanoutGroup  │
//!                                    └───────────────┘
//! ```
//!
//! Two delivery guarantees coexist deliberately: the versioned change
//! stream (serialized, acknowledged, idempotent) and the advisory
//! cursor stream (lossy, latest-value-wins). They share a socket but
//! never a log.
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire envelope and typed payloads
//! - [`gateway`] — auth tokens, admission limiting, connection table
//! - [`presence`] — per-workspace member/cursor registry
//! - [`room`] — serialized per-workspace state owner
//! - [`broadcast`] — room fan-out with backpressure
//! - [`server`] — the WebSocket server tying it together
//! - [`client`] — replica, outbound queue, reconnect state machine
//! - [`services`] — external analysis collaborators
//! - [`storage`] — RocksDB snapshot persistence

pub mod broadcast;
pub mod client;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod services;
pub mod storage;

pub use broadcast::{FanoutGroup, FanoutStats};
pub use client::{Backoff, ClientConfig, ClientCore, ConnState, SyncClient, SyncEvent};
pub use error::{ErrorKind, SyncError};
pub use gateway::{AdmissionLimiter, ConnectionTable, GatewayConfig, TokenValidator};
pub use presence::{CursorColor, CursorPos, CursorThrottle, MemberInfo, PresenceTracker, PALETTE};
pub use protocol::{AckPayload, CursorPayload, MessageKind, WireMessage};
pub use registry::WorkspaceRegistry;
pub use room::{ApplyOutcome, RoomConfig, RoomHandle, RoomManager, SyncResponse};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use services::{AnalysisService, JobHandle, JobRequest, JobStatus, LocalStubService};
pub use storage::{SnapshotMeta, StoreConfig, StoreError, WorkspaceStore};
