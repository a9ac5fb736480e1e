//! Persistent storage for workspace snapshots.
//!
//! ```text
//! ┌──────────────┐  room goes idle   ┌────────────────┐
//! │ WorkspaceRoom│ ────────────────► │ WorkspaceStore │
//! │ (in-memory)  │                   │ (RocksDB)      │
//! └──────┬───────┘                   └──────┬─────────┘
//!        │ first attach                     │ column families
//!        ▼                                  ▼
//! ┌──────────────┐     ┌─────────────────────────────────────┐
//! │ PipelineDoc  │     │ CF "snapshots" — LZ4 snapshot bytes  │
//! │ (restored)   │     │ CF "meta"      — version + checksum  │
//! └──────────────┘     └─────────────────────────────────────┘
//! ```
//!
//! The store holds the latest versioned snapshot per workspace; the
//! retained diff history lives in the room and dies with it. A snapshot
//! whose checksum fails verification is reported as corrupted and the
//! workspace stays unavailable until manually recovered.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod rocks;

pub use rocks::{SnapshotMeta, StoreConfig, StoreError, WorkspaceStore};
