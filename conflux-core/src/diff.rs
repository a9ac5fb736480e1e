//! Change records, diffs, and snapshots — the units of synchronization.
//!
//! A [`GraphDiff`] is a partial description of changed nodes/edges. A
//! [`ChangeRecord`] wraps a diff with its origin and a client-generated
//! idempotency key so the room can detect at-least-once redelivery. A
//! [`Snapshot`] is the complete versioned document used for resync.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::graph::PipelineDoc;

/// A partial diff: node/edge ids mapped to their new value, or `None`
/// for deletion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDiff {
    pub nodes: BTreeMap<Uuid, Option<Value>>,
    pub edges: BTreeMap<Uuid, Option<Value>>,
}

impl GraphDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a node value.
    pub fn set_node(&mut self, id: Uuid, value: Value) -> &mut Self {
        self.nodes.insert(id, Some(value));
        self
    }

    /// Delete a node.
    pub fn remove_node(&mut self, id: Uuid) -> &mut Self {
        self.nodes.insert(id, None);
        self
    }

    pub fn set_edge(&mut self, id: Uuid, value: Value) -> &mut Self {
        self.edges.insert(id, Some(value));
        self
    }

    pub fn remove_edge(&mut self, id: Uuid) -> &mut Self {
        self.edges.insert(id, None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    /// Number of node + edge entries in the diff.
    pub fn len(&self) -> usize {
        self.nodes.len() + self.edges.len()
    }

    /// True when the two diffs touch no common node or edge id.
    pub fn is_disjoint(&self, other: &GraphDiff) -> bool {
        self.nodes.keys().all(|id| !other.nodes.contains_key(id))
            && self.edges.keys().all(|id| !other.edges.contains_key(id))
    }
}

/// A mutation submitted by a client.
///
/// `base_version` is the version the sender believed was current when it
/// produced the diff; a stale base does not block application, it only
/// tells the room which missed diffs to return in the ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub workspace_id: Uuid,
    pub origin_user_id: Uuid,
    /// Client-generated key; the room accepts each key exactly once.
    pub idempotency_key: Uuid,
    pub base_version: u64,
    pub diff: GraphDiff,
}

impl ChangeRecord {
    pub fn new(workspace_id: Uuid, origin_user_id: Uuid, base_version: u64, diff: GraphDiff) -> Self {
        Self {
            workspace_id,
            origin_user_id,
            idempotency_key: Uuid::new_v4(),
            base_version,
            diff,
        }
    }
}

/// A diff stamped with the version the room assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedDiff {
    pub version: u64,
    pub origin_user_id: Uuid,
    pub diff: GraphDiff,
}

/// A complete, versioned copy of workspace state.
///
/// Produced atomically by the room; never reflects a half-applied
/// change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub workspace_id: Uuid,
    pub version: u64,
    pub doc: PipelineDoc,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_builder() {
        let node = Uuid::new_v4();
        let edge = Uuid::new_v4();

        let mut diff = GraphDiff::new();
        diff.set_node(node, json!({"kind": "dataset"}))
            .remove_edge(edge);

        assert_eq!(diff.len(), 2);
        assert!(!diff.is_empty());
        assert_eq!(diff.nodes[&node], Some(json!({"kind": "dataset"})));
        assert_eq!(diff.edges[&edge], None);
    }

    #[test]
    fn test_diff_disjointness() {
        let shared = Uuid::new_v4();

        let mut a = GraphDiff::new();
        a.set_node(shared, json!(1));
        let mut b = GraphDiff::new();
        b.set_node(Uuid::new_v4(), json!(2));
        assert!(a.is_disjoint(&b));

        let mut c = GraphDiff::new();
        c.remove_node(shared);
        assert!(!a.is_disjoint(&c));
    }

    #[test]
    fn test_change_record_fresh_keys() {
        let ws = Uuid::new_v4();
        let user = Uuid::new_v4();
        let r1 = ChangeRecord::new(ws, user, 0, GraphDiff::new());
        let r2 = ChangeRecord::new(ws, user, 0, GraphDiff::new());
        assert_ne!(r1.idempotency_key, r2.idempotency_key);
    }

    #[test]
    fn test_change_record_json_roundtrip() {
        let mut diff = GraphDiff::new();
        diff.set_node(Uuid::new_v4(), json!({"params": {"lr": 0.01}}));
        let record = ChangeRecord::new(Uuid::new_v4(), Uuid::new_v4(), 7, diff);

        let bytes = serde_json::to_vec(&record).unwrap();
        let decoded: ChangeRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let mut doc = PipelineDoc::new();
        let mut diff = GraphDiff::new();
        diff.set_node(Uuid::new_v4(), json!({"kind": "report"}));
        doc.apply_diff(&diff);

        let snapshot = Snapshot {
            workspace_id: Uuid::new_v4(),
            version: 12,
            doc,
        };
        let bytes = serde_json::to_vec(&snapshot).unwrap();
        let decoded: Snapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(snapshot, decoded);
    }
}
