//! The shared pipeline-graph document.
//!
//! A workspace's shared state is a graph of analysis nodes (datasets,
//! transforms, model runs, chart configs) connected by edges. Node and
//! edge bodies are arbitrary nested JSON so the engine never has to
//! understand tool-specific payloads.
//!
//! Convergence policy: diffs merge field-by-field with
//! last-applied-wins per field/node id. There is no operational
//! transform of overlapping sub-edits; ordering comes from the single
//! room that serializes all mutations.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::diff::GraphDiff;

/// The authoritative document for one workspace.
///
/// `BTreeMap` keeps iteration and serialization order deterministic, so
/// two replicas that applied the same diffs in the same order produce
/// byte-identical encodings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDoc {
    /// Analysis nodes, keyed by node id.
    pub nodes: BTreeMap<Uuid, Value>,
    /// Edges between nodes, keyed by edge id.
    pub edges: BTreeMap<Uuid, Value>,
}

impl PipelineDoc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a diff into the document.
    ///
    /// Upserts replace the stored value; when both the stored and the
    /// incoming value are JSON objects the merge is shallow per top-level
    /// field (an explicit `null` field removes that field). `None`
    /// entries delete the node/edge outright.
    pub fn apply_diff(&mut self, diff: &GraphDiff) {
        for (id, change) in &diff.nodes {
            apply_entry(&mut self.nodes, *id, change);
        }
        for (id, change) in &diff.edges {
            apply_entry(&mut self.edges, *id, change);
        }
        log::trace!(
            "applied diff: {} entries, doc now {} nodes / {} edges",
            diff.len(),
            self.nodes.len(),
            self.edges.len()
        );
    }

    pub fn node(&self, id: &Uuid) -> Option<&Value> {
        self.nodes.get(id)
    }

    pub fn edge(&self, id: &Uuid) -> Option<&Value> {
        self.edges.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    /// Deterministic JSON encoding of the full document.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

fn apply_entry(map: &mut BTreeMap<Uuid, Value>, id: Uuid, change: &Option<Value>) {
    match change {
        Some(incoming) => match (map.get_mut(&id), incoming) {
            (Some(Value::Object(existing)), Value::Object(fields)) => {
                for (key, value) in fields {
                    if value.is_null() {
                        existing.remove(key);
                    } else {
                        existing.insert(key.clone(), value.clone());
                    }
                }
            }
            _ => {
                map.insert(id, incoming.clone());
            }
        },
        None => {
            map.remove(&id);
        }
    }
}
