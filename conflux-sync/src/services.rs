//! External analysis collaborators — dataset/model/report services.
//!
//! These services are request/response black boxes: they take a
//! resource id plus parameters and hand back a result id. Calls happen
//! outside any room — a running job never holds a workspace's
//! serialization lock — and only the returned id is referenced from
//! workspace state, never the result document itself.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use conflux_core::diff::GraphDiff;

use crate::error::SyncError;

/// A request to an external compute service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Dataset/model/report identifier the service understands.
    pub resource_id: Uuid,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// The service's reply: an id to reference from workspace state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub result_id: Uuid,
    pub status: JobStatus,
}

/// An external analysis/ML/visualization collaborator.
pub trait AnalysisService: Send + Sync {
    /// Submit a job. The future completes when the service has accepted
    /// (not finished) the job.
    fn submit(&self, request: JobRequest) -> BoxFuture<'_, Result<JobHandle, SyncError>>;
}

/// In-process stub that accepts every job immediately. Stands in for
/// the real services in tests and local development.
pub struct LocalStubService;

impl AnalysisService for LocalStubService {
    fn submit(&self, request: JobRequest) -> BoxFuture<'_, Result<JobHandle, SyncError>> {
        Box::pin(async move {
            log::debug!("Stub service accepted job for resource {}", request.resource_id);
            Ok(JobHandle {
                result_id: Uuid::new_v4(),
                status: JobStatus::Queued,
            })
        })
    }
}

/// Build the diff that links a completed result onto a pipeline node.
///
/// Only the id lands in the document; whoever renders the node fetches
/// the result from the owning service.
pub fn link_result(node_id: Uuid, handle: &JobHandle) -> GraphDiff {
    let mut diff = GraphDiff::new();
    diff.set_node(
        node_id,
        serde_json::json!({
            "result_id": handle.result_id,
            "result_status": status_str(handle.status),
        }),
    );
    diff
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}
