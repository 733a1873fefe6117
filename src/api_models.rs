//! Request and response bodies for the HTTP control plane.

use serde::{Deserialize, Serialize};

use crate::models::{QueueEntry, ReleaseState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRequest {
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub state: ReleaseState,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshotResponse {
    pub is_running: bool,
    pub queue_length: usize,
    pub queue: Vec<QueueEntry>,
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub days: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    pub days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub removed: usize,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub is_release_running: bool,
    pub queue_length: usize,
}
