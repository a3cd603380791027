//! Published status for the timelapse daemon
//!
//! A [`StatusSnapshot`] is rebuilt from the task table by the coordinator and
//! served as JSON by the status endpoint.

use crate::task::{SourceStatus, Task, TaskSummary};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Point-in-time view of every task and the latest task per source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    /// Most recently started task for each source
    pub sources: BTreeMap<String, SourceStatus>,
    pub tasks: Vec<TaskSummary>,
    /// Sources with a capture still registered
    pub running_tasks: usize,
    /// Tasks recording, processing or uploading
    pub active_tasks: usize,
    pub max_concurrent_tasks: usize,
}

/// Shared status state for concurrent access across daemon components
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

/// Create a new shared status with default values
pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusSnapshot::default()))
}

/// Build a snapshot from tasks ordered by start time.
pub fn build_snapshot(
    tasks: &[Task],
    running_tasks: usize,
    max_concurrent_tasks: usize,
) -> StatusSnapshot {
    let mut sources = BTreeMap::new();
    for task in tasks {
        // Later starts overwrite earlier ones
        sources.insert(task.source_id.clone(), task.to_source_status());
    }

    StatusSnapshot {
        timestamp_unix_ms: timestamp_ms(),
        sources,
        tasks: tasks.iter().map(Task::to_summary).collect(),
        running_tasks,
        active_tasks: tasks.iter().filter(|t| t.status.is_active()).count(),
        max_concurrent_tasks,
    }
}

/// Current Unix time in milliseconds
pub fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
