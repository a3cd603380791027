//! Task state for capture sessions.
//!
//! A [`Task`] is one bounded capture-to-video session for a source. Tasks live
//! in a [`TaskTable`] shared between the owning capture task and the coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Lifecycle status of a task.
///
/// `Idle` and `Error` are terminal; the others mean the task is active and
/// count against the concurrency ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Idle,
    Recording,
    Processing,
    Uploading,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Recording => "recording",
            TaskStatus::Processing => "processing",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Error => "error",
        }
    }

    /// Whether the task still holds a concurrency slot.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Recording | TaskStatus::Processing | TaskStatus::Uploading
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One capture session.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub source_id: String,
    pub status: TaskStatus,
    pub interval: Duration,
    pub duration: Duration,
    pub frame_dir: PathBuf,
    pub output_file: PathBuf,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub frames_captured: u64,
    /// Percentage of the recording window elapsed, 0-100.
    pub progress: u8,
    pub time_remaining_secs: u64,
    pub error_message: Option<String>,
    /// Locator of the published video, set after a successful encode.
    pub media_reference: Option<String>,
    pub upload_confirmed: bool,
}

impl Task {
    /// Create a task in the `recording` state starting now.
    pub fn new(
        id: String,
        source_id: String,
        interval: Duration,
        duration: Duration,
        frame_dir: PathBuf,
        output_file: PathBuf,
    ) -> Self {
        let start_time = Utc::now();
        let end_time = window_end(start_time, duration).unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            id,
            source_id,
            status: TaskStatus::Recording,
            interval,
            duration,
            frame_dir,
            output_file,
            start_time,
            end_time,
            frames_captured: 0,
            progress: 0,
            time_remaining_secs: duration.as_secs(),
            error_message: None,
            media_reference: None,
            upload_confirmed: false,
        }
    }

    /// Record capture progress after an acquisition attempt.
    ///
    /// The frame counter never decreases.
    pub fn record_progress(&mut self, frames_captured: u64, elapsed: Duration) {
        self.frames_captured = self.frames_captured.max(frames_captured);
        let (progress, remaining) = compute_progress(elapsed, self.duration);
        self.progress = progress;
        self.time_remaining_secs = remaining;
    }

    /// Mark the task failed with a human-readable message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = TaskStatus::Error;
        self.error_message = Some(message.into());
    }

    /// Mark the task finished.
    pub fn complete(&mut self) {
        self.status = TaskStatus::Idle;
        self.progress = 100;
        self.time_remaining_secs = 0;
    }

    pub fn to_summary(&self) -> TaskSummary {
        TaskSummary {
            task_id: self.id.clone(),
            source_id: self.source_id.clone(),
            status: self.status,
            start_time: self.start_time,
            frames_captured: self.frames_captured,
            progress: self.progress,
            output_file: self.output_file.to_string_lossy().to_string(),
            media_reference: self.media_reference.clone(),
        }
    }

    pub fn to_source_status(&self) -> SourceStatus {
        SourceStatus {
            task_id: self.id.clone(),
            status: self.status,
            progress: self.progress,
            frames_captured: self.frames_captured,
            time_remaining: self.time_remaining_secs,
            output_file: self.output_file.to_string_lossy().to_string(),
            media_reference: self.media_reference.clone(),
            error_message: self.error_message.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

/// End of a recording window of `duration` starting at `start`.
///
/// `None` when the end cannot be represented as a timestamp.
pub fn window_end(start: DateTime<Utc>, duration: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| start.checked_add_signed(d))
}

/// Progress percentage and seconds remaining for an elapsed time.
///
/// Progress is clamped to `[0, 100]` and time remaining never goes negative.
pub fn compute_progress(elapsed: Duration, total: Duration) -> (u8, u64) {
    if total.is_zero() {
        return (100, 0);
    }
    let ratio = elapsed.as_secs_f64() / total.as_secs_f64();
    let progress = (ratio * 100.0).clamp(0.0, 100.0) as u8;
    let remaining = total.saturating_sub(elapsed).as_secs();
    (progress, remaining)
}

/// Task entry in the task list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSummary {
    pub task_id: String,
    pub source_id: String,
    pub status: TaskStatus,
    pub start_time: DateTime<Utc>,
    pub frames_captured: u64,
    pub progress: u8,
    pub output_file: String,
    pub media_reference: Option<String>,
}

/// Per-source record in the published status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceStatus {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub frames_captured: u64,
    /// Seconds left in the recording window.
    pub time_remaining: u64,
    pub output_file: String,
    pub media_reference: Option<String>,
    pub error_message: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Shared task-id to task map.
#[derive(Debug, Clone, Default)]
pub struct TaskTable {
    inner: Arc<RwLock<HashMap<String, Task>>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, task: Task) {
        self.inner.write().await.insert(task.id.clone(), task);
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.inner.read().await.get(id).cloned()
    }

    /// Apply `f` to the task with `id`. Returns false if there is no such task.
    pub async fn update<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Task),
    {
        match self.inner.write().await.get_mut(id) {
            Some(task) => {
                f(task);
                true
            }
            None => false,
        }
    }

    pub async fn set_status(&self, id: &str, status: TaskStatus) -> bool {
        self.update(id, |task| task.status = status).await
    }

    pub async fn remove(&self, id: &str) -> Option<Task> {
        self.inner.write().await.remove(id)
    }

    /// All tasks ordered by start time.
    pub async fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.inner.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Number of active tasks, not counting `except_task`.
    pub async fn active_count(&self, except_task: Option<&str>) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|t| t.status.is_active() && Some(t.id.as_str()) != except_task)
            .count()
    }

    /// Fail every task still marked active. Returns how many were changed.
    pub async fn fail_active(&self, message: &str) -> usize {
        let mut inner = self.inner.write().await;
        let mut failed = 0;
        for task in inner.values_mut().filter(|t| t.status.is_active()) {
            task.fail(message);
            failed += 1;
        }
        failed
    }
}
