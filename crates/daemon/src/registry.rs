//! Task registry: the public start/stop/list/delete surface.
//!
//! Owns the task table and one running capture per source. Enforces the
//! concurrency ceiling, cancels a source's prior capture before registering a
//! new one, and runs finalization (encode, then optional upload) when a capture
//! ends.

use crate::capture::{run_capture, CaptureJob, CaptureOutcome, RetryPolicy};
use crate::concurrency::ResourcePlan;
use crate::config::Config;
use crate::encode::Encoder;
use crate::frame_store::create_directory;
use crate::source::SourceSet;
use crate::task::{window_end, Task, TaskStatus, TaskSummary, TaskTable};
use crate::upload::Uploader;
use chrono::{DateTime, Local, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Rejections returned by the public task operations
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Maximum number of concurrent tasks reached ({active}/{limit})")]
    ConcurrencyLimit { active: usize, limit: usize },

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Task {given} is not the active task for {source_id} (active: {active:?})")]
    TaskMismatch {
        source_id: String,
        given: String,
        active: Option<String>,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Capture duration {0:?} is out of range")]
    InvalidDuration(Duration),

    #[error("Failed to prepare task directories: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for starting a capture. Omitted values come from configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartRequest {
    pub source_id: String,
    pub interval: Option<Duration>,
    pub duration: Option<Duration>,
    pub output_root: Option<PathBuf>,
}

impl StartRequest {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Default::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = Some(root.into());
        self
    }
}

/// Base name shared by a task's frame directory and video.
///
/// `camera.front_door` at 2024-05-01 06:30:00 becomes
/// `timelapse_front_door_20240501_063000`.
pub fn task_name(source_id: &str, at: DateTime<Local>) -> String {
    let camera = source_id
        .split_once('.')
        .map(|(_, name)| name)
        .unwrap_or(source_id)
        .replace(&['/', '\\'][..], "_");
    format!("timelapse_{}_{}", camera, at.format("%Y%m%d_%H%M%S"))
}

/// Frame directory and output file under `root`, avoiding existing names.
fn unique_paths(root: &Path, base: &str) -> (PathBuf, PathBuf) {
    let mut suffix = 1u32;
    loop {
        let name = if suffix == 1 {
            base.to_string()
        } else {
            format!("{}_{}", base, suffix)
        };
        let frame_dir = root.join(&name);
        let output = root.join(format!("{}.mp4", name));
        if !frame_dir.exists() && !output.exists() {
            return (frame_dir, output);
        }
        suffix += 1;
    }
}

/// Encode-then-upload sequence run when a capture ends
#[derive(Debug, Clone)]
pub struct Finalizer {
    tasks: TaskTable,
    encoder: Encoder,
    uploader: Uploader,
    upload_enabled: bool,
    cleanup_frames: bool,
}

impl Finalizer {
    pub fn new(
        tasks: TaskTable,
        encoder: Encoder,
        uploader: Uploader,
        upload_enabled: bool,
        cleanup_frames: bool,
    ) -> Self {
        Self {
            tasks,
            encoder,
            uploader,
            upload_enabled,
            cleanup_frames,
        }
    }

    /// Finalize `task_id` and return its terminal status.
    ///
    /// Encode failures end in `error`. An upload failure keeps the encoded
    /// video and ends in `idle` with the failure recorded as the message.
    pub async fn finalize(&self, task_id: &str) -> TaskStatus {
        let Some(task) = self.tasks.get(task_id).await else {
            tracing::warn!(task_id, "Task vanished before finalization");
            return TaskStatus::Error;
        };
        self.tasks.set_status(task_id, TaskStatus::Processing).await;

        let reference = match self
            .encoder
            .encode(&task.frame_dir, &task.output_file, self.cleanup_frames)
            .await
        {
            Ok(reference) => reference,
            Err(e) => {
                tracing::error!(task_id, source_id = %task.source_id, error = %e, "Finalization failed");
                let message = format!("Failed to generate timelapse: {}", e);
                self.tasks.update(task_id, |t| t.fail(message)).await;
                return TaskStatus::Error;
            }
        };
        self.tasks
            .update(task_id, |t| t.media_reference = Some(reference))
            .await;

        if self.upload_enabled {
            self.uploader
                .upload(&self.tasks, task_id, &task.output_file)
                .await;
        }

        self.tasks.update(task_id, |t| t.complete()).await;
        tracing::info!(task_id, source_id = %task.source_id, "Timelapse finished");
        TaskStatus::Idle
    }
}

/// Message recorded on tasks still active when the registry shuts down
const SHUTDOWN_MESSAGE: &str = "Capture interrupted by shutdown";

/// A spawned capture for one source
#[derive(Debug)]
struct RunningCapture {
    task_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<CaptureOutcome>,
}

/// Capture, then finalize only if the window closed on its own.
async fn run_task(
    job: CaptureJob,
    sources: SourceSet,
    policy: RetryPolicy,
    tasks: TaskTable,
    cancel: CancellationToken,
    debug: bool,
    finalizer: Arc<Finalizer>,
) -> CaptureOutcome {
    let outcome = run_capture(&job, &sources, &policy, &tasks, &cancel, debug).await;
    if let CaptureOutcome::Completed { .. } = outcome {
        finalizer.finalize(&job.task_id).await;
    }
    outcome
}

/// Registry of tasks and their running captures
pub struct TaskRegistry {
    config: Arc<Config>,
    max_concurrent_tasks: usize,
    sources: SourceSet,
    tasks: TaskTable,
    policy: RetryPolicy,
    finalizer: Arc<Finalizer>,
    running: Mutex<HashMap<String, RunningCapture>>,
    /// Finalizations of captures replaced by a newer start, by task id
    finalizing: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskRegistry {
    pub fn new(
        config: Arc<Config>,
        plan: &ResourcePlan,
        sources: SourceSet,
        uploader: Uploader,
    ) -> Self {
        let tasks = TaskTable::new();
        let finalizer = Finalizer::new(
            tasks.clone(),
            Encoder::new(&config, plan),
            uploader,
            config.upload.enabled,
            config.tasks.cleanup_frames,
        );
        Self {
            max_concurrent_tasks: plan.max_concurrent_tasks.max(1) as usize,
            policy: RetryPolicy::from_config(&config.capture),
            config,
            sources,
            tasks,
            finalizer: Arc::new(finalizer),
            running: Mutex::new(HashMap::new()),
            finalizing: Mutex::new(Vec::new()),
        }
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.max_concurrent_tasks
    }

    /// Start capturing from `request.source_id` and return the new task id.
    ///
    /// Returns as soon as the capture is spawned, unless a replaced capture
    /// has to finish finalizing first to stay within the concurrency ceiling.
    pub async fn start(&self, request: StartRequest) -> Result<String, TaskError> {
        let source_id = request.source_id.clone();
        if !self.sources.exists(&source_id).await {
            return Err(TaskError::SourceNotFound(source_id));
        }

        let capture = &self.config.capture;
        let interval = request
            .interval
            .filter(|i| !i.is_zero())
            .unwrap_or(Duration::from_secs(capture.default_interval_secs.max(1)));
        let duration = request.duration.unwrap_or(Duration::from_secs(
            capture.default_duration_mins.saturating_mul(60),
        ));
        if window_end(Utc::now(), duration).is_none()
            || Instant::now().checked_add(duration).is_none()
        {
            return Err(TaskError::InvalidDuration(duration));
        }
        let root = request
            .output_root
            .unwrap_or_else(|| capture.output_root.clone());

        {
            let running = self.running.lock().await;
            self.check_ceiling(&running, &source_id).await?;
        }
        self.probe(&source_id).await;

        let mut running = self.running.lock().await;
        let active = self.check_ceiling(&running, &source_id).await?;

        if let Some(prior) = running.remove(&source_id) {
            // The replaced task holds a slot until its finalization ends
            let room_for_both = active + 2 <= self.max_concurrent_tasks;
            self.replace(prior, room_for_both).await;
        }

        create_directory(&root).await?;
        let (frame_dir, output_file) = unique_paths(&root, &task_name(&source_id, Local::now()));
        create_directory(&frame_dir).await?;

        let task_id = Uuid::new_v4().to_string();
        self.tasks
            .insert(Task::new(
                task_id.clone(),
                source_id.clone(),
                interval,
                duration,
                frame_dir.clone(),
                output_file.clone(),
            ))
            .await;

        let job = CaptureJob {
            task_id: task_id.clone(),
            source_id: source_id.clone(),
            interval,
            duration,
            frame_dir: frame_dir.clone(),
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_task(
            job,
            self.sources.clone(),
            self.policy.clone(),
            self.tasks.clone(),
            cancel.clone(),
            self.config.logging.debug,
            self.finalizer.clone(),
        ));
        running.insert(
            source_id.clone(),
            RunningCapture {
                task_id: task_id.clone(),
                cancel,
                handle,
            },
        );

        tracing::info!(
            task_id = %task_id,
            source_id = %source_id,
            frame_dir = %frame_dir.display(),
            output = %output_file.display(),
            "Timelapse started"
        );
        Ok(task_id)
    }

    /// Reject the start when the ceiling is reached.
    ///
    /// A capture for `source_id` that is still recording is about to be
    /// replaced and does not count. Returns the active count used.
    async fn check_ceiling(
        &self,
        running: &HashMap<String, RunningCapture>,
        source_id: &str,
    ) -> Result<usize, TaskError> {
        let mut replaceable = None;
        if let Some(prior) = running.get(source_id).filter(|r| !r.handle.is_finished()) {
            let status = self.tasks.get(&prior.task_id).await.map(|t| t.status);
            if status == Some(TaskStatus::Recording) {
                replaceable = Some(prior.task_id.as_str());
            }
        }

        let active = self.tasks.active_count(replaceable).await;
        if active >= self.max_concurrent_tasks {
            return Err(TaskError::ConcurrencyLimit {
                active,
                limit: self.max_concurrent_tasks,
            });
        }
        Ok(active)
    }

    /// Test request made before starting; a failure only warns.
    async fn probe(&self, source_id: &str) {
        let timeout = Duration::from_secs(self.config.capture.probe_timeout_secs.max(1));
        if let Err(e) = self.sources.fetch(source_id, timeout, true).await {
            tracing::warn!(
                source_id,
                error = %e,
                "Source did not answer the test probe, starting anyway"
            );
        }
    }

    /// Cancel a capture superseded by a new start and finalize it.
    ///
    /// Finalization runs in the background when `in_background` is set,
    /// otherwise it completes before this returns.
    async fn replace(&self, prior: RunningCapture, in_background: bool) {
        let RunningCapture {
            task_id,
            cancel,
            handle,
        } = prior;
        if handle.is_finished() {
            return;
        }

        let status = self.tasks.get(&task_id).await.map(|t| t.status);
        if status != Some(TaskStatus::Recording) {
            // Already finalizing on its own; let it finish
            if in_background {
                let waiter = tokio::spawn(async move {
                    let _ = handle.await;
                });
                self.track_finalization(task_id, waiter).await;
            } else if let Err(e) = handle.await {
                self.record_join_failure(&task_id, &e).await;
            }
            return;
        }

        tracing::info!(
            task_id = %task_id,
            in_background,
            "Cancelling capture replaced by a new start"
        );
        self.tasks.set_status(&task_id, TaskStatus::Processing).await;
        cancel.cancel();

        match handle.await {
            Ok(CaptureOutcome::Cancelled { .. }) if in_background => {
                let finalizer = self.finalizer.clone();
                let id = task_id.clone();
                let job = tokio::spawn(async move {
                    finalizer.finalize(&id).await;
                });
                self.track_finalization(task_id, job).await;
            }
            Ok(CaptureOutcome::Cancelled { .. }) => {
                self.finalizer.finalize(&task_id).await;
            }
            Ok(CaptureOutcome::Completed { .. }) => {}
            Err(e) => self.record_join_failure(&task_id, &e).await,
        }
    }

    async fn track_finalization(&self, task_id: String, handle: JoinHandle<()>) {
        let mut finalizing = self.finalizing.lock().await;
        finalizing.retain(|(_, h)| !h.is_finished());
        finalizing.push((task_id, handle));
    }

    /// Stop the capture for `source_id` and finalize it with the frames so far.
    ///
    /// When `task_id` is given it must name the source's running task.
    /// Finalization failures end up on the task, not in the return value.
    pub async fn stop(&self, source_id: &str, task_id: Option<&str>) -> Result<(), TaskError> {
        let entry = {
            let mut running = self.running.lock().await;
            let active = running.get(source_id).map(|r| r.task_id.clone());
            if let Some(given) = task_id {
                if active.as_deref() != Some(given) {
                    return Err(TaskError::TaskMismatch {
                        source_id: source_id.to_string(),
                        given: given.to_string(),
                        active,
                    });
                }
            }
            match running.remove(source_id) {
                Some(entry) if !entry.handle.is_finished() => entry,
                _ => return Ok(()),
            }
        };

        tracing::info!(task_id = %entry.task_id, source_id, "Stopping timelapse");
        let status = self.tasks.get(&entry.task_id).await.map(|t| t.status);
        if status == Some(TaskStatus::Recording) {
            self.tasks
                .set_status(&entry.task_id, TaskStatus::Processing)
                .await;
        }
        entry.cancel.cancel();

        match entry.handle.await {
            Ok(CaptureOutcome::Cancelled { frames }) => {
                tracing::debug!(task_id = %entry.task_id, frames, "Capture stopped, finalizing");
                self.finalizer.finalize(&entry.task_id).await;
            }
            // Window closed first; its finalization already ran
            Ok(CaptureOutcome::Completed { .. }) => {}
            Err(e) => self.record_join_failure(&entry.task_id, &e).await,
        }
        Ok(())
    }

    async fn record_join_failure(&self, task_id: &str, error: &tokio::task::JoinError) {
        tracing::error!(task_id, error = %error, "Capture task did not finish cleanly");
        let message = format!("Capture task failed: {}", error);
        self.tasks.update(task_id, |t| t.fail(message)).await;
    }

    /// Summaries of every known task, oldest first.
    pub async fn list(&self) -> Vec<TaskSummary> {
        self.tasks
            .list()
            .await
            .iter()
            .map(Task::to_summary)
            .collect()
    }

    /// Remove a task, stopping and finalizing it first if it is still running.
    ///
    /// A replaced task still finalizing in the background is waited for.
    pub async fn delete(&self, task_id: &str) -> Result<(), TaskError> {
        let task = self
            .tasks
            .get(task_id)
            .await
            .ok_or_else(|| TaskError::TaskNotFound(task_id.to_string()))?;

        if self.running_task_for(&task.source_id).await.as_deref() == Some(task_id) {
            if let Err(e) = self.stop(&task.source_id, Some(task_id)).await {
                tracing::warn!(task_id, error = %e, "Stop before delete failed");
            }
        }

        let background = {
            let mut finalizing = self.finalizing.lock().await;
            finalizing
                .iter()
                .position(|(id, _)| id == task_id)
                .map(|i| finalizing.swap_remove(i).1)
        };
        if let Some(handle) = background {
            tracing::debug!(task_id, "Waiting for finalization before delete");
            if let Err(e) = handle.await {
                tracing::warn!(task_id, error = %e, "Finalization ended abnormally");
            }
        }

        self.tasks.remove(task_id).await;
        tracing::info!(task_id, source_id = %task.source_id, "Task deleted");
        Ok(())
    }

    /// Id of the capture currently registered for `source_id`.
    pub async fn running_task_for(&self, source_id: &str) -> Option<String> {
        self.running
            .lock()
            .await
            .get(source_id)
            .filter(|r| !r.handle.is_finished())
            .map(|r| r.task_id.clone())
    }

    /// Number of sources with a capture still running or finalizing.
    pub async fn running_count(&self) -> usize {
        self.running
            .lock()
            .await
            .values()
            .filter(|r| !r.handle.is_finished())
            .count()
    }

    /// Cancel every capture and wait for it to end, without finalizing.
    ///
    /// Tasks left active are marked failed.
    pub async fn shutdown(&self) {
        let entries: Vec<RunningCapture> = self
            .running
            .lock()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        let background = std::mem::take(&mut *self.finalizing.lock().await);

        for entry in &entries {
            entry.cancel.cancel();
            entry.handle.abort();
        }
        for (_, handle) in &background {
            handle.abort();
        }

        for entry in entries {
            if let Err(e) = entry.handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(task_id = %entry.task_id, error = %e, "Capture ended abnormally");
                }
            }
        }
        for (_, handle) in background {
            let _ = handle.await;
        }

        let interrupted = self.tasks.fail_active(SHUTDOWN_MESSAGE).await;
        tracing::info!(interrupted, "All captures stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_task_name_uses_camera_part() {
        let at = Local.with_ymd_and_hms(2024, 5, 1, 6, 30, 0).unwrap();
        assert_eq!(
            task_name("camera.front_door", at),
            "timelapse_front_door_20240501_063000"
        );
        assert_eq!(task_name("garage", at), "timelapse_garage_20240501_063000");
        assert_eq!(
            task_name("camera.a.b/c", at),
            "timelapse_a.b_c_20240501_063000"
        );
    }

    #[test]
    fn test_unique_paths_skip_existing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (dir, out) = unique_paths(tmp.path(), "timelapse_front");
        assert_eq!(dir, tmp.path().join("timelapse_front"));
        assert_eq!(out, tmp.path().join("timelapse_front.mp4"));

        std::fs::create_dir(&dir).unwrap();
        let (dir2, out2) = unique_paths(tmp.path(), "timelapse_front");
        assert_eq!(dir2, tmp.path().join("timelapse_front_2"));
        assert_eq!(out2, tmp.path().join("timelapse_front_2.mp4"));

        std::fs::write(&out2, b"x").unwrap();
        let (dir3, _) = unique_paths(tmp.path(), "timelapse_front");
        assert_eq!(dir3, tmp.path().join("timelapse_front_3"));
    }

    #[test]
    fn test_start_request_builder() {
        let req = StartRequest::new("camera.front")
            .with_interval(Duration::from_secs(5))
            .with_duration(Duration::from_secs(600))
            .with_output_root("/tmp/out");
        assert_eq!(req.source_id, "camera.front");
        assert_eq!(req.interval, Some(Duration::from_secs(5)));
        assert_eq!(req.duration, Some(Duration::from_secs(600)));
        assert_eq!(req.output_root, Some(PathBuf::from("/tmp/out")));
    }
}
