//! Capture loop for a single task.
//!
//! Acquires a frame every interval until the recording window closes, retrying
//! failed acquisitions with exponential backoff. Cancellation is reported as
//! [`CaptureOutcome::Cancelled`]; the loop itself never finalizes.

use crate::config::CaptureConfig;
use crate::frame_store::write_frame;
use crate::source::{SourceError, SourceSet};
use crate::task::TaskTable;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Retry settings for frame acquisition
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per interval (at least 1)
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Growth factor applied to the delay after each failure
    pub backoff: f64,
    /// Timeout for a single transport request
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &CaptureConfig) -> Self {
        Self {
            max_attempts: cfg.max_retries.max(1),
            base_delay: Duration::from_secs_f64(cfg.retry_base_delay_secs.max(0.0)),
            backoff: cfg.retry_backoff.max(1.0),
            attempt_timeout: Duration::from_secs(cfg.image_timeout_secs.max(1)),
        }
    }

    /// Delay slept after failed attempt number `attempt` (0-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.mul_f64(self.backoff.powi(attempt as i32))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&CaptureConfig::default())
    }
}

/// How a capture loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The recording window closed naturally
    Completed { frames: u64 },
    /// Cancellation was requested; the caller decides about finalization
    Cancelled { frames: u64 },
}

/// Everything the loop needs to know about its task
#[derive(Debug, Clone)]
pub struct CaptureJob {
    pub task_id: String,
    pub source_id: String,
    pub interval: Duration,
    pub duration: Duration,
    pub frame_dir: PathBuf,
}

/// Run the capture loop until the window closes or `cancel` fires.
///
/// Counters are published to `tasks` after every cycle, including cycles where
/// the source was unavailable or acquisition failed.
pub async fn run_capture(
    job: &CaptureJob,
    sources: &SourceSet,
    policy: &RetryPolicy,
    tasks: &TaskTable,
    cancel: &CancellationToken,
    debug: bool,
) -> CaptureOutcome {
    let started = Instant::now();
    // None when the window ends beyond what the clock can represent
    let end = started.checked_add(job.duration);
    let mut sequence: u64 = 0;

    tracing::info!(
        task_id = %job.task_id,
        source_id = %job.source_id,
        interval_secs = job.interval.as_secs_f64(),
        duration_secs = job.duration.as_secs(),
        "Capture started"
    );

    while end.map_or(true, |end| Instant::now() < end) {
        let cycle = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = capture_cycle(job, sources, policy, sequence, debug) => Some(result),
        };
        let Some(captured) = cycle else {
            return cancelled(job, sequence);
        };
        if captured {
            sequence += 1;
        }

        let elapsed = started.elapsed();
        tasks
            .update(&job.task_id, |task| task.record_progress(sequence, elapsed))
            .await;

        if debug {
            tracing::debug!(
                task_id = %job.task_id,
                frames = sequence,
                wait_secs = job.interval.as_secs_f64(),
                "Waiting for next frame"
            );
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(job, sequence),
            _ = sleep(job.interval) => {}
        }
    }

    tracing::info!(task_id = %job.task_id, frames = sequence, "Capture window closed");
    CaptureOutcome::Completed { frames: sequence }
}

fn cancelled(job: &CaptureJob, frames: u64) -> CaptureOutcome {
    tracing::info!(task_id = %job.task_id, frames, "Capture cancelled");
    CaptureOutcome::Cancelled { frames }
}

/// One scheduled capture. Returns true when a frame was persisted.
async fn capture_cycle(
    job: &CaptureJob,
    sources: &SourceSet,
    policy: &RetryPolicy,
    sequence: u64,
    debug: bool,
) -> bool {
    if !sources.is_available(&job.source_id).await {
        tracing::warn!(
            task_id = %job.task_id,
            source_id = %job.source_id,
            "Source unavailable, skipping this interval"
        );
        return false;
    }

    let bytes = match acquire(&job.source_id, sources, policy, debug).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(
                task_id = %job.task_id,
                source_id = %job.source_id,
                attempts = policy.max_attempts,
                error = %e,
                "Frame acquisition failed, continuing with next interval"
            );
            return false;
        }
    };

    match write_frame(&job.frame_dir, sequence, &bytes).await {
        Ok(path) => {
            if debug {
                tracing::debug!(
                    task_id = %job.task_id,
                    frame = sequence,
                    bytes = bytes.len(),
                    path = %path.display(),
                    "Frame saved"
                );
            }
            true
        }
        Err(e) => {
            tracing::warn!(task_id = %job.task_id, frame = sequence, error = %e, "Frame dropped");
            false
        }
    }
}

/// Fetch one image, retrying with backoff.
///
/// Only the final attempt may fall back to the secondary transport.
pub async fn acquire(
    source_id: &str,
    sources: &SourceSet,
    policy: &RetryPolicy,
    debug: bool,
) -> Result<Vec<u8>, SourceError> {
    let mut last_err = None;

    for attempt in 0..policy.max_attempts {
        let final_attempt = attempt + 1 == policy.max_attempts;
        match sources
            .fetch(source_id, policy.attempt_timeout, final_attempt)
            .await
        {
            Ok(bytes) => {
                if debug {
                    tracing::debug!(source_id, attempt, bytes = bytes.len(), "Image captured");
                }
                return Ok(bytes);
            }
            Err(e) => {
                tracing::debug!(source_id, attempt, error = %e, "Image request failed");
                last_err = Some(e);
            }
        }

        if !final_attempt {
            sleep(policy.delay_after(attempt)).await;
        }
    }

    Err(last_err.unwrap_or_else(|| SourceError::Unavailable(source_id.to_string())))
}
