//! Optional upload of finished videos to a photo service.
//!
//! [`Uploader`] never fails its caller: every problem is reduced to `false`
//! plus an error message on the task.

use crate::config::UploadConfig;
use crate::task::{TaskStatus, TaskTable};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;

/// Errors reported by photo services.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Upload service is not configured")]
    NotConfigured,

    #[error("Video file {0:?} does not exist")]
    MissingFile(PathBuf),

    #[error("Failed to run upload command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Upload command failed (exit code {code:?}): {message}")]
    Failed { code: Option<i32>, message: String },
}

/// An external photo-storage integration.
#[async_trait]
pub trait PhotoService: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the integration is present and has what it needs to upload.
    fn is_configured(&self) -> bool;

    async fn upload(
        &self,
        file: &Path,
        album: Option<&str>,
        account: Option<&str>,
    ) -> Result<(), UploadError>;
}

/// Runs a configured command per upload; exit status 0 means success.
#[derive(Debug, Clone)]
pub struct CommandUploader {
    command: Vec<String>,
}

impl CommandUploader {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// Substitute `{file}`, `{album}` and `{account}` into the template.
    pub fn render(&self, file: &Path, album: Option<&str>, account: Option<&str>) -> Vec<String> {
        let file = file.to_string_lossy();
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{file}", &file)
                    .replace("{album}", album.unwrap_or(""))
                    .replace("{account}", account.unwrap_or(""))
            })
            .collect()
    }
}

#[async_trait]
impl PhotoService for CommandUploader {
    fn name(&self) -> &str {
        "command"
    }

    fn is_configured(&self) -> bool {
        !self.command.is_empty()
    }

    async fn upload(
        &self,
        file: &Path,
        album: Option<&str>,
        account: Option<&str>,
    ) -> Result<(), UploadError> {
        let argv = self.render(file, album, account);
        let (program, args) = argv.split_first().ok_or(UploadError::NotConfigured)?;

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(UploadError::Failed {
                code: output.status.code(),
                message: stderr.lines().next().unwrap_or("").to_string(),
            })
        }
    }
}

/// Uploads finished videos and records the outcome on the task.
#[derive(Clone, Default)]
pub struct Uploader {
    service: Option<Arc<dyn PhotoService>>,
    album: Option<String>,
    account: Option<String>,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("service", &self.service.as_ref().map(|s| s.name().to_string()))
            .field("album", &self.album)
            .field("account", &self.account)
            .finish()
    }
}

impl Uploader {
    pub fn new(service: Option<Arc<dyn PhotoService>>, config: &UploadConfig) -> Self {
        Self {
            service,
            album: config.album.clone(),
            account: config.account.clone(),
        }
    }

    /// Upload `file` for `task_id`. Returns whether the upload was confirmed.
    pub async fn upload(&self, tasks: &TaskTable, task_id: &str, file: &Path) -> bool {
        let service = match &self.service {
            Some(service) if service.is_configured() => service,
            _ => {
                record_failure(tasks, task_id, &UploadError::NotConfigured).await;
                return false;
            }
        };
        if tokio::fs::metadata(file).await.is_err() {
            record_failure(tasks, task_id, &UploadError::MissingFile(file.to_path_buf())).await;
            return false;
        }

        tasks.set_status(task_id, TaskStatus::Uploading).await;
        tracing::info!(
            task_id,
            service = service.name(),
            file = %file.display(),
            album = ?self.album,
            "Uploading timelapse"
        );

        match service
            .upload(file, self.album.as_deref(), self.account.as_deref())
            .await
        {
            Ok(()) => {
                tasks.update(task_id, |task| task.upload_confirmed = true).await;
                tracing::info!(task_id, "Upload confirmed");
                true
            }
            Err(e) => {
                record_failure(tasks, task_id, &e).await;
                false
            }
        }
    }
}

async fn record_failure(tasks: &TaskTable, task_id: &str, error: &UploadError) {
    tracing::warn!(task_id, error = %error, "Upload failed");
    let message = format!("Upload failed: {}", error);
    tasks
        .update(task_id, |task| task.error_message = Some(message))
        .await;
}
