//! Publishing finished videos under the publicly servable media root.

use crate::config::MediaConfig;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Subdirectory of the public root receiving copied videos
pub const PUBLISH_SUBDIR: &str = "timelapses";

/// Turns output paths into media references the presentation layer can play.
#[derive(Debug, Clone)]
pub struct MediaPublisher {
    public_root: PathBuf,
    locator_prefix: String,
    large_file_threshold: u64,
}

impl MediaPublisher {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            public_root: config.public_root.clone(),
            locator_prefix: config.locator_prefix.trim_end_matches('/').to_string(),
            large_file_threshold: config.large_file_threshold_bytes,
        }
    }

    /// Locator for a path under the public root, or `None` if it lives elsewhere.
    pub fn locator_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.public_root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().to_string()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(format!("{}/{}", self.locator_prefix, parts.join("/")))
    }

    /// Produce a media reference for `output`, copying it into the public
    /// root first when it is not already servable.
    pub async fn publish(&self, output: &Path) -> io::Result<String> {
        if let Some(locator) = self.locator_for(output) {
            return Ok(locator);
        }

        let file_name = output
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "output has no file name"))?;
        let target_dir = self.public_root.join(PUBLISH_SUBDIR);
        tokio::fs::create_dir_all(&target_dir).await?;
        let target = target_dir.join(file_name);

        let size = tokio::fs::metadata(output).await?.len();
        if size > self.large_file_threshold {
            let src = output.to_path_buf();
            let dst = target.clone();
            tokio::task::spawn_blocking(move || std::fs::copy(&src, &dst))
                .await
                .map_err(io::Error::other)??;
        } else {
            tokio::fs::copy(output, &target).await?;
        }

        tracing::debug!(
            from = %output.display(),
            to = %target.display(),
            bytes = size,
            "Video copied into media root"
        );

        self.locator_for(&target).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "copied video is outside the media root")
        })
    }
}
