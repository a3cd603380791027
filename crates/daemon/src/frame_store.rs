//! Frame store for per-task frame directories.
//!
//! Frames are written as `frame_NNNNNN.jpg` inside a task's frame directory.
//! The store creates directories, writes and verifies single frames, enumerates
//! and samples frame sequences, and cleans up after a successful encode.

use futures::future::join_all;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// File name prefix shared by every frame.
pub const FRAME_PREFIX: &str = "frame_";

/// Frame file extension.
pub const FRAME_EXTENSION: &str = "jpg";

/// Width of the zero-padded sequence number.
pub const FRAME_NUMBER_WIDTH: usize = 6;

/// Name of the ordered file-list manifest used by list-based encoding.
pub const MANIFEST_FILE: &str = "frames.txt";

/// Name of the sentinel file used by the write-permission probe.
const PROBE_FILE: &str = ".write_probe";

/// Number of frame deletions issued concurrently during cleanup.
const CLEANUP_BATCH: usize = 100;

/// Errors that can occur when persisting a single frame.
#[derive(Debug, Error)]
pub enum FrameWriteError {
    /// The frame file could not be written.
    #[error("Failed to write frame {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The frame file is missing or empty after the write.
    #[error("Frame {0:?} is missing or empty after write")]
    Empty(PathBuf),
}

/// Build the file name for a frame sequence number.
pub fn frame_file_name(sequence: u64) -> String {
    format!(
        "{}{:0width$}.{}",
        FRAME_PREFIX,
        sequence,
        FRAME_EXTENSION,
        width = FRAME_NUMBER_WIDTH
    )
}

/// Parse the sequence number out of a frame file name.
///
/// Returns `None` for names that do not follow the frame naming convention.
pub fn parse_frame_number(name: &str) -> Option<u64> {
    let digits = name
        .strip_prefix(FRAME_PREFIX)?
        .strip_suffix(FRAME_EXTENSION)?
        .strip_suffix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Create a task or frame directory (idempotent).
///
/// After creation a sentinel file is written and removed to probe write
/// permission. A failed probe is logged as a warning and does not fail the call.
pub async fn create_directory(path: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(path).await?;

    let probe = path.join(PROBE_FILE);
    match tokio::fs::write(&probe, b"probe").await {
        Ok(()) => {
            if let Err(e) = tokio::fs::remove_file(&probe).await {
                tracing::warn!(path = %probe.display(), error = %e, "Failed to remove write probe");
            }
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Directory is not writable; frame writes will likely fail"
            );
        }
    }

    Ok(())
}

/// Write one frame and verify it landed on disk with non-zero size.
///
/// Returns the path of the written frame. An empty file left behind by a
/// failed write is removed so the sequence number can be reused.
pub async fn write_frame(
    dir: &Path,
    sequence: u64,
    bytes: &[u8],
) -> Result<PathBuf, FrameWriteError> {
    let path = dir.join(frame_file_name(sequence));

    tokio::fs::write(&path, bytes)
        .await
        .map_err(|source| FrameWriteError::Io {
            path: path.clone(),
            source,
        })?;

    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.len() > 0 => Ok(path),
        Ok(_) => {
            let _ = tokio::fs::remove_file(&path).await;
            Err(FrameWriteError::Empty(path))
        }
        Err(_) => Err(FrameWriteError::Empty(path)),
    }
}

/// Lazy, restartable enumeration of the frames in a directory.
///
/// Every call to [`FrameListing::iter`] walks the directory again. Iteration
/// order follows the filesystem; use [`FrameListing::sorted`] for temporal order.
#[derive(Debug, Clone)]
pub struct FrameListing {
    dir: PathBuf,
}

impl FrameListing {
    /// Iterate frame file names in filesystem order.
    pub fn iter(&self) -> impl Iterator<Item = String> {
        WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.file_name().to_str().map(String::from))
            .filter(|name| parse_frame_number(name).is_some())
    }

    /// Frame file names sorted by sequence number.
    pub fn sorted(&self) -> Vec<String> {
        let mut frames: Vec<String> = self.iter().collect();
        frames.sort_by_key(|name| parse_frame_number(name).unwrap_or(u64::MAX));
        frames
    }

    /// Number of frames currently in the directory.
    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

/// Enumerate frames in `dir`.
pub fn list_frames(dir: &Path) -> FrameListing {
    FrameListing {
        dir: dir.to_path_buf(),
    }
}

/// Downsample `frames` to at most `max_count` entries by even stride.
///
/// Entry `i` of the result is `frames[floor(i * len / max_count)]`, so the
/// sample spreads over the whole sequence instead of keeping the earliest frames.
pub fn sample_frames<T: Clone>(frames: &[T], max_count: usize) -> Vec<T> {
    let total = frames.len();
    if total <= max_count {
        return frames.to_vec();
    }
    if max_count == 0 {
        return Vec::new();
    }

    (0..max_count)
        .map(|i| frames[(i as u128 * total as u128 / max_count as u128) as usize].clone())
        .collect()
}

/// Best-effort removal of a frame directory.
///
/// Deletes frame files in concurrent batches, then the manifest, then the
/// directory itself if it is empty. Failures are logged and never returned.
pub async fn cleanup(dir: &Path) {
    let dir_owned = dir.to_path_buf();
    let frames = match tokio::task::spawn_blocking(move || list_frames(&dir_owned).sorted()).await
    {
        Ok(frames) => frames,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to enumerate frames for cleanup");
            return;
        }
    };

    let mut removed = 0usize;
    for batch in frames.chunks(CLEANUP_BATCH) {
        let results = join_all(
            batch
                .iter()
                .map(|name| tokio::fs::remove_file(dir.join(name))),
        )
        .await;

        for (name, result) in batch.iter().zip(results) {
            match result {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(frame = %name, error = %e, "Failed to remove frame");
                }
            }
        }
    }

    let manifest = dir.join(MANIFEST_FILE);
    if let Err(e) = tokio::fs::remove_file(&manifest).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %manifest.display(), error = %e, "Failed to remove manifest");
        }
    }

    // remove_dir refuses non-empty directories
    match tokio::fs::remove_dir(dir).await {
        Ok(()) => {
            tracing::debug!(dir = %dir.display(), removed, "Frame directory removed");
        }
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Frame directory left in place");
        }
    }
}
