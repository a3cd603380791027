//! Encoding of frame directories into timelapse videos
//!
//! The [`Encoder`] locates the external tool, picks an input strategy, runs the
//! tool, verifies the output, publishes it for playback and optionally removes
//! the frames.

pub mod ffmpeg;
pub mod media;

pub use ffmpeg::{choose_strategy, EncodeParams, InputStrategy};
pub use media::MediaPublisher;

use crate::concurrency::ResourcePlan;
use crate::config::Config;
use crate::frame_store::{self, list_frames, MANIFEST_FILE};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Bytes read back from the output to confirm it is readable
const HEADER_PROBE_BYTES: usize = 64;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The frame directory holds no frames
    #[error("No frames found in {0:?}")]
    NoFrames(PathBuf),

    /// The encoding tool is neither on PATH nor in a known location
    #[error("Encoding tool '{0}' not found")]
    ToolNotFound(String),

    /// The tool exited with a non-zero status
    #[error("Encoding tool failed (exit code {code:?}): {diagnostics}")]
    Encoding {
        code: Option<i32>,
        diagnostics: String,
    },

    /// The tool ran longer than the configured limit and was killed
    #[error("Encoding timed out after {0:?}")]
    Timeout(Duration),

    /// The tool reported success but the output is empty
    #[error("Output file {0:?} is empty")]
    EmptyOutput(PathBuf),

    /// The tool reported success but no output was written
    #[error("Output file {0:?} was not created")]
    MissingOutput(PathBuf),

    /// IO error during encoding
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Find the encoding tool.
///
/// A tool given as a path is used as-is. A bare name is searched on `PATH`
/// first, then in `search_paths`.
pub fn locate_tool(tool: &str, search_paths: &[PathBuf]) -> Option<PathBuf> {
    let candidate = Path::new(tool);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    if let Some(paths) = env::var_os("PATH") {
        if let Some(found) = env::split_paths(&paths)
            .map(|dir| dir.join(tool))
            .find(|path| path.is_file())
        {
            return Some(found);
        }
    }

    search_paths.iter().find(|path| path.is_file()).cloned()
}

/// Assembles frame directories into videos with the external tool
#[derive(Debug, Clone)]
pub struct Encoder {
    tool: String,
    search_paths: Vec<PathBuf>,
    params: EncodeParams,
    batch_cap: usize,
    timeout: Duration,
    settle_delay: Duration,
    publisher: MediaPublisher,
}

impl Encoder {
    pub fn new(config: &Config, plan: &ResourcePlan) -> Self {
        let encoder = &config.encoder;
        Self {
            tool: encoder.tool.clone(),
            search_paths: encoder.search_paths.clone(),
            params: EncodeParams {
                framerate: encoder.framerate,
                codec: encoder.codec.clone(),
                pixel_format: encoder.pixel_format.clone(),
                threads: plan.encoder_threads,
            },
            batch_cap: encoder.batch_cap,
            timeout: Duration::from_secs(encoder.timeout_secs),
            settle_delay: Duration::from_millis(encoder.settle_delay_ms),
            publisher: MediaPublisher::new(&config.media),
        }
    }

    /// Resolved path of the encoding tool, if present.
    pub fn tool_path(&self) -> Option<PathBuf> {
        locate_tool(&self.tool, &self.search_paths)
    }

    /// Encode the frames in `frame_dir` into `output_file`.
    ///
    /// Returns the media reference of the published video.
    pub async fn encode(
        &self,
        frame_dir: &Path,
        output_file: &Path,
        cleanup_frames: bool,
    ) -> Result<String, EncodeError> {
        let dir = frame_dir.to_path_buf();
        let frames = tokio::task::spawn_blocking(move || list_frames(&dir).sorted())
            .await
            .map_err(std::io::Error::other)?;
        if frames.is_empty() {
            return Err(EncodeError::NoFrames(frame_dir.to_path_buf()));
        }

        let tool = self
            .tool_path()
            .ok_or_else(|| EncodeError::ToolNotFound(self.tool.clone()))?;

        tracing::info!(
            frames = frames.len(),
            dir = %frame_dir.display(),
            output = %output_file.display(),
            tool = %tool.display(),
            "Encoding timelapse"
        );

        match choose_strategy(&frames, self.batch_cap) {
            InputStrategy::Pattern => {
                let cmd = ffmpeg::build_pattern_command(&tool, &self.params, frame_dir, output_file);
                match ffmpeg::run_encode(cmd, self.timeout).await {
                    Ok(()) => {}
                    Err(EncodeError::Encoding { code, diagnostics }) => {
                        tracing::warn!(
                            code = ?code,
                            diagnostics = %diagnostics,
                            "Pattern input failed, retrying with frame list"
                        );
                        self.encode_from_manifest(&tool, frame_dir, &frames, output_file)
                            .await?;
                    }
                    Err(e) => return Err(e),
                }
            }
            InputStrategy::Manifest(selected) => {
                if selected.len() < frames.len() {
                    tracing::info!(
                        total = frames.len(),
                        sampled = selected.len(),
                        "Sampling frames for encoding"
                    );
                }
                self.encode_from_manifest(&tool, frame_dir, &selected, output_file)
                    .await?;
            }
        }

        verify_output(output_file, self.settle_delay).await?;

        let reference = match self.publisher.publish(output_file).await {
            Ok(locator) => locator,
            Err(e) => {
                tracing::warn!(
                    output = %output_file.display(),
                    error = %e,
                    "Failed to publish video, referencing output path"
                );
                output_file.to_string_lossy().to_string()
            }
        };

        if cleanup_frames {
            frame_store::cleanup(frame_dir).await;
        }

        tracing::info!(output = %output_file.display(), reference = %reference, "Timelapse encoded");
        Ok(reference)
    }

    async fn encode_from_manifest(
        &self,
        tool: &Path,
        frame_dir: &Path,
        frames: &[String],
        output_file: &Path,
    ) -> Result<(), EncodeError> {
        let manifest = ffmpeg::write_manifest(frame_dir, frames).await?;
        let cmd = ffmpeg::build_manifest_command(tool, &self.params, &manifest, output_file);
        let result = ffmpeg::run_encode(cmd, self.timeout).await;

        if let Err(e) = tokio::fs::remove_file(&manifest).await {
            tracing::debug!(path = %manifest.display(), error = %e, "Manifest not removed");
        }
        result
    }
}

async fn output_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|meta| meta.len())
}

/// Confirm the tool left a readable, non-empty file behind.
///
/// A missing or empty file is re-checked once after `settle_delay`.
async fn verify_output(path: &Path, settle_delay: Duration) -> Result<(), EncodeError> {
    let mut size = output_size(path).await;
    if size.unwrap_or(0) == 0 {
        tokio::time::sleep(settle_delay).await;
        size = output_size(path).await;
    }

    match size {
        None => return Err(EncodeError::MissingOutput(path.to_path_buf())),
        Some(0) => return Err(EncodeError::EmptyOutput(path.to_path_buf())),
        Some(_) => {}
    }

    let mut header = [0u8; HEADER_PROBE_BYTES];
    let mut file = tokio::fs::File::open(path).await?;
    if file.read(&mut header).await? == 0 {
        return Err(EncodeError::EmptyOutput(path.to_path_buf()));
    }
    Ok(())
}


#[cfg(all(test, unix))]
mod tests {
    use super::testing::{recorded_calls, write_fake_tool, FakeTool};
    use super::*;
    use crate::frame_store::frame_file_name;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        tool_dir: PathBuf,
        frame_dir: PathBuf,
        output: PathBuf,
        media_root: PathBuf,
    }

    fn fixture(frames: &[u64]) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let tool_dir = tmp.path().join("bin");
        let media_root = tmp.path().join("media");
        let frame_dir = media_root.join("timelapse_front_20240101_000000");
        std::fs::create_dir_all(&tool_dir).unwrap();
        std::fs::create_dir_all(&frame_dir).unwrap();
        for seq in frames {
            std::fs::write(frame_dir.join(frame_file_name(*seq)), b"jpeg").unwrap();
        }
        let output = media_root.join("timelapse_front_20240101_000000.mp4");
        Fixture {
            _tmp: tmp,
            tool_dir,
            frame_dir,
            output,
            media_root,
        }
    }

    fn encoder(fx: &Fixture, behavior: FakeTool, batch_cap: usize) -> Encoder {
        let tool = write_fake_tool(&fx.tool_dir, behavior);
        let mut config = Config::default();
        config.encoder.tool = tool.to_string_lossy().to_string();
        config.encoder.search_paths = Vec::new();
        config.encoder.batch_cap = batch_cap;
        config.encoder.timeout_secs = 5;
        config.encoder.settle_delay_ms = 10;
        config.media.public_root = fx.media_root.clone();
        let plan = ResourcePlan::derive_for_cores(&config, 2);
        Encoder::new(&config, &plan)
    }

    #[test]
    fn test_locate_tool_by_path_and_search_list() {
        let tmp = TempDir::new().unwrap();
        let tool = write_fake_tool(tmp.path(), FakeTool::Succeeds);
        let tool_str = tool.to_string_lossy().to_string();

        assert_eq!(locate_tool(&tool_str, &[]), Some(tool.clone()));
        assert_eq!(
            locate_tool("definitely-not-a-real-tool-name", &[tool.clone()]),
            Some(tool.clone())
        );
        assert_eq!(
            locate_tool("definitely-not-a-real-tool-name", &[tmp.path().join("nope")]),
            None
        );
        assert_eq!(locate_tool(&format!("{}.missing", tool_str), &[tool]), None);
    }

    #[tokio::test]
    async fn test_encode_contiguous_frames_with_pattern() {
        let fx = fixture(&[0, 1, 2, 3]);
        let enc = encoder(&fx, FakeTool::Succeeds, 1000);

        let reference = enc.encode(&fx.frame_dir, &fx.output, false).await.unwrap();

        assert_eq!(
            reference,
            "media-source://media_source/local/timelapse_front_20240101_000000.mp4"
        );
        assert_eq!(std::fs::read(&fx.output).unwrap(), b"fake-video");
        let calls = recorded_calls(&fx.tool_dir);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("frame_%06d.jpg"));
        assert!(calls[0].contains("-threads 1"));
        // Frames kept when cleanup is off
        assert_eq!(list_frames(&fx.frame_dir).count(), 4);
    }

    #[tokio::test]
    async fn test_encode_gapped_frames_with_manifest_and_cleanup() {
        let fx = fixture(&[0, 2, 5]);
        let enc = encoder(&fx, FakeTool::Succeeds, 1000);

        enc.encode(&fx.frame_dir, &fx.output, true).await.unwrap();

        let calls = recorded_calls(&fx.tool_dir);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("concat"));
        assert!(calls[0].contains(MANIFEST_FILE));
        assert!(!fx.frame_dir.exists());
    }

    #[tokio::test]
    async fn test_pattern_failure_falls_back_to_manifest() {
        let fx = fixture(&[0, 1, 2]);
        let enc = encoder(&fx, FakeTool::PatternFails, 1000);

        enc.encode(&fx.frame_dir, &fx.output, false).await.unwrap();

        let calls = recorded_calls(&fx.tool_dir);
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("frame_%06d.jpg"));
        assert!(calls[1].contains("concat"));
        assert!(!fx.frame_dir.join(MANIFEST_FILE).exists());
    }

    #[tokio::test]
    async fn test_large_sequences_are_sampled() {
        let frames: Vec<u64> = (0..25).collect();
        let fx = fixture(&frames);
        let enc = encoder(&fx, FakeTool::Succeeds, 10);

        enc.encode(&fx.frame_dir, &fx.output, false).await.unwrap();

        let calls = recorded_calls(&fx.tool_dir);
        assert!(calls[0].contains("concat"));
    }

    #[tokio::test]
    async fn test_empty_directory_is_rejected() {
        let fx = fixture(&[]);
        let enc = encoder(&fx, FakeTool::Succeeds, 1000);

        let result = enc.encode(&fx.frame_dir, &fx.output, true).await;

        assert!(matches!(result, Err(EncodeError::NoFrames(_))));
        assert!(recorded_calls(&fx.tool_dir).is_empty());
        assert!(!fx.output.exists());
    }

    #[tokio::test]
    async fn test_tool_failure_carries_diagnostics() {
        let fx = fixture(&[0, 2]);
        let enc = encoder(&fx, FakeTool::Fails, 1000);

        match enc.encode(&fx.frame_dir, &fx.output, true).await {
            Err(EncodeError::Encoding { code, diagnostics }) => {
                assert_eq!(code, Some(1));
                assert_eq!(diagnostics.lines().count(), 20);
                assert!(diagnostics.starts_with("error line 0"));
            }
            other => panic!("expected encoding error, got {:?}", other),
        }
        // Frames survive a failed encode
        assert_eq!(list_frames(&fx.frame_dir).count(), 2);
    }

    #[tokio::test]
    async fn test_missing_and_empty_output() {
        let fx = fixture(&[0, 1]);
        let enc = encoder(&fx, FakeTool::NoOutput, 1000);
        assert!(matches!(
            enc.encode(&fx.frame_dir, &fx.output, false).await,
            Err(EncodeError::MissingOutput(_))
        ));

        let fx = fixture(&[0, 1]);
        let enc = encoder(&fx, FakeTool::EmptyOutput, 1000);
        assert!(matches!(
            enc.encode(&fx.frame_dir, &fx.output, false).await,
            Err(EncodeError::EmptyOutput(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let fx = fixture(&[0]);
        let mut config = Config::default();
        config.encoder.tool = fx.tool_dir.join("absent").to_string_lossy().to_string();
        config.encoder.search_paths = Vec::new();
        let enc = Encoder::new(&config, &ResourcePlan::derive_for_cores(&config, 2));

        assert!(matches!(
            enc.encode(&fx.frame_dir, &fx.output, false).await,
            Err(EncodeError::ToolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_hung_tool_is_killed() {
        let fx = fixture(&[0, 1]);
        let tool = write_fake_tool(&fx.tool_dir, FakeTool::Hangs);
        let mut config = Config::default();
        config.encoder.tool = tool.to_string_lossy().to_string();
        config.encoder.timeout_secs = 1;
        let enc = Encoder::new(&config, &ResourcePlan::derive_for_cores(&config, 2));

        let result = enc.encode(&fx.frame_dir, &fx.output, false).await;
        assert!(matches!(result, Err(EncodeError::Timeout(_))));
    }
}
