//! Single-frame grab from a camera stream using the encoding tool.
//!
//! Used as the secondary transport when a snapshot request keeps failing.

use super::{CameraSource, SourceError};
use crate::config::CameraConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Grabs one JPEG frame from each camera's `stream_url`.
pub struct FfmpegGrabSource {
    tool: PathBuf,
    urls: HashMap<String, String>,
}

impl FfmpegGrabSource {
    pub fn new(tool: PathBuf, cameras: &[CameraConfig]) -> Self {
        let urls = cameras
            .iter()
            .filter_map(|c| c.stream_url.as_ref().map(|url| (c.id.clone(), url.clone())))
            .collect();
        Self { tool, urls }
    }

    /// Build the grab command for a stream URL.
    pub fn build_grab_command(&self, url: &str) -> Command {
        let mut cmd = Command::new(&self.tool);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");
        if url.starts_with("rtsp://") {
            cmd.arg("-rtsp_transport").arg("tcp");
        }
        cmd.arg("-i").arg(url);
        cmd.arg("-frames:v").arg("1");
        cmd.arg("-f").arg("image2pipe");
        cmd.arg("-vcodec").arg("mjpeg");
        cmd.arg("-");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CameraSource for FfmpegGrabSource {
    fn name(&self) -> &str {
        "stream-grab"
    }

    async fn exists(&self, source_id: &str) -> bool {
        self.urls.contains_key(source_id)
    }

    async fn is_available(&self, source_id: &str) -> bool {
        self.urls.contains_key(source_id)
    }

    async fn get_image(&self, source_id: &str, timeout: Duration) -> Result<Vec<u8>, SourceError> {
        let url = self
            .urls
            .get(source_id)
            .ok_or_else(|| SourceError::NotFound(source_id.to_string()))?;

        let child = self
            .build_grab_command(url)
            .spawn()
            .map_err(|e| SourceError::Transport(format!("Failed to start {:?}: {}", self.tool, e)))?;

        // Dropping the future on timeout kills the child
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| SourceError::Timeout(timeout))?
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SourceError::Unavailable(
                stderr.lines().next().unwrap_or("stream grab failed").to_string(),
            ));
        }
        if output.stdout.is_empty() {
            return Err(SourceError::Empty);
        }
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|a| a.to_str().map(String::from))
            .collect()
    }

    fn source() -> FfmpegGrabSource {
        FfmpegGrabSource::new(
            PathBuf::from("ffmpeg"),
            &[CameraConfig {
                id: "camera.back".to_string(),
                snapshot_url: None,
                stream_url: Some("rtsp://cam.local/live".to_string()),
            }],
        )
    }

    #[test]
    fn test_rtsp_grab_command() {
        let src = source();
        let args = args(&src.build_grab_command("rtsp://cam.local/live"));

        assert!(args.windows(2).any(|w| w[0] == "-rtsp_transport" && w[1] == "tcp"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "rtsp://cam.local/live"));
        assert!(args.windows(2).any(|w| w[0] == "-frames:v" && w[1] == "1"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_http_stream_has_no_rtsp_flags() {
        let src = source();
        let args = args(&src.build_grab_command("http://cam.local/mjpeg"));
        assert!(!args.iter().any(|a| a == "-rtsp_transport"));
    }

    #[tokio::test]
    async fn test_unknown_camera() {
        let src = source();
        assert!(src.exists("camera.back").await);
        let result = src.get_image("camera.front", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SourceError::NotFound(_))));
    }
}
