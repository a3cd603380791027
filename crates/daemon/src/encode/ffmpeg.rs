//! Command construction and execution for the encoding tool.
//!
//! Two input strategies are supported: a numbered file pattern when the frame
//! sequence is contiguous from zero, and an explicit concat manifest otherwise.

use super::EncodeError;
use crate::frame_store::{
    parse_frame_number, sample_frames, FRAME_EXTENSION, FRAME_NUMBER_WIDTH, FRAME_PREFIX, MANIFEST_FILE,
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Number of diagnostic lines kept from a failed run
const DIAGNOSTIC_LINES: usize = 20;

/// Output settings shared by both input strategies
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeParams {
    pub framerate: u32,
    pub codec: String,
    pub pixel_format: String,
    pub threads: u32,
}

/// How frames are handed to the tool
#[derive(Debug, Clone, PartialEq)]
pub enum InputStrategy {
    /// `frame_%06d.jpg` starting at 0
    Pattern,
    /// Ordered `file '...'` list, possibly sampled
    Manifest(Vec<String>),
}

/// Whether `frames` (sorted) are numbered 0, 1, 2, ... without gaps.
pub fn is_contiguous(frames: &[String]) -> bool {
    frames
        .iter()
        .enumerate()
        .all(|(i, name)| parse_frame_number(name) == Some(i as u64))
}

/// Pick the input strategy for sorted `frames`.
///
/// Sequences above `batch_cap` are sampled down and always go through the
/// manifest, since the pattern input cannot skip frames.
pub fn choose_strategy(frames: &[String], batch_cap: usize) -> InputStrategy {
    let cap = batch_cap.max(1);
    if frames.len() <= cap && is_contiguous(frames) {
        InputStrategy::Pattern
    } else {
        InputStrategy::Manifest(sample_frames(frames, cap))
    }
}

/// Pattern input addressing every frame in `frame_dir`.
pub fn frame_pattern(frame_dir: &Path) -> PathBuf {
    frame_dir.join(format!(
        "{}%0{}d.{}",
        FRAME_PREFIX, FRAME_NUMBER_WIDTH, FRAME_EXTENSION
    ))
}

/// Build a pattern-input encode command.
pub fn build_pattern_command(
    tool: &Path,
    params: &EncodeParams,
    frame_dir: &Path,
    output: &Path,
) -> Command {
    let mut cmd = Command::new(tool);
    cmd.arg("-y").arg("-hide_banner").arg("-loglevel").arg("error");
    cmd.arg("-framerate").arg(params.framerate.to_string());
    cmd.arg("-start_number").arg("0");
    cmd.arg("-i").arg(frame_pattern(frame_dir));
    push_output_args(&mut cmd, params, output);
    cmd
}

/// Build a manifest-input encode command.
pub fn build_manifest_command(
    tool: &Path,
    params: &EncodeParams,
    manifest: &Path,
    output: &Path,
) -> Command {
    let mut cmd = Command::new(tool);
    cmd.arg("-y").arg("-hide_banner").arg("-loglevel").arg("error");
    cmd.arg("-f").arg("concat");
    cmd.arg("-safe").arg("0");
    cmd.arg("-r").arg(params.framerate.to_string());
    cmd.arg("-i").arg(manifest);
    push_output_args(&mut cmd, params, output);
    cmd
}

fn push_output_args(cmd: &mut Command, params: &EncodeParams, output: &Path) {
    cmd.arg("-c:v").arg(&params.codec);
    cmd.arg("-threads").arg(params.threads.max(1).to_string());
    cmd.arg("-pix_fmt").arg(&params.pixel_format);
    cmd.arg("-movflags").arg("+faststart");
    cmd.arg(output);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
}

/// Render manifest content for `frames` in `frame_dir`.
pub fn manifest_content(frame_dir: &Path, frames: &[String]) -> String {
    let mut content = String::new();
    for name in frames {
        let path = frame_dir.join(name);
        let escaped = path.to_string_lossy().replace('\'', r"'\''");
        content.push_str("file '");
        content.push_str(&escaped);
        content.push_str("'\n");
    }
    content
}

/// Write the ordered manifest into `frame_dir` using absolute frame paths.
pub async fn write_manifest(frame_dir: &Path, frames: &[String]) -> std::io::Result<PathBuf> {
    let absolute = tokio::fs::canonicalize(frame_dir).await?;
    let manifest = absolute.join(MANIFEST_FILE);
    tokio::fs::write(&manifest, manifest_content(&absolute, frames)).await?;
    Ok(manifest)
}

/// Run an encode command to completion, killing it after `timeout`.
pub async fn run_encode(mut cmd: Command, timeout: Duration) -> Result<(), EncodeError> {
    let child = cmd.spawn()?;

    // Dropping the future on timeout kills the child
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| EncodeError::Timeout(timeout))??;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let text = if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout).to_string()
    } else {
        stderr.to_string()
    };
    Err(EncodeError::Encoding {
        code: output.status.code(),
        diagnostics: first_lines(&text, DIAGNOSTIC_LINES),
    })
}

fn first_lines(text: &str, count: usize) -> String {
    text.lines().take(count).collect::<Vec<_>>().join("\n")
}
