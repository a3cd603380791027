//! Startup checks module for the timelapse daemon
//!
//! Provides preflight checks run before the daemon accepts work:
//! - Encoding tool availability (`<tool> -version`)
//! - Output root creation and write probe

use crate::config::Config;
use crate::encode::locate_tool;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Sentinel written to the output root by the write probe
const PROBE_FILE: &str = ".startup_probe";

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Encoding tool not available: {0}")]
    ToolUnavailable(String),

    #[error("Output root {path:?} cannot be created: {source}")]
    OutputRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What the checks found
#[derive(Debug, Clone, PartialEq)]
pub struct StartupReport {
    pub tool_path: PathBuf,
    /// Major version reported by the tool, if it could be parsed
    pub tool_major_version: Option<u32>,
    /// Whether the write probe in the output root succeeded
    pub output_root_writable: bool,
}

/// Parse `-version` output and extract the major version number
///
/// Handles release strings (`ffmpeg version 6.1.1-static`) and n-prefixed
/// tags (`ffmpeg version n7.0-...`). Git snapshot builds yield `None`.
pub fn parse_tool_version(version_output: &str) -> Option<u32> {
    let line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains(" version "))?
        .to_lowercase();

    let version = line.split(" version ").nth(1)?.split_whitespace().next()?;
    let version = version.trim_start_matches('n');
    version.split(|c| c == '.' || c == '-').next()?.parse().ok()
}

/// Locate the encoding tool and run `<tool> -version`
pub fn check_encoder_available(cfg: &Config) -> Result<(PathBuf, Option<u32>), StartupError> {
    let tool = locate_tool(&cfg.encoder.tool, &cfg.encoder.search_paths).ok_or_else(|| {
        StartupError::ToolUnavailable(format!(
            "'{}' not found on PATH or in {:?}",
            cfg.encoder.tool, cfg.encoder.search_paths
        ))
    })?;

    let output = Command::new(&tool).arg("-version").output().map_err(|e| {
        StartupError::ToolUnavailable(format!("{} -version failed: {}", tool.display(), e))
    })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable(format!(
            "{} -version exited with {}",
            tool.display(),
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok((tool, parse_tool_version(&stdout)))
}

/// Create the output root and probe that it is writable
///
/// Returns whether the probe succeeded; an unwritable root only warns.
pub fn check_output_root(root: &Path) -> Result<bool, StartupError> {
    std::fs::create_dir_all(root).map_err(|source| StartupError::OutputRoot {
        path: root.to_path_buf(),
        source,
    })?;

    let probe = root.join(PROBE_FILE);
    match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            Ok(true)
        }
        Err(e) => {
            tracing::warn!(
                path = %root.display(),
                error = %e,
                "Output root is not writable; captures will fail"
            );
            Ok(false)
        }
    }
}

/// Run all startup checks in order: encoding tool, output root
pub fn run_startup_checks(cfg: &Config) -> Result<StartupReport, StartupError> {
    let (tool_path, tool_major_version) = check_encoder_available(cfg)?;
    match tool_major_version {
        Some(major) => {
            tracing::info!(tool = %tool_path.display(), major, "Encoding tool found")
        }
        None => {
            tracing::info!(tool = %tool_path.display(), "Encoding tool found (unknown version)")
        }
    }

    let output_root_writable = check_output_root(&cfg.capture.output_root)?;

    Ok(StartupReport {
        tool_path,
        tool_major_version,
        output_root_writable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_version_parsing(
            major in 1u32..100,
            minor in 0u32..100,
            n_prefix in proptest::bool::ANY,
        ) {
            let prefix = if n_prefix { "n" } else { "" };
            let output = format!(
                "ffmpeg version {}{}.{}-static https://johnvansickle.com Copyright (c) 2000-2023\nbuilt with gcc",
                prefix, major, minor
            );
            prop_assert_eq!(parse_tool_version(&output), Some(major));
        }
    }

    #[test]
    fn test_version_parsing_edge_cases() {
        assert_eq!(parse_tool_version("ffmpeg version 6.1.1 Copyright"), Some(6));
        assert_eq!(parse_tool_version("ffmpeg version 7.0-full_build"), Some(7));
        assert_eq!(
            parse_tool_version("ffmpeg version N-113444-g1234abcd Copyright"),
            None
        );
        assert_eq!(parse_tool_version("no version info here"), None);
        assert_eq!(parse_tool_version(""), None);
    }

    #[test]
    fn test_check_output_root_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("timelapses").join("nested");

        assert!(check_output_root(&root).unwrap());
        assert!(root.is_dir());
        assert!(!root.join(PROBE_FILE).exists());
    }

    #[test]
    fn test_missing_tool_is_reported() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.encoder.tool = tmp.path().join("absent").to_string_lossy().to_string();
        cfg.encoder.search_paths = Vec::new();

        assert!(matches!(
            check_encoder_available(&cfg),
            Err(StartupError::ToolUnavailable(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_startup_checks_with_fake_tool() {
        use crate::encode::testing::{write_fake_tool, FakeTool};

        let tmp = TempDir::new().unwrap();
        let tool = write_fake_tool(tmp.path(), FakeTool::Succeeds);
        let mut cfg = Config::default();
        cfg.encoder.tool = tool.to_string_lossy().to_string();
        cfg.capture.output_root = tmp.path().join("out");

        let report = run_startup_checks(&cfg).unwrap();

        assert_eq!(report.tool_path, tool);
        assert_eq!(report.tool_major_version, Some(6));
        assert!(report.output_root_writable);
    }
}
