//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Frame acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureConfig {
    /// Seconds between frames when a start request omits the interval
    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: u64,
    /// Recording window in minutes when a start request omits the duration
    #[serde(default = "default_duration_mins")]
    pub default_duration_mins: u64,
    /// Root directory for frame directories and finished videos
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    /// Acquisition attempts per interval
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the second attempt, in seconds
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: f64,
    /// Multiplier applied to the retry delay after each failed attempt
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,
    /// Timeout for a single image request
    #[serde(default = "default_image_timeout_secs")]
    pub image_timeout_secs: u64,
    /// Timeout for the test probe made when a task starts
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_duration_mins() -> u64 {
    1440
}

fn default_output_root() -> PathBuf {
    PathBuf::from("/config/timelapses")
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_secs() -> f64 {
    2.0
}

fn default_retry_backoff() -> f64 {
    1.5
}

fn default_image_timeout_secs() -> u64 {
    10
}

fn default_probe_timeout_secs() -> u64 {
    5
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: default_interval_secs(),
            default_duration_mins: default_duration_mins(),
            output_root: default_output_root(),
            max_retries: default_max_retries(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_backoff: default_retry_backoff(),
            image_timeout_secs: default_image_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

/// External encoding tool settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Tool name looked up on PATH, or an absolute path
    #[serde(default = "default_tool")]
    pub tool: String,
    /// Install locations probed when the tool is not on PATH
    #[serde(default = "default_search_paths")]
    pub search_paths: Vec<PathBuf>,
    /// Input framerate of the assembled video
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    /// Video codec passed to the tool
    #[serde(default = "default_codec")]
    pub codec: String,
    /// Output pixel format
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,
    /// Encoder thread cap (0 = auto-derive)
    #[serde(default)]
    pub threads: u32,
    /// Frame count above which the input is sampled down to this many frames
    #[serde(default = "default_batch_cap")]
    pub batch_cap: usize,
    /// Hard limit on a single encode run, in seconds
    #[serde(default = "default_encode_timeout_secs")]
    pub timeout_secs: u64,
    /// Delay before re-checking the output file, in milliseconds
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

fn default_tool() -> String {
    "ffmpeg".to_string()
}

fn default_search_paths() -> Vec<PathBuf> {
    [
        "/usr/bin/ffmpeg",
        "/usr/local/bin/ffmpeg",
        "/bin/ffmpeg",
        "/opt/homebrew/bin/ffmpeg",
        "/config/ffmpeg",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

fn default_framerate() -> u32 {
    30
}

fn default_codec() -> String {
    "libx264".to_string()
}

fn default_pixel_format() -> String {
    "yuv420p".to_string()
}

fn default_batch_cap() -> usize {
    1000
}

fn default_encode_timeout_secs() -> u64 {
    1800
}

fn default_settle_delay_ms() -> u64 {
    500
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            search_paths: default_search_paths(),
            framerate: default_framerate(),
            codec: default_codec(),
            pixel_format: default_pixel_format(),
            threads: 0,
            batch_cap: default_batch_cap(),
            timeout_secs: default_encode_timeout_secs(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

/// Task lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TasksConfig {
    /// Maximum simultaneously active tasks (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_tasks: u32,
    /// Delete frame files after a successful encode
    #[serde(default = "default_true")]
    pub cleanup_frames: bool,
    /// Seconds between status snapshot refreshes
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_refresh_interval_secs() -> u64 {
    10
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 0,
            cleanup_frames: true,
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

/// Where finished videos are published for playback
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaConfig {
    /// Publicly servable root directory
    #[serde(default = "default_public_root")]
    pub public_root: PathBuf,
    /// Prefix of the media reference handed to the presentation layer
    #[serde(default = "default_locator_prefix")]
    pub locator_prefix: String,
    /// Files larger than this are copied on the blocking pool
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold_bytes: u64,
}

fn default_public_root() -> PathBuf {
    PathBuf::from("/media")
}

fn default_locator_prefix() -> String {
    "media-source://media_source/local".to_string()
}

fn default_large_file_threshold() -> u64 {
    50 * 1024 * 1024
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            public_root: default_public_root(),
            locator_prefix: default_locator_prefix(),
            large_file_threshold_bytes: default_large_file_threshold(),
        }
    }
}

/// Photo service upload settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UploadConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Album the video is added to
    #[serde(default)]
    pub album: Option<String>,
    /// Account selector for services with several linked accounts
    #[serde(default)]
    pub account: Option<String>,
    /// Upload command; `{file}`, `{album}` and `{account}` are substituted
    #[serde(default)]
    pub command: Vec<String>,
}

/// Status HTTP endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Verbose per-frame logging
    #[serde(default)]
    pub debug: bool,
    /// Tracing filter used when RUST_LOG is unset
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug: false,
            filter: default_filter(),
        }
    }
}

/// A camera the daemon can record from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    /// Source identifier, e.g. `camera.front_door`
    pub id: String,
    /// Still-image URL used by the primary transport
    #[serde(default)]
    pub snapshot_url: Option<String>,
    /// Stream URL used by the secondary transport
    #[serde(default)]
    pub stream_url: Option<String>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - TIMELAPSE_OUTPUT_ROOT -> capture.output_root
    /// - TIMELAPSE_MAX_CONCURRENT_TASKS -> tasks.max_concurrent_tasks
    /// - TIMELAPSE_ENCODER_THREADS -> encoder.threads
    /// - TIMELAPSE_ENCODER_TOOL -> encoder.tool
    /// - TIMELAPSE_UPLOAD_ENABLED -> upload.enabled
    /// - TIMELAPSE_DEBUG -> logging.debug
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("TIMELAPSE_OUTPUT_ROOT") {
            if !val.is_empty() {
                self.capture.output_root = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("TIMELAPSE_MAX_CONCURRENT_TASKS") {
            if let Ok(tasks) = val.parse::<u32>() {
                self.tasks.max_concurrent_tasks = tasks;
            }
        }

        if let Ok(val) = env::var("TIMELAPSE_ENCODER_THREADS") {
            if let Ok(threads) = val.parse::<u32>() {
                self.encoder.threads = threads;
            }
        }

        if let Ok(val) = env::var("TIMELAPSE_ENCODER_TOOL") {
            if !val.is_empty() {
                self.encoder.tool = val;
            }
        }

        // Accept "true", "1", "yes" / "false", "0", "no"; anything else keeps the existing value
        if let Ok(val) = env::var("TIMELAPSE_UPLOAD_ENABLED") {
            if let Some(enabled) = parse_bool(&val) {
                self.upload.enabled = enabled;
            }
        }

        if let Ok(val) = env::var("TIMELAPSE_DEBUG") {
            if let Some(debug) = parse_bool(&val) {
                self.logging.debug = debug;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        env::remove_var("TIMELAPSE_OUTPUT_ROOT");
        env::remove_var("TIMELAPSE_MAX_CONCURRENT_TASKS");
        env::remove_var("TIMELAPSE_ENCODER_THREADS");
        env::remove_var("TIMELAPSE_ENCODER_TOOL");
        env::remove_var("TIMELAPSE_UPLOAD_ENABLED");
        env::remove_var("TIMELAPSE_DEBUG");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            interval in 1u64..3600,
            duration in 1u64..10_000,
            retries in 1u32..10,
            threads in 0u32..16,
            batch_cap in 1usize..5000,
            max_tasks in 0u32..16,
            upload_enabled in proptest::bool::ANY,
            debug in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[capture]
default_interval_secs = {}
default_duration_mins = {}
max_retries = {}

[encoder]
threads = {}
batch_cap = {}

[tasks]
max_concurrent_tasks = {}

[upload]
enabled = {}

[logging]
debug = {}
"#,
                interval, duration, retries, threads, batch_cap, max_tasks, upload_enabled, debug
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.capture.default_interval_secs, interval);
            prop_assert_eq!(config.capture.default_duration_mins, duration);
            prop_assert_eq!(config.capture.max_retries, retries);
            prop_assert_eq!(config.encoder.threads, threads);
            prop_assert_eq!(config.encoder.batch_cap, batch_cap);
            prop_assert_eq!(config.tasks.max_concurrent_tasks, max_tasks);
            prop_assert_eq!(config.upload.enabled, upload_enabled);
            prop_assert_eq!(config.logging.debug, debug);
        }

        #[test]
        fn prop_env_overrides_max_concurrent_tasks(
            initial in 0u32..8,
            override_tasks in 0u32..16,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[tasks]\nmax_concurrent_tasks = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("TIMELAPSE_MAX_CONCURRENT_TASKS", override_tasks.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.tasks.max_concurrent_tasks, override_tasks);
        }

        #[test]
        fn prop_env_overrides_encoder_threads(
            initial in 0u32..8,
            override_threads in 0u32..16,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[encoder]\nthreads = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("TIMELAPSE_ENCODER_THREADS", override_threads.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.encoder.threads, override_threads);
        }

        #[test]
        fn prop_env_overrides_debug(
            initial in proptest::bool::ANY,
            override_debug in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[logging]\ndebug = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("TIMELAPSE_DEBUG", override_debug.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.logging.debug, override_debug);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.capture.default_interval_secs, 60);
        assert_eq!(config.capture.default_duration_mins, 1440);
        assert_eq!(config.capture.output_root, PathBuf::from("/config/timelapses"));
        assert_eq!(config.capture.max_retries, 3);
        assert!((config.capture.retry_base_delay_secs - 2.0).abs() < 1e-9);
        assert!((config.capture.retry_backoff - 1.5).abs() < 1e-9);
        assert_eq!(config.encoder.tool, "ffmpeg");
        assert_eq!(config.encoder.framerate, 30);
        assert_eq!(config.encoder.batch_cap, 1000);
        assert_eq!(config.tasks.max_concurrent_tasks, 0);
        assert!(config.tasks.cleanup_frames);
        assert!(!config.upload.enabled);
        assert!(!config.logging.debug);
        assert!(config.cameras.is_empty());
    }

    #[test]
    fn test_cameras_parse() {
        let toml_str = r#"
[[cameras]]
id = "camera.front"
snapshot_url = "http://cam.local/snap.jpg"

[[cameras]]
id = "camera.back"
stream_url = "rtsp://cam.local/stream"
"#;
        let config = Config::parse_toml(toml_str).expect("Cameras should parse");

        assert_eq!(config.cameras.len(), 2);
        let front = &config.cameras[0];
        assert_eq!(front.id, "camera.front");
        assert_eq!(front.snapshot_url.as_deref(), Some("http://cam.local/snap.jpg"));
        assert!(front.stream_url.is_none());
        assert_eq!(config.cameras[1].stream_url.as_deref(), Some("rtsp://cam.local/stream"));
    }

    #[test]
    fn test_invalid_bool_override_keeps_value() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::parse_toml("[upload]\nenabled = true\n").expect("Valid TOML");
        env::set_var("TIMELAPSE_UPLOAD_ENABLED", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(config.upload.enabled);
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let result = Config::parse_toml("[capture\nmax_retries = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
