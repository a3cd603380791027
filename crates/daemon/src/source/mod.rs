//! Camera source access.
//!
//! Image acquisition is delegated to [`CameraSource`] implementations. A
//! [`SourceSet`] pairs a primary transport with an optional secondary one that
//! is only consulted when the caller allows the fallback.

pub mod ffmpeg;
pub mod http;

pub use ffmpeg::FfmpegGrabSource;
pub use http::HttpSnapshotSource;

use crate::config::Config;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by camera sources.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source identifier is not known to the transport.
    #[error("Source not found: {0}")]
    NotFound(String),

    /// The source exists but cannot currently deliver images.
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    /// The request did not complete in time.
    #[error("Image request timed out after {0:?}")]
    Timeout(Duration),

    /// The source answered with no image data.
    #[error("Source returned an empty image")]
    Empty,

    /// Transport-level failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// A transport able to fetch still images from cameras.
#[async_trait]
pub trait CameraSource: Send + Sync {
    /// Short transport name used in logs.
    fn name(&self) -> &str;

    /// Whether the transport knows `source_id` at all.
    async fn exists(&self, source_id: &str) -> bool;

    /// Whether the source is currently reachable.
    async fn is_available(&self, source_id: &str) -> bool;

    /// Fetch one image. Implementations should give up after `timeout`.
    async fn get_image(&self, source_id: &str, timeout: Duration) -> Result<Vec<u8>, SourceError>;
}

/// Primary transport plus an optional fallback, tried in that order.
#[derive(Clone)]
pub struct SourceSet {
    primary: Arc<dyn CameraSource>,
    secondary: Option<Arc<dyn CameraSource>>,
}

impl std::fmt::Debug for SourceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSet")
            .field("primary", &self.primary.name())
            .field("secondary", &self.secondary.as_ref().map(|s| s.name().to_string()))
            .finish()
    }
}

impl SourceSet {
    pub fn new(primary: Arc<dyn CameraSource>) -> Self {
        Self {
            primary,
            secondary: None,
        }
    }

    pub fn with_secondary(mut self, secondary: Arc<dyn CameraSource>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    /// Build the HTTP snapshot / stream-grab pair from the configured cameras.
    pub fn from_config(config: &Config, encoder_tool: PathBuf) -> Self {
        let set = Self::new(Arc::new(HttpSnapshotSource::new(&config.cameras)));
        if config.cameras.iter().any(|c| c.stream_url.is_some()) {
            set.with_secondary(Arc::new(FfmpegGrabSource::new(encoder_tool, &config.cameras)))
        } else {
            set
        }
    }

    pub async fn exists(&self, source_id: &str) -> bool {
        if self.primary.exists(source_id).await {
            return true;
        }
        match &self.secondary {
            Some(secondary) => secondary.exists(source_id).await,
            None => false,
        }
    }

    pub async fn is_available(&self, source_id: &str) -> bool {
        if self.primary.is_available(source_id).await {
            return true;
        }
        match &self.secondary {
            Some(secondary) => secondary.is_available(source_id).await,
            None => false,
        }
    }

    /// Fetch one image with `timeout` per transport attempt.
    ///
    /// The secondary transport is only tried when `allow_fallback` is set and
    /// the primary failed.
    pub async fn fetch(
        &self,
        source_id: &str,
        timeout: Duration,
        allow_fallback: bool,
    ) -> Result<Vec<u8>, SourceError> {
        let primary_err = match fetch_from(self.primary.as_ref(), source_id, timeout).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) => e,
        };

        match (&self.secondary, allow_fallback) {
            (Some(secondary), true) => {
                tracing::debug!(
                    source_id,
                    primary = self.primary.name(),
                    secondary = secondary.name(),
                    error = %primary_err,
                    "Primary transport failed, trying secondary"
                );
                fetch_from(secondary.as_ref(), source_id, timeout).await
            }
            _ => Err(primary_err),
        }
    }
}

async fn fetch_from(
    source: &dyn CameraSource,
    source_id: &str,
    timeout: Duration,
) -> Result<Vec<u8>, SourceError> {
    let bytes = tokio::time::timeout(timeout, source.get_image(source_id, timeout))
        .await
        .map_err(|_| SourceError::Timeout(timeout))??;
    if bytes.is_empty() {
        return Err(SourceError::Empty);
    }
    Ok(bytes)
}

/// Scripted in-memory source used by the daemon's tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub struct ScriptedSource {
        name: String,
        ids: Vec<String>,
        available: AtomicBool,
        script: Mutex<VecDeque<Result<Vec<u8>, ()>>>,
        fallback: Result<Vec<u8>, ()>,
        pub calls: AtomicUsize,
    }

    impl ScriptedSource {
        /// Always returns `bytes`.
        pub fn healthy(ids: &[&str], bytes: &[u8]) -> Self {
            Self::build(ids, Ok(bytes.to_vec()))
        }

        /// Always fails.
        pub fn failing(ids: &[&str]) -> Self {
            Self::build(ids, Err(()))
        }

        fn build(ids: &[&str], fallback: Result<Vec<u8>, ()>) -> Self {
            Self {
                name: "scripted".to_string(),
                ids: ids.iter().map(|s| s.to_string()).collect(),
                available: AtomicBool::new(true),
                script: Mutex::new(VecDeque::new()),
                fallback,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn named(mut self, name: &str) -> Self {
            self.name = name.to_string();
            self
        }

        /// Queue responses consumed before the fallback behavior applies.
        pub fn with_script(self, script: Vec<Result<Vec<u8>, ()>>) -> Self {
            *self.script.lock().unwrap() = script.into();
            self
        }

        pub fn set_available(&self, available: bool) {
            self.available.store(available, Ordering::SeqCst);
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CameraSource for ScriptedSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn exists(&self, source_id: &str) -> bool {
            self.ids.iter().any(|id| id == source_id)
        }

        async fn is_available(&self, source_id: &str) -> bool {
            self.exists(source_id).await && self.available.load(Ordering::SeqCst)
        }

        async fn get_image(
            &self,
            source_id: &str,
            _timeout: Duration,
        ) -> Result<Vec<u8>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.exists(source_id).await {
                return Err(SourceError::NotFound(source_id.to_string()));
            }
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            next.map_err(|_| SourceError::Unavailable(source_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedSource;
    use super::*;

    #[tokio::test]
    async fn test_fetch_uses_primary_first() {
        let primary = Arc::new(ScriptedSource::healthy(&["camera.front"], b"primary"));
        let secondary = Arc::new(ScriptedSource::healthy(&["camera.front"], b"secondary"));
        let set = SourceSet::new(primary.clone()).with_secondary(secondary.clone());

        let bytes = set
            .fetch("camera.front", Duration::from_secs(1), true)
            .await
            .unwrap();

        assert_eq!(bytes, b"primary");
        assert_eq!(secondary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_falls_back_only_when_allowed() {
        let primary = Arc::new(ScriptedSource::failing(&["camera.front"]));
        let secondary = Arc::new(ScriptedSource::healthy(&["camera.front"], b"secondary"));
        let set = SourceSet::new(primary.clone()).with_secondary(secondary.clone());

        let denied = set.fetch("camera.front", Duration::from_secs(1), false).await;
        assert!(matches!(denied, Err(SourceError::Unavailable(_))));
        assert_eq!(secondary.call_count(), 0);

        let allowed = set
            .fetch("camera.front", Duration::from_secs(1), true)
            .await
            .unwrap();
        assert_eq!(allowed, b"secondary");
        assert_eq!(primary.call_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_image_is_an_error() {
        let set = SourceSet::new(Arc::new(ScriptedSource::healthy(&["camera.front"], b"")));
        let result = set.fetch("camera.front", Duration::from_secs(1), false).await;
        assert!(matches!(result, Err(SourceError::Empty)));
    }

    #[tokio::test]
    async fn test_exists_checks_both_transports() {
        let set = SourceSet::new(Arc::new(ScriptedSource::healthy(&["camera.front"], b"x")))
            .with_secondary(Arc::new(ScriptedSource::healthy(&["camera.back"], b"x")));

        assert!(set.exists("camera.front").await);
        assert!(set.exists("camera.back").await);
        assert!(!set.exists("camera.missing").await);
    }
}
