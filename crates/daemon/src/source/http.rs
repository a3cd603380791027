//! Still-image capture over HTTP snapshot URLs.

use super::{CameraSource, SourceError};
use crate::config::CameraConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Timeout for the availability probe.
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(3);

/// Fetches JPEG snapshots from each camera's `snapshot_url`.
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    urls: HashMap<String, String>,
}

impl HttpSnapshotSource {
    pub fn new(cameras: &[CameraConfig]) -> Self {
        let urls = cameras
            .iter()
            .filter_map(|c| c.snapshot_url.as_ref().map(|url| (c.id.clone(), url.clone())))
            .collect();
        Self {
            client: reqwest::Client::new(),
            urls,
        }
    }
}

#[async_trait]
impl CameraSource for HttpSnapshotSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn exists(&self, source_id: &str) -> bool {
        self.urls.contains_key(source_id)
    }

    /// Any HTTP response counts as reachable; some cameras reject HEAD.
    async fn is_available(&self, source_id: &str) -> bool {
        let Some(url) = self.urls.get(source_id) else {
            return false;
        };
        match self
            .client
            .head(url)
            .timeout(AVAILABILITY_TIMEOUT)
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(source_id, error = %e, "Snapshot URL unreachable");
                false
            }
        }
    }

    async fn get_image(&self, source_id: &str, timeout: Duration) -> Result<Vec<u8>, SourceError> {
        let url = self
            .urls
            .get(source_id)
            .ok_or_else(|| SourceError::NotFound(source_id.to_string()))?;

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Timeout(timeout)
                } else {
                    SourceError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!(
                "{} answered HTTP {}",
                source_id, status
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        if bytes.is_empty() {
            return Err(SourceError::Empty);
        }
        Ok(bytes.to_vec())
    }
}
