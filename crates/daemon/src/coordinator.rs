//! Coordinator for the timelapse daemon
//!
//! Wires configuration, resource plan, task registry and status publication
//! together and exposes the four task operations to outer layers.

use crate::concurrency::{derive_plan, ResourcePlan};
use crate::config::{Config, ConfigError};
use crate::registry::{StartRequest, TaskError, TaskRegistry};
use crate::source::SourceSet;
use crate::startup::{run_startup_checks, StartupError};
use crate::status::{build_snapshot, new_shared_status, SharedStatus, StatusSnapshot};
use crate::status_server::{run_status_server, ServerError};
use crate::task::TaskSummary;
use crate::upload::{CommandUploader, PhotoService, Uploader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error type for coordinator operations
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Status server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Coordinator state containing all runtime components
pub struct Coordinator {
    /// Configuration loaded from file and environment
    pub config: Arc<Config>,
    /// Derived resource plan
    pub plan: ResourcePlan,
    registry: Arc<TaskRegistry>,
    status: SharedStatus,
}

impl Coordinator {
    /// Initialize the coordinator with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file and apply environment overrides
    /// 2. Run startup checks (encoding tool, output root)
    /// 3. Build the configured camera sources and upload service
    /// 4. Derive the resource plan and create the registry
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, CoordinatorError> {
        let config = Config::load(config_path)?;
        Self::with_config(config)
    }

    /// Initialize the coordinator with an existing configuration
    pub fn with_config(config: Config) -> Result<Self, CoordinatorError> {
        let report = run_startup_checks(&config)?;
        let sources = SourceSet::from_config(&config, report.tool_path);
        let photo_service = configured_photo_service(&config);
        Ok(Self::new_without_checks(config, sources, photo_service))
    }

    /// Initialize the coordinator without running startup checks
    ///
    /// Useful for testing when the encoding tool is not available.
    pub fn new_without_checks(
        config: Config,
        sources: SourceSet,
        photo_service: Option<Arc<dyn PhotoService>>,
    ) -> Self {
        let plan = derive_plan(&config);
        let uploader = Uploader::new(photo_service, &config.upload);
        let config = Arc::new(config);
        let registry = Arc::new(TaskRegistry::new(config.clone(), &plan, sources, uploader));

        tracing::info!(
            cores = plan.total_cores,
            encoder_threads = plan.encoder_threads,
            max_concurrent_tasks = plan.max_concurrent_tasks,
            "Resource plan derived"
        );

        Self {
            config,
            plan,
            registry,
            status: new_shared_status(),
        }
    }

    /// Get the shared status
    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Start a capture and publish the new state
    pub async fn start(&self, request: StartRequest) -> Result<String, TaskError> {
        let result = self.registry.start(request).await;
        self.refresh().await;
        result
    }

    /// Stop a capture, finalize it and publish the new state
    pub async fn stop(&self, source_id: &str, task_id: Option<&str>) -> Result<(), TaskError> {
        let result = self.registry.stop(source_id, task_id).await;
        self.refresh().await;
        result
    }

    pub async fn list(&self) -> Vec<TaskSummary> {
        self.registry.list().await
    }

    /// Delete a task and publish the new state
    pub async fn delete(&self, task_id: &str) -> Result<(), TaskError> {
        let result = self.registry.delete(task_id).await;
        self.refresh().await;
        result
    }

    /// Rebuild the published snapshot from the task table
    pub async fn refresh(&self) -> StatusSnapshot {
        publish(&self.registry, &self.status).await
    }

    /// Start the status refresh task
    ///
    /// Periodically rebuilds the snapshot so capture progress is visible
    /// between operations.
    pub fn start_status_publisher(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let status = self.status.clone();
        let period = Duration::from_secs(self.config.tasks.refresh_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                publish(&registry, &status).await;
                tokio::time::sleep(period).await;
            }
        })
    }

    /// Start the status HTTP server
    ///
    /// Spawns the HTTP server as a background task.
    pub fn start_status_server(&self) -> tokio::task::JoinHandle<()> {
        let status = self.status.clone();
        let bind = self.config.server.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = run_status_server(status, &bind).await {
                tracing::error!(error = %e, "Status server stopped");
            }
        })
    }

    /// Cancel all captures without finalizing them
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        self.refresh().await;
    }

    /// Run the coordinator with all background tasks until Ctrl-C
    pub async fn run_with_server(&self) -> Result<(), CoordinatorError> {
        let server = self.start_status_server();
        let publisher = self.start_status_publisher();

        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutting down");

        self.shutdown().await;
        publisher.abort();
        server.abort();
        Ok(())
    }
}

/// Command-based upload service, when uploads are enabled and a command is set
pub fn configured_photo_service(config: &Config) -> Option<Arc<dyn PhotoService>> {
    if !config.upload.enabled {
        return None;
    }
    if config.upload.command.is_empty() {
        tracing::warn!("Uploads enabled but no upload command configured");
        return None;
    }
    Some(Arc::new(CommandUploader::new(config.upload.command.clone())))
}

async fn publish(registry: &TaskRegistry, status: &SharedStatus) -> StatusSnapshot {
    let tasks = registry.tasks().list().await;
    let snapshot = build_snapshot(
        &tasks,
        registry.running_count().await,
        registry.max_concurrent_tasks(),
    );
    *status.write().await = snapshot.clone();
    snapshot
}
