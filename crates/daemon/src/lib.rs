//! Timelapse Daemon
//!
//! Background service that captures frames from cameras on an interval,
//! assembles them into videos, optionally uploads them, and publishes task status.

pub mod capture;
pub mod concurrency;
pub mod coordinator;
pub mod encode;
pub mod frame_store;
pub mod registry;
pub mod source;
pub mod startup;
pub mod status;
pub mod status_server;
pub mod task;
pub mod upload;

pub use timelapse_daemon_config as config;
pub use timelapse_daemon_config::Config;
pub use capture::{run_capture, CaptureJob, CaptureOutcome, RetryPolicy};
pub use concurrency::{derive_plan, ResourcePlan};
pub use coordinator::{configured_photo_service, Coordinator, CoordinatorError};
pub use encode::{locate_tool, EncodeError, Encoder, MediaPublisher};
pub use frame_store::{cleanup, create_directory, list_frames, sample_frames, write_frame};
pub use registry::{Finalizer, StartRequest, TaskError, TaskRegistry};
pub use source::{CameraSource, FfmpegGrabSource, HttpSnapshotSource, SourceError, SourceSet};
pub use startup::{run_startup_checks, StartupError, StartupReport};
pub use status::{build_snapshot, new_shared_status, SharedStatus, StatusSnapshot};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use task::{SourceStatus, Task, TaskStatus, TaskSummary, TaskTable};
pub use upload::{CommandUploader, PhotoService, UploadError, Uploader};
