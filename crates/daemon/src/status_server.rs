//! Status HTTP server for the timelapse daemon
//!
//! Exposes the published snapshot for dashboards and scripts.

use axum::{extract::State, routing::get, Json, Router};
use thiserror::Error;

use crate::status::{SharedStatus, StatusSnapshot};
use crate::task::TaskSummary;

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Status server failed: {0}")]
    Serve(#[from] std::io::Error),
}

/// Handler for GET /status
async fn get_status(State(status): State<SharedStatus>) -> Json<StatusSnapshot> {
    let snapshot = status.read().await.clone();
    Json(snapshot)
}

/// Handler for GET /tasks
async fn get_tasks(State(status): State<SharedStatus>) -> Json<Vec<TaskSummary>> {
    Json(status.read().await.tasks.clone())
}

/// Creates the axum Router with the status endpoints
pub fn create_status_router(status: SharedStatus) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/tasks", get(get_tasks))
        .with_state(status)
}

/// Runs the status HTTP server on `bind` until it fails.
pub async fn run_status_server(status: SharedStatus, bind: &str) -> Result<(), ServerError> {
    let app = create_status_router(status);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    tracing::info!(addr = bind, "Status server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{build_snapshot, new_shared_status};
    use crate::task::{Task, TaskStatus};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn seeded_status() -> SharedStatus {
        let status = new_shared_status();
        let mut task = Task::new(
            "task-001".to_string(),
            "camera.front".to_string(),
            Duration::from_secs(60),
            Duration::from_secs(3600),
            PathBuf::from("/config/timelapses/timelapse_front"),
            PathBuf::from("/config/timelapses/timelapse_front.mp4"),
        );
        task.record_progress(12, Duration::from_secs(720));
        *status.write().await = build_snapshot(&[task], 1, 2);
        status
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .expect("should have content-type header")
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.contains("application/json"));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_get_status_returns_snapshot() {
        let status = seeded_status().await;
        let (code, json) = get_json(create_status_router(status.clone()), "/status").await;

        assert_eq!(code, StatusCode::OK);
        let snapshot: StatusSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(snapshot, *status.read().await);
        let front = &snapshot.sources["camera.front"];
        assert_eq!(front.status, TaskStatus::Recording);
        assert_eq!(front.frames_captured, 12);
        assert_eq!(front.progress, 20);
        assert_eq!(front.time_remaining, 2880);
    }

    #[tokio::test]
    async fn test_get_tasks_returns_list() {
        let status = seeded_status().await;
        let (code, json) = get_json(create_status_router(status), "/tasks").await;

        assert_eq!(code, StatusCode::OK);
        let tasks: Vec<TaskSummary> = serde_json::from_value(json).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id, "task-001");
        assert_eq!(tasks[0].output_file, "/config/timelapses/timelapse_front.mp4");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = create_status_router(new_shared_status());
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
