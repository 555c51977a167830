//! Read-only (plus two actions) HTTP API over the supervisor, for the
//! optional admin UI. Every handler only ever calls into
//! [`ProcessSupervisor`] query/action methods -- it never reaches into
//! supervisor internals directly.

use crate::record::{ProcessRecord, ProcessStatus};
use crate::supervisor::{ListFilters, LogsFilter, ProcessSupervisor};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Clone)]
struct AdminState {
    supervisor: Arc<ProcessSupervisor>,
}

/// Build the admin router. Mounted by the caller under whatever
/// `url_prefix` the CLI was given.
pub fn router(supervisor: Arc<ProcessSupervisor>) -> Router {
    let state = AdminState { supervisor };
    Router::new()
        .route("/api/processes", get(list_processes))
        .route("/api/process/:pid", get(get_process))
        .route("/api/process/:pid/output", get(get_output))
        .route("/api/process/:pid/stop", post(stop_process))
        .route("/api/process/:pid/clean", post(clean_process))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ProcessJson {
    pid: u64,
    status: &'static str,
    command: Vec<String>,
    directory: String,
    description: String,
    labels: Vec<String>,
    start_time: f64,
    end_time: Option<f64>,
    exit_code: Option<i32>,
    error_message: Option<String>,
}

fn status_name(status: ProcessStatus) -> &'static str {
    match status {
        ProcessStatus::Running => "running",
        ProcessStatus::Completed => "completed",
        ProcessStatus::Failed => "failed",
        ProcessStatus::Terminated => "terminated",
        ProcessStatus::Error => "error",
    }
}

fn to_unix_secs(ts: SystemTime) -> f64 {
    ts.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl From<&ProcessRecord> for ProcessJson {
    fn from(record: &ProcessRecord) -> Self {
        Self {
            pid: record.pid,
            status: status_name(record.status),
            command: record.command.clone(),
            directory: record.directory.clone(),
            description: record.description.clone(),
            labels: record.labels.clone(),
            start_time: to_unix_secs(record.start_time),
            end_time: record.end_time.map(to_unix_secs),
            exit_code: record.exit_code,
            error_message: record.error_message.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

fn parse_status(name: &str) -> Option<ProcessStatus> {
    match name {
        "running" => Some(ProcessStatus::Running),
        "completed" => Some(ProcessStatus::Completed),
        "failed" => Some(ProcessStatus::Failed),
        "terminated" => Some(ProcessStatus::Terminated),
        "error" => Some(ProcessStatus::Error),
        _ => None,
    }
}

async fn list_processes(
    State(state): State<AdminState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let status = match query.status.as_deref() {
        None => None,
        Some(name) => match parse_status(name) {
            Some(s) => Some(s),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": format!("unknown status: {name}") })),
                )
                    .into_response();
            }
        },
    };
    let records = state
        .supervisor
        .list(&ListFilters { labels: None, status })
        .await;
    let json: Vec<ProcessJson> = records.iter().map(ProcessJson::from).collect();
    Json(json).into_response()
}

async fn get_process(State(state): State<AdminState>, Path(pid): Path<u64>) -> impl IntoResponse {
    let records = state.supervisor.list(&ListFilters::default()).await;
    match records.iter().find(|r| r.pid == pid) {
        Some(record) => Json(ProcessJson::from(record)).into_response(),
        None => not_found(pid),
    }
}

#[derive(Debug, Deserialize)]
struct OutputQuery {
    tail: Option<usize>,
    stderr: Option<bool>,
}

async fn get_output(
    State(state): State<AdminState>,
    Path(pid): Path<u64>,
    Query(query): Query<OutputQuery>,
) -> impl IntoResponse {
    let with_stderr = query.stderr.unwrap_or(false);
    let filter = LogsFilter {
        tail: query.tail.unwrap_or(0),
        with_stdout: !with_stderr,
        with_stderr,
        follow_seconds: 0,
        ..LogsFilter::default()
    };
    match state.supervisor.logs(pid, &filter).await {
        Ok(result) => Json(serde_json::json!({
            "header": result.header,
            "stdout": result.stdout_block,
            "stderr": result.stderr_block,
        }))
        .into_response(),
        Err(_) => not_found(pid),
    }
}

async fn stop_process(State(state): State<AdminState>, Path(pid): Path<u64>) -> impl IntoResponse {
    match state.supervisor.stop(pid, false).await {
        Ok(()) => Json(serde_json::json!({ "pid": pid, "stop_requested": true })).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn clean_process(State(state): State<AdminState>, Path(pid): Path<u64>) -> impl IntoResponse {
    let outcomes = state.supervisor.clean(&[pid]).await;
    let outcome = outcomes.get(&pid).map(|o| format!("{o:?}")).unwrap_or_default();
    Json(serde_json::json!({ "pid": pid, "outcome": outcome })).into_response()
}

fn not_found(pid: u64) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("Process {pid} not found") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::supervisor::StartSpec;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn config() -> Config {
        Config {
            allowed_commands: ["echo"].into_iter().map(String::from).collect(),
            process_retention_seconds: 3600,
            default_encoding: "utf-8".to_string(),
            shell_path: "/bin/sh".to_string(),
        }
    }

    fn start_spec() -> StartSpec {
        StartSpec {
            command: vec!["echo".to_string(), "hi".to_string()],
            directory: "/tmp".to_string(),
            description: "admin test".to_string(),
            labels: vec![],
            stdin: None,
            envs: HashMap::new(),
            encoding: None,
            timeout: None,
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unknown_pid_is_not_found() {
        let supervisor = Arc::new(ProcessSupervisor::new(config()));
        let app = router(supervisor);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/process/999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_and_detail_round_trip() {
        let supervisor = Arc::new(ProcessSupervisor::new(config()));
        let pid = supervisor.start(start_spec()).await.unwrap();
        let app = router(supervisor);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/processes")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/process/{pid}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["pid"], pid);
    }

    #[tokio::test]
    async fn stop_unknown_pid_is_bad_request() {
        let supervisor = Arc::new(ProcessSupervisor::new(config()));
        let app = router(supervisor);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/process/42/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
