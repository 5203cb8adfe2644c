//! HTTP route handlers mapping onto `RunnerHandle` operations.

use agentrun::coordinator::PendingAmendments;
use agentrun::error::RunError;
use agentrun::io::artifacts::{RunFileText, validate_run_file_name};
use agentrun::io::trace::validate_run_id;
use agentrun::queue::{ResultView, Task, TaskConfig, TaskPatch};
use agentrun::status::{ActivityPage, SourcesView, StatusView};
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::state::AppState;

const DEFAULT_ACTIVITY_LIMIT: usize = 200;
const DEFAULT_RUNS_LIMIT: usize = 200;
const MAX_RUNS_LIMIT: usize = 2000;
const DEFAULT_FILE_BYTES: usize = 200_000;
const MIN_FILE_BYTES: usize = 1_000;
const MAX_FILE_BYTES: usize = 5_000_000;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/query", post(post_query))
        .route("/result/{uid}", get(get_result))
        .route("/status", get(get_status))
        .route("/activity", get(get_activity))
        .route("/sources", get(get_sources))
        .route("/queue", get(get_queue))
        .route("/queue/{uid}", put(put_queue_task).delete(delete_queue_task))
        .route("/tasks", get(get_tasks))
        .route("/amend", post(post_amend))
        .route("/pause", post(post_pause))
        .route("/resume", post(post_resume))
        .route("/new_run", post(post_new_run))
        .route("/amendments", get(get_amendments))
        .route("/runs", get(get_runs))
        .route("/run_files", get(get_run_files))
        .route("/run_file_text", get(get_run_file_text))
        .route("/sources_upload", post(post_sources_upload))
}

/// JSON error body `{"error": ...}` with a matching status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(err: &anyhow::Error) -> Self {
        warn!(err = %format!("{err:#}"), "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        let status = match err {
            RunError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            RunError::InvalidState { .. } => StatusCode::CONFLICT,
            RunError::NoActiveRun => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run disk-touching handle work on the blocking pool so async workers stay free.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ApiError::internal(&anyhow::Error::new(err)))?
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    query: String,
    #[serde(default)]
    config: TaskConfig,
}

#[derive(Debug, Serialize)]
struct Submitted {
    uid: String,
}

/// POST /api/query - enqueue a goal.
async fn post_query(
    State(state): State<AppState>,
    Json(body): Json<QueryBody>,
) -> ApiResult<Submitted> {
    let query = body.query.trim();
    if query.is_empty() {
        return Err(ApiError::bad_request("query must not be empty"));
    }
    let uid = state.handle.submit(query, body.config);
    info!(uid = %uid, "query submitted");
    Ok(Json(Submitted { uid }))
}

/// GET /api/result/{uid} - poll one task.
async fn get_result(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> ApiResult<ResultView> {
    Ok(Json(state.handle.result(&uid)?))
}

/// GET /api/status - published snapshot of the live run.
async fn get_status(State(state): State<AppState>) -> Json<StatusView> {
    Json(state.handle.status())
}

#[derive(Debug, Default, Deserialize)]
struct ActivityParams {
    #[serde(default)]
    since_id: u64,
    limit: Option<usize>,
    run_id: Option<String>,
}

/// GET /api/activity - trace events after a cursor.
async fn get_activity(
    State(state): State<AppState>,
    Query(params): Query<ActivityParams>,
) -> ApiResult<ActivityPage> {
    check_run_id(params.run_id.as_deref())?;
    let limit = params.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
    blocking(move || {
        state
            .handle
            .activity(params.run_id.as_deref(), params.since_id, limit)
            .map(Json)
            .map_err(|err| ApiError::internal(&err))
    })
    .await
}

#[derive(Debug, Default, Deserialize)]
struct SourcesParams {
    run_id: Option<String>,
}

/// GET /api/sources - aggregated sources of a run.
async fn get_sources(
    State(state): State<AppState>,
    Query(params): Query<SourcesParams>,
) -> ApiResult<SourcesView> {
    check_run_id(params.run_id.as_deref())?;
    blocking(move || {
        state
            .handle
            .sources(params.run_id.as_deref())
            .map(Json)
            .map_err(|err| ApiError::internal(&err))
    })
    .await
}

#[derive(Debug, Deserialize)]
struct SourcesUpload {
    run_id: String,
    sources_json: String,
}

/// POST /api/sources_upload - merge an exported source list into a run.
async fn post_sources_upload(
    State(state): State<AppState>,
    Json(body): Json<SourcesUpload>,
) -> ApiResult<Value> {
    let run_id = body.run_id.trim().to_string();
    validate_run_id(&run_id).map_err(|err| ApiError::bad_request(err.to_string()))?;
    let view: SourcesView = serde_json::from_str(&body.sources_json)
        .map_err(|err| ApiError::bad_request(format!("invalid sources_json: {err}")))?;
    let (run_id, summary) = blocking(move || {
        state
            .handle
            .import_sources(&run_id, &view)
            .map(|summary| (run_id, summary))
            .map_err(|err| ApiError::internal(&err))
    })
    .await?;
    info!(run_id = %run_id, added = summary.added, "sources imported");
    Ok(Json(json!({
        "ok": true,
        "run_id": run_id,
        "added": summary.added,
        "total": summary.total,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct RunsParams {
    limit: Option<usize>,
}

/// GET /api/runs - most recent run directories, oldest first.
async fn get_runs(
    State(state): State<AppState>,
    Query(params): Query<RunsParams>,
) -> ApiResult<Value> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_RUNS_LIMIT)
        .clamp(1, MAX_RUNS_LIMIT);
    let runs = blocking(move || {
        state
            .handle
            .runs(limit)
            .map_err(|err| ApiError::internal(&err))
    })
    .await?;
    Ok(Json(json!({ "runs": runs })))
}

#[derive(Debug, Deserialize)]
struct RunFilesParams {
    run_id: String,
}

/// GET /api/run_files - readable files of one run.
async fn get_run_files(
    State(state): State<AppState>,
    Query(params): Query<RunFilesParams>,
) -> ApiResult<Value> {
    validate_run_id(&params.run_id).map_err(|err| ApiError::bad_request(err.to_string()))?;
    let run_id = params.run_id.clone();
    let files = blocking(move || {
        state
            .handle
            .run_files(&params.run_id)
            .map_err(|err| ApiError::internal(&err))
    })
    .await?
    .ok_or_else(|| ApiError::not_found(format!("run {run_id} not found")))?;
    Ok(Json(json!({ "run_id": run_id, "files": files })))
}

#[derive(Debug, Deserialize)]
struct RunFileTextParams {
    run_id: String,
    file: String,
    max_bytes: Option<usize>,
}

/// GET /api/run_file_text - text of one run file, capped at `max_bytes`.
async fn get_run_file_text(
    State(state): State<AppState>,
    Query(params): Query<RunFileTextParams>,
) -> ApiResult<RunFileText> {
    validate_run_id(&params.run_id).map_err(|err| ApiError::bad_request(err.to_string()))?;
    validate_run_file_name(&params.file).map_err(|err| ApiError::bad_request(err.to_string()))?;
    let max_bytes = params
        .max_bytes
        .unwrap_or(DEFAULT_FILE_BYTES)
        .clamp(MIN_FILE_BYTES, MAX_FILE_BYTES);
    let missing = format!("file {} not found in run {}", params.file, params.run_id);
    blocking(move || {
        state
            .handle
            .run_file_text(&params.run_id, &params.file, max_bytes)
            .map_err(|err| ApiError::internal(&err))
    })
    .await?
    .map(Json)
    .ok_or_else(|| ApiError::not_found(missing))
}

/// GET /api/amendments - amendments not yet applied to the live run.
async fn get_amendments(State(state): State<AppState>) -> Json<PendingAmendments> {
    Json(state.handle.pending_amendments())
}

/// GET /api/queue - tasks still waiting, in order.
async fn get_queue(State(state): State<AppState>) -> Json<Vec<Task>> {
    Json(state.handle.queued())
}

/// GET /api/tasks - every retained task.
async fn get_tasks(State(state): State<AppState>) -> Json<Vec<Task>> {
    Json(state.handle.list())
}

/// PUT /api/queue/{uid} - edit a queued task.
async fn put_queue_task(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(patch): Json<TaskPatch>,
) -> ApiResult<Task> {
    if patch.query.as_deref().is_some_and(|query| query.trim().is_empty()) {
        return Err(ApiError::bad_request("query must not be empty"));
    }
    Ok(Json(state.handle.update(&uid, patch)?))
}

/// DELETE /api/queue/{uid} - drop a queued task.
async fn delete_queue_task(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> ApiResult<Value> {
    state.handle.delete(&uid)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct AmendBody {
    text: String,
}

/// POST /api/amend - add user text to the live plan.
async fn post_amend(
    State(state): State<AppState>,
    Json(body): Json<AmendBody>,
) -> ApiResult<Value> {
    let text = body.text.trim();
    if text.is_empty() {
        return Err(ApiError::bad_request("text must not be empty"));
    }
    state.handle.amend(text)?;
    Ok(Json(json!({ "ok": true })))
}

async fn post_pause(State(state): State<AppState>) -> Json<Value> {
    state.handle.pause();
    Json(json!({ "ok": true }))
}

async fn post_resume(State(state): State<AppState>) -> Json<Value> {
    state.handle.resume();
    Json(json!({ "ok": true }))
}

/// POST /api/new_run - cancel the live run and start a fresh session.
async fn post_new_run(State(state): State<AppState>) -> Json<Value> {
    let session_id = state.handle.new_run();
    Json(json!({ "ok": true, "session_id": session_id }))
}

fn check_run_id(run_id: Option<&str>) -> Result<(), ApiError> {
    match run_id {
        Some(run_id) => {
            validate_run_id(run_id).map_err(|err| ApiError::bad_request(err.to_string()))
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrun::agents::Collaborators;
    use agentrun::coordinator::Coordinator;
    use agentrun::core::types::TaskStatus;
    use agentrun::test_support::{ScriptedAgent, ScriptedJudge, StaticPlanner, test_config};

    struct Fixture {
        _temp: tempfile::TempDir,
        coordinator: Coordinator,
        state: AppState,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let collaborators = Collaborators::new(
            StaticPlanner::new(&[("search", "web")]),
            ScriptedJudge::accept_all(),
        )
        .with_agent("web", ScriptedAgent::always("found it"));
        let coordinator =
            Coordinator::new(test_config(temp.path()), collaborators).expect("coordinator");
        let state = AppState::new(coordinator.handle());
        Fixture {
            _temp: temp,
            coordinator,
            state,
        }
    }

    fn query(text: &str) -> Json<QueryBody> {
        Json(QueryBody {
            query: text.to_string(),
            config: TaskConfig::default(),
        })
    }

    #[tokio::test]
    async fn query_then_result_reports_queued() {
        let fx = fixture();
        let Json(submitted) = post_query(State(fx.state.clone()), query("find cafes"))
            .await
            .expect("submit");

        let Json(result) = get_result(State(fx.state.clone()), Path(submitted.uid.clone()))
            .await
            .expect("result");
        assert_eq!(result.status, TaskStatus::Queued);

        let Json(status) = get_status(State(fx.state.clone())).await;
        assert_eq!(status.queue_length, 1);
        let Json(queue) = get_queue(State(fx.state)).await;
        assert_eq!(queue[0].uid, submitted.uid);
    }

    #[tokio::test]
    async fn empty_query_is_bad_request() {
        let fx = fixture();
        let err = post_query(State(fx.state), query("   ")).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_uid_is_not_found() {
        let fx = fixture();
        let err = get_result(State(fx.state), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn editing_finished_task_conflicts() {
        let fx = fixture();
        let Json(submitted) = post_query(State(fx.state.clone()), query("find cafes"))
            .await
            .expect("submit");
        fx.coordinator.run_once().expect("run").expect("report");

        let err = delete_queue_task(State(fx.state.clone()), Path(submitted.uid.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let Json(result) = get_result(State(fx.state.clone()), Path(submitted.uid))
            .await
            .expect("result");
        assert_eq!(result.answer.as_deref(), Some("found it"));

        let Json(page) = get_activity(
            State(fx.state),
            Query(ActivityParams {
                limit: Some(1),
                ..ActivityParams::default()
            }),
        )
        .await
        .expect("activity");
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].event_kind, "run_started");
    }

    #[tokio::test]
    async fn amend_without_run_is_bad_request() {
        let fx = fixture();
        let err = post_amend(
            State(fx.state),
            Json(AmendBody {
                text: "also prices".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("no active run"));
    }

    #[tokio::test]
    async fn bad_run_id_is_rejected() {
        let fx = fixture();
        let err = get_sources(
            State(fx.state),
            Query(SourcesParams {
                run_id: Some("../etc".to_string()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    fn finished_run(fx: &Fixture) -> String {
        fx.state.handle.submit("find cafes", TaskConfig::default());
        fx.coordinator.run_once().expect("run").expect("report");
        fx.state.handle.runs(1).expect("runs")[0].run_id.clone()
    }

    /// Verifies finished run artifacts are listed and readable over the API.
    #[tokio::test]
    async fn run_files_are_browsable() {
        let fx = fixture();
        let run_id = finished_run(&fx);

        let Json(body) = get_runs(State(fx.state.clone()), Query(RunsParams { limit: Some(0) }))
            .await
            .expect("runs");
        assert_eq!(body["runs"][0]["run_id"], run_id.as_str());

        let Json(body) = get_run_files(
            State(fx.state.clone()),
            Query(RunFilesParams {
                run_id: run_id.clone(),
            }),
        )
        .await
        .expect("files");
        let names: Vec<&str> = body["files"]
            .as_array()
            .expect("files")
            .iter()
            .filter_map(|file| file["name"].as_str())
            .collect();
        assert!(names.contains(&"answer.md"));

        let Json(text) = get_run_file_text(
            State(fx.state.clone()),
            Query(RunFileTextParams {
                run_id: run_id.clone(),
                file: "answer.md".to_string(),
                max_bytes: None,
            }),
        )
        .await
        .expect("text");
        assert!(text.content.contains("found it"));
        assert!(!text.truncated);

        let err = get_run_files(
            State(fx.state.clone()),
            Query(RunFilesParams {
                run_id: "run-unknown".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = get_run_file_text(
            State(fx.state),
            Query(RunFileTextParams {
                run_id,
                file: "../config.toml".to_string(),
                max_bytes: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    /// Verifies exported sources merge into a finished run and bad payloads are rejected.
    #[tokio::test]
    async fn sources_upload_merges_into_run() {
        let fx = fixture();
        let run_id = finished_run(&fx);
        let exported = r#"{
            "run_id": "elsewhere",
            "updated_at": null,
            "sources": [{
                "normalized_url": "https://cafes.example/menu",
                "url": "https://cafes.example/menu",
                "title": "Menu",
                "evidence_quotes": [],
                "screenshot_paths": [],
                "seen_in_steps": [],
                "agents": [],
                "visits": 1,
                "first_seen": "2026-01-01T00:00:00Z",
                "last_seen": "2026-01-01T00:00:00Z"
            }]
        }"#;

        let Json(body) = post_sources_upload(
            State(fx.state.clone()),
            Json(SourcesUpload {
                run_id: run_id.clone(),
                sources_json: exported.to_string(),
            }),
        )
        .await
        .expect("upload");
        assert_eq!(body["added"], 1);
        assert_eq!(body["total"], 1);

        let Json(view) = get_sources(
            State(fx.state.clone()),
            Query(SourcesParams {
                run_id: Some(run_id.clone()),
            }),
        )
        .await
        .expect("sources");
        assert_eq!(view.sources[0].normalized_url, "https://cafes.example/menu");

        let err = post_sources_upload(
            State(fx.state),
            Json(SourcesUpload {
                run_id,
                sources_json: "not json".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn amendments_are_empty_without_run() {
        let fx = fixture();
        let Json(pending) = get_amendments(State(fx.state)).await;
        assert_eq!(pending, PendingAmendments::default());
    }

    #[tokio::test]
    async fn new_run_bumps_session() {
        let fx = fixture();
        let Json(body) = post_new_run(State(fx.state.clone())).await;
        assert_eq!(body["session_id"], 1);
        let Json(status) = get_status(State(fx.state)).await;
        assert_eq!(status.session_id, 1);
    }
}
