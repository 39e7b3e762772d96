use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use hub_agent::TunnelStart;
use hub_process::{ActionOutcome, Project, ProjectView, TunnelRecord};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    events, security,
    security::RequestMeta,
    state::AppState,
};

const MAX_LOG_LINES: usize = 10_000;

#[derive(Debug, Serialize)]
struct Healthz {
    status: &'static str,
    version: &'static str,
}

async fn healthz() -> Json<Healthz> {
    Json(Healthz {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    fn done(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

pub async fn list_projects(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<Json<Vec<ProjectView>>> {
    state
        .hub
        .views()
        .await
        .map(Json)
        .map_err(|e| ApiError::from_hub(e, &meta.request_id))
}

pub async fn get_project(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(name): Path<String>,
) -> ApiResult<Json<ProjectView>> {
    state
        .hub
        .view(&name)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_hub(e, &meta.request_id))
}

pub async fn add_project(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(project): Json<Project>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let project = state
        .hub
        .config()
        .add_project(project)
        .await
        .map_err(|e| ApiError::from_hub(e, &meta.request_id))?;
    Ok((StatusCode::CREATED, Json(project)))
}

pub async fn edit_project(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(name): Path<String>,
    Json(project): Json<Project>,
) -> ApiResult<Json<Project>> {
    state
        .hub
        .config()
        .edit_project(&name, project)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_hub(e, &meta.request_id))
}

pub async fn remove_project(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(name): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    state
        .hub
        .config()
        .remove_project(&name)
        .await
        .map_err(|e| ApiError::from_hub(e, &meta.request_id))?;
    Ok(ActionResponse::done(format!("Removed {name}")))
}

pub async fn start_project(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(name): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    state
        .hub
        .start(&name)
        .await
        .map_err(|e| ApiError::from_hub(e, &meta.request_id))?;
    Ok(ActionResponse::done(format!("Started {name}")))
}

pub async fn stop_project(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(name): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    state
        .hub
        .stop(&name)
        .await
        .map_err(|e| ApiError::from_hub(e, &meta.request_id))?;
    Ok(ActionResponse::done(format!("Stopped {name}")))
}

pub async fn restart_project(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(name): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    state
        .hub
        .restart(&name)
        .await
        .map_err(|e| ApiError::from_hub(e, &meta.request_id))?;
    Ok(ActionResponse::done(format!("Restarted {name}")))
}

pub async fn start_all(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<Json<Vec<ActionOutcome>>> {
    state
        .hub
        .start_all()
        .await
        .map(Json)
        .map_err(|e| ApiError::from_hub(e, &meta.request_id))
}

pub async fn stop_all(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<Json<Vec<ActionOutcome>>> {
    state
        .hub
        .stop_all()
        .await
        .map(Json)
        .map_err(|e| ApiError::from_hub(e, &meta.request_id))
}

pub async fn restart_all(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<Json<Vec<ActionOutcome>>> {
    state
        .hub
        .restart_all()
        .await
        .map(Json)
        .map_err(|e| ApiError::from_hub(e, &meta.request_id))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
}

pub async fn project_logs(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(name): Path<String>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    let lines = q.lines.map(|n| n.clamp(1, MAX_LOG_LINES));
    let text = state
        .hub
        .logs(&name, lines)
        .await
        .map_err(|e| ApiError::from_hub(e, &meta.request_id))?
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "logs_unavailable",
                format!("logs for {name} are unavailable"),
                &meta.request_id,
            )
        })?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text))
}

#[derive(Debug, Default, Deserialize)]
pub struct TunnelsQuery {
    #[serde(default)]
    pub reconcile: bool,
}

pub async fn list_tunnels(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Query(q): Query<TunnelsQuery>,
) -> ApiResult<Json<Vec<TunnelRecord>>> {
    state
        .hub
        .tunnel_records(q.reconcile)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_hub(e, &meta.request_id))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStartResponse {
    #[serde(flatten)]
    pub record: TunnelRecord,
    pub already_running: bool,
}

pub async fn start_tunnel(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(name): Path<String>,
) -> ApiResult<Json<TunnelStartResponse>> {
    let started = state
        .hub
        .start_tunnel(&name)
        .await
        .map_err(|e| ApiError::from_hub(e, &meta.request_id))?;
    let already_running = matches!(started, TunnelStart::AlreadyRunning(_));
    Ok(Json(TunnelStartResponse {
        record: started.into_record(),
        already_running,
    }))
}

pub async fn stop_tunnel(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(name): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    let stopped = state
        .hub
        .stop_tunnel(&name)
        .await
        .map_err(|e| ApiError::from_hub(e, &meta.request_id))?;
    Ok(ActionResponse::done(if stopped {
        format!("Stopped tunnel for {name}")
    } else {
        format!("No tunnel running for {name}")
    }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/projects", get(list_projects).post(add_project))
        .route("/api/projects/start-all", post(start_all))
        .route("/api/projects/stop-all", post(stop_all))
        .route("/api/projects/restart-all", post(restart_all))
        .route(
            "/api/projects/:name",
            get(get_project).put(edit_project).delete(remove_project),
        )
        .route("/api/projects/:name/start", post(start_project))
        .route("/api/projects/:name/stop", post(stop_project))
        .route("/api/projects/:name/restart", post(restart_project))
        .route("/api/projects/:name/logs", get(project_logs))
        .route("/api/projects/:name/tunnel/start", post(start_tunnel))
        .route("/api/projects/:name/tunnel/stop", post(stop_tunnel))
        .route("/api/tunnels", get(list_tunnels))
        .route("/api/events", get(events::stream_events))
        .layer(middleware::from_fn(security::request_id))
        .with_state(state)
}
