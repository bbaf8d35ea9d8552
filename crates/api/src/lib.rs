//! Recoon HTTP surface.
//!
//! Read-only JSON views over the store and the compose layer, plus a trigger
//! that asks the puller for an immediate cycle. Objects are never edited
//! through this surface; all change flows through the reconciliation loop.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use metrics::histogram;
use recoon_core::{project_namespace, NamespaceName, Project, Repository, Resource, StoreError};
use recoon_hub::CancellationToken;
use recoon_ops::compose::parse_log_lines;
use recoon_ops::{ComposeOps, ContainerSummary, LogLine};
use recoon_store::{ListOptions, Store};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Lines returned by the logs endpoint.
pub const LOG_TAIL: usize = 60;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub compose: Arc<dyn ComposeOps>,
    /// Immediate-reconcile requests for the puller.
    pub trigger: mpsc::Sender<()>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::Validation(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            Self::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "api: request failed");
        }
        (status, Json(ErrorBody { error: code.to_string(), message: self.to_string() })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => Self::NotFound(e.to_string()),
            StoreError::NameEmpty | StoreError::NamespaceEmpty | StoreError::Invalid(_) => Self::Validation(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self { Self::Internal(format!("{e:#}")) }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn router(state: ApiState) -> Router {
    let v1 = Router::new()
        .route("/reconcile", put(reconcile))
        .route("/repository", get(list_all::<Repository>))
        .route("/repository/{namespace}", get(list_in::<Repository>))
        .route("/repository/{namespace}/{name}", get(get_one::<Repository>))
        .route("/project", get(list_all::<Project>))
        .route("/project/{namespace}", get(list_in::<Project>))
        .route("/project/{namespace}/{name}", get(get_one::<Project>))
        .route("/container", get(list_containers))
        .route("/container/{project}", get(project_containers))
        .route("/container/logs/{id}", get(container_logs));
    Router::new().route("/", get(health)).nest("/api/v1", v1).with_state(state)
}

/// Serve until `cancel` fires.
pub async fn serve(addr: &str, state: ApiState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
    info!(addr = %listener.local_addr()?, "api: listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("api server")?;
    info!("api: stopped");
    Ok(())
}

async fn health() -> Json<&'static str> { Json("ok") }

async fn reconcile(State(s): State<ApiState>) -> std::result::Result<StatusCode, ApiError> {
    match s.trigger.try_send(()) {
        Ok(()) => {
            info!("api: reconcile requested");
            Ok(StatusCode::ACCEPTED)
        }
        // One pending request already covers this one.
        Err(TrySendError::Full(())) => Ok(StatusCode::ACCEPTED),
        Err(TrySendError::Closed(())) => Err(ApiError::Unavailable("reconcile loop is not running".into())),
    }
}

async fn list_all<T: Resource>(State(s): State<ApiState>) -> ApiResult<Vec<T>> {
    let started = Instant::now();
    let items = s.store.list_or_empty::<T>(&ListOptions::all())?;
    histogram!("api_list_ms", started.elapsed().as_secs_f64() * 1000.0);
    debug!(kind = T::KIND.as_str(), count = items.len(), "api: list");
    Ok(Json(items))
}

async fn list_in<T: Resource>(State(s): State<ApiState>, Path(namespace): Path<String>) -> ApiResult<Vec<T>> {
    let started = Instant::now();
    let items = s.store.list_or_empty::<T>(&ListOptions::in_namespace(namespace))?;
    histogram!("api_list_ms", started.elapsed().as_secs_f64() * 1000.0);
    Ok(Json(items))
}

async fn get_one<T: Resource>(State(s): State<ApiState>, Path((namespace, name)): Path<(String, String)>) -> ApiResult<T> {
    Ok(Json(s.store.get::<T>(&NamespaceName::new(namespace, name))?))
}

async fn list_containers(State(s): State<ApiState>) -> ApiResult<Vec<ContainerSummary>> {
    let projects = s.store.list_or_empty::<Project>(&ListOptions::all())?;
    let mut out = Vec::new();
    for p in projects {
        out.extend(s.compose.status(&p.metadata.name).await?);
    }
    Ok(Json(out))
}

async fn project_containers(State(s): State<ApiState>, Path(project): Path<String>) -> ApiResult<Vec<ContainerSummary>> {
    s.store.get::<Project>(&NamespaceName::new(project_namespace(&project), &project))?;
    Ok(Json(s.compose.status(&project).await?))
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    since: Option<String>,
}

async fn container_logs(
    State(s): State<ApiState>,
    Path(id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<Vec<LogLine>> {
    let text = s.compose.logs(&id, q.since.as_deref(), LOG_TAIL).await?;
    Ok(Json(parse_log_lines(&text)))
}
