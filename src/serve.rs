//! HTTP control plane.
//!
//! Routes, handlers and server startup for the supervisor API. Handlers
//! validate, delegate to the `ConfigStore` or the `ProcessRegistry`, and map
//! domain errors onto status codes; they contain no business logic of their
//! own. The bundled web UI is served from `static/` next to the API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{Config, ConfigStore, ProcessDefinition};
use crate::error::{ConfigError, RegistryError};
use crate::output::LogSlice;
use crate::registry::{ProcessRegistry, RunnerMeta, StopOutcome};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProcessRegistry>,
    pub config: Arc<Mutex<ConfigStore>>,
}

/// HTTP-facing error: a status code plus a `{"message"}` body.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match &self {
            HttpError::NotFound(_) => StatusCode::NOT_FOUND,
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::Conflict(_) => StatusCode::CONFLICT,
            HttpError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<RegistryError> for HttpError {
    fn from(err: RegistryError) -> Self {
        match &err {
            RegistryError::UnknownDefinition { .. } | RegistryError::NotRunning { .. } => {
                HttpError::NotFound(err.to_string())
            }
            RegistryError::AlreadyRunning { .. } | RegistryError::OperationInFlight { .. } => {
                HttpError::Conflict(err.to_string())
            }
            RegistryError::Spawn { .. } => HttpError::Internal(err.to_string()),
        }
    }
}

impl From<ConfigError> for HttpError {
    fn from(err: ConfigError) -> Self {
        match &err {
            ConfigError::Invalid(_) => HttpError::BadRequest(err.to_string()),
            ConfigError::UnknownServer { .. } => HttpError::NotFound(err.to_string()),
            ConfigError::Load { .. } | ConfigError::Save { .. } => {
                HttpError::Internal(err.to_string())
            }
        }
    }
}

/// Full snapshot returned by `GET /api/state`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StateView {
    pub config: Config,
    pub runners: HashMap<String, RunnerMeta>,
}

#[derive(Serialize)]
struct OkBody {
    message: &'static str,
}

fn ok() -> Json<OkBody> {
    Json(OkBody { message: "OK" })
}

#[derive(Serialize)]
struct StartedBody {
    message: &'static str,
    pid: u32,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default = "default_since")]
    since: i64,
}

fn default_since() -> i64 {
    -1
}

async fn get_state(State(state): State<AppState>) -> Json<StateView> {
    let config = state.config.lock().unwrap().config().clone();
    Json(StateView {
        config,
        runners: state.registry.snapshot(),
    })
}

async fn get_config(State(state): State<AppState>) -> Json<Config> {
    Json(state.config.lock().unwrap().config().clone())
}

async fn get_runners(State(state): State<AppState>) -> Json<HashMap<String, RunnerMeta>> {
    Json(state.registry.snapshot())
}

async fn upsert_server(
    State(state): State<AppState>,
    Json(def): Json<ProcessDefinition>,
) -> Result<impl IntoResponse, HttpError> {
    state.config.lock().unwrap().upsert(def)?;
    Ok((StatusCode::CREATED, ok()))
}

async fn remove_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<OkBody>, HttpError> {
    state.config.lock().unwrap().remove(&name)?;
    Ok(ok())
}

async fn start_runner(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    let def = state
        .config
        .lock()
        .unwrap()
        .get(&name)
        .cloned()
        .ok_or(RegistryError::UnknownDefinition { name })?;
    let pid = state.registry.start(&def)?;
    Ok((
        StatusCode::CREATED,
        Json(StartedBody { message: "OK", pid }),
    ))
}

async fn stop_runner(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<StopOutcome>, HttpError> {
    let outcome = state.registry.stop(&name).await?;
    Ok(Json(outcome))
}

async fn get_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogSlice>, HttpError> {
    let slice = state.registry.read_logs(&name, query.since)?;
    Ok(Json(slice))
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/state", get(get_state))
        .route("/config", get(get_config))
        .route("/config/server", post(upsert_server))
        .route("/config/server/{name}", axum::routing::delete(remove_server))
        .route("/runner", get(get_runners))
        .route(
            "/runner/{name}",
            post(start_runner).delete(stop_runner),
        )
        .route("/runner/{name}/logs", get(get_logs))
}

/// Builds the complete router: API under `/api`, web UI for everything else.
pub fn create_router(state: AppState, static_dir: &std::path::Path) -> Router {
    let serve_dir =
        ServeDir::new(static_dir).fallback(ServeFile::new(static_dir.join("index.html")));
    Router::new()
        .nest("/api", api_routes().with_state(state))
        .fallback_service(serve_dir)
        .layer(TraceLayer::new_for_http())
}

/// Runs the control plane in the foreground until interrupted.
pub async fn run(config: ConfigStore) -> Result<()> {
    info!(path = %config.path().display(), "configuration loaded");
    let settings = config.settings().clone();
    let registry = Arc::new(ProcessRegistry::new(
        settings.log_retention_lines,
        Duration::from_millis(settings.stop_grace_ms),
    ));
    let state = AppState {
        registry,
        config: Arc::new(Mutex::new(config)),
    };
    let router = create_router(state, std::path::Path::new("static"));

    let addr = settings.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("listening on http://{}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_errors_map_to_expected_statuses() {
        let cases = [
            (
                HttpError::from(RegistryError::UnknownDefinition {
                    name: "a".into(),
                }),
                StatusCode::NOT_FOUND,
            ),
            (
                HttpError::from(RegistryError::NotRunning { name: "a".into() }),
                StatusCode::NOT_FOUND,
            ),
            (
                HttpError::from(RegistryError::AlreadyRunning { name: "a".into() }),
                StatusCode::CONFLICT,
            ),
            (
                HttpError::from(RegistryError::OperationInFlight { name: "a".into() }),
                StatusCode::CONFLICT,
            ),
            (
                HttpError::from(RegistryError::Spawn {
                    name: "a".into(),
                    source: std::io::Error::other("boom"),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn config_errors_map_to_expected_statuses() {
        let invalid = HttpError::from(ConfigError::Invalid("bad".into()));
        assert_eq!(invalid.into_response().status(), StatusCode::BAD_REQUEST);
        let unknown = HttpError::from(ConfigError::UnknownServer { name: "a".into() });
        assert_eq!(unknown.into_response().status(), StatusCode::NOT_FOUND);
    }
}
