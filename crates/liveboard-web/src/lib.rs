//! HTTP surface: on-demand collection for one station and a health check.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use liveboard_core::{FailureKind, IngestionResult, ProviderErrorKind, StoreErrorKind};
use liveboard_sync::{
    collect_station_scoped, maybe_build_scheduler, CollectorConfig, LiveResources, ResourceFactory,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CollectorConfig>,
    pub resources: Arc<dyn ResourceFactory>,
}

impl AppState {
    pub fn new(config: Arc<CollectorConfig>, resources: Arc<dyn ResourceFactory>) -> Self {
        Self { config, resources }
    }
}

#[derive(Debug, Deserialize, Default)]
struct TrainsQuery {
    station: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TrainsResponse {
    pub status: &'static str,
    pub station: String,
    pub trains_fetched: usize,
    pub trains_stored: u64,
    pub inserted: u64,
    pub updated: u64,
    pub discarded: usize,
    pub message: String,
}

impl From<&IngestionResult> for TrainsResponse {
    fn from(result: &IngestionResult) -> Self {
        Self {
            status: "success",
            station: result.station_id.clone(),
            trains_fetched: result.fetched,
            trains_stored: result.persisted,
            inserted: result.inserted,
            updated: result.updated,
            discarded: result.discarded.total(),
            message: format!(
                "Successfully processed {} departures for {}",
                result.persisted, result.station_id
            ),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub station: String,
    pub kind: FailureKind,
    pub message: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/trains", get(trains_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

/// Serves the API until ctrl-c, running the cron scheduler alongside when enabled.
pub async fn serve(config: Arc<CollectorConfig>, resources: Arc<dyn ResourceFactory>) -> anyhow::Result<()> {
    let mut scheduler = maybe_build_scheduler(config.clone(), resources.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    let port = config.web_port;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, stations = config.stations.len(), "liveboard api listening");

    axum::serve(listener, app(AppState::new(config, resources)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = Arc::new(CollectorConfig::from_env()?);
    serve(config, Arc::new(LiveResources)).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn trains_handler(State(state): State<Arc<AppState>>, Query(query): Query<TrainsQuery>) -> Response {
    let requested = query.station.filter(|s| !s.trim().is_empty());
    let station = match requested {
        Some(name) => name,
        None => match state.config.default_station() {
            Some(default) => default.id.clone(),
            None => {
                return error_response(
                    String::new(),
                    FailureKind::UnknownStation,
                    "no station requested and none configured".to_string(),
                )
            }
        },
    };

    match collect_station_scoped(state.resources.as_ref(), state.config.clone(), &station).await {
        Ok(result) => (StatusCode::OK, Json(TrainsResponse::from(&result))).into_response(),
        Err(err) => {
            warn!(station = %station, kind = %err.kind(), error = %err, "on-demand collection failed");
            error_response(station, err.kind(), err.to_string())
        }
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

fn error_response(station: String, kind: FailureKind, message: String) -> Response {
    let body = ErrorResponse {
        status: "error",
        station,
        kind,
        message,
    };
    (status_for(kind), Json(body)).into_response()
}

pub fn status_for(kind: FailureKind) -> StatusCode {
    match kind {
        FailureKind::UnknownStation => StatusCode::BAD_REQUEST,
        FailureKind::DeadlineExceeded | FailureKind::Provider(ProviderErrorKind::Timeout) => {
            StatusCode::GATEWAY_TIMEOUT
        }
        FailureKind::Provider(_) => StatusCode::BAD_GATEWAY,
        FailureKind::Store(StoreErrorKind::ConnectionFailed | StoreErrorKind::Timeout) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        FailureKind::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
