use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::{get, patch};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

mod config;
mod models;
mod routes;
mod schema;
mod services;

use beamcast_shared::clients::db::create_pool;
use beamcast_shared::middleware::{init_metrics, init_tracing, metrics_middleware};
use config::AppConfig;
use services::{MemoryStreamStore, PgStreamStore, StreamStore};

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn StreamStore>,
    pub metrics_handle: PrometheusHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("beamcast-streams");

    let config = AppConfig::load()?;
    let port = config.port;
    let metrics_handle = init_metrics()?;

    let store: Arc<dyn StreamStore> = match config.database_url.as_deref() {
        Some(url) => Arc::new(PgStreamStore::new(create_pool(url, config.db_pool_size)?)),
        None => {
            tracing::warn!("no database_url configured, streams are kept in memory");
            Arc::new(MemoryStreamStore::new())
        }
    };

    let state = Arc::new(AppState { config, store, metrics_handle });
    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "beamcast-streams starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config.allowed_origins);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::metrics))
        .route(
            "/api/streams",
            get(routes::streams::list_streams).post(routes::streams::create_stream),
        )
        .route("/api/streams/:id", get(routes::streams::get_stream))
        .route("/api/streams/:id/status", patch(routes::streams::update_status))
        .route("/api/streams/:id/joiners", patch(routes::streams::add_joiner))
        .layer(axum::middleware::from_fn(metrics_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<HeaderValue>().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PATCH])
        .allow_headers([HeaderName::from_static("content-type")])
}
