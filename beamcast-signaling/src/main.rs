use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use socketioxide::SocketIo;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

mod broadcast;
mod config;
mod engine;
mod error;
mod ids;
mod routes;
mod session;
mod signaling;
mod socket;

use beamcast_shared::middleware::{init_metrics, metrics_middleware};
use broadcast::BroadcastCoordinator;
use config::AppConfig;
use engine::{EngineSettings, LocalEngine, MediaEngine};
use session::{ConnectionSupervisor, SessionRegistry};
use signaling::Signaling;

pub struct AppState {
    pub config: AppConfig,
    pub supervisor: ConnectionSupervisor,
    pub metrics_handle: PrometheusHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    beamcast_shared::middleware::init_tracing("beamcast-signaling");

    let config = AppConfig::load()?;
    let port = config.port;
    let metrics_handle = init_metrics()?;

    let engine: Arc<dyn MediaEngine> = Arc::new(LocalEngine::new(EngineSettings::from(&config)));
    let signaling = Signaling::new(
        Arc::new(SessionRegistry::new()),
        engine,
        BroadcastCoordinator::new(config.notification_buffer),
    );

    let state = Arc::new(AppState {
        supervisor: ConnectionSupervisor::new(signaling),
        config,
        metrics_handle,
    });

    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "beamcast-signaling starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    // Socket.IO setup
    let (sio_layer, io) = SocketIo::builder()
        .with_state(state.clone())
        .build_layer();

    io.ns("/", socket::handlers::on_connect);

    let cors = build_cors_layer(&state.config.allowed_origins);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::metrics))
        .layer(sio_layer)
        .layer(axum::middleware::from_fn(metrics_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        tracing::warn!("CORS: permissive mode (allow all origins)");
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<HeaderValue>() {
            Ok(origin) => Some(origin),
            Err(_) => {
                tracing::warn!(origin = s, "CORS: skipping invalid origin");
                None
            }
        })
        .collect();

    tracing::info!("CORS: restricted to {} origin(s)", origins.len());

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([HeaderName::from_static("content-type")])
        .allow_credentials(true)
}
