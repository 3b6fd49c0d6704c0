use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use beamcast_shared::{HealthCheck, HealthResponse, HealthStatus};
use std::sync::Arc;

use crate::AppState;

/// Liveness plus a snapshot of the session registry.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let registry = state.supervisor.signaling().registry();
    let capabilities = state.supervisor.signaling().engine().capabilities().await;

    let checks = vec![
        HealthCheck {
            name: "registry".into(),
            status: HealthStatus::Healthy,
            message: Some(format!(
                "{} connections, {} publishers",
                registry.connection_count(),
                registry.publisher_count()
            )),
        },
        if capabilities.codecs.is_empty() {
            HealthCheck {
                name: "engine".into(),
                status: HealthStatus::Degraded,
                message: Some("engine reports no codecs".into()),
            }
        } else {
            HealthCheck {
                name: "engine".into(),
                status: HealthStatus::Healthy,
                message: None,
            }
        },
    ];

    let response = HealthResponse::healthy("beamcast-signaling", env!("CARGO_PKG_VERSION"))
        .with_checks(checks);

    let status = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(response)).into_response()
}

/// Returns Prometheus metrics.
pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}
