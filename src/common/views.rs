use super::models::HealthCheck;
use super::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use tracing::{error, info};
use utoipa_axum::{router::OpenApiRouter, routes};

pub fn router(state: &AppState) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(healthz))
        .with_state(state.clone())
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (
            status = OK,
            description = "Kubernetes health check",
            body = HealthCheck,
            content_type = "application/json"
        ),
        (
            status = INTERNAL_SERVER_ERROR,
            description = "Feature cache unreachable",
            body = HealthCheck,
            content_type = "application/json"
        )
    )
)]
pub async fn healthz(State(app_state): State<AppState>) -> (StatusCode, Json<HealthCheck>) {
    let now = chrono::Utc::now();
    if !app_state.pipeline.cache_healthy().await {
        error!(
            timestamp = %now.format("%Y-%m-%d %H:%M:%S"),
            endpoint = "healthz",
            status = 500,
            "Feature cache connection FAILED"
        );
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(HealthCheck {
                status: "error".to_string(),
                cache_connected: false,
            }),
        );
    }
    info!(
        timestamp = %now.format("%Y-%m-%d %H:%M:%S"),
        endpoint = "healthz",
        status = 200,
        "Feature cache connection is healthy"
    );
    (
        StatusCode::OK,
        Json(HealthCheck {
            status: "ok".to_string(),
            cache_connected: true,
        }),
    )
}
