//! Health check endpoint for load balancers and orchestrators.

use axum::{Json, extract::State, response::IntoResponse};
use http::StatusCode;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// "healthy" or "unhealthy"
    pub status: &'static str,
    pub version: &'static str,
    /// Authentication mode currently in force.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

const UNAVAILABLE_MESSAGE: &str = "configuration service unavailable";

/// Reports unhealthy when the configuration service cannot be read.
#[tracing::instrument(name = "health.check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.settings.mode().await {
        Ok(mode) => (
            StatusCode::OK,
            Json(HealthStatus {
                status: "healthy",
                version: env!("CARGO_PKG_VERSION"),
                auth_mode: Some(mode.as_setting().to_string()),
                message: None,
            }),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Health check could not read the authentication mode");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthStatus {
                    status: "unhealthy",
                    version: env!("CARGO_PKG_VERSION"),
                    auth_mode: None,
                    message: Some(UNAVAILABLE_MESSAGE.to_string()),
                }),
            )
        }
    }
}
