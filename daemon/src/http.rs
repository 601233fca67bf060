//! HTTP API: health, application status, manual and webhook triggers.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use stacksync::gitops::{ApplicationStatus, SyncTrigger};

use crate::state::ApiState;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/applications", get(list_applications))
        .route("/api/applications/{name}", get(get_application))
        .route("/api/applications/{name}/sync", post(sync_application))
        .route("/api/webhook", post(webhook))
        .with_state(state)
}

/// API error body.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    UnknownApplication(String),
    NotRunning(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::UnknownApplication(name) => (
                StatusCode::NOT_FOUND,
                format!("application '{}' not found", name),
            ),
            ApiError::NotRunning(name) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("application '{}' is not running", name),
            ),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

/// Accepted trigger response.
#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub trigger: SyncTrigger,
    pub applications: Vec<String>,
}

/// Webhook payload. Without `application` every application is refreshed.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookRequest {
    #[serde(default)]
    pub application: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_applications(State(state): State<ApiState>) -> Json<Vec<ApplicationStatus>> {
    Json(state.statuses())
}

async fn get_application(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<ApplicationStatus>, ApiError> {
    state
        .get(&name)
        .map(|app| Json(app.status()))
        .ok_or(ApiError::UnknownApplication(name))
}

async fn sync_application(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    let app = state
        .get(&name)
        .ok_or_else(|| ApiError::UnknownApplication(name.clone()))?;
    if !app.trigger(SyncTrigger::Manual) {
        return Err(ApiError::NotRunning(name));
    }

    info!(application = %name, "Manual sync requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            trigger: SyncTrigger::Manual,
            applications: vec![name],
        }),
    ))
}

async fn webhook(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    let request: WebhookRequest = if body.iter().all(u8::is_ascii_whitespace) {
        WebhookRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid webhook payload: {}", e)))?
    };
    let trigger = SyncTrigger::Webhook {
        revision: request.revision,
    };

    let applications = match request.application {
        Some(name) => {
            let app = state
                .get(&name)
                .ok_or_else(|| ApiError::UnknownApplication(name.clone()))?;
            if !app.trigger(trigger.clone()) {
                return Err(ApiError::NotRunning(name));
            }
            vec![name]
        }
        None => state.trigger_all(&trigger),
    };

    info!(
        applications = ?applications,
        revision = ?trigger.revision(),
        "Webhook received"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            trigger,
            applications,
        }),
    ))
}
