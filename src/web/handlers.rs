use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::WebState;
use crate::core::{BackupEntry, ContainerSummary, JobKind, JobView, TriggerResponse};

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub backup: Option<String>,
}

#[derive(Serialize)]
pub struct ContainersResponse {
    enabled: bool,
    containers: Vec<ContainerSummary>,
}

pub async fn healthz(State(state): State<WebState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "job_active": state.ctx.jobs.snapshot().active,
    }))
}

pub async fn job_status(State(state): State<WebState>) -> Json<JobView> {
    Json(state.ctx.jobs.snapshot())
}

pub async fn job_action(
    State(state): State<WebState>,
    Json(req): Json<ActionRequest>,
) -> (StatusCode, Json<TriggerResponse>) {
    let action = req.action.trim().to_lowercase();

    let response = if action == "cancel" {
        state.ctx.jobs.request_cancel(req.container.as_deref())
    } else if let Some(kind) = JobKind::from_str(&action) {
        state.ctx.jobs.trigger(kind, req.container, req.backup).await
    } else {
        return (
            StatusCode::BAD_REQUEST,
            Json(TriggerResponse::rejected(format!("Unknown action: {}", req.action))),
        );
    };

    let status = if response.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(response))
}

pub async fn list_backups(
    State(state): State<WebState>,
) -> Result<Json<Vec<BackupEntry>>, (StatusCode, Json<Value>)> {
    state.ctx.jobs.list_backups().await.map(Json).map_err(|e| {
        tracing::warn!(error = %e, "Failed to list backups");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
    })
}

pub async fn list_containers(State(state): State<WebState>) -> Json<ContainersResponse> {
    Json(ContainersResponse {
        enabled: state.ctx.config.docker_enabled,
        containers: state.ctx.jobs.containers().await,
    })
}
