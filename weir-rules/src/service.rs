use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::info;

use crate::error::RuleError;
use crate::manager::{ActivatedPolicy, RuleManager};
use crate::rule::RuleStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationResponse {
    pub policies: Vec<ActivatedPolicy>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
}

#[derive(Clone)]
struct PolicyServiceState {
    manager: RuleManager,
}

/// Configuration for the policy API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyServiceConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "0.0.0.0:8082".to_string()
}

impl Default for PolicyServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

/// Helper used by the daemon to compose the REST API router.
#[derive(Clone)]
pub struct PolicyApiBuilder {
    state: PolicyServiceState,
}

impl PolicyApiBuilder {
    pub fn new(manager: RuleManager) -> Self {
        Self {
            state: PolicyServiceState { manager },
        }
    }

    pub fn into_router(self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/policies", get(list_policies).post(activate_policy))
            .route(
                "/policies/:rule_id",
                get(policy_status).delete(stop_policy),
            )
            .with_state(self.state)
    }

    /// Spawns an HTTP server binding to the configured address.
    pub async fn serve(self, config: PolicyServiceConfig) -> anyhow::Result<oneshot::Sender<()>> {
        let (tx, rx) = oneshot::channel();
        let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
        let state = self.state.clone();

        tokio::spawn(async move {
            info!(address = %config.bind_address, "starting policy service");
            let app = PolicyApiBuilder { state }.into_router();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.await;
                })
                .await
                .ok();
        });

        Ok(tx)
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_policies(State(state): State<PolicyServiceState>) -> impl IntoResponse {
    Json(state.manager.list())
}

async fn activate_policy(
    State(state): State<PolicyServiceState>,
    Json(payload): Json<ActivationRequest>,
) -> Result<(StatusCode, Json<ActivationResponse>), (StatusCode, Json<ErrorResponse>)> {
    let policies = state
        .manager
        .activate(&payload.text)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(ActivationResponse { policies })))
}

async fn policy_status(
    State(state): State<PolicyServiceState>,
    Path(rule_id): Path<String>,
) -> Result<Json<RuleStatus>, (StatusCode, Json<ErrorResponse>)> {
    let handle = state
        .manager
        .get(&rule_id)
        .ok_or_else(|| error_response(RuleError::NotFound(rule_id.clone())))?;
    let status = handle.status().await.map_err(error_response)?;
    Ok(Json(status))
}

async fn stop_policy(
    State(state): State<PolicyServiceState>,
    Path(rule_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    state.manager.stop(&rule_id).await.map_err(error_response)?;
    Ok(Json(serde_json::json!({ "stopped": rule_id })))
}

fn error_response(err: RuleError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match &err {
        RuleError::Parse(_) => (StatusCode::BAD_REQUEST, "invalid_rule"),
        // An actor that already stopped on its own is indistinguishable
        // from a forgotten one as far as callers are concerned.
        RuleError::NotFound(_) | RuleError::Stopped => (StatusCode::NOT_FOUND, "not_found"),
        RuleError::Dispatch(_) => (StatusCode::BAD_GATEWAY, "dispatch_failed"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: err.to_string(),
        }),
    )
}
