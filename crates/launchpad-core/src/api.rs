//! HTTP surface of the trigger endpoint.
//!
//! Any method on `/` is an invocation, mirroring a function URL. `GET /health`
//! answers without touching the cluster.

use crate::error::TriggerError;
use crate::trigger::{AuthMode, InvocationRequest, RunAccepted, TriggerEndpoint};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;

impl IntoResponse for TriggerError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

pub fn router(endpoint: TriggerEndpoint) -> Router {
    Router::new()
        .route("/", any(invoke))
        .route("/health", get(health_check))
        .with_state(endpoint)
}

async fn health_check(State(endpoint): State<TriggerEndpoint>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "function": endpoint.binding().function_name,
    }))
}

async fn invoke(
    State(endpoint): State<TriggerEndpoint>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<RunAccepted>), TriggerError> {
    if endpoint.binding().auth_mode == AuthMode::AwsIam
        && !headers.contains_key(header::AUTHORIZATION)
    {
        return Err(TriggerError::Unauthorized);
    }

    let request = InvocationRequest::from_body(&body)?;
    let accepted = endpoint.invoke(request).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}
