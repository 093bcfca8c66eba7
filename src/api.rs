use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::service::{
    lifecycle::ContainerRuntime,
    orchestrator::{IdentityChange, RestartOrchestrator, RestartOutcome, RestartRequest},
    probe::ProbeEndpoint,
};

/// State shared across axum handlers.
pub struct AppState {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub orchestrator: Arc<RestartOrchestrator>,
    pub probe_host: Option<String>,
    pub health_container: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/restart", post(restart))
        .with_state(state)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid JSON body: {0}")]
    MalformedBody(String),
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("gluetun_port must be a port number between 1 and 65535, got {0:?}")]
    InvalidPort(String),
}

/// `gluetun_port` arrives as a string from most clients, but numbers are accepted too.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortField {
    Number(serde_json::Number),
    Text(String),
}

#[derive(Debug, Default, Deserialize)]
struct RestartBody {
    container_name: Option<String>,
    gluetun_port: Option<PortField>,
}

fn parse_port(field: PortField) -> Result<u16, ValidationError> {
    let raw = match field {
        PortField::Number(n) => n.to_string(),
        PortField::Text(s) => s.trim().to_string(),
    };
    if raw.is_empty() {
        return Err(ValidationError::MissingField("gluetun_port"));
    }
    match raw.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ValidationError::InvalidPort(raw)),
    }
}

/// Check every required field before anything touches docker.
fn validate_restart_body(body: &[u8]) -> Result<(String, u16), ValidationError> {
    let body: RestartBody = if body.iter().all(u8::is_ascii_whitespace) {
        RestartBody::default()
    } else {
        serde_json::from_slice(body).map_err(|e| ValidationError::MalformedBody(e.to_string()))?
    };

    let container_name = body
        .container_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or(ValidationError::MissingField("container_name"))?;

    let port = body
        .gluetun_port
        .ok_or(ValidationError::MissingField("gluetun_port"))
        .and_then(parse_port)?;

    Ok((container_name, port))
}

#[derive(Debug, Serialize)]
struct RestartResponse {
    restart_id: uuid::Uuid,
    container: String,
    message: String,
    old_ip: String,
    new_ip: String,
    /// Only true when both IPs are known and differ.
    changed: bool,
    ip_status: IdentityChange,
}

impl From<RestartOutcome> for RestartResponse {
    fn from(outcome: RestartOutcome) -> Self {
        Self {
            restart_id: outcome.restart_id,
            container: outcome.container_name.clone(),
            old_ip: outcome.prior_identifier_or_unknown().to_string(),
            changed: outcome.change.changed().unwrap_or(false),
            ip_status: outcome.change,
            message: outcome.message,
            new_ip: outcome.new_identifier,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HealthQuery {
    container: Option<String>,
}

async fn health(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HealthQuery>,
) -> Result<String, (StatusCode, String)> {
    let container = query
        .container
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| state.health_container.clone());

    let snapshot = state.runtime.inspect(&container).await.map_err(|e| {
        log::error!("Failed to inspect container {container}: {e}");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    let mut text = snapshot.render(chrono::Utc::now());
    if state.orchestrator.is_restarting(&container) {
        text.push_str("Restart: in progress\n");
    }
    Ok(text)
}

async fn restart(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<RestartResponse>, (StatusCode, String)> {
    let (container_name, port) = validate_restart_body(&body).map_err(|e| {
        log::warn!("Rejected restart request: {e}");
        (StatusCode::BAD_REQUEST, e.to_string())
    })?;

    let probe_host = state.probe_host.clone().ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "SERVER_IP environment variable is not set".to_string(),
        )
    })?;

    let request = RestartRequest {
        container_name,
        probe_endpoint: ProbeEndpoint::new(probe_host, port),
    };

    // Run detached so a client hanging up does not abort a restart midway
    let orchestrator = Arc::clone(&state.orchestrator);
    let outcome = tokio::spawn(async move { orchestrator.restart_and_verify(&request).await })
        .await
        .map_err(|e| {
            log::error!("Restart task failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(outcome.into()))
}
