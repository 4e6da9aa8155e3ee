//! Control API request handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::router::AgentInfo;

use super::error::ApiError;
use super::state::AppState;

/// Sender recorded when a client does not identify itself.
const ANONYMOUS_SENDER: &str = "external";

/// `GET /api/agents` response.
#[derive(Debug, Serialize)]
pub struct AgentsResponse {
    pub agents: Vec<AgentInfo>,
    #[serde(rename = "activeTab")]
    pub active_tab: Option<String>,
}

/// `POST /api/agents` request body.
#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    #[serde(rename = "threadName")]
    pub thread_name: String,
}

/// `POST /api/agents` response.
#[derive(Debug, Serialize)]
pub struct CreateAgentResponse {
    pub created: bool,
    #[serde(rename = "threadName")]
    pub thread_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `POST /api/agents/{name}/message` request body.
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub message: String,
    #[serde(default)]
    pub sender: Option<String>,
}

/// Delivery acknowledgement or failure.
#[derive(Debug, Serialize)]
pub struct DeliveryResponse {
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<Vec<String>>,
}

/// List every agent and its status.
pub async fn list_agents(State(state): State<AppState>) -> Result<Json<AgentsResponse>, ApiError> {
    let agents = state.router.list_agents().await;
    let active_tab = state.active_tab.read().await.clone();
    Ok(Json(AgentsResponse { agents, active_tab }))
}

/// Idempotently create an agent's thread.
pub async fn create_agent(
    State(state): State<AppState>,
    Json(request): Json<CreateAgentRequest>,
) -> Result<Json<CreateAgentResponse>, ApiError> {
    let created = state.router.create_agent(&request.thread_name).await?;
    Ok(Json(CreateAgentResponse {
        created,
        thread_name: request.thread_name,
        reason: (!created).then(|| "already exists".to_string()),
    }))
}

/// Deliver a message to an agent.
///
/// Fire-and-forget: `delivered: true` means the router accepted the job,
/// not that the target finished responding. Unknown targets get a 404
/// carrying the current agent list so the client can auto-create and retry.
pub async fn message_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Result<Response, ApiError> {
    if !state.router.supervisor().thread_exists(&name).await {
        let available = state
            .router
            .list_agents()
            .await
            .into_iter()
            .map(|agent| agent.name)
            .collect();
        return Ok((
            StatusCode::NOT_FOUND,
            Json(DeliveryResponse {
                delivered: false,
                target: None,
                error: Some(format!("Agent \"{name}\" not found")),
                available: Some(available),
            }),
        )
            .into_response());
    }

    let sender = request.sender.as_deref().unwrap_or(ANONYMOUS_SENDER);
    if let Err(err) = state
        .router
        .inject_message(&name, &request.message, sender)
        .await
    {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(DeliveryResponse {
                delivered: false,
                target: Some(name),
                error: Some(format!("{err:#}")),
                available: None,
            }),
        )
            .into_response());
    }

    Ok(Json(DeliveryResponse {
        delivered: true,
        target: Some(name),
        error: None,
        available: None,
    })
    .into_response())
}
