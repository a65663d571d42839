//! Route handlers and their wire DTOs.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use hireling_tools::ToolDefinition;
use hireling_types::{Cents, Execution, Session, Settlement};

use crate::error::ApiError;
use crate::AppState;

// ── DTOs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub agent_id: String,
    #[serde(default)]
    pub provider_id: Option<String>,
    pub budget_allowance: Cents,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionAction {
    Start,
    End,
}

#[derive(Debug, Deserialize)]
pub struct PatchSessionRequest {
    pub action: SessionAction,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub tool_id: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleRequest {
    pub session_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBody {
    pub id: Uuid,
    pub agent_id: String,
    pub provider_id: String,
    pub status: String,
    pub budget_allowance: Cents,
    pub consumed: Cents,
    pub remaining_budget: Cents,
    pub effective_ms: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<DateTime<Utc>>,
}

impl From<&Session> for SessionBody {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id,
            agent_id: s.agent_id.clone(),
            provider_id: s.provider_id.clone(),
            status: s.status.to_string(),
            budget_allowance: s.budget_allowance,
            consumed: s.consumed,
            remaining_budget: s.remaining_budget(),
            effective_ms: s.effective_ms,
            created_at: s.created_at,
            ended_at: s.ended_at,
            settled_at: s.settled_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionBody {
    pub id: Uuid,
    pub tool_id: String,
    pub status: String,
    pub args: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<Cents>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Execution> for ExecutionBody {
    fn from(e: &Execution) -> Self {
        Self {
            id: e.id,
            tool_id: e.tool_id.clone(),
            status: e.status.to_string(),
            args: e.args.clone(),
            started_at: e.started_at,
            ended_at: e.ended_at,
            exit_code: e.exit_code,
            duration_ms: e.duration_ms,
            cost: e.cost,
            stdout: e.stdout.clone(),
            stderr: e.stderr.clone(),
            error: e.error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementBody {
    pub id: Uuid,
    pub session_id: Uuid,
    pub total_amount: Cents,
    pub provider_payout: Cents,
    pub platform_fee: Cents,
    pub reserve_amount: Cents,
    pub reference: String,
    pub settled_at: DateTime<Utc>,
}

impl From<&Settlement> for SettlementBody {
    fn from(s: &Settlement) -> Self {
        Self {
            id: s.id,
            session_id: s.session_id,
            total_amount: s.total_amount,
            provider_payout: s.provider_payout,
            platform_fee: s.platform_fee,
            reserve_amount: s.reserve_amount,
            reference: s.reference.clone(),
            settled_at: s.settled_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolBody {
    pub id: String,
    pub name: String,
    pub max_duration_secs: u64,
    pub price_per_minute: Cents,
    pub args: Vec<ToolArgBody>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolArgBody {
    pub name: String,
    pub arg_type: String,
    pub required: bool,
}

impl From<&ToolDefinition> for ToolBody {
    fn from(t: &ToolDefinition) -> Self {
        Self {
            id: t.id.clone(),
            name: t.name.clone(),
            max_duration_secs: t.max_duration_secs,
            price_per_minute: t.price_per_minute,
            args: t
                .args
                .iter()
                .map(|a| ToolArgBody {
                    name: a.name.clone(),
                    arg_type: a.arg_type.to_string(),
                    required: a.required,
                })
                .collect(),
        }
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionBody>), ApiError> {
    if let Some(provider_id) = &body.provider_id {
        if provider_id != &state.provider_id {
            return Err(ApiError::not_found(format!(
                "provider '{provider_id}' is not served here"
            )));
        }
    }
    let session = state
        .manager
        .create_session(&body.agent_id, body.budget_allowance)
        .await?;
    Ok((StatusCode::CREATED, Json(SessionBody::from(&session))))
}

pub async fn patch_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<PatchSessionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match body.action {
        SessionAction::Start => {
            let session = state.manager.start_session(id).await?;
            Ok(Json(json!({ "session": SessionBody::from(&session) })))
        }
        SessionAction::End => {
            let (session, preview) = state.manager.end_session(id).await?;
            Ok(Json(json!({
                "session": SessionBody::from(&session),
                "settlement": {
                    "totalAmount": preview.total_amount,
                    "providerPayout": preview.provider_payout,
                    "platformFee": preview.platform_fee,
                    "reserveAmount": preview.reserve_amount,
                },
            })))
        }
    }
}

pub async fn execute(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let receipt = state.manager.execute(id, &body.tool_id, &body.args).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "executionId": receipt.execution_id,
            "status": receipt.status.to_string(),
            "projectedCost": receipt.projected_cost,
            "remainingBudget": receipt.remaining_budget,
        })),
    ))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (session, executions) = state.manager.get_session(id).await?;
    let executions: Vec<ExecutionBody> = executions.iter().map(ExecutionBody::from).collect();
    Ok(Json(json!({
        "session": SessionBody::from(&session),
        "executions": executions,
    })))
}

pub async fn list_tools(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let tools: Vec<ToolBody> = state
        .manager
        .registry()
        .list()
        .iter()
        .map(ToolBody::from)
        .collect();
    Json(json!({ "tools": tools }))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let counts = state.manager.engine().counts();
    Json(json!({
        "status": "ok",
        "provider": state.provider_id,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "activeSessions": state.manager.active_sessions(),
        "executions": {
            "inFlight": counts.in_flight,
            "totalStarted": counts.total_started,
        },
    }))
}

pub async fn settle(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SettleRequest>,
) -> Result<(StatusCode, Json<SettlementBody>), ApiError> {
    let settlement = state.manager.settle_session(body.session_id).await?;
    Ok((StatusCode::CREATED, Json(SettlementBody::from(&settlement))))
}
