use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use serde::Deserialize;

use super::models::*;
use super::store::{DataStore, LocalStore};
use super::webhooks::WebhookAction;
use crate::errors::DashboardError;

/// Header carrying the authenticated user id, set by the fronting auth proxy.
pub const USER_HEADER: &str = "x-user-id";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: LocalStore,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateColumnRequest {
    pub name: String,
    pub color: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateColumnRequest {
    pub name: Option<String>,
    pub color: Option<String>,
    pub position: Option<i32>,
}

#[derive(Deserialize)]
pub struct MoveLeadRequest {
    pub column_id: i64,
    pub position: f64,
}

#[derive(Deserialize)]
pub struct ConvertLeadsRequest {
    pub lead_ids: Vec<i64>,
    pub list_name: String,
}

#[derive(Deserialize)]
pub struct CreateConversationRequest {
    pub contact_phone: String,
    pub contact_name: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct LeadFromConversationRequest {
    pub column_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct RecordMessageRequest {
    pub direction: MessageDirection,
    #[serde(default)]
    pub body: String,
    pub media_url: Option<String>,
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct UpsertWebhookRequest {
    pub url: String,
}

const DEFAULT_COLUMN_COLOR: &str = "#64748b";

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                format!("Missing {} header", USER_HEADER),
            ),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<DashboardError> for ApiError {
    fn from(e: DashboardError) -> Self {
        let msg = e.to_string();
        match &e {
            DashboardError::Validation(_) | DashboardError::DefaultColumnProtected => {
                ApiError::BadRequest(msg)
            }
            DashboardError::AccessDenied => ApiError::Forbidden(msg),
            DashboardError::NotFound { .. } => ApiError::NotFound(msg),
            DashboardError::MutationInFlight(_) => ApiError::Conflict(msg),
            DashboardError::WriteRejected { .. } | DashboardError::Transport(_) => {
                ApiError::BadGateway(msg)
            }
            DashboardError::Database(_) | DashboardError::Other(_) => {
                tracing::error!(error = ?e, "request failed");
                ApiError::Internal(msg)
            }
        }
    }
}

// ── Principal extraction ──────────────────────────────────────────────

/// The caller, taken from the [`USER_HEADER`] header.
pub struct Caller(pub Principal);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Caller(Principal::new(v)))
            .ok_or(ApiError::Unauthorized)
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/board", get(get_board))
        .route("/api/columns", get(list_columns).post(create_column))
        .route("/api/columns/{id}", patch(update_column).delete(delete_column))
        .route("/api/columns/{id}/renormalize", post(renormalize_column))
        .route("/api/leads", get(list_leads).post(create_lead))
        .route("/api/leads/convert", post(convert_leads))
        .route(
            "/api/leads/{id}",
            get(get_lead).patch(update_lead).delete(delete_lead),
        )
        .route("/api/leads/{id}/move", patch(move_lead))
        .route("/api/contacts", get(list_contacts))
        .route("/api/contacts/{id}", axum::routing::delete(delete_contact))
        .route("/api/contact-lists", get(list_contact_lists))
        .route("/api/contact-lists/{id}/members", get(list_members))
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/api/conversations/{id}/lead", post(lead_from_conversation))
        .route(
            "/api/conversations/{id}/messages",
            get(list_messages).post(record_message),
        )
        .route("/api/conversations/{id}/read", post(mark_read))
        .route("/api/webhooks", get(list_webhooks))
        .route("/api/webhooks/{name}", put(upsert_webhook))
        .route("/api/stats", get(get_stats))
        .route("/api/plan", get(get_plan).put(put_plan))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_board(
    State(state): State<SharedState>,
    Caller(user): Caller,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.get_board(&user).await?))
}

async fn list_columns(
    State(state): State<SharedState>,
    Caller(user): Caller,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_columns(&user).await?))
}

async fn create_column(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Json(req): Json<CreateColumnRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Column name is required".into()));
    }
    let color = req.color.as_deref().unwrap_or(DEFAULT_COLUMN_COLOR);
    let column = state.store.create_column(&user, name, color).await?;
    Ok((StatusCode::CREATED, Json(column)))
}

async fn update_column(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Path(id): Path<i64>,
    Json(req): Json<UpdateColumnRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let column = state
        .store
        .update_column(&user, id, req.name, req.color, req.position)
        .await?;
    Ok(Json(column))
}

async fn delete_column(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let reassigned = state.store.delete_column(&user, id).await?;
    Ok(Json(serde_json::json!({"reassigned": reassigned})))
}

async fn renormalize_column(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.renormalize_column(&user, id).await?))
}

async fn list_leads(
    State(state): State<SharedState>,
    Caller(user): Caller,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_leads(&user).await?))
}

async fn get_lead(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.get_lead(&user, id).await?))
}

async fn create_lead(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Json(input): Json<LeadInput>,
) -> Result<impl IntoResponse, ApiError> {
    let lead = state.store.create_lead(&user, &input).await?;
    Ok((StatusCode::CREATED, Json(lead)))
}

async fn update_lead(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Path(id): Path<i64>,
    Json(input): Json<LeadInput>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.update_lead(&user, id, &input).await?))
}

async fn move_lead(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Path(id): Path<i64>,
    Json(req): Json<MoveLeadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !req.position.is_finite() {
        return Err(ApiError::BadRequest("Position must be a finite number".into()));
    }
    let lead = state
        .store
        .move_lead(&user, id, req.column_id, req.position)
        .await?;
    Ok(Json(lead))
}

async fn delete_lead(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_lead(&user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn convert_leads(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Json(req): Json<ConvertLeadsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let list_name = req.list_name.trim();
    if list_name.is_empty() {
        return Err(ApiError::BadRequest("List name is required".into()));
    }
    let report = state
        .store
        .convert_leads_to_contacts(&user, &req.lead_ids, list_name)
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn list_contacts(
    State(state): State<SharedState>,
    Caller(user): Caller,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_contacts(&user).await?))
}

async fn delete_contact(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_contact(&user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_contact_lists(
    State(state): State<SharedState>,
    Caller(user): Caller,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_contact_lists(&user).await?))
}

async fn list_members(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_members(&user, id).await?))
}

async fn list_conversations(
    State(state): State<SharedState>,
    Caller(user): Caller,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_conversations(&user).await?))
}

async fn create_conversation(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let phone = req.contact_phone.trim();
    if phone.is_empty() {
        return Err(ApiError::BadRequest("Contact phone is required".into()));
    }
    let conversation = state
        .store
        .create_conversation(&user, phone, req.contact_name.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn lead_from_conversation(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Path(id): Path<i64>,
    body: Option<Json<LeadFromConversationRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let lead = state
        .store
        .create_lead_from_conversation(&user, id, req.column_id)
        .await?;
    Ok((StatusCode::CREATED, Json(lead)))
}

async fn list_messages(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_messages(&user, id).await?))
}

/// Record a message that already went through the automation layer
/// (inbound deliveries, or outbound sends relayed elsewhere).
async fn record_message(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Path(id): Path<i64>,
    Json(req): Json<RecordMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.body.trim().is_empty() && req.media_url.is_none() {
        return Err(ApiError::BadRequest(
            "Message needs a body or a media_url".into(),
        ));
    }
    let status = req.status.unwrap_or_else(|| match req.direction {
        MessageDirection::Inbound => "received".to_string(),
        MessageDirection::Outbound => "sent".to_string(),
    });
    let message = state
        .store
        .record_message(&user, id, req.direction, &req.body, req.media_url, &status)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_read(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.mark_conversation_read(&user, id).await?))
}

async fn list_webhooks(
    State(state): State<SharedState>,
    Caller(_user): Caller,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_webhooks().await?))
}

async fn upsert_webhook(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Path(name): Path<String>,
    Json(req): Json<UpsertWebhookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let action = name.parse::<WebhookAction>().map_err(ApiError::BadRequest)?;
    let url = req.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ApiError::BadRequest(
            "Webhook url must be an http(s) URL".into(),
        ));
    }
    let endpoint = state
        .store
        .upsert_webhook(action.registry_name(), url)
        .await?;
    tracing::info!(webhook = %action, user = %user, "webhook endpoint registered");
    Ok(Json(endpoint))
}

async fn get_stats(
    State(state): State<SharedState>,
    Caller(user): Caller,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.stats(&user).await?))
}

async fn get_plan(
    State(state): State<SharedState>,
    Caller(user): Caller,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.plan_usage(&user).await?))
}

async fn put_plan(
    State(state): State<SharedState>,
    Caller(user): Caller,
    Json(payload): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.set_plan_payload(&user, payload).await?;
    Ok(Json(state.store.plan_usage(&user).await?))
}

// ── Tests ─────────────────────────────────────────────────────────────
