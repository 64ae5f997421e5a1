//! Synchronous HTTP surface over the conversation service, plus the
//! WebSocket upgrade route.
//!
//! The acting user comes from the `x-user-id` header; authentication itself
//! is the external gateway's job.  Every handler delegates to
//! [`ConversationService`] so the WebSocket and REST paths share one
//! authorization and fan-out implementation.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use courier_shared::envelope::{MessageView, SendMessage};
use courier_shared::{
    ConversationId, MessageId, MessageKind, MessagePriority, ParticipantRole, PresenceStatus,
    ReactionOp, UserId,
};
use courier_store::{Conversation, ConversationFilter, MessageFilter, Participant};

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::presence::PresenceStore;
use crate::registry::ConnectionRegistry;
use crate::service::{ConversationDetail, ConversationService, ConversationSummary, MessagePage};
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub service: Arc<ConversationService>,
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub presence: Arc<PresenceStore>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/conversations", post(create_group).get(list_conversations))
        .route("/conversations/direct", post(open_direct))
        .route("/conversations/{id}", get(conversation_detail))
        .route("/conversations/{id}/settings", put(update_settings))
        .route("/conversations/{id}/participants", post(add_participant))
        .route(
            "/conversations/{id}/participants/{user_id}",
            delete(remove_participant),
        )
        .route(
            "/conversations/{id}/messages",
            post(send_message).get(list_messages),
        )
        .route("/conversations/{id}/read", post(mark_read))
        .route("/conversations/{id}/typing", post(set_typing))
        .route("/messages/{id}", put(edit_message).delete(delete_message))
        .route("/messages/{id}/reactions", post(react))
        .route("/messages/{id}/attachments", post(register_attachment))
        .route("/attachments/{id}", get(attachment_handle))
        .route("/users/{id}/presence", get(user_presence))
        .route("/blocks", post(block_user))
        .route("/blocks/{user_id}", delete(unblock_user))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve the HTTP/WebSocket API until the server fails.
pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// The authenticated user, as asserted by the gateway in `x-user-id`.
fn acting_user(headers: &HeaderMap) -> Result<UserId, ServerError> {
    let raw = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ServerError::Validation("missing x-user-id header".into()))?;
    raw.parse::<Uuid>()
        .map(UserId)
        .map_err(|_| ServerError::Validation("invalid x-user-id header".into()))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connections: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.registry.connection_count().await,
    })
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateGroupRequest {
    title: Option<String>,
    project_id: Option<Uuid>,
    member_ids: Vec<UserId>,
}

async fn create_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateGroupRequest>,
) -> Result<Json<Conversation>, ServerError> {
    let user_id = acting_user(&headers)?;
    let conversation = state
        .service
        .create_group_conversation(
            user_id,
            request.title.as_deref(),
            request.project_id,
            &request.member_ids,
        )
        .await?;
    Ok(Json(conversation))
}

#[derive(Deserialize)]
struct OpenDirectRequest {
    user_id: UserId,
    project_id: Option<Uuid>,
}

#[derive(Serialize)]
struct OpenDirectResponse {
    #[serde(flatten)]
    conversation: Conversation,
    created: bool,
}

async fn open_direct(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<OpenDirectRequest>,
) -> Result<Json<OpenDirectResponse>, ServerError> {
    let user_id = acting_user(&headers)?;
    let (conversation, created) = state
        .service
        .open_direct_conversation(user_id, request.user_id, request.project_id)
        .await?;
    Ok(Json(OpenDirectResponse {
        conversation,
        created,
    }))
}

#[derive(Deserialize)]
struct ConversationListParams {
    archived: Option<bool>,
    muted: Option<bool>,
    is_group: Option<bool>,
    search: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ConversationListParams>,
) -> Result<Json<Vec<ConversationSummary>>, ServerError> {
    let user_id = acting_user(&headers)?;
    let filter = ConversationFilter {
        archived: params.archived,
        muted: params.muted,
        is_group: params.is_group,
        search: params.search,
    };
    let summaries = state
        .service
        .list_conversations(
            user_id,
            &filter,
            params.limit.unwrap_or(50).min(200),
            params.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(summaries))
}

async fn conversation_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<ConversationId>,
) -> Result<Json<ConversationDetail>, ServerError> {
    let user_id = acting_user(&headers)?;
    let detail = state
        .service
        .conversation_detail(user_id, conversation_id)
        .await?;
    Ok(Json(detail))
}

#[derive(Deserialize)]
struct SettingsRequest {
    archived: Option<bool>,
    muted: Option<bool>,
}

#[derive(Serialize)]
struct SettingsResponse {
    is_archived: bool,
    is_muted: bool,
}

async fn update_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<ConversationId>,
    Json(request): Json<SettingsRequest>,
) -> Result<Json<SettingsResponse>, ServerError> {
    let user_id = acting_user(&headers)?;
    let setting = state
        .service
        .set_conversation_settings(user_id, conversation_id, request.archived, request.muted)
        .await?;
    Ok(Json(SettingsResponse {
        is_archived: setting.is_archived,
        is_muted: setting.is_muted,
    }))
}

// ---------------------------------------------------------------------------
// Participants
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AddParticipantRequest {
    user_id: UserId,
    role: Option<ParticipantRole>,
}

async fn add_participant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<ConversationId>,
    Json(request): Json<AddParticipantRequest>,
) -> Result<Json<Participant>, ServerError> {
    let actor_id = acting_user(&headers)?;
    let participant = state
        .service
        .add_participant(
            actor_id,
            conversation_id,
            request.user_id,
            request.role.unwrap_or(ParticipantRole::Member),
        )
        .await?;
    Ok(Json(participant))
}

async fn remove_participant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((conversation_id, user_id)): Path<(ConversationId, UserId)>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let actor_id = acting_user(&headers)?;
    state
        .service
        .remove_participant(actor_id, conversation_id, user_id)
        .await?;
    Ok(Json(serde_json::json!({ "removed": true })))
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SendMessageRequest {
    content: String,
    parent_id: Option<MessageId>,
    #[serde(default)]
    kind: MessageKind,
    #[serde(default)]
    priority: MessagePriority,
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<ConversationId>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<MessageView>, ServerError> {
    let user_id = acting_user(&headers)?;
    let view = state
        .service
        .send_message(
            user_id,
            &SendMessage {
                conversation_id,
                content: request.content,
                recipient_id: None,
                parent_id: request.parent_id,
                kind: request.kind,
                priority: request.priority,
            },
        )
        .await?;
    Ok(Json(view))
}

#[derive(Deserialize)]
struct MessageListParams {
    before_seq: Option<i64>,
    sender_id: Option<UserId>,
    kind: Option<MessageKind>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    text: Option<String>,
    limit: Option<u32>,
}

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<ConversationId>,
    Query(params): Query<MessageListParams>,
) -> Result<Json<MessagePage>, ServerError> {
    let user_id = acting_user(&headers)?;
    let filter = MessageFilter {
        before_seq: params.before_seq,
        sender_id: params.sender_id,
        kind: params.kind,
        since: params.since,
        until: params.until,
        text: params.text,
    };
    let page = state
        .service
        .list_messages(user_id, conversation_id, &filter, params.limit.unwrap_or(50))
        .await?;
    Ok(Json(page))
}

#[derive(Deserialize)]
struct EditMessageRequest {
    content: String,
}

async fn edit_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<MessageId>,
    Json(request): Json<EditMessageRequest>,
) -> Result<Json<MessageView>, ServerError> {
    let user_id = acting_user(&headers)?;
    let view = state
        .service
        .edit_message(user_id, message_id, &request.content)
        .await?;
    Ok(Json(view))
}

async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<MessageId>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = acting_user(&headers)?;
    state.service.delete_message(user_id, message_id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

// ---------------------------------------------------------------------------
// Reactions, receipts, typing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ReactionRequest {
    conversation_id: ConversationId,
    emoji: String,
    op: ReactionOp,
}

async fn react(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<MessageId>,
    Json(request): Json<ReactionRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = acting_user(&headers)?;
    state
        .service
        .react(
            user_id,
            request.conversation_id,
            message_id,
            &request.emoji,
            request.op,
        )
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Deserialize)]
struct MarkReadRequest {
    message_ids: Vec<MessageId>,
}

async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<ConversationId>,
    Json(request): Json<MarkReadRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = acting_user(&headers)?;
    state
        .service
        .mark_read(user_id, conversation_id, &request.message_ids)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Deserialize)]
struct TypingRequest {
    is_typing: bool,
}

async fn set_typing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<ConversationId>,
    Json(request): Json<TypingRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = acting_user(&headers)?;
    state
        .service
        .set_typing(user_id, conversation_id, request.is_typing)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RegisterAttachmentRequest {
    file_name: String,
    mime_type: String,
    size_bytes: i64,
    storage_key: String,
    thumbnail: Option<String>,
}

#[derive(Serialize)]
struct AttachmentResponse {
    id: Uuid,
    message_id: MessageId,
    file_name: String,
    mime_type: String,
    size_bytes: i64,
    storage_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail: Option<String>,
    scan_status: String,
}

async fn register_attachment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<MessageId>,
    Json(request): Json<RegisterAttachmentRequest>,
) -> Result<Json<AttachmentResponse>, ServerError> {
    let user_id = acting_user(&headers)?;
    let attachment = state
        .service
        .register_attachment(
            user_id,
            message_id,
            &request.file_name,
            &request.mime_type,
            request.size_bytes,
            &request.storage_key,
            request.thumbnail.as_deref(),
        )
        .await?;
    Ok(Json(attachment_response(attachment)))
}

async fn attachment_handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(attachment_id): Path<Uuid>,
) -> Result<Json<AttachmentResponse>, ServerError> {
    let user_id = acting_user(&headers)?;
    let attachment = state
        .service
        .attachment_handle(user_id, attachment_id)
        .await?;
    Ok(Json(attachment_response(attachment)))
}

fn attachment_response(attachment: courier_store::Attachment) -> AttachmentResponse {
    AttachmentResponse {
        id: attachment.id,
        message_id: attachment.message_id,
        file_name: attachment.file_name,
        mime_type: attachment.mime_type,
        size_bytes: attachment.size_bytes,
        storage_key: attachment.storage_key,
        thumbnail: attachment.thumbnail,
        scan_status: attachment.scan_status,
    }
}

// ---------------------------------------------------------------------------
// Presence & blocks
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PresenceResponse {
    user_id: UserId,
    status: PresenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_seen: Option<DateTime<Utc>>,
}

async fn user_presence(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Json<PresenceResponse> {
    let (status, last_seen) = state.service.presence_of(user_id).await;
    Json(PresenceResponse {
        user_id,
        status,
        last_seen,
    })
}

#[derive(Deserialize)]
struct BlockRequest {
    user_id: UserId,
}

async fn block_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BlockRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = acting_user(&headers)?;
    state.service.block_user(user_id, request.user_id).await?;
    Ok(Json(serde_json::json!({ "blocked": true })))
}

async fn unblock_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(blocked_id): Path<UserId>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = acting_user(&headers)?;
    state.service.unblock_user(user_id, blocked_id).await?;
    Ok(Json(serde_json::json!({ "unblocked": true })))
}
