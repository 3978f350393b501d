use axum::{
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use application::{
    AdminListRequest, CreateConversationRequest, EditMessageRequest, ListConversationsRequest,
    ListMessagesRequest, SendMessageRequest,
};
use domain::{
    AdminConversationFilter, AdminConversationRow, Attachment, ContextKind, Conversation,
    ConversationContext, ConversationFilter, ConversationId, ConversationStatus, ConversationType,
    MessageId, MessageView, OffsetPage, Page, Participant, ParticipantSettings, ReactionToggle,
    UnreadSummary, UserId,
};

use crate::{auth::AuthUser, error::ApiError, state::AppState, websocket::websocket_upgrade};

/// 请求体解析失败时返回统一的错误结构
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
struct ApiJson<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
struct ApiQuery<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
struct ApiPath<T>(T);

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl From<axum::extract::rejection::QueryRejection> for ApiError {
    fn from(rejection: axum::extract::rejection::QueryRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl From<axum::extract::rejection::PathRejection> for ApiError {
    fn from(rejection: axum::extract::rejection::PathRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

#[derive(Debug, Deserialize)]
struct CreateConversationPayload {
    #[serde(rename = "type")]
    kind: ConversationType,
    participant_ids: Vec<UserId>,
    #[serde(default)]
    context: Option<ConversationContext>,
}

#[derive(Debug, Default, Deserialize)]
struct ConversationListQuery {
    status: Option<ConversationStatus>,
    #[serde(rename = "type")]
    kind: Option<ConversationType>,
    archived: Option<bool>,
    pinned: Option<bool>,
    context_type: Option<ContextKind>,
    context_id: Option<String>,
    cursor: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    #[serde(default)]
    content: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    cursor: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct EditMessagePayload {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ReactionPayload {
    emoji: String,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
}

#[derive(Debug, Deserialize)]
struct AdminQuery {
    search: Option<String>,
    status: Option<ConversationStatus>,
    #[serde(default)]
    offset: u64,
    limit: Option<u32>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/conversations",
            post(create_conversation).get(list_conversations),
        )
        .route(
            "/conversations/{conversation_id}",
            get(get_conversation).delete(delete_conversation),
        )
        .route(
            "/conversations/{conversation_id}/settings",
            patch(update_settings),
        )
        .route("/conversations/{conversation_id}/read", post(mark_read))
        .route(
            "/conversations/{conversation_id}/messages",
            post(send_message).get(list_messages),
        )
        .route(
            "/messages/{message_id}",
            patch(edit_message).delete(delete_message),
        )
        .route("/messages/{message_id}/reactions", post(toggle_reaction))
        .route("/search/messages", get(search_messages))
        .route("/me/unread", get(unread_summary))
        .route("/admin/conversations", get(admin_conversations))
        .route("/ws", get(websocket_upgrade))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn create_conversation(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ApiJson(payload): ApiJson<CreateConversationPayload>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let result = state
        .conversation_service
        .create_conversation(
            &actor,
            CreateConversationRequest {
                kind: payload.kind,
                participant_ids: payload.participant_ids,
                context: payload.context,
            },
        )
        .await?;

    // 命中已有的 direct 会话时返回 200
    let status = if result.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result.conversation)))
}

async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ApiQuery(query): ApiQuery<ConversationListQuery>,
) -> Result<Json<Page<Conversation>>, ApiError> {
    let page = state
        .conversation_service
        .list_conversations(
            &actor,
            ListConversationsRequest {
                filter: ConversationFilter {
                    status: query.status,
                    kind: query.kind,
                    archived: query.archived,
                    pinned: query.pinned,
                    context_type: query.context_type,
                    context_id: query.context_id,
                },
                cursor: query.cursor,
                limit: query.limit,
            },
        )
        .await?;

    Ok(Json(page))
}

async fn get_conversation(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ApiPath(conversation_id): ApiPath<ConversationId>,
) -> Result<Json<Conversation>, ApiError> {
    let conversation = state
        .conversation_service
        .get_conversation(&actor, conversation_id)
        .await?;
    Ok(Json(conversation))
}

async fn delete_conversation(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ApiPath(conversation_id): ApiPath<ConversationId>,
) -> Result<Json<Conversation>, ApiError> {
    let conversation = state
        .conversation_service
        .delete_conversation(&actor, conversation_id)
        .await?;
    Ok(Json(conversation))
}

async fn update_settings(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ApiPath(conversation_id): ApiPath<ConversationId>,
    ApiJson(settings): ApiJson<ParticipantSettings>,
) -> Result<Json<Conversation>, ApiError> {
    let conversation = state
        .conversation_service
        .update_settings(&actor, conversation_id, settings)
        .await?;
    Ok(Json(conversation))
}

async fn mark_read(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ApiPath(conversation_id): ApiPath<ConversationId>,
) -> Result<Json<Participant>, ApiError> {
    let participant = state
        .conversation_service
        .mark_read(&actor, conversation_id)
        .await?;
    Ok(Json(participant))
}

async fn send_message(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ApiPath(conversation_id): ApiPath<ConversationId>,
    ApiJson(payload): ApiJson<SendMessagePayload>,
) -> Result<(StatusCode, Json<MessageView>), ApiError> {
    let message = state
        .conversation_service
        .send_message(
            &actor,
            SendMessageRequest {
                conversation_id,
                content: payload.content,
                attachments: payload.attachments,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

async fn list_messages(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ApiPath(conversation_id): ApiPath<ConversationId>,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> Result<Json<Page<MessageView>>, ApiError> {
    let page = state
        .conversation_service
        .list_messages(
            &actor,
            ListMessagesRequest {
                conversation_id,
                cursor: query.cursor,
                limit: query.limit,
            },
        )
        .await?;
    Ok(Json(page))
}

async fn edit_message(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ApiPath(message_id): ApiPath<MessageId>,
    ApiJson(payload): ApiJson<EditMessagePayload>,
) -> Result<Json<MessageView>, ApiError> {
    let message = state
        .conversation_service
        .edit_message(
            &actor,
            EditMessageRequest {
                message_id,
                content: payload.content,
            },
        )
        .await?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ApiPath(message_id): ApiPath<MessageId>,
) -> Result<Json<MessageView>, ApiError> {
    let message = state
        .conversation_service
        .delete_message(&actor, message_id)
        .await?;
    Ok(Json(message))
}

async fn toggle_reaction(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ApiPath(message_id): ApiPath<MessageId>,
    ApiJson(payload): ApiJson<ReactionPayload>,
) -> Result<Json<ReactionToggle>, ApiError> {
    let toggle = state
        .conversation_service
        .toggle_reaction(&actor, message_id, &payload.emoji)
        .await?;
    Ok(Json(toggle))
}

async fn search_messages(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ApiQuery(query): ApiQuery<SearchQuery>,
) -> Result<Json<Vec<MessageView>>, ApiError> {
    let hits = state
        .conversation_service
        .search_messages(&actor, &query.q)
        .await?;
    Ok(Json(hits))
}

async fn unread_summary(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
) -> Result<Json<UnreadSummary>, ApiError> {
    let summary = state.conversation_service.unread_summary(&actor).await?;
    Ok(Json(summary))
}

async fn admin_conversations(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ApiQuery(query): ApiQuery<AdminQuery>,
) -> Result<Json<OffsetPage<AdminConversationRow>>, ApiError> {
    let page = state
        .conversation_service
        .admin_list_conversations(
            &actor,
            AdminListRequest {
                filter: AdminConversationFilter {
                    search: query.search,
                    status: query.status,
                },
                offset: query.offset,
                limit: query.limit,
            },
        )
        .await?;
    Ok(Json(page))
}
