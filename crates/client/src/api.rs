//! 会话服务的请求封装
//!
//! 每个服务端接口对应一个方法。只读请求在网络抖动或 5xx 时按指数退避最多重试 2 次，
//! 写请求从不自动重试。

use std::time::Duration;

use application::retry::{retry_async, Backoff, RetryConfig};
use domain::{
    AdminConversationRow, Attachment, Conversation, ConversationContext, ConversationFilter,
    ConversationId, ConversationStatus, ConversationType, MessageId, MessageView, OffsetPage, Page,
    Participant, ParticipantSettings, ReactionToggle, UnreadSummary, UserId,
};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::ClientError;

/// 重试资格取决于请求是否幂等
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotence {
    Read,
    Write,
}

/// 创建会话的结果，`created` 为 false 表示命中已有的 direct 会话
#[derive(Debug, Clone)]
pub struct CreatedConversation {
    pub conversation: Conversation,
    pub created: bool,
}

#[derive(Clone)]
pub struct ChatApi {
    http: Client,
    base_url: String,
    token: String,
    read_retry: RetryConfig,
}

impl ChatApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            read_retry: RetryConfig {
                max_attempts: 3,
                backoff: Backoff::exponential(Duration::from_millis(200), Duration::from_secs(2)),
            },
        }
    }

    pub fn with_read_retry(mut self, read_retry: RetryConfig) -> Self {
        self.read_retry = read_retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// 实时通道地址
    pub fn websocket_url(&self) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{base}/api/v1/ws?token={}", self.token)
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<(StatusCode, T), ClientError> {
        let mut request = self
            .http
            .request(method, format!("{}/api/v1{path}", self.base_url))
            .bearer_auth(&self.token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::from_response(status, &text));
        }
        let value = response.json::<T>().await?;
        Ok((status, value))
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        idempotence: Idempotence,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<(StatusCode, T), ClientError> {
        let single = RetryConfig {
            max_attempts: 1,
            ..self.read_retry.clone()
        };
        let config = match idempotence {
            Idempotence::Read => &self.read_retry,
            Idempotence::Write => &single,
        };
        retry_async(config, ClientError::is_transient, || {
            self.send_once(method.clone(), path, query, body.as_ref())
        })
        .await
    }

    async fn read<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        self.execute(Idempotence::Read, Method::GET, path, query, None)
            .await
            .map(|(_, value)| value)
    }

    async fn write<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, ClientError> {
        self.execute(Idempotence::Write, method, path, &[], body)
            .await
            .map(|(_, value)| value)
    }

    pub async fn create_conversation(
        &self,
        kind: ConversationType,
        participant_ids: &[UserId],
        context: Option<&ConversationContext>,
    ) -> Result<CreatedConversation, ClientError> {
        let body = json!({
            "type": kind,
            "participant_ids": participant_ids,
            "context": context,
        });
        let (status, conversation) = self
            .execute(Idempotence::Write, Method::POST, "/conversations", &[], Some(body))
            .await?;
        Ok(CreatedConversation {
            conversation,
            created: status == StatusCode::CREATED,
        })
    }

    pub async fn list_conversations(
        &self,
        filter: &ConversationFilter,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Page<Conversation>, ClientError> {
        let mut query = Vec::new();
        if let Some(status) = filter.status {
            query.push(("status", status.as_str().to_string()));
        }
        if let Some(kind) = filter.kind {
            query.push(("type", kind.as_str().to_string()));
        }
        if let Some(archived) = filter.archived {
            query.push(("archived", archived.to_string()));
        }
        if let Some(pinned) = filter.pinned {
            query.push(("pinned", pinned.to_string()));
        }
        if let Some(context_type) = filter.context_type {
            query.push(("context_type", context_type.as_str().to_string()));
        }
        if let Some(context_id) = &filter.context_id {
            query.push(("context_id", context_id.clone()));
        }
        push_page(&mut query, cursor, limit);
        self.read("/conversations", &query).await
    }

    pub async fn get_conversation(&self, id: ConversationId) -> Result<Conversation, ClientError> {
        self.read(&format!("/conversations/{id}"), &[]).await
    }

    pub async fn update_settings(
        &self,
        id: ConversationId,
        settings: &ParticipantSettings,
    ) -> Result<Conversation, ClientError> {
        self.write(
            Method::PATCH,
            &format!("/conversations/{id}/settings"),
            Some(json!(settings)),
        )
        .await
    }

    pub async fn delete_conversation(&self, id: ConversationId) -> Result<Conversation, ClientError> {
        self.write(Method::DELETE, &format!("/conversations/{id}"), None)
            .await
    }

    pub async fn mark_read(&self, id: ConversationId) -> Result<Participant, ClientError> {
        self.write(Method::POST, &format!("/conversations/{id}/read"), None)
            .await
    }

    pub async fn list_messages(
        &self,
        id: ConversationId,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Page<MessageView>, ClientError> {
        let mut query = Vec::new();
        push_page(&mut query, cursor, limit);
        self.read(&format!("/conversations/{id}/messages"), &query)
            .await
    }

    pub async fn send_message(
        &self,
        id: ConversationId,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<MessageView, ClientError> {
        self.write(
            Method::POST,
            &format!("/conversations/{id}/messages"),
            Some(json!({ "content": content, "attachments": attachments })),
        )
        .await
    }

    pub async fn edit_message(&self, id: MessageId, content: &str) -> Result<MessageView, ClientError> {
        self.write(
            Method::PATCH,
            &format!("/messages/{id}"),
            Some(json!({ "content": content })),
        )
        .await
    }

    pub async fn delete_message(&self, id: MessageId) -> Result<MessageView, ClientError> {
        self.write(Method::DELETE, &format!("/messages/{id}"), None)
            .await
    }

    pub async fn toggle_reaction(
        &self,
        id: MessageId,
        emoji: &str,
    ) -> Result<ReactionToggle, ClientError> {
        self.write(
            Method::POST,
            &format!("/messages/{id}/reactions"),
            Some(json!({ "emoji": emoji })),
        )
        .await
    }

    pub async fn search_messages(&self, query: &str) -> Result<Vec<MessageView>, ClientError> {
        self.read("/search/messages", &[("q", query.to_string())])
            .await
    }

    pub async fn unread_summary(&self) -> Result<UnreadSummary, ClientError> {
        self.read("/me/unread", &[]).await
    }

    pub async fn admin_list_conversations(
        &self,
        search: Option<&str>,
        status: Option<ConversationStatus>,
        offset: u64,
        limit: Option<u32>,
    ) -> Result<OffsetPage<AdminConversationRow>, ClientError> {
        let mut query = vec![("offset", offset.to_string())];
        if let Some(search) = search {
            query.push(("search", search.to_string()));
        }
        if let Some(status) = status {
            query.push(("status", status.as_str().to_string()));
        }
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        self.read("/admin/conversations", &query).await
    }
}

fn push_page(query: &mut Vec<(&'static str, String)>, cursor: Option<&str>, limit: Option<u32>) {
    if let Some(cursor) = cursor {
        query.push(("cursor", cursor.to_string()));
    }
    if let Some(limit) = limit {
        query.push(("limit", limit.to_string()));
    }
}
