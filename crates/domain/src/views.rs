//! 对外传输的消息视图
//!
//! 已删除消息不对外暴露原始内容与附件。编辑历史只出现在审核视图中。

use serde::{Deserialize, Serialize};

use crate::conversation::LastMessage;
use crate::message::{preview_text, Attachment, EditRecord, Message, Reaction};
use crate::value_objects::{ConversationId, MessageId, Timestamp, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    /// 可直接展示的内容（已转义，删除后为占位文本）
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub reactions: Vec<Reaction>,
    pub is_edited: bool,
    pub edit_count: u32,
    /// 编辑前的原始内容，仅审核视图携带
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_history: Option<Vec<EditRecord>>,
    pub is_spam: bool,
    pub is_deleted: bool,
    pub deleted_by: Option<UserId>,
    pub deleted_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl From<&Message> for MessageView {
    fn from(message: &Message) -> Self {
        let deleted = message.is_deleted;
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            sender_name: message.sender_name.clone(),
            content: message.display_content().to_owned(),
            attachments: if deleted {
                Vec::new()
            } else {
                message.attachments.clone()
            },
            reactions: if deleted {
                Vec::new()
            } else {
                message.reactions.clone()
            },
            is_edited: message.is_edited,
            edit_count: message.edit_history.len() as u32,
            edit_history: None,
            is_spam: message.is_spam,
            is_deleted: deleted,
            deleted_by: message.deleted_by,
            deleted_at: message.deleted_at,
            created_at: message.created_at,
            updated_at: message.updated_at,
        }
    }
}

impl MessageView {
    /// 审核视图：附带完整编辑历史
    pub fn for_moderator(message: &Message) -> Self {
        Self {
            edit_history: Some(message.edit_history.clone()),
            ..Self::from(message)
        }
    }

    /// 会话列表摘要
    pub fn last_message(&self) -> LastMessage {
        LastMessage {
            content_preview: preview_text(&self.content, self.attachments.len()),
            sender_id: self.sender_id,
            timestamp: self.created_at,
        }
    }
}

impl From<Message> for MessageView {
    fn from(message: Message) -> Self {
        MessageView::from(&message)
    }
}

/// 分页结果，`next_cursor` 为空表示没有更多数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
        }
    }
}

/// 管理后台的偏移分页结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetPage<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u32,
}

/// 管理后台列表行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminConversationRow {
    pub conversation: crate::conversation::Conversation,
    pub total_unread: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadSummary {
    pub total_unread: u64,
    pub conversations_with_unread: u64,
}
