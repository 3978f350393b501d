use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{ConversationId, MessageId, Timestamp, UserId};

/// 发送后允许编辑的时长（秒）
pub const EDIT_WINDOW_SECS: i64 = 15 * 60;
/// 软删除后对外展示的内容
pub const DELETED_PLACEHOLDER: &str = "This message was deleted";
pub const MAX_CONTENT_CHARS: usize = 4000;
pub const MAX_ATTACHMENTS: usize = 10;
const PREVIEW_CHARS: usize = 120;

pub fn edit_window() -> Duration {
    Duration::seconds(EDIT_WINDOW_SECS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Document,
    Video,
    Audio,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub size: u64,
    pub name: String,
    pub thumbnail: Option<String>,
}

impl Attachment {
    pub fn validate(&self) -> Result<(), DomainError> {
        let url = self.url.trim();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(DomainError::invalid_argument(
                "attachments.url",
                "must be an http(s) url",
            ));
        }
        if self.name.trim().is_empty() {
            return Err(DomainError::invalid_argument(
                "attachments.name",
                "cannot be empty",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: UserId,
    pub emoji: String,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRecord {
    pub content: String,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    /// 原始内容，编辑历史和审计使用
    pub content: String,
    /// 转义后的展示内容
    pub content_sanitized: String,
    pub attachments: Vec<Attachment>,
    pub reactions: Vec<Reaction>,
    pub edit_history: Vec<EditRecord>,
    pub spam_score: u8,
    pub is_spam: bool,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub deleted_by: Option<UserId>,
    pub deleted_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// 构造新消息所需的字段
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub content: String,
    pub content_sanitized: String,
    pub attachments: Vec<Attachment>,
    pub spam_score: u8,
    pub spam_threshold: u8,
}

impl Message {
    pub fn new(id: MessageId, draft: NewMessage, now: Timestamp) -> Self {
        Self {
            id,
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            sender_name: draft.sender_name,
            content: draft.content,
            content_sanitized: draft.content_sanitized,
            attachments: draft.attachments,
            reactions: Vec::new(),
            edit_history: Vec::new(),
            spam_score: draft.spam_score.min(100),
            is_spam: draft.spam_score >= draft.spam_threshold,
            is_edited: false,
            is_deleted: false,
            deleted_by: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 校验消息正文和附件：至少需要其一
    pub fn validate_payload(content: &str, attachments: &[Attachment]) -> Result<(), DomainError> {
        if content.trim().is_empty() && attachments.is_empty() {
            return Err(DomainError::invalid_argument(
                "content",
                "content or attachments required",
            ));
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(DomainError::invalid_argument("content", "too long"));
        }
        if attachments.len() > MAX_ATTACHMENTS {
            return Err(DomainError::invalid_argument(
                "attachments",
                "too many attachments",
            ));
        }
        attachments.iter().try_for_each(Attachment::validate)
    }

    /// 编辑前检查：发送者本人、未删除、在编辑窗口内
    pub fn ensure_editable(&self, editor: UserId, now: Timestamp) -> Result<(), DomainError> {
        if self.sender_id != editor {
            return Err(DomainError::NotMessageSender);
        }
        if self.is_deleted {
            return Err(DomainError::MessageDeleted);
        }
        if now - self.created_at >= edit_window() {
            return Err(DomainError::EditWindowExpired);
        }
        Ok(())
    }

    pub fn apply_edit(&mut self, content: String, content_sanitized: String, now: Timestamp) {
        let previous = std::mem::replace(&mut self.content, content);
        self.edit_history.push(EditRecord {
            content: previous,
            timestamp: now,
        });
        self.content_sanitized = content_sanitized;
        self.is_edited = true;
        self.updated_at = now;
    }

    pub fn soft_delete(&mut self, by: UserId, at: Timestamp) {
        self.is_deleted = true;
        self.deleted_by = Some(by);
        self.deleted_at = Some(at);
        self.updated_at = at;
    }

    /// 同一用户同一表情只保留一个，再次点击即移除。返回是否为新增。
    pub fn toggle_reaction(&mut self, user_id: UserId, emoji: &str, at: Timestamp) -> bool {
        if let Some(pos) = self
            .reactions
            .iter()
            .position(|r| r.user_id == user_id && r.emoji == emoji)
        {
            self.reactions.remove(pos);
            false
        } else {
            self.reactions.push(Reaction {
                user_id,
                emoji: emoji.to_owned(),
                timestamp: at,
            });
            true
        }
    }

    pub fn display_content(&self) -> &str {
        if self.is_deleted {
            DELETED_PLACEHOLDER
        } else {
            &self.content_sanitized
        }
    }

    /// 会话列表里的摘要
    pub fn preview(&self) -> String {
        preview_text(self.display_content(), self.attachments.len())
    }

    /// 垃圾消息和已删除消息不计入他人未读
    pub fn counts_toward_unread(&self) -> bool {
        !self.is_spam && !self.is_deleted
    }

    pub fn sender_name_or_default(&self) -> &str {
        self.sender_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(crate::participant::UNKNOWN_DISPLAY_NAME)
    }
}

/// 摘要文本：截断正文，纯附件消息显示附件数量
pub fn preview_text(content: &str, attachment_count: usize) -> String {
    let text = content.trim();
    if text.is_empty() && attachment_count > 0 {
        return format!("[{attachment_count} attachment(s)]");
    }
    text.chars().take(PREVIEW_CHARS).collect()
}

pub fn validate_emoji(emoji: &str) -> Result<(), DomainError> {
    let trimmed = emoji.trim();
    if trimmed.is_empty() || trimmed.len() > 32 || trimmed.len() != emoji.len() {
        return Err(DomainError::invalid_argument("emoji", "invalid emoji"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample(sender: UserId, created_at: Timestamp) -> Message {
        Message::new(
            MessageId::generate(),
            NewMessage {
                conversation_id: ConversationId::generate(),
                sender_id: sender,
                sender_name: Some("Alice".into()),
                content: "Hello".into(),
                content_sanitized: "Hello".into(),
                attachments: vec![],
                spam_score: 10,
                spam_threshold: 70,
            },
            created_at,
        )
    }

    #[test]
    fn edit_window_boundary() {
        let sender = UserId::from(Uuid::new_v4());
        let created = Utc::now();
        let message = sample(sender, created);

        let just_before = created + edit_window() - Duration::seconds(1);
        assert!(message.ensure_editable(sender, just_before).is_ok());

        let at_boundary = created + edit_window();
        assert_eq!(
            message.ensure_editable(sender, at_boundary),
            Err(DomainError::EditWindowExpired)
        );
    }

    #[test]
    fn only_sender_may_edit() {
        let sender = UserId::from(Uuid::new_v4());
        let message = sample(sender, Utc::now());
        assert_eq!(
            message.ensure_editable(UserId::from(Uuid::new_v4()), Utc::now()),
            Err(DomainError::NotMessageSender)
        );
    }

    #[test]
    fn apply_edit_appends_history() {
        let sender = UserId::from(Uuid::new_v4());
        let mut message = sample(sender, Utc::now());
        message.apply_edit("Hello there".into(), "Hello there".into(), Utc::now());

        assert!(message.is_edited);
        assert_eq!(message.edit_history.len(), 1);
        assert_eq!(message.edit_history[0].content, "Hello");
        assert_eq!(message.content, "Hello there");
    }

    #[test]
    fn reaction_toggle_is_involutive() {
        let sender = UserId::from(Uuid::new_v4());
        let reactor = UserId::from(Uuid::new_v4());
        let mut message = sample(sender, Utc::now());
        let before = message.reactions.clone();

        assert!(message.toggle_reaction(reactor, "👍", Utc::now()));
        assert!(!message.toggle_reaction(reactor, "👍", Utc::now()));
        assert_eq!(message.reactions, before);
    }

    #[test]
    fn deleted_message_shows_placeholder() {
        let sender = UserId::from(Uuid::new_v4());
        let mut message = sample(sender, Utc::now());
        message.soft_delete(sender, Utc::now());

        assert_eq!(message.display_content(), DELETED_PLACEHOLDER);
        assert_eq!(message.content, "Hello");
        assert!(!message.counts_toward_unread());
    }

    #[test]
    fn payload_requires_content_or_attachment() {
        assert!(Message::validate_payload("   ", &[]).is_err());
        let attachment = Attachment {
            url: "https://cdn.example.com/a.png".into(),
            kind: AttachmentKind::Image,
            size: 1024,
            name: "a.png".into(),
            thumbnail: None,
        };
        assert!(Message::validate_payload("", &[attachment]).is_ok());
    }
}
