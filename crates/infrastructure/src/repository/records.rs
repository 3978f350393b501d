use std::collections::HashMap;

use chrono::{DateTime, Utc};
use domain::{
    Attachment, ContextKind, Conversation, ConversationContext, ConversationId,
    ConversationStatus, ConversationType, EditRecord, LastMessage, Message, MessageId,
    Participant, ParticipantRole, Reaction, RepositoryError, UserId,
};
use sqlx::{types::Json, FromRow};
use uuid::Uuid;

use super::invalid_data;

pub(crate) const CONVERSATION_COLUMNS: &str = "c.id, c.type, c.status, c.context_type, \
     c.context_ref_id, c.context_title, c.last_message_preview, c.last_message_sender_id, \
     c.last_message_at, c.created_by, c.created_at, c.updated_at";

pub(crate) const PARTICIPANT_COLUMNS: &str = "conversation_id, user_id, display_name, role, \
     is_pinned, is_muted, is_archived, unread_count, last_read_at";

pub(crate) const MESSAGE_COLUMNS: &str = "m.id, m.conversation_id, m.sender_id, m.sender_name, \
     m.content, m.content_sanitized, m.attachments, m.edit_history, m.spam_score, m.is_spam, \
     m.is_edited, m.is_deleted, m.deleted_by, m.deleted_at, m.created_at, m.updated_at";

#[derive(Debug, FromRow)]
pub(crate) struct ConversationRecord {
    pub id: Uuid,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub status: String,
    pub context_type: Option<String>,
    pub context_ref_id: Option<String>,
    pub context_title: Option<String>,
    pub last_message_preview: Option<String>,
    pub last_message_sender_id: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn into_conversation(self, participants: Vec<Participant>) -> Result<Conversation, RepositoryError> {
        let kind = ConversationType::parse(&self.kind)
            .ok_or_else(|| invalid_data(format!("unknown conversation type {}", self.kind)))?;
        let status = ConversationStatus::parse(&self.status)
            .ok_or_else(|| invalid_data(format!("unknown conversation status {}", self.status)))?;

        let context = match (self.context_type, self.context_ref_id) {
            (Some(context_type), Some(referenced_id)) => Some(ConversationContext {
                kind: ContextKind::parse(&context_type)
                    .ok_or_else(|| invalid_data(format!("unknown context type {context_type}")))?,
                referenced_id,
                title: self.context_title,
            }),
            _ => None,
        };

        let last_message = match (
            self.last_message_preview,
            self.last_message_sender_id,
            self.last_message_at,
        ) {
            (Some(content_preview), Some(sender_id), Some(timestamp)) => Some(LastMessage {
                content_preview,
                sender_id: UserId::from(sender_id),
                timestamp,
            }),
            _ => None,
        };

        Ok(Conversation {
            id: ConversationId::from(self.id),
            kind,
            participants,
            context,
            last_message,
            status,
            created_by: UserId::from(self.created_by),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ParticipantRecord {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub display_name: Option<String>,
    pub role: String,
    pub is_pinned: bool,
    pub is_muted: bool,
    pub is_archived: bool,
    pub unread_count: i32,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl TryFrom<ParticipantRecord> for Participant {
    type Error = RepositoryError;

    fn try_from(value: ParticipantRecord) -> Result<Self, Self::Error> {
        let role = ParticipantRole::parse(&value.role)
            .ok_or_else(|| invalid_data(format!("unknown participant role {}", value.role)))?;
        Ok(Participant {
            user_id: UserId::from(value.user_id),
            display_name: value.display_name,
            role,
            is_pinned: value.is_pinned,
            is_muted: value.is_muted,
            is_archived: value.is_archived,
            unread_count: u32::try_from(value.unread_count).unwrap_or(0),
            last_read_at: value.last_read_at,
        })
    }
}

/// 按会话分组参与者，保留查询顺序
pub(crate) fn group_participants(
    records: Vec<ParticipantRecord>,
) -> Result<HashMap<Uuid, Vec<Participant>>, RepositoryError> {
    let mut grouped: HashMap<Uuid, Vec<Participant>> = HashMap::new();
    for record in records {
        let conversation_id = record.conversation_id;
        grouped
            .entry(conversation_id)
            .or_default()
            .push(Participant::try_from(record)?);
    }
    Ok(grouped)
}

#[derive(Debug, FromRow)]
pub(crate) struct MessageRecord {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: Option<String>,
    pub content: String,
    pub content_sanitized: String,
    pub attachments: Json<Vec<Attachment>>,
    pub edit_history: Json<Vec<EditRecord>>,
    pub spam_score: i16,
    pub is_spam: bool,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub deleted_by: Option<Uuid>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn into_message(self, reactions: Vec<Reaction>) -> Message {
        Message {
            id: MessageId::from(self.id),
            conversation_id: ConversationId::from(self.conversation_id),
            sender_id: UserId::from(self.sender_id),
            sender_name: self.sender_name,
            content: self.content,
            content_sanitized: self.content_sanitized,
            attachments: self.attachments.0,
            reactions,
            edit_history: self.edit_history.0,
            spam_score: u8::try_from(self.spam_score.clamp(0, 100)).unwrap_or(100),
            is_spam: self.is_spam,
            is_edited: self.is_edited,
            is_deleted: self.is_deleted,
            deleted_by: self.deleted_by.map(UserId::from),
            deleted_at: self.deleted_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ReactionRecord {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

impl From<ReactionRecord> for Reaction {
    fn from(value: ReactionRecord) -> Self {
        Reaction {
            user_id: UserId::from(value.user_id),
            emoji: value.emoji,
            timestamp: value.created_at,
        }
    }
}

pub(crate) fn group_reactions(records: Vec<ReactionRecord>) -> HashMap<Uuid, Vec<Reaction>> {
    let mut grouped: HashMap<Uuid, Vec<Reaction>> = HashMap::new();
    for record in records {
        grouped
            .entry(record.message_id)
            .or_default()
            .push(Reaction::from(record));
    }
    grouped
}

#[derive(Debug, FromRow)]
pub(crate) struct UnreadSummaryRecord {
    pub total_unread: i64,
    pub conversations_with_unread: i64,
}

#[derive(Debug, FromRow)]
pub(crate) struct SenderHistoryRecord {
    pub messages_last_minute: i64,
    pub messages_last_day: i64,
    pub spam_flagged_last_day: i64,
}

pub(crate) fn count_to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}
