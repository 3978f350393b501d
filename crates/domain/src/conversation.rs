use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::message::{Message, DELETED_PLACEHOLDER};
use crate::participant::{Participant, ParticipantRole};
use crate::value_objects::{ConversationId, Timestamp, UserId};

/// 单个会话的参与者上限
pub const MAX_PARTICIPANTS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    Direct,
    Group,
    Contextual,
    Support,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::Direct => "direct",
            ConversationType::Group => "group",
            ConversationType::Contextual => "contextual",
            ConversationType::Support => "support",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "direct" => Some(ConversationType::Direct),
            "group" => Some(ConversationType::Group),
            "contextual" => Some(ConversationType::Contextual),
            "support" => Some(ConversationType::Support),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Active,
    Archived,
    Deleted,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
            ConversationStatus::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(ConversationStatus::Active),
            "archived" => Some(ConversationStatus::Archived),
            "deleted" => Some(ConversationStatus::Deleted),
            _ => None,
        }
    }
}

/// 业务记录类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    Listing,
    Order,
    Quote,
    Inquiry,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Listing => "listing",
            ContextKind::Order => "order",
            ContextKind::Quote => "quote",
            ContextKind::Inquiry => "inquiry",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "listing" => Some(ContextKind::Listing),
            "order" => Some(ContextKind::Order),
            "quote" => Some(ContextKind::Quote),
            "inquiry" => Some(ContextKind::Inquiry),
            _ => None,
        }
    }
}

/// 创建时复制的业务记录快照，之后不再和源记录关联
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    #[serde(rename = "type")]
    pub kind: ContextKind,
    pub referenced_id: String,
    pub title: Option<String>,
}

impl ConversationContext {
    pub fn validate(&self) -> Result<(), DomainError> {
        let referenced = self.referenced_id.trim();
        if referenced.is_empty() {
            return Err(DomainError::invalid_argument(
                "context.referenced_id",
                "cannot be empty",
            ));
        }
        if referenced.len() > 128 {
            return Err(DomainError::invalid_argument(
                "context.referenced_id",
                "too long",
            ));
        }
        if self.title.as_deref().is_some_and(|title| title.len() > 200) {
            return Err(DomainError::invalid_argument("context.title", "too long"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub content_preview: String,
    pub sender_id: UserId,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(rename = "type")]
    pub kind: ConversationType,
    pub participants: Vec<Participant>,
    pub context: Option<ConversationContext>,
    pub last_message: Option<LastMessage>,
    pub status: ConversationStatus,
    pub created_by: UserId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Conversation {
    /// 构造新会话。`participants` 必须已包含创建者。
    pub fn new(
        id: ConversationId,
        kind: ConversationType,
        created_by: UserId,
        participants: Vec<Participant>,
        context: Option<ConversationContext>,
        now: Timestamp,
    ) -> Result<Self, DomainError> {
        Self::validate_participants(kind, created_by, &participants)?;
        if let Some(context) = &context {
            context.validate()?;
        }
        if kind == ConversationType::Contextual && context.is_none() {
            return Err(DomainError::invalid_argument(
                "context",
                "contextual conversations require a context",
            ));
        }

        Ok(Self {
            id,
            kind,
            participants,
            context,
            last_message: None,
            status: ConversationStatus::Active,
            created_by,
            created_at: now,
            updated_at: now,
        })
    }

    fn validate_participants(
        kind: ConversationType,
        created_by: UserId,
        participants: &[Participant],
    ) -> Result<(), DomainError> {
        if participants.len() < 2 {
            return Err(DomainError::invalid_argument(
                "participant_ids",
                "at least one other participant is required",
            ));
        }
        if participants.len() > MAX_PARTICIPANTS {
            return Err(DomainError::invalid_argument(
                "participant_ids",
                "too many participants",
            ));
        }
        let mut seen = HashSet::with_capacity(participants.len());
        if !participants.iter().all(|p| seen.insert(p.user_id)) {
            return Err(DomainError::invalid_argument(
                "participant_ids",
                "duplicate participant",
            ));
        }
        if !seen.contains(&created_by) {
            return Err(DomainError::invalid_argument(
                "participant_ids",
                "creator must be a participant",
            ));
        }
        if kind == ConversationType::Direct && participants.len() != 2 {
            return Err(DomainError::invalid_argument(
                "participant_ids",
                "direct conversations have exactly two participants",
            ));
        }
        Ok(())
    }

    /// direct 会话去重键：无序的参与者对
    pub fn direct_key(&self) -> Option<String> {
        if self.kind != ConversationType::Direct {
            return None;
        }
        let mut ids: Vec<UserId> = self.participants.iter().map(|p| p.user_id).collect();
        ids.sort();
        Some(direct_key_for(ids[0], ids[1]))
    }

    pub fn participant(&self, user_id: UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: UserId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.participant(user_id).is_some()
    }

    pub fn participant_ids(&self) -> Vec<UserId> {
        self.participants.iter().map(|p| p.user_id).collect()
    }

    pub fn is_deleted(&self) -> bool {
        self.status == ConversationStatus::Deleted
    }

    /// 返回参与者，会话已删除或用户不在其中时报错
    pub fn require_participant(&self, user_id: UserId) -> Result<&Participant, DomainError> {
        if self.is_deleted() {
            return Err(DomainError::ConversationDeleted);
        }
        self.participant(user_id).ok_or(DomainError::NotParticipant)
    }

    pub fn total_unread(&self) -> u64 {
        self.participants
            .iter()
            .map(|p| u64::from(p.unread_count))
            .sum()
    }

    /// 记录一条新消息：给除发送者外的参与者累加未读，摘要只会前移
    pub fn record_message(&mut self, last: LastMessage) {
        for participant in &mut self.participants {
            if participant.user_id != last.sender_id {
                participant.unread_count = participant.unread_count.saturating_add(1);
            }
        }
        let is_newer = self
            .last_message
            .as_ref()
            .map_or(true, |current| last.timestamp >= current.timestamp);
        if is_newer {
            self.updated_at = self.updated_at.max(last.timestamp);
            self.last_message = Some(last);
        }
    }

    /// 给某个参与者看的副本：只保留其本人的个人设置和未读数
    pub fn view_for(&self, viewer: UserId) -> Conversation {
        let mut view = self.clone();
        for participant in &mut view.participants {
            if participant.user_id != viewer {
                *participant = participant.public_view();
            }
        }
        view
    }

    /// 编辑后的最新消息同步到摘要，其他消息的编辑不影响摘要
    pub fn refresh_last_message(&mut self, edited: &LastMessage) -> bool {
        match self.last_message.as_mut() {
            Some(last)
                if last.sender_id == edited.sender_id && last.timestamp == edited.timestamp =>
            {
                last.content_preview = edited.content_preview.clone();
                true
            }
            _ => false,
        }
    }

    /// 撤回一条已删除消息对未读数和摘要的影响
    pub fn retract_message(&mut self, sender_id: UserId, created_at: Timestamp) {
        for participant in &mut self.participants {
            let unread_when_sent = participant
                .last_read_at
                .map_or(true, |read_at| read_at < created_at);
            if participant.user_id != sender_id && unread_when_sent {
                participant.unread_count = participant.unread_count.saturating_sub(1);
            }
        }
        if let Some(last) = self.last_message.as_mut() {
            if last.sender_id == sender_id && last.timestamp == created_at {
                last.content_preview = DELETED_PLACEHOLDER.to_owned();
            }
        }
    }

    /// 根据完整的消息列表重建最后消息摘要和各参与者未读数
    pub fn rebuild_aggregates<'a>(&mut self, messages: impl IntoIterator<Item = &'a Message>) {
        let visible: Vec<&Message> = messages
            .into_iter()
            .filter(|m| m.conversation_id == self.id && !m.is_spam)
            .collect();

        self.last_message = visible
            .iter()
            .max_by_key(|m| (m.created_at, m.id))
            .map(|m| LastMessage {
                content_preview: m.preview(),
                sender_id: m.sender_id,
                timestamp: m.created_at,
            });

        for participant in &mut self.participants {
            let unread = visible
                .iter()
                .filter(|m| {
                    m.sender_id != participant.user_id
                        && m.counts_toward_unread()
                        && participant
                            .last_read_at
                            .map_or(true, |read_at| read_at < m.created_at)
                })
                .count();
            participant.unread_count = u32::try_from(unread).unwrap_or(u32::MAX);
        }
    }

    pub fn set_status(&mut self, status: ConversationStatus, now: Timestamp) {
        self.status = status;
        self.updated_at = now;
    }

    /// 会话标题：优先业务上下文标题，否则用对方的显示名
    pub fn title_for(&self, viewer: UserId) -> String {
        if let Some(title) = self
            .context
            .as_ref()
            .and_then(|ctx| ctx.title.as_deref())
            .filter(|t| !t.trim().is_empty())
        {
            return title.to_owned();
        }
        let names: Vec<&str> = self
            .participants
            .iter()
            .filter(|p| p.user_id != viewer)
            .map(Participant::display_name_or_default)
            .collect();
        names.join(", ")
    }
}

pub fn direct_key_for(a: UserId, b: UserId) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{low}:{high}")
}

/// 新会话的参与者列表：创建者为 owner，其余按传入顺序
pub fn initial_participants(
    kind: ConversationType,
    creator: (UserId, Option<String>),
    others: Vec<(UserId, Option<String>)>,
) -> Vec<Participant> {
    let other_role = match kind {
        ConversationType::Support => ParticipantRole::Agent,
        _ => ParticipantRole::Member,
    };
    std::iter::once(Participant::new(creator.0, creator.1, ParticipantRole::Owner))
        .chain(
            others
                .into_iter()
                .map(|(id, name)| Participant::new(id, name, other_role)),
        )
        .collect()
}
