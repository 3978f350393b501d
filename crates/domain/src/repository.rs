//! 仓储接口定义
//!
//! 内层定义接口，外层（Postgres / 内存）实现。所有聚合字段的修改都必须在存储内原子完成。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::conversation::{ContextKind, Conversation, ConversationStatus, ConversationType, LastMessage};
use crate::cursor::Cursor;
use crate::errors::RepositoryResult;
use crate::message::{Message, Reaction};
use crate::participant::{Participant, ParticipantSettings};
use crate::value_objects::{ConversationId, MessageId, Timestamp, UserId};
use crate::views::UnreadSummary;

/// 会话列表过滤条件，字段为空表示不过滤
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationFilter {
    pub status: Option<ConversationStatus>,
    #[serde(rename = "type")]
    pub kind: Option<ConversationType>,
    pub archived: Option<bool>,
    pub pinned: Option<bool>,
    pub context_type: Option<ContextKind>,
    pub context_id: Option<String>,
}

impl ConversationFilter {
    /// 参与者视角的过滤判断，内存实现和测试共用
    pub fn matches(&self, conversation: &Conversation, participant: &Participant) -> bool {
        if conversation.is_deleted() {
            return false;
        }
        if self.status.is_some_and(|status| status != conversation.status) {
            return false;
        }
        if self.kind.is_some_and(|kind| kind != conversation.kind) {
            return false;
        }
        if self
            .archived
            .is_some_and(|archived| archived != participant.is_archived)
        {
            return false;
        }
        if self.pinned.is_some_and(|pinned| pinned != participant.is_pinned) {
            return false;
        }
        if let Some(kind) = self.context_type {
            if conversation.context.as_ref().map(|ctx| ctx.kind) != Some(kind) {
                return false;
            }
        }
        if let Some(reference) = self.context_id.as_deref() {
            if conversation
                .context
                .as_ref()
                .map(|ctx| ctx.referenced_id.as_str())
                != Some(reference)
            {
                return false;
            }
        }
        true
    }
}

/// 管理后台过滤条件
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminConversationFilter {
    /// 在上下文标题、参与者显示名、最后一条消息摘要中做不区分大小写的匹配
    pub search: Option<String>,
    pub status: Option<ConversationStatus>,
}

impl AdminConversationFilter {
    pub fn matches(&self, conversation: &Conversation) -> bool {
        if self.status.is_some_and(|status| status != conversation.status) {
            return false;
        }
        let Some(needle) = self
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            return true;
        };
        let needle = needle.to_lowercase();
        let contains = |haystack: &str| haystack.to_lowercase().contains(&needle);

        conversation
            .context
            .as_ref()
            .and_then(|ctx| ctx.title.as_deref())
            .is_some_and(contains)
            || conversation
                .participants
                .iter()
                .filter_map(|p| p.display_name.as_deref())
                .any(contains)
            || conversation
                .last_message
                .as_ref()
                .is_some_and(|last| contains(&last.content_preview))
    }
}

/// 新消息对会话聚合字段的影响
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAggregate {
    pub conversation_id: ConversationId,
    pub last_message: LastMessage,
}

impl MessageAggregate {
    pub fn for_message(message: &Message) -> Self {
        Self {
            conversation_id: message.conversation_id,
            last_message: LastMessage {
                content_preview: message.preview(),
                sender_id: message.sender_id,
                timestamp: message.created_at,
            },
        }
    }
}

/// 表情切换结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionToggle {
    pub added: bool,
    pub reactions: Vec<Reaction>,
}

/// 列表查询的观察者，决定垃圾消息是否可见
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageViewer {
    pub user_id: UserId,
    /// 版主可以看到所有垃圾消息，普通用户只看到自己发的
    pub include_all_spam: bool,
}

impl MessageViewer {
    pub fn can_see(&self, message: &Message) -> bool {
        !message.is_spam || self.include_all_spam || message.sender_id == self.user_id
    }
}

/// 发送者近期行为，供垃圾评分使用
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderHistory {
    pub messages_last_minute: u32,
    pub messages_last_day: u32,
    pub spam_flagged_last_day: u32,
}

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn create(&self, conversation: &Conversation) -> RepositoryResult<Conversation>;

    /// 原子地查找或创建 direct 会话，返回 `(会话, 是否新建)`
    async fn create_direct(&self, conversation: &Conversation)
        -> RepositoryResult<(Conversation, bool)>;

    async fn find_by_id(&self, id: ConversationId) -> RepositoryResult<Option<Conversation>>;

    async fn find_direct(&self, a: UserId, b: UserId) -> RepositoryResult<Option<Conversation>>;

    /// 按 `(updated_at, id)` 倒序分页
    async fn list_for_user(
        &self,
        user_id: UserId,
        filter: &ConversationFilter,
        cursor: Option<Cursor>,
        limit: u32,
    ) -> RepositoryResult<Vec<Conversation>>;

    /// 更新最后消息摘要，并给除发送者外的参与者原子地加一未读
    async fn record_message(&self, aggregate: &MessageAggregate) -> RepositoryResult<()>;

    /// 摘要仍指向这条消息（发送者和时间一致）时，替换预览文本
    async fn refresh_last_message(&self, aggregate: &MessageAggregate) -> RepositoryResult<()>;

    /// 消息被删除后，从尚未读到它的参与者未读数中扣除；
    /// 若它正是最后一条消息，摘要换成删除占位文本
    async fn retract_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        created_at: Timestamp,
    ) -> RepositoryResult<()>;

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        at: Timestamp,
    ) -> RepositoryResult<Option<Participant>>;

    async fn update_settings(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        settings: &ParticipantSettings,
        now: Timestamp,
    ) -> RepositoryResult<Option<Conversation>>;

    async fn set_status(
        &self,
        conversation_id: ConversationId,
        status: ConversationStatus,
        now: Timestamp,
    ) -> RepositoryResult<Option<Conversation>>;

    /// 聚合更新多次失败后标记，交给后台任务修复
    async fn mark_inconsistent(&self, conversation_id: ConversationId) -> RepositoryResult<()>;

    async fn list_inconsistent(&self, limit: u32) -> RepositoryResult<Vec<ConversationId>>;

    /// 从消息表重新计算最后消息和每个参与者的未读数，并清除标记
    async fn reconcile(&self, conversation_id: ConversationId) -> RepositoryResult<()>;

    /// 与该用户共享至少一个未删除会话的其他用户
    async fn co_participants(&self, user_id: UserId) -> RepositoryResult<Vec<UserId>>;

    async fn admin_list(
        &self,
        filter: &AdminConversationFilter,
        offset: u64,
        limit: u32,
    ) -> RepositoryResult<(Vec<Conversation>, u64)>;

    async fn unread_summary(&self, user_id: UserId) -> RepositoryResult<UnreadSummary>;
}

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn insert(&self, message: &Message) -> RepositoryResult<Message>;

    async fn find_by_id(&self, id: MessageId) -> RepositoryResult<Option<Message>>;

    /// 乐观并发写入编辑结果：仅当存储中的编辑次数仍为 `expected_edit_count` 时生效，
    /// 否则返回 `None`
    async fn apply_edit(
        &self,
        message: &Message,
        expected_edit_count: u32,
    ) -> RepositoryResult<Option<Message>>;

    /// 软删除，只有从未删除变为删除时返回 `Some`
    async fn soft_delete(
        &self,
        id: MessageId,
        deleted_by: UserId,
        at: Timestamp,
    ) -> RepositoryResult<Option<Message>>;

    async fn toggle_reaction(
        &self,
        id: MessageId,
        user_id: UserId,
        emoji: &str,
        at: Timestamp,
    ) -> RepositoryResult<ReactionToggle>;

    /// 按 `(created_at, id)` 倒序分页
    async fn list_page(
        &self,
        conversation_id: ConversationId,
        viewer: MessageViewer,
        cursor: Option<Cursor>,
        limit: u32,
    ) -> RepositoryResult<Vec<Message>>;

    /// 在用户参与的会话中全文检索，排除已删除消息和他人的垃圾消息
    async fn search(
        &self,
        user_id: UserId,
        query: &str,
        limit: u32,
    ) -> RepositoryResult<Vec<Message>>;

    async fn sender_history(
        &self,
        sender_id: UserId,
        now: Timestamp,
    ) -> RepositoryResult<SenderHistory>;
}
