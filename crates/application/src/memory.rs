//! 内存仓储实现
//!
//! 会话与消息放在同一把锁下，聚合字段的更新与 Postgres 实现一样是原子的。
//! 用于未配置数据库的单节点部署和测试。发送者历史统计仍是全量扫描。

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use domain::{
    AdminConversationFilter, Conversation, ConversationFilter, ConversationId,
    ConversationRepository, ConversationStatus, Cursor, Message, MessageAggregate, MessageId,
    MessageRepository, MessageViewer, Participant, ParticipantSettings, ReactionToggle,
    RepositoryError, RepositoryResult, SenderHistory, Timestamp, UnreadSummary, UserId,
};
use tokio::sync::Mutex;

use crate::sanitize::sanitize_content;

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, Conversation>,
    /// 未删除 direct 会话的去重键
    direct_keys: HashMap<String, ConversationId>,
    inconsistent: HashSet<ConversationId>,
    messages: HashMap<MessageId, Message>,
    /// 每个会话的消息 id，分页和重算只扫描本会话
    by_conversation: HashMap<ConversationId, Vec<MessageId>>,
}

impl MemoryState {
    fn conversation_mut(&mut self, id: ConversationId) -> RepositoryResult<&mut Conversation> {
        self.conversations
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound)
    }

    fn conversation_messages(&self, id: ConversationId) -> impl Iterator<Item = &Message> {
        self.by_conversation
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|message_id| self.messages.get(message_id))
    }

    fn participating(&self, user_id: UserId) -> impl Iterator<Item = &Conversation> {
        self.conversations
            .values()
            .filter(move |c| !c.is_deleted() && c.is_participant(user_id))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_desc<T>(items: &mut [T], key: impl Fn(&T) -> (Timestamp, uuid::Uuid)) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

#[async_trait]
impl ConversationRepository for MemoryStore {
    async fn create(&self, conversation: &Conversation) -> RepositoryResult<Conversation> {
        let mut state = self.state.lock().await;
        if state.conversations.contains_key(&conversation.id) {
            return Err(RepositoryError::Conflict);
        }
        if let Some(key) = conversation.direct_key() {
            if state.direct_keys.contains_key(&key) {
                return Err(RepositoryError::Conflict);
            }
            state.direct_keys.insert(key, conversation.id);
        }
        state
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation.clone())
    }

    async fn create_direct(
        &self,
        conversation: &Conversation,
    ) -> RepositoryResult<(Conversation, bool)> {
        let key = conversation
            .direct_key()
            .ok_or_else(|| RepositoryError::storage("not a direct conversation"))?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .direct_keys
            .get(&key)
            .and_then(|id| state.conversations.get(id))
        {
            return Ok((existing.clone(), false));
        }
        state.direct_keys.insert(key, conversation.id);
        state
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok((conversation.clone(), true))
    }

    async fn find_by_id(&self, id: ConversationId) -> RepositoryResult<Option<Conversation>> {
        Ok(self.state.lock().await.conversations.get(&id).cloned())
    }

    async fn find_direct(&self, a: UserId, b: UserId) -> RepositoryResult<Option<Conversation>> {
        let state = self.state.lock().await;
        Ok(state
            .direct_keys
            .get(&domain::direct_key_for(a, b))
            .and_then(|id| state.conversations.get(id))
            .cloned())
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        filter: &ConversationFilter,
        cursor: Option<Cursor>,
        limit: u32,
    ) -> RepositoryResult<Vec<Conversation>> {
        let state = self.state.lock().await;
        let mut items: Vec<Conversation> = state
            .participating(user_id)
            .filter(|c| {
                c.participant(user_id)
                    .is_some_and(|p| filter.matches(c, p))
            })
            .filter(|c| cursor.map_or(true, |cur| cur.is_after(c.updated_at, c.id.as_uuid())))
            .cloned()
            .collect();
        sort_desc(&mut items, |c| (c.updated_at, c.id.as_uuid()));
        items.truncate(limit as usize);
        Ok(items)
    }

    async fn record_message(&self, aggregate: &MessageAggregate) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        let conversation = state.conversation_mut(aggregate.conversation_id)?;
        conversation.record_message(aggregate.last_message.clone());
        Ok(())
    }

    async fn refresh_last_message(&self, aggregate: &MessageAggregate) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        state
            .conversation_mut(aggregate.conversation_id)?
            .refresh_last_message(&aggregate.last_message);
        Ok(())
    }

    async fn retract_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        created_at: Timestamp,
    ) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        state
            .conversation_mut(conversation_id)?
            .retract_message(sender_id, created_at);
        Ok(())
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        at: Timestamp,
    ) -> RepositoryResult<Option<Participant>> {
        let mut state = self.state.lock().await;
        let conversation = state.conversation_mut(conversation_id)?;
        Ok(conversation.participant_mut(user_id).map(|participant| {
            participant.record_read(at);
            participant.clone()
        }))
    }

    async fn update_settings(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        settings: &ParticipantSettings,
        _now: Timestamp,
    ) -> RepositoryResult<Option<Conversation>> {
        let mut state = self.state.lock().await;
        let conversation = state.conversation_mut(conversation_id)?;
        let Some(participant) = conversation.participant_mut(user_id) else {
            return Ok(None);
        };
        participant.apply_settings(settings);
        Ok(Some(conversation.clone()))
    }

    async fn set_status(
        &self,
        conversation_id: ConversationId,
        status: ConversationStatus,
        now: Timestamp,
    ) -> RepositoryResult<Option<Conversation>> {
        let mut state = self.state.lock().await;
        let Some(conversation) = state.conversations.get(&conversation_id).cloned() else {
            return Ok(None);
        };
        if let Some(key) = conversation.direct_key() {
            if status == ConversationStatus::Deleted {
                state.direct_keys.remove(&key);
            } else if conversation.is_deleted() {
                if state.direct_keys.contains_key(&key) {
                    return Err(RepositoryError::Conflict);
                }
                state.direct_keys.insert(key, conversation_id);
            }
        }
        let conversation = state.conversation_mut(conversation_id)?;
        conversation.set_status(status, now);
        Ok(Some(conversation.clone()))
    }

    async fn mark_inconsistent(&self, conversation_id: ConversationId) -> RepositoryResult<()> {
        self.state.lock().await.inconsistent.insert(conversation_id);
        Ok(())
    }

    async fn list_inconsistent(&self, limit: u32) -> RepositoryResult<Vec<ConversationId>> {
        let state = self.state.lock().await;
        Ok(state
            .inconsistent
            .iter()
            .take(limit as usize)
            .copied()
            .collect())
    }

    async fn reconcile(&self, conversation_id: ConversationId) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        let messages: Vec<Message> = state.conversation_messages(conversation_id).cloned().collect();
        let conversation = state.conversation_mut(conversation_id)?;
        conversation.rebuild_aggregates(&messages);
        if let Some(last) = &conversation.last_message {
            conversation.updated_at = conversation.updated_at.max(last.timestamp);
        }
        state.inconsistent.remove(&conversation_id);
        Ok(())
    }

    async fn co_participants(&self, user_id: UserId) -> RepositoryResult<Vec<UserId>> {
        let state = self.state.lock().await;
        let others: HashSet<UserId> = state
            .participating(user_id)
            .flat_map(|c| c.participant_ids())
            .filter(|id| *id != user_id)
            .collect();
        Ok(others.into_iter().collect())
    }

    async fn admin_list(
        &self,
        filter: &AdminConversationFilter,
        offset: u64,
        limit: u32,
    ) -> RepositoryResult<(Vec<Conversation>, u64)> {
        let state = self.state.lock().await;
        let mut matching: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        sort_desc(&mut matching, |c| (c.updated_at, c.id.as_uuid()));
        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn unread_summary(&self, user_id: UserId) -> RepositoryResult<UnreadSummary> {
        let state = self.state.lock().await;
        let counts: Vec<u32> = state
            .participating(user_id)
            .filter_map(|c| c.participant(user_id).map(|p| p.unread_count))
            .collect();
        Ok(UnreadSummary {
            total_unread: counts.iter().map(|n| u64::from(*n)).sum(),
            conversations_with_unread: counts.iter().filter(|n| **n > 0).count() as u64,
        })
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn insert(&self, message: &Message) -> RepositoryResult<Message> {
        let mut state = self.state.lock().await;
        if !state.conversations.contains_key(&message.conversation_id) {
            return Err(RepositoryError::NotFound);
        }
        if state.messages.contains_key(&message.id) {
            return Err(RepositoryError::Conflict);
        }
        state.messages.insert(message.id, message.clone());
        state
            .by_conversation
            .entry(message.conversation_id)
            .or_default()
            .push(message.id);
        Ok(message.clone())
    }

    async fn find_by_id(&self, id: MessageId) -> RepositoryResult<Option<Message>> {
        Ok(self.state.lock().await.messages.get(&id).cloned())
    }

    async fn apply_edit(
        &self,
        message: &Message,
        expected_edit_count: u32,
    ) -> RepositoryResult<Option<Message>> {
        let mut state = self.state.lock().await;
        let stored = state
            .messages
            .get_mut(&message.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.edit_history.len() as u32 != expected_edit_count || stored.is_deleted {
            return Ok(None);
        }
        *stored = message.clone();
        Ok(Some(stored.clone()))
    }

    async fn soft_delete(
        &self,
        id: MessageId,
        deleted_by: UserId,
        at: Timestamp,
    ) -> RepositoryResult<Option<Message>> {
        let mut state = self.state.lock().await;
        let stored = state
            .messages
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.is_deleted {
            return Ok(None);
        }
        stored.soft_delete(deleted_by, at);
        Ok(Some(stored.clone()))
    }

    async fn toggle_reaction(
        &self,
        id: MessageId,
        user_id: UserId,
        emoji: &str,
        at: Timestamp,
    ) -> RepositoryResult<ReactionToggle> {
        let mut state = self.state.lock().await;
        let stored = state
            .messages
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound)?;
        let added = stored.toggle_reaction(user_id, emoji, at);
        Ok(ReactionToggle {
            added,
            reactions: stored.reactions.clone(),
        })
    }

    async fn list_page(
        &self,
        conversation_id: ConversationId,
        viewer: MessageViewer,
        cursor: Option<Cursor>,
        limit: u32,
    ) -> RepositoryResult<Vec<Message>> {
        let state = self.state.lock().await;
        let mut items: Vec<Message> = state
            .conversation_messages(conversation_id)
            .filter(|m| viewer.can_see(m))
            .filter(|m| cursor.map_or(true, |cur| cur.is_after(m.created_at, m.id.as_uuid())))
            .cloned()
            .collect();
        sort_desc(&mut items, |m| (m.created_at, m.id.as_uuid()));
        items.truncate(limit as usize);
        Ok(items)
    }

    async fn search(
        &self,
        user_id: UserId,
        query: &str,
        limit: u32,
    ) -> RepositoryResult<Vec<Message>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        // 存储的是转义后的内容，查询词按同样规则转义后再比较
        let escaped = sanitize_content(&needle);
        let state = self.state.lock().await;
        let visible: Vec<ConversationId> = state.participating(user_id).map(|c| c.id).collect();
        let viewer = MessageViewer {
            user_id,
            include_all_spam: false,
        };
        let mut hits: Vec<Message> = visible
            .iter()
            .flat_map(|id| state.conversation_messages(*id))
            .filter(|m| !m.is_deleted && viewer.can_see(m))
            .filter(|m| {
                m.content_sanitized.to_lowercase().contains(&escaped)
                    || m
                        .sender_name
                        .as_deref()
                        .is_some_and(|name| name.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        sort_desc(&mut hits, |m| (m.created_at, m.id.as_uuid()));
        hits.truncate(limit as usize);
        Ok(hits)
    }

    async fn sender_history(
        &self,
        sender_id: UserId,
        now: Timestamp,
    ) -> RepositoryResult<SenderHistory> {
        let state = self.state.lock().await;
        let minute_ago = now - chrono::Duration::minutes(1);
        let day_ago = now - chrono::Duration::days(1);
        let mut history = SenderHistory::default();
        for message in state
            .messages
            .values()
            .filter(|m| m.sender_id == sender_id && m.created_at > day_ago)
        {
            history.messages_last_day += 1;
            if message.is_spam {
                history.spam_flagged_last_day += 1;
            }
            if message.created_at > minute_ago {
                history.messages_last_minute += 1;
            }
        }
        Ok(history)
    }
}
