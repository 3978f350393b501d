//! 客户端状态容器
//!
//! 会话列表、已加载的消息、当前会话、未读汇总、输入中用户和在线用户都保存在同一把
//! 读写锁之后。每次变更在释放锁之后同步通知观察者，观察者可以在回调里读取最新状态。
//! 所有变更按消息 id 去重，重复投递不会产生重复条目。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use application::{Clock, SystemClock};
use chrono::Duration;
use domain::{
    Conversation, ConversationId, MessageId, MessageView, Reaction, ServerEvent, Timestamp,
    UnreadSummary, UserId, DELETED_PLACEHOLDER,
};

/// 输入状态在最后一次 typing 信号后的有效期
pub const TYPING_TTL_SECS: i64 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// 会话列表整体替换（首次加载或重连后同步）
    ConversationsReplaced,
    ConversationUpserted(ConversationId),
    ConversationRemoved(ConversationId),
    ActiveConversationChanged(Option<ConversationId>),
    MessagesAppended {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    MessagesPrepended {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    MessagesUpdated {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    MessagesDeleted {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    /// 已加载的消息被整体替换，界面需要重新渲染该会话
    MessagesReloaded(ConversationId),
    ComposingUsersChanged(ConversationId),
    PresenceChanged {
        user_id: UserId,
        online: bool,
    },
    UnreadChanged(UnreadSummary),
}

pub trait StoreObserver: Send + Sync {
    fn handle_event(&self, event: &StoreEvent);
}

impl<F> StoreObserver for F
where
    F: Fn(&StoreEvent) + Send + Sync,
{
    fn handle_event(&self, event: &StoreEvent) {
        self(event)
    }
}

#[derive(Default)]
struct StoreState {
    conversations: HashMap<ConversationId, Conversation>,
    /// 每个会话已加载的消息，按时间从旧到新
    messages: HashMap<ConversationId, Vec<MessageView>>,
    message_index: HashMap<MessageId, ConversationId>,
    history_cursors: HashMap<ConversationId, Option<String>>,
    pending: HashSet<MessageId>,
    active: Option<ConversationId>,
    typing: HashMap<ConversationId, HashMap<UserId, Timestamp>>,
    online: HashSet<UserId>,
}

impl StoreState {
    fn unread_summary(&self, me: UserId) -> UnreadSummary {
        let counts = self
            .conversations
            .values()
            .filter_map(|conversation| conversation.participant(me))
            .map(|participant| u64::from(participant.unread_count));
        let (total_unread, conversations_with_unread) =
            counts.fold((0, 0), |(total, with_unread), count| {
                (total + count, with_unread + u64::from(count > 0))
            });
        UnreadSummary {
            total_unread,
            conversations_with_unread,
        }
    }

    fn contains_message(&self, id: MessageId) -> bool {
        self.message_index.contains_key(&id)
    }

    fn find_message_mut(&mut self, id: MessageId) -> Option<&mut MessageView> {
        let conversation_id = self.message_index.get(&id)?;
        self.messages
            .get_mut(conversation_id)?
            .iter_mut()
            .find(|message| message.id == id)
    }

    fn remove_message(&mut self, id: MessageId) -> Option<MessageView> {
        let conversation_id = self.message_index.remove(&id)?;
        self.pending.remove(&id);
        let messages = self.messages.get_mut(&conversation_id)?;
        let pos = messages.iter().position(|message| message.id == id)?;
        Some(messages.remove(pos))
    }

    fn drop_conversation(&mut self, id: ConversationId) -> bool {
        let existed = self.conversations.remove(&id).is_some();
        if let Some(messages) = self.messages.remove(&id) {
            for message in messages {
                self.message_index.remove(&message.id);
                self.pending.remove(&message.id);
            }
        }
        self.history_cursors.remove(&id);
        self.typing.remove(&id);
        if self.active == Some(id) {
            self.active = None;
        }
        existed
    }
}

pub struct ChatStore {
    me: UserId,
    clock: Arc<dyn Clock>,
    state: RwLock<StoreState>,
    observers: RwLock<Vec<Arc<dyn StoreObserver>>>,
}

impl ChatStore {
    pub fn new(me: UserId) -> Self {
        Self::with_clock(me, Arc::new(SystemClock))
    }

    pub fn with_clock(me: UserId, clock: Arc<dyn Clock>) -> Self {
        Self {
            me,
            clock,
            state: RwLock::new(StoreState::default()),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn me(&self) -> UserId {
        self.me
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn subscribe(&self, observer: Arc<dyn StoreObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 在写锁内执行变更，释放锁后按顺序通知观察者；未读汇总变化时追加一条事件
    fn mutate<R>(&self, change: impl FnOnce(&mut StoreState, &mut Vec<StoreEvent>) -> R) -> R {
        let mut events = Vec::new();
        let result = {
            let mut state = self.write();
            let before = state.unread_summary(self.me);
            let result = change(&mut *state, &mut events);
            let after = state.unread_summary(self.me);
            if before != after {
                events.push(StoreEvent::UnreadChanged(after));
            }
            result
        };
        self.notify(&events);
        result
    }

    fn notify(&self, events: &[StoreEvent]) {
        if events.is_empty() {
            return;
        }
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for event in events {
            for observer in &observers {
                observer.handle_event(event);
            }
        }
    }

    // ---- 查询 ----

    /// 置顶优先，其余按最近活动倒序
    pub fn conversations(&self) -> Vec<Conversation> {
        let me = self.me;
        let mut list: Vec<Conversation> = self.read().conversations.values().cloned().collect();
        list.sort_by(|a, b| {
            let pinned = |c: &Conversation| c.participant(me).is_some_and(|p| p.is_pinned);
            pinned(b)
                .cmp(&pinned(a))
                .then(b.updated_at.cmp(&a.updated_at))
                .then(b.id.cmp(&a.id))
        });
        list
    }

    pub fn conversation(&self, id: ConversationId) -> Option<Conversation> {
        self.read().conversations.get(&id).cloned()
    }

    pub fn messages(&self, conversation_id: ConversationId) -> Vec<MessageView> {
        self.read()
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn message(&self, id: MessageId) -> Option<MessageView> {
        let state = self.read();
        let conversation_id = state.message_index.get(&id)?;
        state
            .messages
            .get(conversation_id)?
            .iter()
            .find(|message| message.id == id)
            .cloned()
    }

    pub fn is_pending(&self, id: MessageId) -> bool {
        self.read().pending.contains(&id)
    }

    /// 更早历史的游标；`None` 表示还没加载过，`Some(None)` 表示已经到底
    pub fn history_cursor(&self, conversation_id: ConversationId) -> Option<Option<String>> {
        self.read().history_cursors.get(&conversation_id).cloned()
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.read().active
    }

    pub fn unread_summary(&self) -> UnreadSummary {
        self.read().unread_summary(self.me)
    }

    /// 仍在有效期内的输入中用户
    pub fn typing_users(&self, conversation_id: ConversationId) -> Vec<UserId> {
        let cutoff = self.clock.now() - Duration::seconds(TYPING_TTL_SECS);
        let mut users: Vec<UserId> = self
            .read()
            .typing
            .get(&conversation_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, at)| **at > cutoff)
                    .map(|(user_id, _)| *user_id)
                    .collect()
            })
            .unwrap_or_default();
        users.sort();
        users
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.read().online.contains(&user_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.read().online.iter().copied().collect();
        users.sort();
        users
    }

    // ---- 会话 ----

    /// 重新同步时整体替换会话列表，已不在列表中的会话连同消息一起丢弃
    pub fn replace_conversations(&self, conversations: Vec<Conversation>) {
        self.mutate(|state, events| {
            let keep: HashSet<ConversationId> = conversations.iter().map(|c| c.id).collect();
            let stale: Vec<ConversationId> = state
                .conversations
                .keys()
                .filter(|id| !keep.contains(id))
                .copied()
                .collect();
            for id in stale {
                state.drop_conversation(id);
            }
            for conversation in conversations {
                state.conversations.insert(conversation.id, conversation);
            }
            events.push(StoreEvent::ConversationsReplaced);
        });
    }

    /// 新增或覆盖会话；已删除或不再包含自己的会话会被移除
    pub fn upsert_conversation(&self, conversation: Conversation) {
        let me = self.me;
        self.mutate(|state, events| {
            let id = conversation.id;
            if conversation.is_deleted() || !conversation.is_participant(me) {
                if state.drop_conversation(id) {
                    events.push(StoreEvent::ConversationRemoved(id));
                }
                return;
            }
            state.conversations.insert(id, conversation);
            events.push(StoreEvent::ConversationUpserted(id));
        });
    }

    pub fn remove_conversation(&self, id: ConversationId) {
        self.mutate(|state, events| {
            if state.drop_conversation(id) {
                events.push(StoreEvent::ConversationRemoved(id));
            }
        });
    }

    pub fn set_active(&self, id: Option<ConversationId>) {
        self.mutate(|state, events| {
            if state.active != id {
                state.active = id;
                events.push(StoreEvent::ActiveConversationChanged(id));
            }
        });
    }

    /// 本地把自己在该会话的未读清零
    pub fn mark_read_local(&self, conversation_id: ConversationId, at: Timestamp) {
        let me = self.me;
        self.mutate(|state, events| {
            if let Some(participant) = state
                .conversations
                .get_mut(&conversation_id)
                .and_then(|conversation| conversation.participant_mut(me))
            {
                participant.record_read(at);
                events.push(StoreEvent::ConversationUpserted(conversation_id));
            }
        });
    }

    // ---- 消息 ----

    /// 追加一条新消息到末尾；已存在的 id 视为重复投递，只更新内容
    pub fn append_message(&self, message: MessageView) {
        let me = self.me;
        self.mutate(|state, events| {
            let conversation_id = message.conversation_id;
            let id = message.id;
            if let Some(existing) = state.find_message_mut(id) {
                if *existing != message {
                    *existing = message;
                    events.push(StoreEvent::MessagesUpdated {
                        conversation_id,
                        message_ids: vec![id],
                    });
                }
                return;
            }

            let is_active = state.active == Some(conversation_id);
            if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
                let newer = conversation
                    .last_message
                    .as_ref()
                    .map_or(true, |last| last.timestamp <= message.created_at);
                if newer {
                    conversation.last_message = Some(message.last_message());
                    conversation.updated_at = conversation.updated_at.max(message.created_at);
                }
                let counts = message.sender_id != me && !message.is_spam && !message.is_deleted;
                if counts && !is_active {
                    if let Some(participant) = conversation.participant_mut(me) {
                        participant.unread_count = participant.unread_count.saturating_add(1);
                    }
                }
                events.push(StoreEvent::ConversationUpserted(conversation_id));
            }

            let sender = message.sender_id;
            state.message_index.insert(id, conversation_id);
            state
                .messages
                .entry(conversation_id)
                .or_default()
                .push(message);
            // 对方发出消息即视为停止输入
            let stopped = state
                .typing
                .get_mut(&conversation_id)
                .is_some_and(|entries| entries.remove(&sender).is_some());
            if stopped {
                events.push(StoreEvent::ComposingUsersChanged(conversation_id));
            }
            events.insert(
                0,
                StoreEvent::MessagesAppended {
                    conversation_id,
                    message_ids: vec![id],
                },
            );
        });
    }

    /// 把一页更早的历史插到开头，已加载过的消息被跳过；返回实际插入的条数
    pub fn prepend_messages(
        &self,
        conversation_id: ConversationId,
        older: Vec<MessageView>,
        next_cursor: Option<String>,
    ) -> usize {
        self.mutate(|state, events| {
            let mut fresh: Vec<MessageView> = Vec::with_capacity(older.len());
            for message in older {
                if message.conversation_id != conversation_id
                    || state.contains_message(message.id)
                    || fresh.iter().any(|m| m.id == message.id)
                {
                    continue;
                }
                fresh.push(message);
            }
            fresh.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            state.history_cursors.insert(conversation_id, next_cursor);
            if fresh.is_empty() {
                return 0;
            }

            let inserted = fresh.len();
            let message_ids: Vec<MessageId> = fresh.iter().map(|m| m.id).collect();
            for id in &message_ids {
                state.message_index.insert(*id, conversation_id);
            }
            let loaded = state.messages.entry(conversation_id).or_default();
            fresh.append(loaded);
            *loaded = fresh;
            events.push(StoreEvent::MessagesPrepended {
                conversation_id,
                message_ids,
            });
            inserted
        })
    }

    /// 用服务端的第一页覆盖该会话的已加载消息，保留尚未确认的本地消息
    pub fn reset_messages(
        &self,
        conversation_id: ConversationId,
        newest_first: Vec<MessageView>,
        next_cursor: Option<String>,
    ) {
        self.mutate(|state, events| {
            let pending: Vec<MessageView> = state
                .messages
                .remove(&conversation_id)
                .unwrap_or_default()
                .into_iter()
                .filter(|message| {
                    let keep = state.pending.contains(&message.id);
                    if !keep {
                        state.message_index.remove(&message.id);
                    }
                    keep
                })
                .collect();

            let mut loaded: Vec<MessageView> = newest_first
                .into_iter()
                .filter(|message| message.conversation_id == conversation_id)
                .collect();
            loaded.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            loaded.dedup_by(|a, b| a.id == b.id);
            for message in &loaded {
                state.message_index.insert(message.id, conversation_id);
            }
            loaded.extend(pending);
            state.messages.insert(conversation_id, loaded);
            state.history_cursors.insert(conversation_id, next_cursor);
            events.push(StoreEvent::MessagesReloaded(conversation_id));
        });
    }

    /// 覆盖已加载的消息（编辑、服务端确认）；未加载的消息忽略
    pub fn update_message(&self, message: MessageView) {
        self.mutate(|state, events| {
            let conversation_id = message.conversation_id;
            let id = message.id;
            if let Some(existing) = state.find_message_mut(id) {
                if *existing != message {
                    *existing = message;
                    events.push(StoreEvent::MessagesUpdated {
                        conversation_id,
                        message_ids: vec![id],
                    });
                }
            }
        });
    }

    /// 软删除：保留位置，内容替换为占位文本
    pub fn delete_message(
        &self,
        message_id: MessageId,
        deleted_by: UserId,
        deleted_at: Timestamp,
    ) {
        self.mutate(|state, events| {
            let Some(message) = state.find_message_mut(message_id) else {
                return;
            };
            if message.is_deleted {
                return;
            }
            message.is_deleted = true;
            message.content = DELETED_PLACEHOLDER.to_owned();
            message.attachments.clear();
            message.reactions.clear();
            message.deleted_by = Some(deleted_by);
            message.deleted_at = Some(deleted_at);
            message.updated_at = deleted_at;
            let conversation_id = message.conversation_id;
            let sender_id = message.sender_id;
            let created_at = message.created_at;

            if let Some(last) = state
                .conversations
                .get_mut(&conversation_id)
                .and_then(|conversation| conversation.last_message.as_mut())
            {
                if last.sender_id == sender_id && last.timestamp == created_at {
                    last.content_preview = DELETED_PLACEHOLDER.to_owned();
                }
            }
            events.push(StoreEvent::MessagesDeleted {
                conversation_id,
                message_ids: vec![message_id],
            });
        });
    }

    /// 用服务端给出的完整集合覆盖表情
    pub fn set_reactions(&self, message_id: MessageId, reactions: Vec<Reaction>) {
        self.mutate(|state, events| {
            if let Some(message) = state.find_message_mut(message_id) {
                if message.reactions != reactions {
                    message.reactions = reactions;
                    events.push(StoreEvent::MessagesUpdated {
                        conversation_id: message.conversation_id,
                        message_ids: vec![message_id],
                    });
                }
            }
        });
    }

    /// 本地切换一个表情，返回是否为新增；消息不存在时返回 `None`
    pub fn toggle_reaction(&self, message_id: MessageId, emoji: &str) -> Option<bool> {
        let me = self.me;
        let now = self.clock.now();
        self.mutate(|state, events| {
            let message = state.find_message_mut(message_id)?;
            let added = match message
                .reactions
                .iter()
                .position(|r| r.user_id == me && r.emoji == emoji)
            {
                Some(pos) => {
                    message.reactions.remove(pos);
                    false
                }
                None => {
                    message.reactions.push(Reaction {
                        user_id: me,
                        emoji: emoji.to_owned(),
                        timestamp: now,
                    });
                    true
                }
            };
            events.push(StoreEvent::MessagesUpdated {
                conversation_id: message.conversation_id,
                message_ids: vec![message_id],
            });
            Some(added)
        })
    }

    // ---- 本地待确认消息 ----

    /// 乐观插入一条尚未被服务端确认的消息
    pub fn insert_pending(&self, message: MessageView) {
        let id = message.id;
        self.append_message(message);
        self.write().pending.insert(id);
    }

    /// 用服务端结果替换本地消息；推送已先到达时只移除本地副本
    pub fn confirm_pending(&self, local_id: MessageId, confirmed: MessageView) {
        self.mutate(|state, events| {
            let conversation_id = confirmed.conversation_id;
            let confirmed_id = confirmed.id;
            state.pending.remove(&local_id);

            if state.contains_message(confirmed_id) {
                if state.remove_message(local_id).is_some() {
                    events.push(StoreEvent::MessagesDeleted {
                        conversation_id,
                        message_ids: vec![local_id],
                    });
                }
                return;
            }

            match state.find_message_mut(local_id) {
                Some(message) => {
                    *message = confirmed.clone();
                    state.message_index.remove(&local_id);
                    state.message_index.insert(confirmed_id, conversation_id);
                    events.push(StoreEvent::MessagesUpdated {
                        conversation_id,
                        message_ids: vec![local_id, confirmed_id],
                    });
                }
                None => {
                    state.message_index.insert(confirmed_id, conversation_id);
                    state
                        .messages
                        .entry(conversation_id)
                        .or_default()
                        .push(confirmed.clone());
                    events.push(StoreEvent::MessagesAppended {
                        conversation_id,
                        message_ids: vec![confirmed_id],
                    });
                }
            }
            if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
                conversation.last_message = Some(confirmed.last_message());
                conversation.updated_at = conversation.updated_at.max(confirmed.created_at);
                events.push(StoreEvent::ConversationUpserted(conversation_id));
            }
        });
    }

    /// 服务端拒绝后撤销乐观插入，并恢复会话摘要
    pub fn rollback_pending(&self, local_id: MessageId, previous: Option<&Conversation>) {
        self.mutate(|state, events| {
            if !state.pending.contains(&local_id) {
                return;
            }
            if let Some(removed) = state.remove_message(local_id) {
                let conversation_id = removed.conversation_id;
                events.push(StoreEvent::MessagesDeleted {
                    conversation_id,
                    message_ids: vec![local_id],
                });
                if let (Some(previous), Some(current)) =
                    (previous, state.conversations.get_mut(&conversation_id))
                {
                    current.last_message = previous.last_message.clone();
                    current.updated_at = previous.updated_at;
                    events.push(StoreEvent::ConversationUpserted(conversation_id));
                }
            }
        });
    }

    // ---- 输入状态与在线状态 ----

    /// 自己的输入信号不进入列表
    pub fn set_typing(&self, conversation_id: ConversationId, user_id: UserId, is_typing: bool) {
        if user_id == self.me {
            return;
        }
        let now = self.clock.now();
        self.mutate(|state, events| {
            let entries = state.typing.entry(conversation_id).or_default();
            let changed = if is_typing {
                entries.insert(user_id, now).is_none()
            } else {
                entries.remove(&user_id).is_some()
            };
            if changed {
                events.push(StoreEvent::ComposingUsersChanged(conversation_id));
            }
        });
    }

    /// 清除过期的输入状态，返回受影响的会话
    pub fn expire_typing(&self) -> Vec<ConversationId> {
        let cutoff = self.clock.now() - Duration::seconds(TYPING_TTL_SECS);
        self.mutate(|state, events| {
            let mut affected = Vec::new();
            for (conversation_id, entries) in state.typing.iter_mut() {
                let before = entries.len();
                entries.retain(|_, at| *at > cutoff);
                if entries.len() != before {
                    affected.push(*conversation_id);
                }
            }
            state.typing.retain(|_, entries| !entries.is_empty());
            affected.sort();
            events.extend(
                affected
                    .iter()
                    .map(|id| StoreEvent::ComposingUsersChanged(*id)),
            );
            affected
        })
    }

    pub fn set_presence(&self, user_id: UserId, online: bool) {
        self.mutate(|state, events| {
            let changed = if online {
                state.online.insert(user_id)
            } else {
                state.online.remove(&user_id)
            };
            if changed {
                events.push(StoreEvent::PresenceChanged { user_id, online });
            }
        });
    }

    /// 应用一条服务端推送
    pub fn apply_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Message { message } => self.append_message(message),
            ServerEvent::MessageEdited { message } => self.update_message(message),
            ServerEvent::MessageDeleted {
                message_id,
                deleted_by,
                deleted_at,
                ..
            } => self.delete_message(message_id, deleted_by, deleted_at),
            ServerEvent::Reaction {
                message_id,
                reactions,
                ..
            } => self.set_reactions(message_id, reactions),
            ServerEvent::Typing {
                conversation_id,
                user_id,
                is_typing,
            } => self.set_typing(conversation_id, user_id, is_typing),
            ServerEvent::Read {
                conversation_id,
                user_id,
                read_at,
            } => {
                if user_id == self.me {
                    self.mark_read_local(conversation_id, read_at);
                } else {
                    self.mutate(|state, events| {
                        if let Some(participant) = state
                            .conversations
                            .get_mut(&conversation_id)
                            .and_then(|conversation| conversation.participant_mut(user_id))
                        {
                            participant.record_read(read_at);
                            events.push(StoreEvent::ConversationUpserted(conversation_id));
                        }
                    });
                }
            }
            ServerEvent::Presence { user_id, online } => self.set_presence(user_id, online),
            ServerEvent::ConversationCreated { conversation }
            | ServerEvent::ConversationUpdated { conversation } => {
                self.upsert_conversation(conversation)
            }
        }
    }
}
