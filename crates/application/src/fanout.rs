//! 实时推送中心
//!
//! 维护用户到连接的映射与每个连接的状态机：
//! `Connecting → Authenticated → Subscribed(会话集合) → Disconnected`。
//! 每个连接有一个无界队列，推送方只入队不等待，慢连接不会拖住发送者。
//! 投递时总是从仓储重新读取会话成员，不缓存成员关系。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    ConnectionId, ConversationId, ConversationRepository, DeliveryScope, DomainError, ErrorKind,
    EventEnvelope, RepositoryError, ServerEvent, ServerFrame, Timestamp, UserId,
};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::broadcaster::{BroadcastError, EventBroadcaster};
use crate::clock::Clock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Subscribed(HashSet<ConversationId>),
    Disconnected,
}

impl ConnectionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self,
            ConnectionState::Authenticated | ConnectionState::Subscribed(_)
        )
    }

    pub fn is_subscribed_to(&self, conversation_id: ConversationId) -> bool {
        matches!(self, ConnectionState::Subscribed(ids) if ids.contains(&conversation_id))
    }
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("unknown connection")]
    UnknownConnection,
    #[error("connection is not authenticated")]
    NotAuthenticated,
    #[error("connection has not joined the conversation")]
    NotSubscribed,
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl FanoutError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FanoutError::UnknownConnection | FanoutError::NotAuthenticated => {
                ErrorKind::Authorization
            }
            FanoutError::NotSubscribed => ErrorKind::Validation,
            FanoutError::Domain(err) => err.kind(),
            FanoutError::Repository(err) => err.kind(),
        }
    }
}

/// 正在输入状态，按最后一次活动时间过期
#[derive(Debug, Default)]
pub struct TypingTracker {
    entries: HashMap<(ConversationId, UserId), Timestamp>,
}

impl TypingTracker {
    /// 返回 true 表示从未输入变为输入中
    pub fn start(&mut self, conversation_id: ConversationId, user_id: UserId, now: Timestamp) -> bool {
        self.entries.insert((conversation_id, user_id), now).is_none()
    }

    pub fn stop(&mut self, conversation_id: ConversationId, user_id: UserId) -> bool {
        self.entries.remove(&(conversation_id, user_id)).is_some()
    }

    /// 移除并返回静默超过 `ttl` 的条目
    pub fn expire(&mut self, now: Timestamp, ttl: chrono::Duration) -> Vec<(ConversationId, UserId)> {
        let expired: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, last)| now - **last >= ttl)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }

    pub fn clear_user(&mut self, user_id: UserId) -> Vec<ConversationId> {
        let cleared: Vec<_> = self
            .entries
            .keys()
            .filter(|(_, user)| *user == user_id)
            .copied()
            .collect();
        for key in &cleared {
            self.entries.remove(key);
        }
        cleared.into_iter().map(|(conversation, _)| conversation).collect()
    }

    pub fn typing_in(&self, conversation_id: ConversationId) -> Vec<UserId> {
        self.entries
            .keys()
            .filter(|(conversation, _)| *conversation == conversation_id)
            .map(|(_, user)| *user)
            .collect()
    }
}

struct ConnectionEntry {
    user_id: Option<UserId>,
    state: ConnectionState,
    sender: mpsc::UnboundedSender<ServerFrame>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    typing: TypingTracker,
}

impl HubState {
    fn user_connections(&self, user_id: UserId) -> impl Iterator<Item = ConnectionId> + '_ {
        self.by_user
            .get(&user_id)
            .into_iter()
            .flat_map(|ids| ids.iter().copied())
    }
}

/// 新建连接的句柄，`receiver` 交给传输层写出
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub receiver: mpsc::UnboundedReceiver<ServerFrame>,
}

pub struct ConnectionHub {
    conversations: Arc<dyn ConversationRepository>,
    clock: Arc<dyn Clock>,
    typing_ttl: chrono::Duration,
    state: RwLock<HubState>,
}

impl ConnectionHub {
    pub fn new(
        conversations: Arc<dyn ConversationRepository>,
        clock: Arc<dyn Clock>,
        typing_ttl: chrono::Duration,
    ) -> Self {
        Self {
            conversations,
            clock,
            typing_ttl,
            state: RwLock::new(HubState::default()),
        }
    }

    /// 新连接，处于 `Connecting` 状态
    pub async fn open(&self) -> ConnectionHandle {
        let id = ConnectionId::generate();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state.write().await.connections.insert(
            id,
            ConnectionEntry {
                user_id: None,
                state: ConnectionState::Connecting,
                sender,
            },
        );
        ConnectionHandle { id, receiver }
    }

    /// 绑定已验证的用户。用户的第一个连接会向共同会话的用户广播上线。
    pub async fn authenticate(&self, id: ConnectionId, user_id: UserId) -> Result<(), FanoutError> {
        let first_connection = {
            let mut state = self.state.write().await;
            let entry = state
                .connections
                .get_mut(&id)
                .ok_or(FanoutError::UnknownConnection)?;
            match entry.user_id {
                Some(existing) if existing == user_id => return Ok(()),
                Some(_) => return Err(FanoutError::NotAuthenticated),
                None => {}
            }
            entry.user_id = Some(user_id);
            entry.state = ConnectionState::Authenticated;
            let connections = state.by_user.entry(user_id).or_default();
            connections.insert(id);
            connections.len() == 1
        };

        tracing::info!(connection_id = %id, user_id = %user_id, "连接已认证");
        if first_connection {
            self.emit(ServerEvent::Presence {
                user_id,
                online: true,
            })
            .await;
        }
        Ok(())
    }

    /// `open` + `authenticate`
    pub async fn connect(&self, user_id: UserId) -> Result<ConnectionHandle, FanoutError> {
        let handle = self.open().await;
        self.authenticate(handle.id, user_id).await?;
        Ok(handle)
    }

    fn authenticated_user(state: &HubState, id: ConnectionId) -> Result<UserId, FanoutError> {
        let entry = state
            .connections
            .get(&id)
            .ok_or(FanoutError::UnknownConnection)?;
        match entry.user_id {
            Some(user_id) if entry.state.is_authenticated() => Ok(user_id),
            _ => Err(FanoutError::NotAuthenticated),
        }
    }

    /// 加入会话广播组，需要当前是未删除会话的参与者
    pub async fn join(&self, id: ConnectionId, conversation_id: ConversationId) -> Result<(), FanoutError> {
        let user_id = Self::authenticated_user(&*self.state.read().await, id)?;

        let conversation = self
            .conversations
            .find_by_id(conversation_id)
            .await?
            .ok_or(DomainError::ConversationNotFound)?;
        conversation.require_participant(user_id)?;

        let mut state = self.state.write().await;
        let entry = state
            .connections
            .get_mut(&id)
            .ok_or(FanoutError::UnknownConnection)?;
        match &mut entry.state {
            ConnectionState::Subscribed(ids) => {
                ids.insert(conversation_id);
            }
            ConnectionState::Authenticated => {
                entry.state = ConnectionState::Subscribed(HashSet::from([conversation_id]));
            }
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                return Err(FanoutError::NotAuthenticated)
            }
        }
        tracing::debug!(connection_id = %id, conversation_id = %conversation_id, "加入会话广播组");
        Ok(())
    }

    pub async fn leave(&self, id: ConnectionId, conversation_id: ConversationId) -> Result<(), FanoutError> {
        let (user_id, stopped_typing) = {
            let mut state = self.state.write().await;
            let user_id = Self::authenticated_user(&state, id)?;
            let still_subscribed = {
                let entry = state
                    .connections
                    .get_mut(&id)
                    .ok_or(FanoutError::UnknownConnection)?;
                if let ConnectionState::Subscribed(ids) = &mut entry.state {
                    ids.remove(&conversation_id);
                    if ids.is_empty() {
                        entry.state = ConnectionState::Authenticated;
                    }
                }
                // 同一用户的其他连接可能仍在该会话中
                state
                    .user_connections(user_id)
                    .filter_map(|conn| state.connections.get(&conn))
                    .any(|entry| entry.state.is_subscribed_to(conversation_id))
            };
            let stopped = !still_subscribed && state.typing.stop(conversation_id, user_id);
            (user_id, stopped)
        };

        if stopped_typing {
            self.emit_typing(conversation_id, user_id, false).await;
        }
        Ok(())
    }

    /// 客户端发来的输入状态，需要已加入该会话
    pub async fn set_typing(
        &self,
        id: ConnectionId,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> Result<(), FanoutError> {
        let now = self.clock.now();
        let (user_id, changed) = {
            let mut state = self.state.write().await;
            let user_id = Self::authenticated_user(&state, id)?;
            let subscribed = state
                .connections
                .get(&id)
                .is_some_and(|entry| entry.state.is_subscribed_to(conversation_id));
            if !subscribed {
                return Err(FanoutError::NotSubscribed);
            }
            let changed = if is_typing {
                state.typing.start(conversation_id, user_id, now)
            } else {
                state.typing.stop(conversation_id, user_id)
            };
            (user_id, changed)
        };

        if changed {
            self.emit_typing(conversation_id, user_id, is_typing).await;
        }
        Ok(())
    }

    /// 关闭连接。用户的最后一个连接断开时立即清除输入状态并广播离线。
    pub async fn disconnect(&self, id: ConnectionId) {
        let (user_id, cleared) = {
            let mut state = self.state.write().await;
            let Some(mut entry) = state.connections.remove(&id) else {
                return;
            };
            entry.state = ConnectionState::Disconnected;
            let Some(user_id) = entry.user_id else {
                return;
            };
            let last_connection = match state.by_user.get_mut(&user_id) {
                Some(connections) => {
                    connections.remove(&id);
                    connections.is_empty()
                }
                None => true,
            };
            if !last_connection {
                tracing::debug!(connection_id = %id, user_id = %user_id, "连接断开");
                return;
            }
            state.by_user.remove(&user_id);
            (user_id, state.typing.clear_user(user_id))
        };

        tracing::info!(connection_id = %id, user_id = %user_id, "用户最后一个连接断开");
        for conversation_id in cleared {
            self.emit_typing(conversation_id, user_id, false).await;
        }
        self.emit(ServerEvent::Presence {
            user_id,
            online: false,
        })
        .await;
    }

    /// 过期静默的输入状态，返回过期条数
    pub async fn sweep_typing(&self) -> usize {
        let now = self.clock.now();
        let expired = self.state.write().await.typing.expire(now, self.typing_ttl);
        for (conversation_id, user_id) in &expired {
            tracing::info!(conversation_id = %conversation_id, user_id = %user_id, "输入状态超时");
            self.emit_typing(*conversation_id, *user_id, false).await;
        }
        expired.len()
    }

    pub fn spawn_typing_sweeper(self: &Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                hub.sweep_typing().await;
            }
        })
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.state
            .read()
            .await
            .by_user
            .get(&user_id)
            .is_some_and(|connections| !connections.is_empty())
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        self.state.read().await.by_user.keys().copied().collect()
    }

    pub async fn connection_state(&self, id: ConnectionId) -> ConnectionState {
        self.state
            .read()
            .await
            .connections
            .get(&id)
            .map(|entry| entry.state.clone())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn typing_users(&self, conversation_id: ConversationId) -> Vec<UserId> {
        self.state.read().await.typing.typing_in(conversation_id)
    }

    async fn emit_typing(&self, conversation_id: ConversationId, user_id: UserId, is_typing: bool) {
        let event = ServerEvent::Typing {
            conversation_id,
            user_id,
            is_typing,
        };
        if let Err(err) = self.dispatch(event, Some(user_id)).await {
            tracing::warn!(error = %err, "输入状态推送失败");
        }
    }

    async fn emit(&self, event: ServerEvent) {
        let kind = event.kind();
        if let Err(err) = self.dispatch(event, None).await {
            tracing::warn!(kind, error = %err, "事件推送失败");
        }
    }

    /// 计算接收连接并入队，返回成功入队的连接数
    async fn dispatch(&self, event: ServerEvent, exclude: Option<UserId>) -> Result<usize, BroadcastError> {
        let envelope = EventEnvelope::new(event);
        envelope
            .validate()
            .map_err(|err| BroadcastError::InvalidEvent(err.to_string()))?;

        let scope = envelope.event.scope();
        let (users, subscribers_of) = match scope {
            DeliveryScope::Subscribers(conversation_id) => {
                match self.current_participants(conversation_id, false).await? {
                    Some(users) => (users, Some(conversation_id)),
                    None => return Ok(0),
                }
            }
            DeliveryScope::Participants(conversation_id) => {
                match self.current_participants(conversation_id, true).await? {
                    Some(users) => (users, None),
                    None => return Ok(0),
                }
            }
            DeliveryScope::PresenceWatchers(user_id) => {
                let watchers = self
                    .conversations
                    .co_participants(user_id)
                    .await
                    .map_err(|err| BroadcastError::failed(err.to_string()))?;
                (watchers, None)
            }
        };

        let frame = ServerFrame::Event(envelope);
        Ok(self
            .deliver(&frame, &users, subscribers_of, exclude)
            .await)
    }

    /// 投递时重新读取成员，已删除会话的输入状态不再广播
    async fn current_participants(
        &self,
        conversation_id: ConversationId,
        include_deleted: bool,
    ) -> Result<Option<Vec<UserId>>, BroadcastError> {
        let conversation = self
            .conversations
            .find_by_id(conversation_id)
            .await
            .map_err(|err| BroadcastError::failed(err.to_string()))?;
        Ok(conversation
            .filter(|c| include_deleted || !c.is_deleted())
            .map(|c| c.participant_ids()))
    }

    async fn deliver(
        &self,
        frame: &ServerFrame,
        users: &[UserId],
        subscribers_of: Option<ConversationId>,
        exclude: Option<UserId>,
    ) -> usize {
        let state = self.state.read().await;
        let mut delivered = 0;
        for user_id in users.iter().filter(|user| Some(**user) != exclude) {
            for connection_id in state.user_connections(*user_id) {
                let Some(entry) = state.connections.get(&connection_id) else {
                    continue;
                };
                let wanted = match subscribers_of {
                    Some(conversation_id) => entry.state.is_subscribed_to(conversation_id),
                    None => entry.state.is_authenticated(),
                };
                if !wanted {
                    continue;
                }
                if entry.sender.send(frame.clone()).is_err() {
                    tracing::warn!(connection_id = %connection_id, user_id = %user_id, "连接队列已关闭，丢弃事件");
                } else {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

#[async_trait]
impl EventBroadcaster for ConnectionHub {
    async fn broadcast(&self, event: ServerEvent) -> Result<(), BroadcastError> {
        let kind = event.kind();
        let delivered = self.dispatch(event, None).await?;
        tracing::debug!(kind, delivered, "事件已推送");
        Ok(())
    }

    async fn send_to_user(&self, user_id: UserId, event: ServerEvent) -> Result<(), BroadcastError> {
        let envelope = EventEnvelope::new(event);
        envelope
            .validate()
            .map_err(|err| BroadcastError::InvalidEvent(err.to_string()))?;
        let frame = ServerFrame::Event(envelope);
        self.deliver(&frame, &[user_id], None, None).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryStore;
    use chrono::{Duration, Utc};
    use domain::{initial_participants, Conversation, ConversationStatus, ConversationType};

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        hub: Arc<ConnectionHub>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let hub = Arc::new(ConnectionHub::new(
            store.clone(),
            clock.clone(),
            Duration::seconds(3),
        ));
        Fixture { store, clock, hub }
    }

    async fn conversation(store: &MemoryStore, a: UserId, b: UserId) -> Conversation {
        let conversation = Conversation::new(
            ConversationId::generate(),
            ConversationType::Direct,
            a,
            initial_participants(ConversationType::Direct, (a, None), vec![(b, None)]),
            None,
            Utc::now(),
        )
        .unwrap();
        store.create(&conversation).await.unwrap()
    }

    fn drain(handle: &mut ConnectionHandle) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(frame) = handle.receiver.try_recv() {
            if let ServerFrame::Event(envelope) = frame {
                events.push(envelope.event);
            }
        }
        events
    }

    #[tokio::test]
    async fn connection_walks_through_state_machine() {
        let f = fixture();
        let (alice, bob) = (UserId::generate(), UserId::generate());
        let conv = conversation(&f.store, alice, bob).await;

        let handle = f.hub.open().await;
        assert_eq!(f.hub.connection_state(handle.id).await, ConnectionState::Connecting);
        assert!(matches!(
            f.hub.join(handle.id, conv.id).await,
            Err(FanoutError::NotAuthenticated)
        ));

        f.hub.authenticate(handle.id, alice).await.unwrap();
        assert_eq!(f.hub.connection_state(handle.id).await, ConnectionState::Authenticated);

        f.hub.join(handle.id, conv.id).await.unwrap();
        assert!(f.hub.connection_state(handle.id).await.is_subscribed_to(conv.id));

        f.hub.leave(handle.id, conv.id).await.unwrap();
        assert_eq!(f.hub.connection_state(handle.id).await, ConnectionState::Authenticated);

        f.hub.disconnect(handle.id).await;
        assert_eq!(f.hub.connection_state(handle.id).await, ConnectionState::Disconnected);
        assert!(!f.hub.is_online(alice).await);
    }

    #[tokio::test]
    async fn join_requires_membership() {
        let f = fixture();
        let conv = conversation(&f.store, UserId::generate(), UserId::generate()).await;
        let outsider = f.hub.connect(UserId::generate()).await.unwrap();

        let result = f.hub.join(outsider.id, conv.id).await;
        assert!(matches!(
            result,
            Err(FanoutError::Domain(DomainError::NotParticipant))
        ));
    }

    #[tokio::test]
    async fn every_connection_of_a_participant_receives_events() {
        let f = fixture();
        let (alice, bob) = (UserId::generate(), UserId::generate());
        let conv = conversation(&f.store, alice, bob).await;
        let mut phone = f.hub.connect(bob).await.unwrap();
        let mut laptop = f.hub.connect(bob).await.unwrap();
        let mut outsider = f.hub.connect(UserId::generate()).await.unwrap();
        drain(&mut phone);
        drain(&mut laptop);

        f.hub
            .broadcast(ServerEvent::Read {
                conversation_id: conv.id,
                user_id: alice,
                read_at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(drain(&mut phone).len(), 1);
        assert_eq!(drain(&mut laptop).len(), 1);
        assert!(drain(&mut outsider).is_empty());
    }

    #[tokio::test]
    async fn typing_only_reaches_subscribers_and_expires() {
        let f = fixture();
        let (alice, bob) = (UserId::generate(), UserId::generate());
        let conv = conversation(&f.store, alice, bob).await;

        let typist = f.hub.connect(alice).await.unwrap();
        let mut watching = f.hub.connect(bob).await.unwrap();
        let mut idle = f.hub.connect(bob).await.unwrap();
        f.hub.join(typist.id, conv.id).await.unwrap();
        f.hub.join(watching.id, conv.id).await.unwrap();
        drain(&mut watching);
        drain(&mut idle);

        f.hub.set_typing(typist.id, conv.id, true).await.unwrap();
        // 重复的 start 只刷新时间，不重复广播
        f.hub.set_typing(typist.id, conv.id, true).await.unwrap();

        let events = drain(&mut watching);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerEvent::Typing { is_typing: true, .. }));
        assert!(drain(&mut idle).is_empty());

        f.clock.advance(Duration::milliseconds(2_900));
        assert_eq!(f.hub.sweep_typing().await, 0);
        f.clock.advance(Duration::milliseconds(100));
        assert_eq!(f.hub.sweep_typing().await, 1);

        let events = drain(&mut watching);
        assert!(matches!(events[0], ServerEvent::Typing { is_typing: false, .. }));
        assert!(f.hub.typing_users(conv.id).await.is_empty());
    }

    #[tokio::test]
    async fn last_disconnect_clears_typing_and_announces_offline() {
        let f = fixture();
        let (alice, bob) = (UserId::generate(), UserId::generate());
        let conv = conversation(&f.store, alice, bob).await;

        let typist = f.hub.connect(alice).await.unwrap();
        let mut watcher = f.hub.connect(bob).await.unwrap();
        f.hub.join(typist.id, conv.id).await.unwrap();
        f.hub.join(watcher.id, conv.id).await.unwrap();
        f.hub.set_typing(typist.id, conv.id, true).await.unwrap();
        drain(&mut watcher);

        f.hub.disconnect(typist.id).await;

        let events = drain(&mut watcher);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::Typing { is_typing: false, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::Presence { online: false, user_id } if *user_id == alice)));
    }

    #[tokio::test]
    async fn presence_reaches_co_participants_only() {
        let f = fixture();
        let (alice, bob) = (UserId::generate(), UserId::generate());
        conversation(&f.store, alice, bob).await;
        let mut bob_conn = f.hub.connect(bob).await.unwrap();
        let mut stranger = f.hub.connect(UserId::generate()).await.unwrap();
        drain(&mut bob_conn);
        drain(&mut stranger);

        let _alice_conn = f.hub.connect(alice).await.unwrap();

        let events = drain(&mut bob_conn);
        assert_eq!(
            events,
            vec![ServerEvent::Presence {
                user_id: alice,
                online: true
            }]
        );
        assert!(drain(&mut stranger).is_empty());
    }

    #[tokio::test]
    async fn deleted_conversation_stops_typing_fanout() {
        let f = fixture();
        let (alice, bob) = (UserId::generate(), UserId::generate());
        let conv = conversation(&f.store, alice, bob).await;
        let typist = f.hub.connect(alice).await.unwrap();
        let mut watcher = f.hub.connect(bob).await.unwrap();
        f.hub.join(typist.id, conv.id).await.unwrap();
        f.hub.join(watcher.id, conv.id).await.unwrap();
        drain(&mut watcher);

        f.store
            .set_status(conv.id, ConversationStatus::Deleted, Utc::now())
            .await
            .unwrap();
        f.hub.set_typing(typist.id, conv.id, true).await.unwrap();

        let events = drain(&mut watcher);
        assert!(events.is_empty());
    }
}
