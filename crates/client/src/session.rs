//! 客户端会话
//!
//! 把请求封装、状态容器和实时通道组合在一起。自己发出的消息先乐观写入本地，
//! 服务端拒绝时回滚。历史与搜索按资源键发放递增的票据，只有最新票据的结果会被采用。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use domain::{
    Attachment, Conversation, ConversationContext, ConversationFilter, ConversationId,
    ConversationType, MessageId, MessageView, ParticipantSettings, UnreadSummary, UserId,
};
use tokio::task::JoinHandle;

use crate::api::{ChatApi, CreatedConversation};
use crate::error::ClientError;
use crate::listener::RealtimeLink;
use crate::store::ChatStore;

/// 一次加载会话列表时的单页大小
const CONVERSATION_PAGE: u32 = 100;
/// 打开会话时加载的消息条数
const HISTORY_PAGE: u32 = 30;

const ACTIVE_HISTORY_KEY: &str = "history:active";
const SEARCH_KEY: &str = "search";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    key: String,
    generation: u64,
}

/// 每个资源键一个递增代数，新票据让旧票据失效
#[derive(Debug, Default)]
pub struct Tickets {
    generations: Mutex<HashMap<String, u64>>,
}

impl Tickets {
    pub fn issue(&self, key: impl Into<String>) -> Ticket {
        let key = key.into();
        let mut generations = self
            .generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let generation = generations.entry(key.clone()).or_insert(0);
        *generation += 1;
        Ticket {
            key,
            generation: *generation,
        }
    }

    pub fn is_current(&self, ticket: &Ticket) -> bool {
        self.generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&ticket.key)
            .is_some_and(|generation| *generation == ticket.generation)
    }

    /// 结果只在票据仍是最新时交付
    pub fn settle<T>(&self, ticket: &Ticket, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if !self.is_current(ticket) {
            tracing::debug!(key = %ticket.key, "丢弃过期的请求结果");
            return Err(ClientError::Superseded);
        }
        result
    }
}

pub struct ChatSession {
    api: ChatApi,
    store: Arc<ChatStore>,
    tickets: Tickets,
    link: tokio::sync::Mutex<Option<RealtimeLink>>,
}

impl ChatSession {
    pub fn new(api: ChatApi, me: UserId) -> Self {
        Self::with_store(api, Arc::new(ChatStore::new(me)))
    }

    pub fn with_store(api: ChatApi, store: Arc<ChatStore>) -> Self {
        Self {
            api,
            store,
            tickets: Tickets::default(),
            link: tokio::sync::Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<ChatStore> {
        &self.store
    }

    pub fn api(&self) -> &ChatApi {
        &self.api
    }

    pub fn tickets(&self) -> &Tickets {
        &self.tickets
    }

    // ---- 会话列表 ----

    /// 拉取全部会话并替换本地列表
    pub async fn load_conversations(&self) -> Result<Vec<Conversation>, ClientError> {
        let filter = ConversationFilter::default();
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .api
                .list_conversations(&filter, cursor.as_deref(), Some(CONVERSATION_PAGE))
                .await?;
            all.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        self.store.replace_conversations(all.clone());
        Ok(all)
    }

    pub async fn create_conversation(
        &self,
        kind: ConversationType,
        participant_ids: &[UserId],
        context: Option<&ConversationContext>,
    ) -> Result<CreatedConversation, ClientError> {
        let created = self
            .api
            .create_conversation(kind, participant_ids, context)
            .await?;
        self.store.upsert_conversation(created.conversation.clone());
        Ok(created)
    }

    pub async fn update_settings(
        &self,
        conversation_id: ConversationId,
        settings: &ParticipantSettings,
    ) -> Result<Conversation, ClientError> {
        let conversation = self.api.update_settings(conversation_id, settings).await?;
        self.store.upsert_conversation(conversation.clone());
        Ok(conversation)
    }

    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        self.api.delete_conversation(conversation_id).await?;
        self.store.remove_conversation(conversation_id);
        Ok(())
    }

    pub async fn unread_summary(&self) -> Result<UnreadSummary, ClientError> {
        self.api.unread_summary().await
    }

    // ---- 消息历史 ----

    /// 切换当前会话并加载最新一页；更快的切换会让本次结果作废
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        let previous = self.store.active_conversation();
        self.store.set_active(Some(conversation_id));
        let ticket = self.tickets.issue(ACTIVE_HISTORY_KEY);

        let page = self
            .api
            .list_messages(conversation_id, None, Some(HISTORY_PAGE))
            .await;
        let page = self.tickets.settle(&ticket, page)?;
        self.store
            .reset_messages(conversation_id, page.items, page.next_cursor);

        if let Some(link) = self.link.lock().await.as_ref() {
            if let Some(previous) = previous.filter(|id| *id != conversation_id) {
                link.leave(previous)?;
            }
            link.join(conversation_id)?;
        }
        self.mark_read(conversation_id).await
    }

    /// 加载更早的一页，返回新增条数；已经到底时返回 0
    pub async fn load_older(&self, conversation_id: ConversationId) -> Result<usize, ClientError> {
        let cursor = match self.store.history_cursor(conversation_id) {
            Some(None) => return Ok(0),
            Some(Some(cursor)) => Some(cursor),
            None => None,
        };
        let ticket = self.tickets.issue(format!("history:{conversation_id}"));
        let page = self
            .api
            .list_messages(conversation_id, cursor.as_deref(), Some(HISTORY_PAGE))
            .await;
        let page = self.tickets.settle(&ticket, page)?;

        Ok(self
            .store
            .prepend_messages(conversation_id, page.items, page.next_cursor))
    }

    /// 全文搜索；新的搜索会让还在进行的旧搜索作废
    pub async fn search(&self, query: &str) -> Result<Vec<MessageView>, ClientError> {
        let ticket = self.tickets.issue(SEARCH_KEY);
        let result = self.api.search_messages(query).await;
        self.tickets.settle(&ticket, result)
    }

    pub async fn mark_read(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        let participant = self.api.mark_read(conversation_id).await?;
        let read_at = participant.last_read_at.unwrap_or_else(|| self.store.now());
        self.store.mark_read_local(conversation_id, read_at);
        Ok(())
    }

    // ---- 写操作 ----

    /// 乐观发送：先插入本地消息，服务端确认后替换，失败则回滚
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<MessageView, ClientError> {
        let previous = self.store.conversation(conversation_id);
        let now = self.store.now();
        let local = MessageView {
            id: MessageId::generate(),
            conversation_id,
            sender_id: self.store.me(),
            sender_name: None,
            content: content.to_owned(),
            attachments: attachments.clone(),
            reactions: Vec::new(),
            is_edited: false,
            edit_count: 0,
            edit_history: None,
            is_spam: false,
            is_deleted: false,
            deleted_by: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        let local_id = local.id;
        self.store.insert_pending(local);

        match self
            .api
            .send_message(conversation_id, content, &attachments)
            .await
        {
            Ok(confirmed) => {
                self.store.confirm_pending(local_id, confirmed.clone());
                Ok(confirmed)
            }
            Err(err) => {
                tracing::info!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "消息发送被拒绝，撤销本地消息"
                );
                self.store.rollback_pending(local_id, previous.as_ref());
                Err(err)
            }
        }
    }

    pub async fn edit_message(&self, message_id: MessageId, content: &str) -> Result<MessageView, ClientError> {
        let edited = self.api.edit_message(message_id, content).await?;
        self.store.update_message(edited.clone());
        Ok(edited)
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<MessageView, ClientError> {
        let deleted = self.api.delete_message(message_id).await?;
        self.store.delete_message(
            deleted.id,
            deleted.deleted_by.unwrap_or_else(|| self.store.me()),
            deleted.deleted_at.unwrap_or(deleted.updated_at),
        );
        Ok(deleted)
    }

    /// 本地先切换，服务端返回后以其集合为准，失败时切换回去
    pub async fn toggle_reaction(&self, message_id: MessageId, emoji: &str) -> Result<bool, ClientError> {
        let optimistic = self.store.toggle_reaction(message_id, emoji);
        match self.api.toggle_reaction(message_id, emoji).await {
            Ok(toggle) => {
                self.store.set_reactions(message_id, toggle.reactions);
                Ok(toggle.added)
            }
            Err(err) => {
                if optimistic.is_some() {
                    self.store.toggle_reaction(message_id, emoji);
                }
                Err(err)
            }
        }
    }

    // ---- 实时通道 ----

    /// 建立实时连接并重新加入当前会话
    pub async fn connect_realtime(&self) -> Result<(), ClientError> {
        let link = RealtimeLink::connect(&self.api.websocket_url(), self.store.clone()).await?;
        if let Some(active) = self.store.active_conversation() {
            link.join(active)?;
        }
        *self.link.lock().await = Some(link);
        tracing::info!(user_id = %self.store.me(), "实时通道已连接");
        Ok(())
    }

    /// 断线重连后全量同步：会话列表和当前会话的最新一页
    pub async fn resync(&self) -> Result<(), ClientError> {
        self.load_conversations().await?;
        if let Some(active) = self.store.active_conversation() {
            let ticket = self.tickets.issue(ACTIVE_HISTORY_KEY);
            let page = self
                .api
                .list_messages(active, None, Some(HISTORY_PAGE))
                .await;
            let page = self.tickets.settle(&ticket, page)?;
            self.store.reset_messages(active, page.items, page.next_cursor);
        }
        Ok(())
    }

    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.connect_realtime().await?;
        self.resync().await
    }

    pub async fn is_connected(&self) -> bool {
        self.link
            .lock()
            .await
            .as_ref()
            .is_some_and(|link| !link.is_closed())
    }

    pub async fn join(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        self.with_link(|link| link.join(conversation_id)).await
    }

    pub async fn set_typing(&self, conversation_id: ConversationId, is_typing: bool) -> Result<(), ClientError> {
        self.with_link(|link| link.typing(conversation_id, is_typing))
            .await
    }

    /// 等待服务端处理完此前发出的全部命令
    pub async fn sync_realtime(&self) -> Result<(), ClientError> {
        match self.link.lock().await.as_mut() {
            Some(link) => link.sync().await,
            None => Err(ClientError::Protocol("realtime link not connected".into())),
        }
    }

    pub async fn disconnect(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.close().await;
        }
    }

    async fn with_link(
        &self,
        f: impl FnOnce(&RealtimeLink) -> Result<(), ClientError>,
    ) -> Result<(), ClientError> {
        match self.link.lock().await.as_ref() {
            Some(link) => f(link),
            None => Err(ClientError::Protocol("realtime link not connected".into())),
        }
    }

    /// 定期清理过期的输入状态
    pub fn spawn_typing_expiry(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let expired = store.expire_typing();
                if !expired.is_empty() {
                    tracing::debug!(count = expired.len(), "输入状态已过期");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_ticket_supersedes_older() {
        let tickets = Tickets::default();
        let first = tickets.issue("search");
        let second = tickets.issue("search");
        let other = tickets.issue("history:active");

        assert!(!tickets.is_current(&first));
        assert!(tickets.is_current(&second));
        assert!(tickets.is_current(&other));
        assert!(matches!(
            tickets.settle(&first, Ok(1)),
            Err(ClientError::Superseded)
        ));
        assert_eq!(tickets.settle(&second, Ok(2)).unwrap(), 2);
    }
}
