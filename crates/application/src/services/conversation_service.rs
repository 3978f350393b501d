use std::collections::HashSet;
use std::sync::Arc;

use domain::{
    initial_participants, validate_emoji, AdminConversationFilter, AdminConversationRow,
    Attachment, Conversation, ConversationContext, ConversationFilter, ConversationId,
    ConversationRepository, ConversationStatus, ConversationType, Cursor, DomainError, Message,
    MessageAggregate, MessageId, MessageRepository, MessageView, MessageViewer, NewMessage,
    OffsetPage, Page, Participant, ParticipantRole, ParticipantSettings, ReactionToggle,
    RepositoryError, ServerEvent, UnreadSummary, UserId, UserRole,
};

use crate::{
    abuse::{DailyRateLimiter, SpamScorer, DEFAULT_SPAM_THRESHOLD},
    broadcaster::EventBroadcaster,
    clock::Clock,
    directory::{SubscriptionDirectory, UserDirectory},
    error::ApplicationError,
    retry::{retry_async, RetryConfig},
    sanitize::sanitize_content,
};

/// 身份服务校验过的请求者
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub role: UserRole,
    pub display_name: Option<String>,
}

impl Actor {
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            role: UserRole::User,
            display_name: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateConversationRequest {
    pub kind: ConversationType,
    /// 除请求者之外的参与者
    pub participant_ids: Vec<UserId>,
    pub context: Option<ConversationContext>,
}

#[derive(Debug, Clone)]
pub struct CreateConversationResult {
    pub conversation: Conversation,
    /// false 表示命中了已有的 direct 会话
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone)]
pub struct EditMessageRequest {
    pub message_id: MessageId,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListConversationsRequest {
    pub filter: ConversationFilter,
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ListMessagesRequest {
    pub conversation_id: ConversationId,
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct AdminListRequest {
    pub filter: AdminConversationFilter,
    pub offset: u64,
    pub limit: Option<u32>,
}

/// 服务层可调参数
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub spam_threshold: u8,
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub search_limit: u32,
    pub aggregate_retry: RetryConfig,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            spam_threshold: DEFAULT_SPAM_THRESHOLD,
            default_page_size: 30,
            max_page_size: 100,
            search_limit: 50,
            aggregate_retry: RetryConfig::aggregate_update(),
        }
    }
}

impl ServiceSettings {
    pub fn from_config(config: &config::AppConfig) -> Self {
        Self {
            spam_threshold: config.abuse.spam_threshold,
            default_page_size: config.limits.default_page_size,
            max_page_size: config.limits.max_page_size,
            search_limit: config.limits.search_limit,
            aggregate_retry: RetryConfig::aggregate_update(),
        }
    }
}

const MAX_QUERY_CHARS: usize = 200;

pub struct ConversationServiceDependencies {
    pub conversation_repository: Arc<dyn ConversationRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub user_directory: Arc<dyn UserDirectory>,
    pub subscriptions: Arc<dyn SubscriptionDirectory>,
    pub rate_limiter: Arc<DailyRateLimiter>,
    pub spam_scorer: Arc<SpamScorer>,
    pub broadcaster: Arc<dyn EventBroadcaster>,
    pub clock: Arc<dyn Clock>,
    pub settings: ServiceSettings,
}

pub struct ConversationService {
    deps: ConversationServiceDependencies,
}

impl ConversationService {
    pub fn new(deps: ConversationServiceDependencies) -> Self {
        Self { deps }
    }

    async fn load_conversation(&self, id: ConversationId) -> Result<Conversation, ApplicationError> {
        self.deps
            .conversation_repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| DomainError::ConversationNotFound.into())
    }

    async fn load_message(&self, id: MessageId) -> Result<Message, ApplicationError> {
        self.deps
            .message_repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| DomainError::MessageNotFound.into())
    }

    fn page_limit(&self, requested: Option<u32>) -> u32 {
        let settings = &self.deps.settings;
        requested
            .unwrap_or(settings.default_page_size)
            .clamp(1, settings.max_page_size)
    }

    /// 推送失败只记日志，不影响请求结果
    async fn publish(&self, event: ServerEvent) {
        let kind = event.kind();
        if let Err(err) = self.deps.broadcaster.broadcast(event).await {
            tracing::warn!(kind, error = %err, "事件推送失败");
        }
    }

    async fn publish_to(&self, user_id: UserId, event: ServerEvent) {
        let kind = event.kind();
        if let Err(err) = self.deps.broadcaster.send_to_user(user_id, event).await {
            tracing::warn!(kind, user_id = %user_id, error = %err, "事件推送失败");
        }
    }

    /// 会话变更逐个推给参与者，每人只看到自己的个人设置
    async fn publish_conversation_updated(&self, conversation: &Conversation) {
        for participant in &conversation.participants {
            self.publish_to(
                participant.user_id,
                ServerEvent::ConversationUpdated {
                    conversation: conversation.view_for(participant.user_id),
                },
            )
            .await;
        }
    }

    /// 垃圾消息的事件只回给发送者
    async fn publish_message_event(&self, message: &Message, event: ServerEvent) {
        if message.is_spam {
            self.publish_to(message.sender_id, event).await;
        } else {
            self.publish(event).await;
        }
    }

    /// 会话聚合字段更新，存储故障时重试，仍失败则标记待修复
    async fn update_aggregate<F, Fut>(&self, conversation_id: ConversationId, op: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), RepositoryError>>,
    {
        let result = retry_async(
            &self.deps.settings.aggregate_retry,
            |err: &RepositoryError| matches!(err, RepositoryError::Storage { .. }),
            op,
        )
        .await;

        if let Err(err) = result {
            tracing::error!(conversation_id = %conversation_id, error = %err, "会话聚合更新失败，标记待修复");
            if let Err(mark_err) = self
                .deps
                .conversation_repository
                .mark_inconsistent(conversation_id)
                .await
            {
                tracing::error!(conversation_id = %conversation_id, error = %mark_err, "标记待修复失败");
            }
        }
    }

    pub async fn create_conversation(
        &self,
        actor: &Actor,
        request: CreateConversationRequest,
    ) -> Result<CreateConversationResult, ApplicationError> {
        let others = &request.participant_ids;
        if others.is_empty() {
            return Err(DomainError::invalid_argument("participant_ids", "cannot be empty").into());
        }
        let mut seen = HashSet::with_capacity(others.len());
        if !others.iter().all(|id| seen.insert(*id)) {
            return Err(
                DomainError::invalid_argument("participant_ids", "duplicate participant").into(),
            );
        }
        if seen.contains(&actor.user_id) {
            return Err(DomainError::invalid_argument(
                "participant_ids",
                "must not include the requester",
            )
            .into());
        }
        if request.kind == ConversationType::Direct && others.len() != 1 {
            return Err(DomainError::invalid_argument(
                "participant_ids",
                "direct conversations take exactly one other participant",
            )
            .into());
        }

        let profiles = self.deps.user_directory.find_profiles(others).await?;
        let mut resolved = Vec::with_capacity(others.len());
        for id in others {
            let profile = profiles
                .iter()
                .find(|p| p.id == *id)
                .ok_or_else(|| DomainError::user_not_found(id))?;
            resolved.push((profile.id, profile.display_name.clone()));
        }

        let now = self.deps.clock.now();
        let participants = initial_participants(
            request.kind,
            (actor.user_id, actor.display_name.clone()),
            resolved,
        );
        let conversation = Conversation::new(
            ConversationId::generate(),
            request.kind,
            actor.user_id,
            participants,
            request.context,
            now,
        )?;

        let (conversation, created) = if conversation.kind == ConversationType::Direct {
            self.deps
                .conversation_repository
                .create_direct(&conversation)
                .await?
        } else {
            (
                self.deps
                    .conversation_repository
                    .create(&conversation)
                    .await?,
                true,
            )
        };

        if created {
            tracing::info!(
                conversation_id = %conversation.id,
                kind = conversation.kind.as_str(),
                user_id = %actor.user_id,
                "会话已创建"
            );
            self.publish(ServerEvent::ConversationCreated {
                conversation: conversation.clone(),
            })
            .await;
        } else {
            tracing::debug!(conversation_id = %conversation.id, "命中已有 direct 会话");
        }

        Ok(CreateConversationResult {
            conversation: conversation.view_for(actor.user_id),
            created,
        })
    }

    pub async fn get_conversation(
        &self,
        actor: &Actor,
        conversation_id: ConversationId,
    ) -> Result<Conversation, ApplicationError> {
        let conversation = self.load_conversation(conversation_id).await?;
        if !actor.role.is_admin() {
            conversation.require_participant(actor.user_id)?;
        }
        Ok(redact_for(conversation, actor))
    }

    pub async fn list_conversations(
        &self,
        actor: &Actor,
        request: ListConversationsRequest,
    ) -> Result<Page<Conversation>, ApplicationError> {
        let limit = self.page_limit(request.limit);
        let cursor = request.cursor.as_deref().map(Cursor::decode).transpose()?;
        let mut items = self
            .deps
            .conversation_repository
            .list_for_user(actor.user_id, &request.filter, cursor, limit + 1)
            .await?;

        let next_cursor = if items.len() > limit as usize {
            items.truncate(limit as usize);
            items
                .last()
                .map(|c| Cursor::new(c.updated_at, c.id).encode())
        } else {
            None
        };
        let items = items
            .iter()
            .map(|conversation| conversation.view_for(actor.user_id))
            .collect();
        Ok(Page { items, next_cursor })
    }

    pub async fn send_message(
        &self,
        actor: &Actor,
        request: SendMessageRequest,
    ) -> Result<MessageView, ApplicationError> {
        let conversation = self.load_conversation(request.conversation_id).await?;
        let participant = conversation.require_participant(actor.user_id)?;

        Message::validate_payload(&request.content, &request.attachments)?;

        let now = self.deps.clock.now();
        let tier = self.deps.subscriptions.tier_for(actor.user_id).await;
        let decision = self
            .deps
            .rate_limiter
            .check(actor.user_id, tier, now)
            .await?;
        if !decision.allowed {
            return Err(ApplicationError::RateLimited {
                reset_at: decision.reset_at,
            });
        }

        let history = self
            .deps
            .message_repository
            .sender_history(actor.user_id, now)
            .await?;
        let spam_score = self.deps.spam_scorer.score(&request.content, &history);

        let sender_name = participant
            .display_name
            .clone()
            .or_else(|| actor.display_name.clone());
        let content_sanitized = sanitize_content(&request.content);
        let message = Message::new(
            MessageId::generate(),
            NewMessage {
                conversation_id: conversation.id,
                sender_id: actor.user_id,
                sender_name,
                content: request.content,
                content_sanitized,
                attachments: request.attachments,
                spam_score,
                spam_threshold: self.deps.settings.spam_threshold,
            },
            now,
        );

        let message = self.deps.message_repository.insert(&message).await?;

        if message.is_spam {
            tracing::info!(
                message_id = %message.id,
                conversation_id = %conversation.id,
                user_id = %actor.user_id,
                spam_score = message.spam_score,
                "消息被标记为垃圾消息"
            );
        } else {
            let aggregate = MessageAggregate::for_message(&message);
            let repository = &self.deps.conversation_repository;
            self.update_aggregate(conversation.id, || repository.record_message(&aggregate))
                .await;
        }

        let view = MessageView::from(&message);
        self.publish_message_event(
            &message,
            ServerEvent::Message {
                message: view.clone(),
            },
        )
        .await;
        Ok(view)
    }

    pub async fn edit_message(
        &self,
        actor: &Actor,
        request: EditMessageRequest,
    ) -> Result<MessageView, ApplicationError> {
        let message = self.load_message(request.message_id).await?;
        let conversation = self.load_conversation(message.conversation_id).await?;
        conversation.require_participant(actor.user_id)?;
        let now = self.deps.clock.now();
        message.ensure_editable(actor.user_id, now)?;
        Message::validate_payload(&request.content, &message.attachments)?;

        let expected_edit_count = message.edit_history.len() as u32;
        let mut edited = message.clone();
        let sanitized = sanitize_content(&request.content);
        edited.apply_edit(request.content, sanitized, now);

        let stored = self
            .deps
            .message_repository
            .apply_edit(&edited, expected_edit_count)
            .await?
            .ok_or(DomainError::ConcurrentModification)?;

        if !stored.is_spam {
            let aggregate = MessageAggregate::for_message(&stored);
            let repository = &self.deps.conversation_repository;
            self.update_aggregate(stored.conversation_id, || {
                repository.refresh_last_message(&aggregate)
            })
            .await;
        }

        tracing::info!(message_id = %stored.id, user_id = %actor.user_id, "消息已编辑");
        let view = MessageView::from(&stored);
        self.publish_message_event(
            &stored,
            ServerEvent::MessageEdited {
                message: view.clone(),
            },
        )
        .await;
        Ok(view)
    }

    /// 重复删除不报错，直接返回当前状态
    pub async fn delete_message(
        &self,
        actor: &Actor,
        message_id: MessageId,
    ) -> Result<MessageView, ApplicationError> {
        let message = self.load_message(message_id).await?;
        let is_sender = message.sender_id == actor.user_id;
        if !is_sender && !actor.role.can_moderate() {
            return Err(DomainError::InsufficientPermissions.into());
        }
        if message.is_deleted {
            return Ok(MessageView::from(&message));
        }

        let now = self.deps.clock.now();
        let Some(deleted) = self
            .deps
            .message_repository
            .soft_delete(message_id, actor.user_id, now)
            .await?
        else {
            // 并发删除已经生效
            let current = self.load_message(message_id).await?;
            return Ok(MessageView::from(&current));
        };

        if !deleted.is_spam {
            let repository = &self.deps.conversation_repository;
            self.update_aggregate(deleted.conversation_id, || {
                repository.retract_message(deleted.conversation_id, deleted.sender_id, deleted.created_at)
            })
            .await;
        }

        tracing::info!(
            message_id = %deleted.id,
            deleted_by = %actor.user_id,
            moderator = !is_sender,
            "消息已删除"
        );
        self.publish_message_event(
            &deleted,
            ServerEvent::MessageDeleted {
                conversation_id: deleted.conversation_id,
                message_id: deleted.id,
                deleted_by: actor.user_id,
                deleted_at: now,
            },
        )
        .await;
        Ok(MessageView::from(&deleted))
    }

    pub async fn toggle_reaction(
        &self,
        actor: &Actor,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<ReactionToggle, ApplicationError> {
        validate_emoji(emoji)?;
        let message = self.load_message(message_id).await?;
        let conversation = self.load_conversation(message.conversation_id).await?;
        conversation.require_participant(actor.user_id)?;
        let viewer = MessageViewer {
            user_id: actor.user_id,
            include_all_spam: actor.role.can_moderate(),
        };
        if !viewer.can_see(&message) {
            return Err(DomainError::MessageNotFound.into());
        }
        if message.is_deleted {
            return Err(DomainError::MessageDeleted.into());
        }

        let now = self.deps.clock.now();
        let toggle = self
            .deps
            .message_repository
            .toggle_reaction(message_id, actor.user_id, emoji, now)
            .await?;

        self.publish_message_event(
            &message,
            ServerEvent::Reaction {
                conversation_id: message.conversation_id,
                message_id,
                user_id: actor.user_id,
                emoji: emoji.to_owned(),
                added: toggle.added,
                reactions: toggle.reactions.clone(),
            },
        )
        .await;
        Ok(toggle)
    }

    pub async fn mark_read(
        &self,
        actor: &Actor,
        conversation_id: ConversationId,
    ) -> Result<Participant, ApplicationError> {
        let conversation = self.load_conversation(conversation_id).await?;
        conversation.require_participant(actor.user_id)?;

        let now = self.deps.clock.now();
        let participant = self
            .deps
            .conversation_repository
            .mark_read(conversation_id, actor.user_id, now)
            .await?
            .ok_or(DomainError::NotParticipant)?;

        self.publish(ServerEvent::Read {
            conversation_id,
            user_id: actor.user_id,
            read_at: now,
        })
        .await;
        Ok(participant)
    }

    pub async fn list_messages(
        &self,
        actor: &Actor,
        request: ListMessagesRequest,
    ) -> Result<Page<MessageView>, ApplicationError> {
        let conversation = self.load_conversation(request.conversation_id).await?;
        conversation.require_participant(actor.user_id)?;

        let limit = self.page_limit(request.limit);
        let cursor = request.cursor.as_deref().map(Cursor::decode).transpose()?;
        let viewer = MessageViewer {
            user_id: actor.user_id,
            include_all_spam: actor.role.can_moderate(),
        };
        let mut messages = self
            .deps
            .message_repository
            .list_page(conversation.id, viewer, cursor, limit + 1)
            .await?;

        let next_cursor = if messages.len() > limit as usize {
            messages.truncate(limit as usize);
            messages
                .last()
                .map(|m| Cursor::new(m.created_at, m.id).encode())
        } else {
            None
        };
        let project: fn(&Message) -> MessageView = if actor.role.can_moderate() {
            MessageView::for_moderator
        } else {
            |m: &Message| MessageView::from(m)
        };
        Ok(Page {
            items: messages.iter().map(project).collect(),
            next_cursor,
        })
    }

    pub async fn search_messages(
        &self,
        actor: &Actor,
        query: &str,
    ) -> Result<Vec<MessageView>, ApplicationError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(DomainError::invalid_argument("q", "cannot be empty").into());
        }
        if query.chars().count() > MAX_QUERY_CHARS {
            return Err(DomainError::invalid_argument("q", "too long").into());
        }
        let hits = self
            .deps
            .message_repository
            .search(actor.user_id, query, self.deps.settings.search_limit)
            .await?;
        Ok(hits.iter().map(MessageView::from).collect())
    }

    pub async fn update_settings(
        &self,
        actor: &Actor,
        conversation_id: ConversationId,
        settings: ParticipantSettings,
    ) -> Result<Conversation, ApplicationError> {
        if settings.is_empty() {
            return Err(DomainError::invalid_argument("settings", "nothing to update").into());
        }
        let conversation = self.load_conversation(conversation_id).await?;
        conversation.require_participant(actor.user_id)?;

        let now = self.deps.clock.now();
        let updated = self
            .deps
            .conversation_repository
            .update_settings(conversation_id, actor.user_id, &settings, now)
            .await?
            .ok_or(DomainError::NotParticipant)?;

        self.publish_conversation_updated(&updated).await;
        Ok(updated.view_for(actor.user_id))
    }

    /// 软删除会话，仅 owner 或管理员
    pub async fn delete_conversation(
        &self,
        actor: &Actor,
        conversation_id: ConversationId,
    ) -> Result<Conversation, ApplicationError> {
        let conversation = self.load_conversation(conversation_id).await?;
        if conversation.is_deleted() {
            return Ok(redact_for(conversation, actor));
        }
        let is_owner = conversation
            .participant(actor.user_id)
            .is_some_and(|p| p.role == ParticipantRole::Owner);
        if !is_owner && !actor.role.is_admin() {
            return Err(DomainError::InsufficientPermissions.into());
        }

        let now = self.deps.clock.now();
        let deleted = self
            .deps
            .conversation_repository
            .set_status(conversation_id, ConversationStatus::Deleted, now)
            .await?
            .ok_or(DomainError::ConversationNotFound)?;

        tracing::info!(conversation_id = %conversation_id, user_id = %actor.user_id, "会话已删除");
        self.publish_conversation_updated(&deleted).await;
        Ok(redact_for(deleted, actor))
    }

    pub async fn unread_summary(&self, actor: &Actor) -> Result<UnreadSummary, ApplicationError> {
        Ok(self
            .deps
            .conversation_repository
            .unread_summary(actor.user_id)
            .await?)
    }

    pub async fn admin_list_conversations(
        &self,
        actor: &Actor,
        request: AdminListRequest,
    ) -> Result<OffsetPage<AdminConversationRow>, ApplicationError> {
        if !actor.role.is_admin() {
            return Err(ApplicationError::Authorization);
        }
        let limit = self.page_limit(request.limit);
        let (conversations, total) = self
            .deps
            .conversation_repository
            .admin_list(&request.filter, request.offset, limit)
            .await?;
        Ok(OffsetPage {
            items: conversations
                .into_iter()
                .map(|conversation| AdminConversationRow {
                    total_unread: conversation.total_unread(),
                    conversation,
                })
                .collect(),
            total,
            offset: request.offset,
            limit,
        })
    }
}

/// 参与者只看到自己的个人设置；不在会话中的管理员看到完整记录
fn redact_for(conversation: Conversation, actor: &Actor) -> Conversation {
    if conversation.is_participant(actor.user_id) {
        conversation.view_for(actor.user_id)
    } else {
        conversation
    }
}
