//! 服务端推送事件
//!
//! 每个事件按 `kind` 打标签，外层信封带协议版本号，收发两端在分发前都会校验。

use serde::{Deserialize, Serialize};

use crate::conversation::Conversation;
use crate::errors::DomainError;
use crate::message::{validate_emoji, Reaction};
use crate::value_objects::{ConversationId, MessageId, Timestamp, UserId};
use crate::views::MessageView;

/// 当前事件协议版本
pub const PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ServerEvent {
    Message {
        message: MessageView,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    Read {
        conversation_id: ConversationId,
        user_id: UserId,
        read_at: Timestamp,
    },
    Reaction {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
        added: bool,
        /// 切换后的完整表情集合，客户端据此覆盖本地状态
        reactions: Vec<Reaction>,
    },
    Presence {
        user_id: UserId,
        online: bool,
    },
    ConversationCreated {
        conversation: Conversation,
    },
    ConversationUpdated {
        conversation: Conversation,
    },
    MessageEdited {
        message: MessageView,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
        deleted_by: UserId,
        deleted_at: Timestamp,
    },
}

/// 事件的投递范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryScope {
    /// 只投递给显式加入了该会话广播组的连接
    Subscribers(ConversationId),
    /// 投递给会话当前所有参与者的全部连接
    Participants(ConversationId),
    /// 投递给与该用户共享活跃会话的用户
    PresenceWatchers(UserId),
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Message { .. } => "message",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::Read { .. } => "read",
            ServerEvent::Reaction { .. } => "reaction",
            ServerEvent::Presence { .. } => "presence",
            ServerEvent::ConversationCreated { .. } => "conversation-created",
            ServerEvent::ConversationUpdated { .. } => "conversation-updated",
            ServerEvent::MessageEdited { .. } => "message-edited",
            ServerEvent::MessageDeleted { .. } => "message-deleted",
        }
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            ServerEvent::Message { message } | ServerEvent::MessageEdited { message } => {
                Some(message.conversation_id)
            }
            ServerEvent::Typing {
                conversation_id, ..
            }
            | ServerEvent::Read {
                conversation_id, ..
            }
            | ServerEvent::Reaction {
                conversation_id, ..
            }
            | ServerEvent::MessageDeleted {
                conversation_id, ..
            } => Some(*conversation_id),
            ServerEvent::ConversationCreated { conversation }
            | ServerEvent::ConversationUpdated { conversation } => Some(conversation.id),
            ServerEvent::Presence { .. } => None,
        }
    }

    pub fn scope(&self) -> DeliveryScope {
        match self {
            ServerEvent::Typing {
                conversation_id, ..
            } => DeliveryScope::Subscribers(*conversation_id),
            ServerEvent::Presence { user_id, .. } => DeliveryScope::PresenceWatchers(*user_id),
            ServerEvent::Message { message } | ServerEvent::MessageEdited { message } => {
                DeliveryScope::Participants(message.conversation_id)
            }
            ServerEvent::Read {
                conversation_id, ..
            }
            | ServerEvent::Reaction {
                conversation_id, ..
            }
            | ServerEvent::MessageDeleted {
                conversation_id, ..
            } => DeliveryScope::Participants(*conversation_id),
            ServerEvent::ConversationCreated { conversation }
            | ServerEvent::ConversationUpdated { conversation } => {
                DeliveryScope::Participants(conversation.id)
            }
        }
    }

    /// 分发前的结构校验
    pub fn validate(&self) -> Result<(), DomainError> {
        match self {
            ServerEvent::Reaction {
                emoji, reactions, ..
            } => {
                validate_emoji(emoji)?;
                reactions
                    .iter()
                    .try_for_each(|reaction| validate_emoji(&reaction.emoji))
            }
            ServerEvent::ConversationCreated { conversation }
            | ServerEvent::ConversationUpdated { conversation } => {
                if conversation.participants.is_empty() {
                    Err(DomainError::invalid_argument(
                        "conversation.participants",
                        "cannot be empty",
                    ))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

/// 带版本的事件信封
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u16,
    pub event: ServerEvent,
}

impl EventEnvelope {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            event,
        }
    }

    /// 校验版本号和事件内容，通过后才允许分发
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.v != PROTOCOL_VERSION {
            return Err(DomainError::invalid_argument(
                "v",
                format!("unsupported protocol version {}", self.v),
            ));
        }
        self.event.validate()
    }
}

/// WebSocket 上服务端发出的帧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Event(EventEnvelope),
    Pong,
    Error { kind: String, message: String },
}

impl ServerFrame {
    pub fn event(event: ServerEvent) -> Self {
        ServerFrame::Event(EventEnvelope::new(event))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
