//! 客户端通过 WebSocket 发送的命令

use serde::{Deserialize, Serialize};

use crate::value_objects::ConversationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientCommand {
    /// 加入会话广播组，需要当前是参与者
    Join { conversation_id: ConversationId },
    Leave { conversation_id: ConversationId },
    TypingStart { conversation_id: ConversationId },
    TypingStop { conversation_id: ConversationId },
    Ping,
}

impl ClientCommand {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            ClientCommand::Join { conversation_id }
            | ClientCommand::Leave { conversation_id }
            | ClientCommand::TypingStart { conversation_id }
            | ClientCommand::TypingStop { conversation_id } => Some(*conversation_id),
            ClientCommand::Ping => None,
        }
    }
}
