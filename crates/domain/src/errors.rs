//! 领域模型错误定义
//!
//! 定义了会话、消息相关的业务错误，以及仓储层统一的错误类型。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// 参数校验失败
    #[error("invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("conversation not found")]
    ConversationNotFound,

    #[error("message not found")]
    MessageNotFound,

    #[error("user not found: {user_id}")]
    UserNotFound { user_id: String },

    /// 请求者不是会话参与者
    #[error("user is not a participant of the conversation")]
    NotParticipant,

    /// 只有发送者本人可以执行该操作
    #[error("only the sender may perform this action")]
    NotMessageSender,

    #[error("insufficient permissions")]
    InsufficientPermissions,

    /// 超过 15 分钟编辑窗口
    #[error("edit window has expired")]
    EditWindowExpired,

    #[error("message has been deleted")]
    MessageDeleted,

    #[error("conversation has been deleted")]
    ConversationDeleted,

    /// 乐观并发检查失败
    #[error("concurrent modification detected")]
    ConcurrentModification,
}

impl DomainError {
    /// 创建参数错误
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn user_not_found(user_id: impl ToString) -> Self {
        Self::UserNotFound {
            user_id: user_id.to_string(),
        }
    }
}

impl DomainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::InvalidArgument { .. } => ErrorKind::Validation,
            DomainError::ConversationNotFound
            | DomainError::MessageNotFound
            | DomainError::UserNotFound { .. }
            | DomainError::ConversationDeleted => ErrorKind::NotFound,
            DomainError::NotParticipant
            | DomainError::NotMessageSender
            | DomainError::InsufficientPermissions => ErrorKind::Authorization,
            DomainError::EditWindowExpired => ErrorKind::Forbidden,
            DomainError::MessageDeleted | DomainError::ConcurrentModification => {
                ErrorKind::Conflict
            }
        }
    }
}

/// 对外暴露的错误分类，HTTP 响应和 WebSocket 错误帧共用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authorization,
    Forbidden,
    NotFound,
    RateLimited,
    Conflict,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;

/// 仓储层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,

    #[error("record conflict")]
    Conflict,

    #[error("storage error: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

impl RepositoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepositoryError::NotFound => ErrorKind::NotFound,
            RepositoryError::Conflict => ErrorKind::Conflict,
            RepositoryError::Storage { .. } => ErrorKind::Internal,
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;
