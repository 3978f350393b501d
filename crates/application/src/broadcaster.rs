use async_trait::async_trait;
use domain::{ServerEvent, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast failed: {0}")]
    Failed(String),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
}

impl BroadcastError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// 实时事件出口。实现必须是即发即忘的，不能等待接收方的套接字。
#[async_trait]
pub trait EventBroadcaster: Send + Sync {
    /// 按事件自身的投递范围分发
    async fn broadcast(&self, event: ServerEvent) -> Result<(), BroadcastError>;

    /// 只投递给某个用户的全部连接
    async fn send_to_user(&self, user_id: UserId, event: ServerEvent)
        -> Result<(), BroadcastError>;
}
