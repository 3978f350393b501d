//! 后台修复：重算被标记为不一致的会话聚合字段

use std::sync::Arc;
use std::time::Duration;

use domain::{ConversationRepository, RepositoryResult};
use tokio::task::JoinHandle;

const BATCH_SIZE: u32 = 100;

pub struct AggregateReconciler {
    conversations: Arc<dyn ConversationRepository>,
}

impl AggregateReconciler {
    pub fn new(conversations: Arc<dyn ConversationRepository>) -> Self {
        Self { conversations }
    }

    /// 处理一批待修复会话，返回成功修复的数量
    pub async fn run_once(&self) -> RepositoryResult<usize> {
        let pending = self.conversations.list_inconsistent(BATCH_SIZE).await?;
        let mut repaired = 0;
        for conversation_id in pending {
            match self.conversations.reconcile(conversation_id).await {
                Ok(()) => {
                    repaired += 1;
                    tracing::info!(conversation_id = %conversation_id, "会话聚合已修复");
                }
                Err(err) => {
                    tracing::warn!(conversation_id = %conversation_id, error = %err, "会话聚合修复失败");
                }
            }
        }
        Ok(repaired)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.run_once().await {
                    tracing::error!(error = %err, "读取待修复会话失败");
                }
            }
        })
    }
}
