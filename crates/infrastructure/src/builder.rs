use std::sync::Arc;

use application::{
    MemoryRateLimitStore, MemoryStore, MemoryUserDirectory, RateLimitStore, UserDirectory,
};
use config::AppConfig;
use domain::{ConversationRepository, MessageRepository};
use thiserror::Error;

use crate::{
    migrations::MIGRATOR,
    rate_limit::RedisRateLimitStore,
    repository::{create_pg_pool, PgStorage},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// 按配置选出的存储适配器
#[derive(Clone)]
pub struct Infrastructure {
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub users: Arc<dyn UserDirectory>,
    pub rate_limit_store: Arc<dyn RateLimitStore>,
}

impl Infrastructure {
    /// 配置了数据库时使用 Postgres，否则使用内存仓储；Redis 同理
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let storage = match &config.database {
            Some(database) => {
                let pool = create_pg_pool(&database.url, database.max_connections).await?;
                if database.run_migrations {
                    MIGRATOR.run(&pool).await?;
                    tracing::info!("数据库迁移完成");
                }
                tracing::info!(max_connections = database.max_connections, "使用 Postgres 存储");
                Some(PgStorage::new(pool))
            }
            None => {
                tracing::warn!("未配置数据库，使用内存存储，重启后数据丢失");
                None
            }
        };

        let mut infrastructure = match storage {
            Some(storage) => Self {
                conversations: storage.conversation_repository,
                messages: storage.message_repository,
                users: storage.user_directory,
                rate_limit_store: Arc::new(MemoryRateLimitStore::new()),
            },
            None => Self::in_memory(),
        };

        match &config.redis {
            Some(redis) => {
                infrastructure.rate_limit_store =
                    Arc::new(RedisRateLimitStore::connect(&redis.url).await?);
            }
            None => tracing::info!("未配置 Redis，限流计数保存在进程内"),
        }

        Ok(infrastructure)
    }

    /// 纯内存装配，测试和本地开发使用
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            conversations: store.clone(),
            messages: store,
            users: Arc::new(MemoryUserDirectory::new()),
            rate_limit_store: Arc::new(MemoryRateLimitStore::new()),
        }
    }
}
