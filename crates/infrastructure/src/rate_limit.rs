//! Redis 每日发送计数
//!
//! 键为 `chat:rate:{user}:{yyyy-mm-dd}`，自增与设置过期时间在同一个 MULTI 中完成，
//! 多个服务实例共享同一份计数。

use application::RateLimitStore;
use async_trait::async_trait;
use chrono::NaiveDate;
use domain::{RepositoryError, RepositoryResult, Timestamp, UserId};
use redis::{aio::ConnectionManager, AsyncCommands};

const KEY_PREFIX: &str = "chat:rate";

fn map_redis_err(err: redis::RedisError) -> RepositoryError {
    tracing::error!(error = %err, "Redis 操作失败");
    RepositoryError::storage(format!("redis: {err}"))
}

#[derive(Clone)]
pub struct RedisRateLimitStore {
    connection: ConnectionManager,
}

impl RedisRateLimitStore {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        tracing::info!("Redis 限流计数已连接");
        Ok(Self { connection })
    }

    fn key(user_id: UserId, day: NaiveDate) -> String {
        format!("{KEY_PREFIX}:{user_id}:{}", day.format("%Y-%m-%d"))
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn increment(
        &self,
        user_id: UserId,
        day: NaiveDate,
        expires_at: Timestamp,
    ) -> RepositoryResult<u32> {
        let key = Self::key(user_id, day);
        let mut conn = self.connection.clone();
        let (count,): (u32,) = redis::pipe()
            .atomic()
            .incr(&key, 1u32)
            .expire_at(&key, expires_at.timestamp())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(count)
    }

    async fn current(&self, user_id: UserId, day: NaiveDate) -> RepositoryResult<u32> {
        let mut conn = self.connection.clone();
        let count: Option<u32> = conn
            .get(Self::key(user_id, day))
            .await
            .map_err(map_redis_err)?;
        Ok(count.unwrap_or(0))
    }
}
