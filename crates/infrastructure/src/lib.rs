//! 基础设施层实现。
//!
//! 提供 Postgres 仓储、Redis 限流计数和装配入口，实现应用/领域层定义的接口。

pub mod builder;
pub mod migrations;
pub mod rate_limit;
pub mod repository;

pub use builder::{Infrastructure, InfrastructureError};
pub use migrations::MIGRATOR;
pub use rate_limit::RedisRateLimitStore;
pub use repository::{
    create_pg_pool, PgConversationRepository, PgMessageRepository, PgStorage, PgUserDirectory,
};
