//! 统一配置中心
//!
//! 配置来源按优先级从低到高：
//! - 内置默认值
//! - 工作目录下可选的 `chat.toml` / `chat.yaml`
//! - `CHAT_` 前缀的环境变量，嵌套字段用 `__` 分隔（如 `CHAT_DATABASE__URL`）

use std::collections::HashMap;

use figment::providers::{Env, Format, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// 支持的订阅等级
pub const KNOWN_TIERS: [&str; 3] = ["free", "premium", "pro"];

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,
    /// 未配置时使用内存存储
    #[serde(default)]
    #[validate(nested)]
    pub database: Option<DatabaseConfig>,
    /// 未配置时限流计数保存在进程内
    #[serde(default)]
    #[validate(nested)]
    pub redis: Option<RedisConfig>,
    #[validate(nested)]
    pub jwt: JwtConfig,
    #[serde(default)]
    #[validate(nested)]
    pub limits: LimitsConfig,
    #[serde(default)]
    #[validate(nested)]
    pub abuse: AbuseConfig,
    #[serde(default)]
    #[validate(nested)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DatabaseConfig {
    #[validate(url)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    #[validate(range(min = 1, max = 200))]
    pub max_connections: u32,
    /// 启动时执行内置迁移
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RedisConfig {
    #[validate(url)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JwtConfig {
    /// HS256 共享密钥，至少 32 字节
    #[validate(length(min = 32))]
    pub secret: String,
}

/// 每日发送上限与分页参数
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LimitsConfig {
    #[validate(range(min = 1))]
    pub free_daily: u32,
    #[validate(range(min = 1))]
    pub premium_daily: u32,
    /// `None` 表示不限
    pub pro_daily: Option<u32>,
    #[validate(range(min = 1, max = 100))]
    pub default_page_size: u32,
    #[validate(range(min = 1, max = 100))]
    pub max_page_size: u32,
    #[validate(range(min = 1, max = 200))]
    pub search_limit: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            free_daily: 50,
            premium_daily: 200,
            pro_daily: None,
            default_page_size: 30,
            max_page_size: 100,
            search_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AbuseConfig {
    /// 评分不低于该值即标记为垃圾消息
    #[validate(range(min = 1, max = 100))]
    pub spam_threshold: u8,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self { spam_threshold: 70 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RealtimeConfig {
    #[validate(range(min = 100))]
    pub typing_ttl_ms: u64,
    #[validate(range(min = 50))]
    pub typing_sweep_interval_ms: u64,
    #[validate(range(min = 1))]
    pub reconcile_interval_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            typing_ttl_ms: 3_000,
            typing_sweep_interval_ms: 500,
            reconcile_interval_secs: 30,
        }
    }
}

/// 静态订阅等级表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub default_tier: String,
    /// 用户 id → 等级
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            default_tier: "free".into(),
            overrides: HashMap::new(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8080,
            },
            database: None,
            redis: None,
            jwt: JwtConfig {
                secret: String::new(),
            },
            limits: LimitsConfig::default(),
            abuse: AbuseConfig::default(),
            realtime: RealtimeConfig::default(),
            subscriptions: SubscriptionConfig::default(),
        }
    }
}

impl AppConfig {
    /// 默认值 ← 配置文件 ← 环境变量
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file("chat.toml"))
            .merge(Yaml::file("chat.yaml"))
            .merge(Env::prefixed("CHAT_").split("__"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment.extract().map_err(Box::new)?;
        config.validate_all()?;
        Ok(config)
    }

    /// 字段级校验之外的跨字段检查
    pub fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.limits.max_page_size < self.limits.default_page_size {
            return Err(ConfigError::Invalid(
                "limits.max_page_size must not be smaller than limits.default_page_size".into(),
            ));
        }
        if self.limits.premium_daily < self.limits.free_daily {
            return Err(ConfigError::Invalid(
                "limits.premium_daily must not be smaller than limits.free_daily".into(),
            ));
        }
        if self.realtime.typing_sweep_interval_ms > self.realtime.typing_ttl_ms {
            return Err(ConfigError::Invalid(
                "realtime.typing_sweep_interval_ms must not exceed realtime.typing_ttl_ms".into(),
            ));
        }

        let subscriptions = &self.subscriptions;
        for tier in std::iter::once(&subscriptions.default_tier).chain(subscriptions.overrides.values()) {
            if !KNOWN_TIERS.contains(&tier.as_str()) {
                return Err(ConfigError::Invalid(format!("unknown subscription tier: {tier}")));
            }
        }
        Ok(())
    }

    /// 日志里使用的脱敏描述
    pub fn sanitize(&self) -> String {
        format!(
            "server={}:{} storage={} rate_counter={} spam_threshold={} limits(free={}, premium={}, pro={:?})",
            self.server.host,
            self.server.port,
            if self.database.is_some() { "postgres" } else { "memory" },
            if self.redis.is_some() { "redis" } else { "memory" },
            self.abuse.spam_threshold,
            self.limits.free_daily,
            self.limits.premium_daily,
            self.limits.pro_daily,
        )
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Extract(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "unit-test-secret-with-at-least-32-characters";

    fn base() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Serialized::default("jwt.secret", SECRET))
    }

    #[test]
    fn defaults_use_memory_storage() {
        let config = AppConfig::from_figment(base()).unwrap();
        assert!(config.database.is_none());
        assert!(config.redis.is_none());
        assert_eq!(config.limits.free_daily, 50);
        assert_eq!(config.limits.premium_daily, 200);
        assert_eq!(config.limits.pro_daily, None);
        assert_eq!(config.abuse.spam_threshold, 70);
        assert_eq!(config.realtime.typing_ttl_ms, 3_000);
    }

    #[test]
    fn short_jwt_secret_is_rejected() {
        let figment = base().merge(Serialized::default("jwt.secret", "short"));
        assert!(matches!(
            AppConfig::from_figment(figment),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn toml_overrides_defaults() {
        let figment = base().merge(Toml::string(
            r#"
            [database]
            url = "postgres://chat:chat@db:5432/chat"

            [limits]
            free_daily = 20
            premium_daily = 100
            default_page_size = 25
            max_page_size = 50
            search_limit = 20

            [subscriptions]
            default_tier = "free"
            overrides = { "7d0c5c5e-8f43-4a53-9d1c-000000000001" = "pro" }
            "#,
        ));
        let config = AppConfig::from_figment(figment).unwrap();
        let database = config.database.unwrap();
        assert_eq!(database.max_connections, 10);
        assert!(database.run_migrations);
        assert_eq!(config.limits.free_daily, 20);
        assert_eq!(config.subscriptions.overrides.len(), 1);
    }

    #[test]
    fn unknown_tier_is_rejected() {
        let figment = base().merge(Serialized::default("subscriptions.default_tier", "gold"));
        assert!(matches!(
            AppConfig::from_figment(figment),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn page_size_bounds_are_cross_checked() {
        let figment = base()
            .merge(Serialized::default("limits.default_page_size", 80))
            .merge(Serialized::default("limits.max_page_size", 40));
        assert!(AppConfig::from_figment(figment).is_err());
    }
}
