//! 外部协作方的端口：用户目录与订阅等级

use std::collections::HashMap;

use async_trait::async_trait;
use domain::{RepositoryResult, UserId, UserProfile};
use tokio::sync::RwLock;

use crate::abuse::SubscriptionTier;

/// 用户目录，解析参与者是否存在以及显示名快照
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// 返回找到的用户，缺失的 id 不在结果中
    async fn find_profiles(&self, ids: &[UserId]) -> RepositoryResult<Vec<UserProfile>>;

    /// 身份服务校验过的用户资料同步到本地目录
    async fn upsert(&self, profile: &UserProfile) -> RepositoryResult<()>;
}

#[async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    async fn tier_for(&self, user_id: UserId) -> SubscriptionTier;
}

/// 基于配置的静态订阅表
pub struct StaticSubscriptionDirectory {
    default_tier: SubscriptionTier,
    overrides: HashMap<UserId, SubscriptionTier>,
}

impl StaticSubscriptionDirectory {
    pub fn new(default_tier: SubscriptionTier) -> Self {
        Self {
            default_tier,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, user_id: UserId, tier: SubscriptionTier) -> Self {
        self.overrides.insert(user_id, tier);
        self
    }

    pub fn from_config(config: &config::SubscriptionConfig) -> Self {
        let default_tier = SubscriptionTier::parse(&config.default_tier).unwrap_or_default();
        let overrides = config
            .overrides
            .iter()
            .filter_map(|(user, tier)| {
                let parsed = user
                    .parse::<UserId>()
                    .ok()
                    .zip(SubscriptionTier::parse(tier));
                if parsed.is_none() {
                    tracing::warn!(user = %user, tier = %tier, "忽略无效的订阅配置项");
                }
                parsed
            })
            .collect();
        Self {
            default_tier,
            overrides,
        }
    }
}

#[async_trait]
impl SubscriptionDirectory for StaticSubscriptionDirectory {
    async fn tier_for(&self, user_id: UserId) -> SubscriptionTier {
        self.overrides
            .get(&user_id)
            .copied()
            .unwrap_or(self.default_tier)
    }
}

/// 进程内用户目录
#[derive(Default)]
pub struct MemoryUserDirectory {
    users: RwLock<HashMap<UserId, UserProfile>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: UserId, display_name: Option<&str>) {
        self.users.write().await.insert(
            id,
            UserProfile {
                id,
                display_name: display_name.map(str::to_owned),
            },
        );
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_profiles(&self, ids: &[UserId]) -> RepositoryResult<Vec<UserProfile>> {
        let users = self.users.read().await;
        Ok(ids.iter().filter_map(|id| users.get(id).cloned()).collect())
    }

    async fn upsert(&self, profile: &UserProfile) -> RepositoryResult<()> {
        let mut users = self.users.write().await;
        // 新资料没有显示名时保留已有的
        if profile.display_name.is_some() || !users.contains_key(&profile.id) {
            users.insert(profile.id, profile.clone());
        }
        Ok(())
    }
}
