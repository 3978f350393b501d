//! 按订阅等级的每日发送限流
//!
//! 计数键为 `(用户, UTC 日期)`，跨日自动换键。先原子自增再比较，
//! 并发请求最多只会比上限多计一次，但不会多放行。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use domain::{RepositoryResult, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Premium,
    Pro,
}

impl SubscriptionTier {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Some(SubscriptionTier::Free),
            "premium" => Some(SubscriptionTier::Premium),
            "pro" => Some(SubscriptionTier::Pro),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Premium => "premium",
            SubscriptionTier::Pro => "pro",
        }
    }
}

/// 各等级的每日上限，`None` 表示不限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub free: Option<u32>,
    pub premium: Option<u32>,
    pub pro: Option<u32>,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            free: Some(50),
            premium: Some(200),
            pro: None,
        }
    }
}

impl TierLimits {
    pub fn from_config(limits: &config::LimitsConfig) -> Self {
        Self {
            free: Some(limits.free_daily),
            premium: Some(limits.premium_daily),
            pro: limits.pro_daily,
        }
    }

    pub fn ceiling(&self, tier: SubscriptionTier) -> Option<u32> {
        match tier {
            SubscriptionTier::Free => self.free,
            SubscriptionTier::Premium => self.premium,
            SubscriptionTier::Pro => self.pro,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// 不限量时为空
    pub remaining: Option<u32>,
    pub reset_at: Timestamp,
}

/// 计数存储，`increment` 必须是单次原子操作并返回自增后的值
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn increment(
        &self,
        user_id: UserId,
        day: NaiveDate,
        expires_at: Timestamp,
    ) -> RepositoryResult<u32>;

    async fn current(&self, user_id: UserId, day: NaiveDate) -> RepositoryResult<u32>;
}

#[derive(Default)]
struct DayCounters {
    latest: Option<NaiveDate>,
    days: HashMap<NaiveDate, HashMap<UserId, u32>>,
}

/// 进程内计数，单节点部署或测试使用；只保留最近一天的计数
#[derive(Default)]
pub struct MemoryRateLimitStore {
    counters: Mutex<DayCounters>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn increment(
        &self,
        user_id: UserId,
        day: NaiveDate,
        _expires_at: Timestamp,
    ) -> RepositoryResult<u32> {
        let mut counters = self.counters.lock().await;
        // 进入新的一天时按日期整体丢弃过期计数
        if counters.latest.map_or(true, |latest| day > latest) {
            counters.latest = Some(day);
            counters.days.retain(|counter_day, _| *counter_day >= day);
        }
        let count = counters
            .days
            .entry(day)
            .or_default()
            .entry(user_id)
            .or_insert(0);
        *count = count.saturating_add(1);
        Ok(*count)
    }

    async fn current(&self, user_id: UserId, day: NaiveDate) -> RepositoryResult<u32> {
        let counters = self.counters.lock().await;
        Ok(counters
            .days
            .get(&day)
            .and_then(|users| users.get(&user_id))
            .copied()
            .unwrap_or(0))
    }
}

pub struct DailyRateLimiter {
    store: Arc<dyn RateLimitStore>,
    limits: TierLimits,
}

impl DailyRateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, limits: TierLimits) -> Self {
        Self { store, limits }
    }

    /// 下一个 UTC 零点
    pub fn reset_at(now: Timestamp) -> Timestamp {
        let tomorrow = now
            .date_naive()
            .checked_add_days(Days::new(1))
            .unwrap_or(NaiveDate::MAX);
        tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
    }

    /// 计入一次发送并判断是否放行
    pub async fn check(
        &self,
        user_id: UserId,
        tier: SubscriptionTier,
        now: Timestamp,
    ) -> RepositoryResult<RateLimitDecision> {
        let reset_at = Self::reset_at(now);
        let Some(ceiling) = self.limits.ceiling(tier) else {
            return Ok(RateLimitDecision {
                allowed: true,
                remaining: None,
                reset_at,
            });
        };

        let count = self
            .store
            .increment(user_id, now.date_naive(), reset_at)
            .await?;
        let allowed = count <= ceiling;
        if !allowed {
            tracing::info!(%user_id, tier = tier.as_str(), count, ceiling, "发送次数超过每日上限");
        }
        Ok(RateLimitDecision {
            allowed,
            remaining: Some(ceiling.saturating_sub(count)),
            reset_at,
        })
    }

    /// 只读查询剩余额度
    pub async fn peek(
        &self,
        user_id: UserId,
        tier: SubscriptionTier,
        now: Timestamp,
    ) -> RepositoryResult<RateLimitDecision> {
        let reset_at = Self::reset_at(now);
        let Some(ceiling) = self.limits.ceiling(tier) else {
            return Ok(RateLimitDecision {
                allowed: true,
                remaining: None,
                reset_at,
            });
        };
        let count = self.store.current(user_id, now.date_naive()).await?;
        Ok(RateLimitDecision {
            allowed: count < ceiling,
            remaining: Some(ceiling.saturating_sub(count)),
            reset_at,
        })
    }
}
