//! 写路径上的同步防滥用：垃圾评分与每日限流

pub mod rate_limit;
pub mod spam;

pub use rate_limit::{
    DailyRateLimiter, MemoryRateLimitStore, RateLimitDecision, RateLimitStore, SubscriptionTier,
    TierLimits,
};
pub use spam::{SpamScorer, DEFAULT_SPAM_THRESHOLD};
