//! 应用层实现。
//!
//! 围绕领域模型的用例服务：会话与消息、滥用防护、实时扇出，
//! 以及对外部协作方（用户目录、订阅等级、事件推送）的抽象。

pub mod abuse;
pub mod broadcaster;
pub mod clock;
pub mod directory;
pub mod error;
pub mod fanout;
pub mod memory;
pub mod retry;
pub mod sanitize;
pub mod services;

pub use abuse::{
    DailyRateLimiter, MemoryRateLimitStore, RateLimitDecision, RateLimitStore, SpamScorer,
    SubscriptionTier, TierLimits,
};
pub use broadcaster::{BroadcastError, EventBroadcaster};
pub use clock::{Clock, ManualClock, SystemClock};
pub use directory::{
    MemoryUserDirectory, StaticSubscriptionDirectory, SubscriptionDirectory, UserDirectory,
};
pub use error::ApplicationError;
pub use fanout::{ConnectionHandle, ConnectionHub, ConnectionState, FanoutError};
pub use memory::MemoryStore;
pub use services::{
    Actor, AdminListRequest, AggregateReconciler, ConversationService,
    ConversationServiceDependencies, CreateConversationRequest, CreateConversationResult,
    EditMessageRequest, ListConversationsRequest, ListMessagesRequest, SendMessageRequest,
    ServiceSettings,
};
