use std::sync::Arc;

use application::{
    Clock, ConnectionHub, ConversationService, ConversationServiceDependencies, DailyRateLimiter,
    ServiceSettings, SpamScorer, StaticSubscriptionDirectory, TierLimits, UserDirectory,
};
use config::AppConfig;
use infrastructure::Infrastructure;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub conversation_service: Arc<ConversationService>,
    pub hub: Arc<ConnectionHub>,
    pub jwt: Arc<JwtService>,
    pub users: Arc<dyn UserDirectory>,
}

impl AppState {
    pub fn new(
        conversation_service: Arc<ConversationService>,
        hub: Arc<ConnectionHub>,
        jwt: Arc<JwtService>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            conversation_service,
            hub,
            jwt,
            users,
        }
    }

    /// 按配置装配服务与推送中心，推送中心同时作为服务的事件出口
    pub fn build(config: &AppConfig, infrastructure: Infrastructure, clock: Arc<dyn Clock>) -> Self {
        let typing_ttl =
            chrono::Duration::milliseconds(i64::try_from(config.realtime.typing_ttl_ms).unwrap_or(3_000));
        let hub = Arc::new(ConnectionHub::new(
            infrastructure.conversations.clone(),
            clock.clone(),
            typing_ttl,
        ));

        let conversation_service = ConversationService::new(ConversationServiceDependencies {
            conversation_repository: infrastructure.conversations,
            message_repository: infrastructure.messages,
            user_directory: infrastructure.users.clone(),
            subscriptions: Arc::new(StaticSubscriptionDirectory::from_config(
                &config.subscriptions,
            )),
            rate_limiter: Arc::new(DailyRateLimiter::new(
                infrastructure.rate_limit_store,
                TierLimits::from_config(&config.limits),
            )),
            spam_scorer: Arc::new(SpamScorer::new()),
            broadcaster: hub.clone(),
            clock,
            settings: ServiceSettings::from_config(config),
        });

        Self::new(
            Arc::new(conversation_service),
            hub,
            Arc::new(JwtService::new(&config.jwt)),
            infrastructure.users,
        )
    }
}
