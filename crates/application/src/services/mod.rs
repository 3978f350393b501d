mod conversation_service;
mod reconciler;

#[cfg(test)]
mod conversation_service_tests;

pub use conversation_service::{
    Actor, AdminListRequest, ConversationService, ConversationServiceDependencies,
    CreateConversationRequest, CreateConversationResult, EditMessageRequest,
    ListConversationsRequest, ListMessagesRequest, SendMessageRequest, ServiceSettings,
};
pub use reconciler::AggregateReconciler;
