//! 会话服务单元测试
//!
//! 使用内存仓储和手动时钟，覆盖发送、限流、编辑窗口、删除撤回和分页等用例。

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use domain::{
    initial_participants, Conversation, ConversationFilter, ConversationId,
    ConversationRepository, ConversationType, ErrorKind, Message, MessageId, MessageRepository,
    MessageView, MockConversationRepository, MockMessageRepository, NewMessage,
    ParticipantSettings, RepositoryError, SenderHistory, ServerEvent, UserId, UserRole,
    DELETED_PLACEHOLDER,
};

use crate::abuse::{DailyRateLimiter, MemoryRateLimitStore, SpamScorer, SubscriptionTier, TierLimits};
use crate::broadcaster::recording::RecordingBroadcaster;
use crate::clock::{Clock, ManualClock};
use crate::directory::{MemoryUserDirectory, StaticSubscriptionDirectory};
use crate::error::ApplicationError;
use crate::memory::MemoryStore;
use crate::services::*;

const SPAM: &str = "CLICK HERE for FREE MONEY, BUY NOW!!! https://spam.example.com/x https://spam.example.com/y https://spam.example.com/z";

struct Harness {
    service: ConversationService,
    store: Arc<MemoryStore>,
    events: Arc<RecordingBroadcaster>,
    clock: Arc<ManualClock>,
    buyer: Actor,
    seller: Actor,
}

impl Harness {
    async fn new() -> Self {
        Self::with_buyer_tier(SubscriptionTier::Free).await
    }

    async fn with_buyer_tier(tier: SubscriptionTier) -> Self {
        let store = Arc::new(MemoryStore::new());
        let users = Arc::new(MemoryUserDirectory::new());
        let events = Arc::new(RecordingBroadcaster::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap(),
        ));

        let buyer = Actor {
            user_id: UserId::generate(),
            role: UserRole::User,
            display_name: Some("Buyer Ltd".to_string()),
        };
        let seller = Actor {
            user_id: UserId::generate(),
            role: UserRole::User,
            display_name: Some("Seller GmbH".to_string()),
        };
        users.insert(buyer.user_id, buyer.display_name.as_deref()).await;
        users.insert(seller.user_id, seller.display_name.as_deref()).await;
        let subscriptions = StaticSubscriptionDirectory::new(SubscriptionTier::Free)
            .with_override(buyer.user_id, tier);

        let service = ConversationService::new(ConversationServiceDependencies {
            conversation_repository: store.clone(),
            message_repository: store.clone(),
            user_directory: users,
            subscriptions: Arc::new(subscriptions),
            rate_limiter: Arc::new(DailyRateLimiter::new(
                Arc::new(MemoryRateLimitStore::new()),
                TierLimits::default(),
            )),
            spam_scorer: Arc::new(SpamScorer::new()),
            broadcaster: events.clone(),
            clock: clock.clone(),
            settings: ServiceSettings::default(),
        });

        Self {
            service,
            store,
            events,
            clock,
            buyer,
            seller,
        }
    }

    async fn direct(&self) -> Conversation {
        self.service
            .create_conversation(
                &self.buyer,
                CreateConversationRequest {
                    kind: ConversationType::Direct,
                    participant_ids: vec![self.seller.user_id],
                    context: None,
                },
            )
            .await
            .unwrap()
            .conversation
    }

    async fn send(
        &self,
        actor: &Actor,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<MessageView, ApplicationError> {
        self.service
            .send_message(
                actor,
                SendMessageRequest {
                    conversation_id,
                    content: content.to_string(),
                    attachments: Vec::new(),
                },
            )
            .await
    }

    async fn unread(&self, conversation_id: ConversationId, user_id: UserId) -> u32 {
        ConversationRepository::find_by_id(self.store.as_ref(), conversation_id)
            .await
            .unwrap()
            .unwrap()
            .participant(user_id)
            .unwrap()
            .unread_count
    }
}

fn moderator() -> Actor {
    Actor {
        user_id: UserId::generate(),
        role: UserRole::Moderator,
        display_name: None,
    }
}

#[tokio::test]
async fn direct_conversation_is_deduplicated_across_both_sides() {
    let h = Harness::new().await;
    let first = h.direct().await;

    let second = h
        .service
        .create_conversation(
            &h.seller,
            CreateConversationRequest {
                kind: ConversationType::Direct,
                participant_ids: vec![h.buyer.user_id],
                context: None,
            },
        )
        .await
        .unwrap();

    assert!(!second.created);
    assert_eq!(second.conversation.id, first.id);
    assert_eq!(h.events.kinds().await, vec!["conversation-created"]);
}

#[tokio::test]
async fn create_rejects_unknown_and_invalid_participants() {
    let h = Harness::new().await;

    let unknown = h
        .service
        .create_conversation(
            &h.buyer,
            CreateConversationRequest {
                kind: ConversationType::Group,
                participant_ids: vec![UserId::generate()],
                context: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(unknown.kind(), ErrorKind::NotFound);

    let empty = h
        .service
        .create_conversation(
            &h.buyer,
            CreateConversationRequest {
                kind: ConversationType::Group,
                participant_ids: Vec::new(),
                context: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(empty.kind(), ErrorKind::Validation);

    let self_included = h
        .service
        .create_conversation(
            &h.buyer,
            CreateConversationRequest {
                kind: ConversationType::Group,
                participant_ids: vec![h.seller.user_id, h.buyer.user_id],
                context: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(self_included.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn send_updates_unread_and_read_resets_it() {
    let h = Harness::new().await;
    let conversation = h.direct().await;

    let view = h
        .send(&h.buyer, conversation.id, "Is the <b>pallet</b> price negotiable?")
        .await
        .unwrap();
    assert_eq!(view.content, "Is the &lt;b&gt;pallet&lt;/b&gt; price negotiable?");
    assert_eq!(view.sender_name.as_deref(), Some("Buyer Ltd"));

    assert_eq!(h.unread(conversation.id, h.seller.user_id).await, 1);
    assert_eq!(h.unread(conversation.id, h.buyer.user_id).await, 0);

    let stored = ConversationRepository::find_by_id(h.store.as_ref(), conversation.id)
        .await
        .unwrap()
        .unwrap();
    let last = stored.last_message.unwrap();
    assert_eq!(last.sender_id, h.buyer.user_id);

    let participant = h
        .service
        .mark_read(&h.seller, conversation.id)
        .await
        .unwrap();
    assert_eq!(participant.unread_count, 0);
    assert_eq!(participant.last_read_at, Some(h.clock.now()));
    assert_eq!(
        h.events.kinds().await,
        vec!["conversation-created", "message", "read"]
    );
}

#[tokio::test]
async fn non_participant_cannot_send() {
    let h = Harness::new().await;
    let conversation = h.direct().await;
    let err = h
        .send(&Actor::user(UserId::generate()), conversation.id, "hello")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
}

#[tokio::test]
async fn empty_content_is_rejected() {
    let h = Harness::new().await;
    let conversation = h.direct().await;
    let err = h.send(&h.buyer, conversation.id, "   ").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn free_tier_is_blocked_on_fifty_first_message() {
    let h = Harness::new().await;
    let conversation = h.direct().await;

    for i in 0..50 {
        h.send(&h.buyer, conversation.id, &format!("update number {i}"))
            .await
            .unwrap();
    }
    let err = h
        .send(&h.buyer, conversation.id, "one more")
        .await
        .unwrap_err();
    match err {
        ApplicationError::RateLimited { reset_at } => {
            assert_eq!(reset_at, Utc.with_ymd_and_hms(2024, 5, 11, 0, 0, 0).unwrap());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.unread(conversation.id, h.seller.user_id).await, 50);

    // 被拒绝的消息既不落库也不推送
    let stored = h
        .service
        .list_messages(
            &h.seller,
            ListMessagesRequest {
                conversation_id: conversation.id,
                cursor: None,
                limit: Some(100),
            },
        )
        .await
        .unwrap();
    assert_eq!(stored.items.len(), 50);
    assert!(stored.items.iter().all(|m| m.content != "one more"));
    let message_events = h
        .events
        .kinds()
        .await
        .into_iter()
        .filter(|kind| *kind == "message")
        .count();
    assert_eq!(message_events, 50);
    assert!(h.events.direct.lock().await.is_empty());

    h.clock.set(Utc.with_ymd_and_hms(2024, 5, 11, 0, 0, 1).unwrap());
    h.send(&h.buyer, conversation.id, "new day").await.unwrap();
}

#[tokio::test]
async fn premium_tier_gets_a_higher_ceiling() {
    let h = Harness::with_buyer_tier(SubscriptionTier::Premium).await;
    let conversation = h.direct().await;
    for i in 0..51 {
        h.send(&h.buyer, conversation.id, &format!("line {i}"))
            .await
            .unwrap();
    }
    assert_eq!(h.unread(conversation.id, h.seller.user_id).await, 51);
}

#[tokio::test]
async fn edit_is_limited_to_sender_and_window() {
    let h = Harness::new().await;
    let conversation = h.direct().await;
    let sent = h.send(&h.buyer, conversation.id, "price is 10").await.unwrap();

    h.clock.advance(Duration::minutes(14));
    let edited = h
        .service
        .edit_message(
            &h.buyer,
            EditMessageRequest {
                message_id: sent.id,
                content: "price is 12".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(edited.is_edited);
    assert_eq!(edited.edit_count, 1);
    assert_eq!(edited.content, "price is 12");
    // 最新消息的编辑同步到会话摘要
    let summary = ConversationRepository::find_by_id(h.store.as_ref(), conversation.id)
        .await
        .unwrap()
        .unwrap()
        .last_message
        .unwrap();
    assert_eq!(summary.content_preview, "price is 12");

    let not_sender = h
        .service
        .edit_message(
            &h.seller,
            EditMessageRequest {
                message_id: sent.id,
                content: "hijack".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(not_sender.kind(), ErrorKind::Authorization);

    h.clock.advance(Duration::minutes(1));
    let expired = h
        .service
        .edit_message(
            &h.buyer,
            EditMessageRequest {
                message_id: sent.id,
                content: "too late".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(expired.kind(), ErrorKind::Forbidden);
    assert!(h.events.kinds().await.contains(&"message-edited"));
}

#[tokio::test]
async fn reaction_toggles_on_and_off() {
    let h = Harness::new().await;
    let conversation = h.direct().await;
    let sent = h.send(&h.buyer, conversation.id, "deal?").await.unwrap();

    let added = h
        .service
        .toggle_reaction(&h.seller, sent.id, "👍")
        .await
        .unwrap();
    assert!(added.added);
    assert_eq!(added.reactions.len(), 1);

    let removed = h
        .service
        .toggle_reaction(&h.seller, sent.id, "👍")
        .await
        .unwrap();
    assert!(!removed.added);
    assert!(removed.reactions.is_empty());

    let invalid = h
        .service
        .toggle_reaction(&h.seller, sent.id, "")
        .await
        .unwrap_err();
    assert_eq!(invalid.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn message_pages_walk_to_exhaustion_without_overlap() {
    let h = Harness::new().await;
    let conversation = h.direct().await;
    for i in 0..5 {
        h.send(&h.buyer, conversation.id, &format!("m{i}")).await.unwrap();
        h.clock.advance(Duration::seconds(1));
    }

    let mut seen = Vec::new();
    let mut cursor = None;
    let mut pages = 0;
    loop {
        let page = h
            .service
            .list_messages(
                &h.seller,
                ListMessagesRequest {
                    conversation_id: conversation.id,
                    cursor: cursor.take(),
                    limit: Some(2),
                },
            )
            .await
            .unwrap();
        pages += 1;
        seen.extend(page.items.into_iter().map(|m| m.content));
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    assert_eq!(pages, 3);
    assert_eq!(seen, vec!["m4", "m3", "m2", "m1", "m0"]);
}

#[tokio::test]
async fn malformed_cursor_is_a_validation_error() {
    let h = Harness::new().await;
    let conversation = h.direct().await;
    let err = h
        .service
        .list_messages(
            &h.buyer,
            ListMessagesRequest {
                conversation_id: conversation.id,
                cursor: Some("not-a-cursor".to_string()),
                limit: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn spam_is_stored_but_hidden_from_other_participants() {
    let h = Harness::new().await;
    let conversation = h.direct().await;

    let view = h.send(&h.buyer, conversation.id, SPAM).await.unwrap();
    assert!(view.is_spam);
    assert_eq!(h.unread(conversation.id, h.seller.user_id).await, 0);

    // 事件只回给发送者
    assert_eq!(h.events.kinds().await, vec!["conversation-created"]);
    let direct = h.events.direct.lock().await;
    assert_eq!(direct.len(), 1);
    assert_eq!(direct[0].0, h.buyer.user_id);
    assert!(matches!(direct[0].1, ServerEvent::Message { .. }));
    drop(direct);

    let conversation_id = conversation.id;
    let list = |actor: Actor| {
        let service = &h.service;
        async move {
            service
                .list_messages(
                    &actor,
                    ListMessagesRequest {
                        conversation_id,
                        cursor: None,
                        limit: None,
                    },
                )
                .await
                .unwrap()
                .items
                .len()
        }
    };
    assert_eq!(list(h.seller.clone()).await, 0);
    assert_eq!(list(h.buyer.clone()).await, 1);
}

#[tokio::test]
async fn delete_masks_content_and_retracts_unread() {
    let h = Harness::new().await;
    let conversation = h.direct().await;
    let sent = h.send(&h.buyer, conversation.id, "wrong invoice").await.unwrap();
    assert_eq!(h.unread(conversation.id, h.seller.user_id).await, 1);

    let denied = h
        .service
        .delete_message(&h.seller, sent.id)
        .await
        .unwrap_err();
    assert_eq!(denied.kind(), ErrorKind::Authorization);

    let deleted = h.service.delete_message(&h.buyer, sent.id).await.unwrap();
    assert!(deleted.is_deleted);
    assert_eq!(deleted.content, DELETED_PLACEHOLDER);
    assert_eq!(h.unread(conversation.id, h.seller.user_id).await, 0);

    let stored = ConversationRepository::find_by_id(h.store.as_ref(), conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        stored.last_message.unwrap().content_preview,
        DELETED_PLACEHOLDER
    );

    // 重复删除不报错，也不再推送
    let again = h.service.delete_message(&h.buyer, sent.id).await.unwrap();
    assert!(again.is_deleted);
    let deletions = h
        .events
        .kinds()
        .await
        .into_iter()
        .filter(|kind| *kind == "message-deleted")
        .count();
    assert_eq!(deletions, 1);
}

#[tokio::test]
async fn moderator_can_delete_any_message() {
    let h = Harness::new().await;
    let conversation = h.direct().await;
    let sent = h.send(&h.seller, conversation.id, "call me").await.unwrap();

    let moderator = moderator();
    let deleted = h.service.delete_message(&moderator, sent.id).await.unwrap();
    assert!(deleted.is_deleted);
    assert_eq!(deleted.deleted_by, Some(moderator.user_id));
}

#[tokio::test]
async fn deleted_message_cannot_be_edited() {
    let h = Harness::new().await;
    let conversation = h.direct().await;
    let sent = h.send(&h.buyer, conversation.id, "draft").await.unwrap();
    h.service.delete_message(&h.buyer, sent.id).await.unwrap();

    let err = h
        .service
        .edit_message(
            &h.buyer,
            EditMessageRequest {
                message_id: sent.id,
                content: "revived".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn settings_drive_conversation_filters() {
    let h = Harness::new().await;
    let conversation = h.direct().await;

    let updated = h
        .service
        .update_settings(
            &h.seller,
            conversation.id,
            ParticipantSettings {
                is_pinned: Some(true),
                ..ParticipantSettings::default()
            },
        )
        .await
        .unwrap();
    assert!(updated.participant(h.seller.user_id).unwrap().is_pinned);

    // 每个参与者收到的变更只带自己的个人设置
    {
        let direct = h.events.direct.lock().await;
        assert_eq!(direct.len(), 2);
        for (recipient, event) in direct.iter() {
            let ServerEvent::ConversationUpdated { conversation } = event else {
                panic!("unexpected event: {event:?}");
            };
            let seller_pinned = conversation
                .participant(h.seller.user_id)
                .unwrap()
                .is_pinned;
            assert_eq!(seller_pinned, *recipient == h.seller.user_id);
        }
    }
    assert!(!h
        .events
        .kinds()
        .await
        .contains(&"conversation-updated"));
    let seen_by_buyer = h
        .service
        .get_conversation(&h.buyer, conversation.id)
        .await
        .unwrap();
    assert!(!seen_by_buyer.participant(h.seller.user_id).unwrap().is_pinned);

    let pinned = |actor: Actor| {
        let service = &h.service;
        async move {
            service
                .list_conversations(
                    &actor,
                    ListConversationsRequest {
                        filter: ConversationFilter {
                            pinned: Some(true),
                            ..ConversationFilter::default()
                        },
                        ..ListConversationsRequest::default()
                    },
                )
                .await
                .unwrap()
                .items
                .len()
        }
    };
    assert_eq!(pinned(h.seller.clone()).await, 1);
    assert_eq!(pinned(h.buyer.clone()).await, 0);

    let empty = h
        .service
        .update_settings(&h.seller, conversation.id, ParticipantSettings::default())
        .await
        .unwrap_err();
    assert_eq!(empty.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn conversation_delete_requires_owner_and_blocks_sends() {
    let h = Harness::new().await;
    let conversation = h.direct().await;

    let denied = h
        .service
        .delete_conversation(&h.seller, conversation.id)
        .await
        .unwrap_err();
    assert_eq!(denied.kind(), ErrorKind::Authorization);

    let deleted = h
        .service
        .delete_conversation(&h.buyer, conversation.id)
        .await
        .unwrap();
    assert!(deleted.is_deleted());

    let err = h.send(&h.buyer, conversation.id, "still there?").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn edits_keep_summary_on_latest_and_stop_after_conversation_delete() {
    let h = Harness::new().await;
    let conversation = h.direct().await;
    let first = h.send(&h.buyer, conversation.id, "first offer").await.unwrap();
    h.clock.advance(Duration::seconds(5));
    h.send(&h.seller, conversation.id, "counter offer").await.unwrap();

    h.service
        .edit_message(
            &h.buyer,
            EditMessageRequest {
                message_id: first.id,
                content: "first offer, revised".to_string(),
            },
        )
        .await
        .unwrap();
    let summary = ConversationRepository::find_by_id(h.store.as_ref(), conversation.id)
        .await
        .unwrap()
        .unwrap()
        .last_message
        .unwrap();
    assert_eq!(summary.content_preview, "counter offer");

    h.service
        .delete_conversation(&h.buyer, conversation.id)
        .await
        .unwrap();
    let err = h
        .service
        .edit_message(
            &h.buyer,
            EditMessageRequest {
                message_id: first.id,
                content: "after delete".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn search_finds_visible_messages_only() {
    let h = Harness::new().await;
    let conversation = h.direct().await;
    h.send(&h.buyer, conversation.id, "Need 40 crates of olive oil")
        .await
        .unwrap();
    h.send(&h.buyer, conversation.id, SPAM).await.unwrap();

    let hits = h.service.search_messages(&h.seller, "olive").await.unwrap();
    assert_eq!(hits.len(), 1);
    let spam_hits = h.service.search_messages(&h.seller, "free money").await.unwrap();
    assert!(spam_hits.is_empty());

    let outsider = h
        .service
        .search_messages(&Actor::user(UserId::generate()), "olive")
        .await
        .unwrap();
    assert!(outsider.is_empty());

    let err = h.service.search_messages(&h.seller, "  ").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn search_matches_text_with_markup_characters() {
    let h = Harness::new().await;
    let conversation = h.direct().await;
    h.send(&h.buyer, conversation.id, "Smith & Sons quote: \"<5 pallets\"")
        .await
        .unwrap();

    for query in ["Smith & Sons", "<5", "\"<5 pallets\""] {
        let hits = h.service.search_messages(&h.seller, query).await.unwrap();
        assert_eq!(hits.len(), 1, "query {query:?}");
    }
    let misses = h.service.search_messages(&h.seller, "&amp;").await.unwrap();
    assert!(misses.is_empty());
}

#[tokio::test]
async fn unread_summary_and_admin_listing() {
    let h = Harness::new().await;
    let conversation = h.direct().await;
    h.send(&h.buyer, conversation.id, "one").await.unwrap();
    h.send(&h.buyer, conversation.id, "two").await.unwrap();

    let summary = h.service.unread_summary(&h.seller).await.unwrap();
    assert_eq!(summary.total_unread, 2);
    assert_eq!(summary.conversations_with_unread, 1);

    let denied = h
        .service
        .admin_list_conversations(&h.buyer, AdminListRequest::default())
        .await
        .unwrap_err();
    assert_eq!(denied.kind(), ErrorKind::Authorization);

    let admin = Actor {
        user_id: UserId::generate(),
        role: UserRole::Admin,
        display_name: None,
    };
    let page = h
        .service
        .admin_list_conversations(&admin, AdminListRequest::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].total_unread, 2);
}

#[tokio::test]
async fn aggregate_failure_marks_conversation_for_repair() {
    let buyer = UserId::generate();
    let seller = UserId::generate();
    let now = Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap();
    let conversation = Conversation::new(
        ConversationId::generate(),
        ConversationType::Direct,
        buyer,
        initial_participants(ConversationType::Direct, (buyer, None), vec![(seller, None)]),
        None,
        now,
    )
    .unwrap();
    let conversation_id = conversation.id;

    let mut conversations = MockConversationRepository::new();
    conversations
        .expect_find_by_id()
        .returning(move |_| Ok(Some(conversation.clone())));
    conversations
        .expect_record_message()
        .times(3)
        .returning(|_| Err(RepositoryError::storage("connection reset")));
    conversations
        .expect_mark_inconsistent()
        .withf(move |id| *id == conversation_id)
        .times(1)
        .returning(|_| Ok(()));

    let mut messages = MockMessageRepository::new();
    messages
        .expect_sender_history()
        .returning(|_, _| Ok(SenderHistory::default()));
    messages.expect_insert().returning(|m| Ok(m.clone()));

    let events = Arc::new(RecordingBroadcaster::default());
    let service = ConversationService::new(ConversationServiceDependencies {
        conversation_repository: Arc::new(conversations),
        message_repository: Arc::new(messages),
        user_directory: Arc::new(MemoryUserDirectory::new()),
        subscriptions: Arc::new(StaticSubscriptionDirectory::new(SubscriptionTier::Pro)),
        rate_limiter: Arc::new(DailyRateLimiter::new(
            Arc::new(MemoryRateLimitStore::new()),
            TierLimits::default(),
        )),
        spam_scorer: Arc::new(SpamScorer::new()),
        broadcaster: events.clone(),
        clock: Arc::new(ManualClock::new(now)),
        settings: ServiceSettings::default(),
    });

    let view = service
        .send_message(
            &Actor::user(buyer),
            SendMessageRequest {
                conversation_id,
                content: "hello".to_string(),
                attachments: Vec::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(view.content, "hello");
    assert_eq!(events.kinds().await, vec!["message"]);
}

#[tokio::test]
async fn storage_failure_on_insert_surfaces_as_internal() {
    let buyer = UserId::generate();
    let seller = UserId::generate();
    let now = Utc::now();
    let conversation = Conversation::new(
        ConversationId::generate(),
        ConversationType::Direct,
        buyer,
        initial_participants(ConversationType::Direct, (buyer, None), vec![(seller, None)]),
        None,
        now,
    )
    .unwrap();
    let conversation_id = conversation.id;

    let mut conversations = MockConversationRepository::new();
    conversations
        .expect_find_by_id()
        .returning(move |_| Ok(Some(conversation.clone())));
    conversations.expect_record_message().never();

    let mut messages = MockMessageRepository::new();
    messages
        .expect_sender_history()
        .returning(|_, _| Ok(SenderHistory::default()));
    messages
        .expect_insert()
        .returning(|_| Err(RepositoryError::storage("disk full")));

    let events = Arc::new(RecordingBroadcaster::default());
    let service = ConversationService::new(ConversationServiceDependencies {
        conversation_repository: Arc::new(conversations),
        message_repository: Arc::new(messages),
        user_directory: Arc::new(MemoryUserDirectory::new()),
        subscriptions: Arc::new(StaticSubscriptionDirectory::new(SubscriptionTier::Pro)),
        rate_limiter: Arc::new(DailyRateLimiter::new(
            Arc::new(MemoryRateLimitStore::new()),
            TierLimits::default(),
        )),
        spam_scorer: Arc::new(SpamScorer::new()),
        broadcaster: events.clone(),
        clock: Arc::new(ManualClock::new(now)),
        settings: ServiceSettings::default(),
    });

    let err = service
        .send_message(
            &Actor::user(buyer),
            SendMessageRequest {
                conversation_id,
                content: "hello".to_string(),
                attachments: Vec::new(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(err.public_message(), "internal server error");
    assert!(events.kinds().await.is_empty());
}

#[tokio::test]
async fn reconciler_rebuilds_unread_from_messages() {
    let store = Arc::new(MemoryStore::new());
    let buyer = UserId::generate();
    let seller = UserId::generate();
    let now = Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap();
    let conversation = Conversation::new(
        ConversationId::generate(),
        ConversationType::Direct,
        buyer,
        initial_participants(ConversationType::Direct, (buyer, None), vec![(seller, None)]),
        None,
        now,
    )
    .unwrap();
    store.create_direct(&conversation).await.unwrap();

    for i in 0..3 {
        let message = Message::new(
            MessageId::generate(),
            NewMessage {
                conversation_id: conversation.id,
                sender_id: buyer,
                sender_name: None,
                content: format!("m{i}"),
                content_sanitized: format!("m{i}"),
                attachments: Vec::new(),
                spam_score: 0,
                spam_threshold: 70,
            },
            now + Duration::seconds(i),
        );
        store.insert(&message).await.unwrap();
    }
    store.mark_inconsistent(conversation.id).await.unwrap();

    let reconciler = AggregateReconciler::new(store.clone());
    assert_eq!(reconciler.run_once().await.unwrap(), 1);
    assert_eq!(reconciler.run_once().await.unwrap(), 0);

    let repaired = ConversationRepository::find_by_id(store.as_ref(), conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(repaired.participant(seller).unwrap().unread_count, 3);
    assert_eq!(repaired.participant(buyer).unwrap().unread_count, 0);
    assert_eq!(repaired.last_message.unwrap().content_preview, "m2");
}
