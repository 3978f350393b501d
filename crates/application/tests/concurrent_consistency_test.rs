//! 并发数据一致性测试
//!
//! 多个发送者同时写入同一个会话时，未读计数和分页结果不能丢失更新。

use std::sync::Arc;

use application::{
    Actor, ConnectionHub, ConversationService, ConversationServiceDependencies,
    CreateConversationRequest, DailyRateLimiter, ListMessagesRequest, MemoryRateLimitStore,
    MemoryStore, MemoryUserDirectory, SendMessageRequest, ServiceSettings, SpamScorer,
    StaticSubscriptionDirectory, SubscriptionTier, SystemClock, TierLimits,
};
use domain::{ConversationType, UserId, UserRole};

const SENDERS: usize = 4;
const PER_SENDER: usize = 10;

fn actor(name: &str) -> Actor {
    Actor {
        user_id: UserId::generate(),
        role: UserRole::User,
        display_name: Some(name.to_string()),
    }
}

struct Fixture {
    service: Arc<ConversationService>,
    hub: Arc<ConnectionHub>,
}

async fn fixture(users: &[&Actor]) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(MemoryUserDirectory::new());
    for user in users {
        directory
            .insert(user.user_id, user.display_name.as_deref())
            .await;
    }
    let clock = Arc::new(SystemClock);
    let hub = Arc::new(ConnectionHub::new(
        store.clone(),
        clock.clone(),
        chrono::Duration::seconds(3),
    ));
    let service = ConversationService::new(ConversationServiceDependencies {
        conversation_repository: store.clone(),
        message_repository: store,
        user_directory: directory,
        subscriptions: Arc::new(StaticSubscriptionDirectory::new(SubscriptionTier::Free)),
        rate_limiter: Arc::new(DailyRateLimiter::new(
            Arc::new(MemoryRateLimitStore::new()),
            TierLimits::default(),
        )),
        spam_scorer: Arc::new(SpamScorer::new()),
        broadcaster: hub.clone(),
        clock,
        settings: ServiceSettings::default(),
    });
    Fixture {
        service: Arc::new(service),
        hub,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_keep_unread_counts_exact() {
    let reader = actor("Quiet Reader");
    let senders: Vec<Actor> = (0..SENDERS).map(|i| actor(&format!("Trader {i}"))).collect();
    let mut everyone: Vec<&Actor> = senders.iter().collect();
    everyone.push(&reader);
    let f = fixture(&everyone).await;

    let conversation = f
        .service
        .create_conversation(
            &senders[0],
            CreateConversationRequest {
                kind: ConversationType::Group,
                participant_ids: senders[1..]
                    .iter()
                    .map(|a| a.user_id)
                    .chain(std::iter::once(reader.user_id))
                    .collect(),
                context: None,
            },
        )
        .await
        .expect("create group")
        .conversation;

    // 读者在线，所有消息事件都应送达它的连接
    let mut reader_connection = f.hub.connect(reader.user_id).await.expect("connect");

    let mut tasks = Vec::new();
    for sender in senders.clone() {
        let service = f.service.clone();
        let conversation_id = conversation.id;
        tasks.push(tokio::spawn(async move {
            for i in 0..PER_SENDER {
                service
                    .send_message(
                        &sender,
                        SendMessageRequest {
                            conversation_id,
                            content: format!("offer {i} from {}", sender.user_id),
                            attachments: Vec::new(),
                        },
                    )
                    .await
                    .expect("send");
            }
        }));
    }
    for task in tasks {
        task.await.expect("sender task");
    }

    let total = (SENDERS * PER_SENDER) as u64;
    let summary = f.service.unread_summary(&reader).await.expect("summary");
    assert_eq!(summary.total_unread, total);
    for sender in &senders {
        let summary = f.service.unread_summary(sender).await.expect("summary");
        assert_eq!(summary.total_unread, total - PER_SENDER as u64);
    }

    // 游标遍历恰好覆盖每条消息一次
    let mut seen = std::collections::HashSet::new();
    let mut cursor = None;
    loop {
        let page = f
            .service
            .list_messages(
                &reader,
                ListMessagesRequest {
                    conversation_id: conversation.id,
                    cursor: cursor.take(),
                    limit: Some(7),
                },
            )
            .await
            .expect("page");
        for message in page.items {
            assert!(seen.insert(message.id), "duplicate {}", message.id);
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    assert_eq!(seen.len() as u64, total);

    let mut delivered = 0;
    while let Ok(frame) = reader_connection.receiver.try_recv() {
        if let domain::ServerFrame::Event(envelope) = frame {
            if envelope.event.kind() == "message" {
                delivered += 1;
            }
        }
    }
    assert_eq!(delivered, total);
}
