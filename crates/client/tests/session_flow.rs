use std::sync::Arc;
use std::time::Duration;

use application::{Actor, SystemClock};
use client::{ChatApi, ChatSession, ClientError};
use config::AppConfig;
use domain::{ConversationType, ErrorKind, UserId, UserRole};
use infrastructure::Infrastructure;
use tokio::{net::TcpListener, sync::oneshot};
use web_api::{router, AppState};

const SECRET: &str = "client-integration-secret-with-32-chars";

struct Server {
    base_url: String,
    state: AppState,
    _shutdown: oneshot::Sender<()>,
}

async fn start_server() -> Server {
    let mut config = AppConfig::default();
    config.jwt.secret = SECRET.to_string();
    let state = AppState::build(&config, Infrastructure::in_memory(), Arc::new(SystemClock));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });
    Server {
        base_url: format!("http://{addr}"),
        state,
        _shutdown: shutdown_tx,
    }
}

/// 生成令牌并调用一次接口，让用户出现在用户目录里
async fn session_for(server: &Server, name: &str) -> ChatSession {
    let actor = Actor {
        user_id: UserId::generate(),
        role: UserRole::User,
        display_name: Some(name.to_string()),
    };
    let token = server
        .state
        .jwt
        .generate_token(&actor, chrono::Duration::hours(1))
        .expect("token");
    let session = ChatSession::new(ChatApi::new(&server.base_url, token), actor.user_id);
    session.unread_summary().await.expect("register user");
    session
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..150 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met before timeout");
}

#[tokio::test]
async fn pushed_messages_reach_the_other_store() {
    let server = start_server().await;
    let buyer = session_for(&server, "Buyer Ltd").await;
    let seller = session_for(&server, "Seller GmbH").await;

    let created = buyer
        .create_conversation(ConversationType::Direct, &[seller.store().me()], None)
        .await
        .expect("create");
    assert!(created.created);
    let conversation_id = created.conversation.id;

    // 再次创建命中同一会话
    let again = seller
        .create_conversation(ConversationType::Direct, &[buyer.store().me()], None)
        .await
        .expect("dedupe");
    assert!(!again.created);
    assert_eq!(again.conversation.id, conversation_id);

    seller.load_conversations().await.expect("load");
    seller.connect_realtime().await.expect("connect");
    seller.open_conversation(conversation_id).await.expect("open");
    seller.sync_realtime().await.expect("sync");

    let sent = buyer
        .send_message(conversation_id, "Pallet ready on Monday", vec![])
        .await
        .expect("send");
    assert_eq!(buyer.store().messages(conversation_id).len(), 1);
    assert!(!buyer.store().is_pending(sent.id));

    let store = seller.store().clone();
    wait_until(|| store.message(sent.id).is_some()).await;
    assert_eq!(
        store.message(sent.id).unwrap().content,
        "Pallet ready on Monday"
    );
    // 当前打开的会话不累计未读
    assert_eq!(store.unread_summary().total_unread, 0);

    let added = seller.toggle_reaction(sent.id, "👍").await.expect("react");
    assert!(added);
    let buyer_store = buyer.store().clone();
    buyer.connect_realtime().await.expect("buyer connect");
    buyer.resync().await.expect("resync");
    assert_eq!(buyer_store.conversations().len(), 1);

    seller.disconnect().await;
    buyer.disconnect().await;
}

#[tokio::test]
async fn rejected_send_rolls_back_optimistic_message() {
    let server = start_server().await;
    let buyer = session_for(&server, "Buyer Ltd").await;
    let seller = session_for(&server, "Seller GmbH").await;
    let conversation_id = buyer
        .create_conversation(ConversationType::Direct, &[seller.store().me()], None)
        .await
        .expect("create")
        .conversation
        .id;

    let err = buyer
        .send_message(conversation_id, "   ", vec![])
        .await
        .expect_err("blank content");
    assert_eq!(err.kind(), Some(ErrorKind::Validation));
    assert!(buyer.store().messages(conversation_id).is_empty());
    assert!(buyer
        .store()
        .conversation(conversation_id)
        .unwrap()
        .last_message
        .is_none());

    for i in 0..50 {
        buyer
            .api()
            .send_message(conversation_id, &format!("quote revision {i}"), &[])
            .await
            .expect("within daily limit");
    }
    let err = buyer
        .send_message(conversation_id, "one more", vec![])
        .await
        .expect_err("over daily limit");
    match err {
        ClientError::Api { kind, reset_at, .. } => {
            assert_eq!(kind, ErrorKind::RateLimited);
            assert!(reset_at.is_some());
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(buyer.store().messages(conversation_id).is_empty());
}

#[tokio::test]
async fn typing_and_presence_follow_the_peer() {
    let server = start_server().await;
    let buyer = session_for(&server, "Buyer Ltd").await;
    let seller = session_for(&server, "Seller GmbH").await;
    let conversation_id = buyer
        .create_conversation(ConversationType::Direct, &[seller.store().me()], None)
        .await
        .expect("create")
        .conversation
        .id;

    seller.load_conversations().await.expect("load");
    seller.connect_realtime().await.expect("seller connect");
    seller.join(conversation_id).await.expect("join");
    seller.sync_realtime().await.expect("sync");

    buyer.connect_realtime().await.expect("buyer connect");
    buyer.join(conversation_id).await.expect("buyer join");
    buyer.set_typing(conversation_id, true).await.expect("typing");
    buyer.sync_realtime().await.expect("buyer sync");

    let store = seller.store().clone();
    let buyer_id = buyer.store().me();
    wait_until(|| store.is_online(buyer_id)).await;
    wait_until(|| store.typing_users(conversation_id) == vec![buyer_id]).await;

    buyer.disconnect().await;
    wait_until(|| !store.is_online(buyer_id)).await;
    wait_until(|| store.typing_users(conversation_id).is_empty()).await;
    seller.disconnect().await;
}

#[tokio::test]
async fn reads_and_lookups_surface_typed_errors() {
    let server = start_server().await;
    let buyer = session_for(&server, "Buyer Ltd").await;

    let err = buyer
        .api()
        .get_conversation(domain::ConversationId::generate())
        .await
        .expect_err("unknown conversation");
    assert_eq!(err.kind(), Some(ErrorKind::NotFound));
    assert!(!err.is_transient());

    let hits = buyer.search("anything").await.expect("search");
    assert!(hits.is_empty());
}
