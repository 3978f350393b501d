use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use client::{ChatApi, ClientError};
use domain::{ConversationId, ErrorKind};
use serde_json::{json, Value};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Hits {
    conversation: Arc<AtomicUsize>,
    messages: Arc<AtomicUsize>,
    unread: Arc<AtomicUsize>,
}

async fn unavailable(counter: &AtomicUsize) -> (StatusCode, Json<Value>) {
    counter.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "kind": "internal", "message": "try again later" })),
    )
}

/// 固定返回错误并计数的服务端
async fn start_stub() -> (String, Hits) {
    let hits = Hits::default();
    let app = Router::new()
        .route(
            "/api/v1/conversations/{conversation_id}",
            get(|State(hits): State<Hits>| async move { unavailable(&hits.conversation).await }),
        )
        .route(
            "/api/v1/conversations/{conversation_id}/messages",
            get(|State(hits): State<Hits>| async move { unavailable(&hits.messages).await }).post(
                |State(hits): State<Hits>| async move { unavailable(&hits.messages).await },
            ),
        )
        .route(
            "/api/v1/me/unread",
            get(|State(hits): State<Hits>| async move {
                hits.unread.fetch_add(1, Ordering::SeqCst);
                (
                    StatusCode::FORBIDDEN,
                    Json(json!({ "kind": "forbidden", "message": "not allowed" })),
                )
            }),
        )
        .with_state(hits.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.ok();
    });
    (format!("http://{addr}"), hits)
}

#[tokio::test]
async fn reads_retry_twice_on_server_errors() {
    let (base_url, hits) = start_stub().await;
    let api = ChatApi::new(base_url, "token");

    let err = api
        .get_conversation(ConversationId::generate())
        .await
        .expect_err("server keeps failing");

    assert!(matches!(
        err,
        ClientError::Api { status, .. } if status == reqwest::StatusCode::SERVICE_UNAVAILABLE
    ));
    assert_eq!(hits.conversation.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn writes_are_sent_once() {
    let (base_url, hits) = start_stub().await;
    let api = ChatApi::new(base_url, "token");

    let err = api
        .send_message(ConversationId::generate(), "is the pallet still available?", &[])
        .await
        .expect_err("server keeps failing");

    assert!(err.is_transient());
    assert_eq!(hits.messages.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn client_errors_on_reads_are_not_retried() {
    let (base_url, hits) = start_stub().await;
    let api = ChatApi::new(base_url, "token");

    let err = api.unread_summary().await.expect_err("forbidden");

    assert_eq!(err.kind(), Some(ErrorKind::Forbidden));
    assert_eq!(hits.unread.load(Ordering::SeqCst), 1);
}
