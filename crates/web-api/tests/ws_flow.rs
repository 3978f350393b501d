mod support;

use std::time::Duration;

use axum::http::StatusCode;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};

use support::TestApp;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: std::net::SocketAddr, token: &str) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/api/v1/ws?token={token}"))
        .await
        .expect("websocket connect");
    socket
}

async fn send_command(socket: &mut Socket, command: Value) {
    socket
        .send(TungsteniteMessage::text(command.to_string()))
        .await
        .expect("send command");
}

/// 读取下一帧文本并解析为 JSON
async fn next_frame(socket: &mut Socket) -> Value {
    loop {
        let message = timeout(Duration::from_secs(3), socket.next())
            .await
            .expect("frame before timeout")
            .expect("socket open")
            .expect("frame");
        if let TungsteniteMessage::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("json frame");
        }
    }
}

/// 跳过其他事件，直到收到指定种类的事件
async fn next_event(socket: &mut Socket, kind: &str) -> Value {
    loop {
        let frame = next_frame(socket).await;
        if frame["frame"] == "event" && frame["event"]["kind"] == kind {
            assert_eq!(frame["v"], 1);
            return frame["event"].clone();
        }
    }
}

/// ping 的应答说明之前的命令都已处理
async fn sync(socket: &mut Socket) {
    send_command(socket, json!({ "type": "ping" })).await;
    loop {
        if next_frame(socket).await["frame"] == "pong" {
            return;
        }
    }
}

#[tokio::test]
async fn websocket_receives_events_and_answers_commands() {
    let app = TestApp::new();
    let buyer = app.registered_user("Buyer Ltd").await;
    let seller = app.registered_user("Seller GmbH").await;
    let conversation_id = app.direct(&buyer, &seller).await;
    let (addr, shutdown) = app.serve().await;

    let mut seller_ws = connect(addr, &seller.token).await;
    send_command(
        &mut seller_ws,
        json!({ "type": "join", "conversation_id": conversation_id }),
    )
    .await;
    sync(&mut seller_ws).await;

    // 新消息推送给参与者
    let (status, _) = app
        .post(
            &buyer,
            &format!("/api/v1/conversations/{conversation_id}/messages"),
            json!({ "content": "Can you ship by Friday" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let event = next_event(&mut seller_ws, "message").await;
    assert_eq!(event["message"]["content"], "Can you ship by Friday");
    assert_eq!(event["message"]["conversation_id"], conversation_id.as_str());

    // 买家上线后加入会话并开始输入
    let mut buyer_ws = connect(addr, &buyer.token).await;
    let presence = next_event(&mut seller_ws, "presence").await;
    assert_eq!(presence["online"], true);
    send_command(
        &mut buyer_ws,
        json!({ "type": "join", "conversation_id": conversation_id }),
    )
    .await;
    send_command(
        &mut buyer_ws,
        json!({ "type": "typing-start", "conversation_id": conversation_id }),
    )
    .await;
    let typing = next_event(&mut seller_ws, "typing").await;
    assert_eq!(typing["is_typing"], true);
    assert_eq!(typing["user_id"], json!(buyer.actor.user_id));

    // 最后一个连接断开时立即清除输入状态并广播离线
    buyer_ws.close(None).await.expect("close");
    let typing = next_event(&mut seller_ws, "typing").await;
    assert_eq!(typing["is_typing"], false);
    let presence = next_event(&mut seller_ws, "presence").await;
    assert_eq!(presence["online"], false);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn websocket_rejects_invalid_commands_and_outsiders() {
    let app = TestApp::new();
    let buyer = app.registered_user("Buyer Ltd").await;
    let seller = app.registered_user("Seller GmbH").await;
    let outsider = app.registered_user("Nosy Parker").await;
    let conversation_id = app.direct(&buyer, &seller).await;
    let (addr, shutdown) = app.serve().await;

    let mut ws = connect(addr, &outsider.token).await;
    send_command(&mut ws, json!({ "type": "shout" })).await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["frame"], "error");
    assert_eq!(frame["kind"], "validation");

    send_command(
        &mut ws,
        json!({ "type": "join", "conversation_id": conversation_id }),
    )
    .await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["frame"], "error");
    assert_eq!(frame["kind"], "authorization");

    send_command(
        &mut ws,
        json!({ "type": "typing-start", "conversation_id": conversation_id }),
    )
    .await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["kind"], "validation");

    // 令牌无效时握手失败
    let rejected = connect_async(format!("ws://{addr}/api/v1/ws?token=garbage")).await;
    assert!(rejected.is_err());

    let _ = shutdown.send(());
}
