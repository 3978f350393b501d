//! WebSocket 实时通道
//!
//! 升级前用查询参数里的令牌认证，连接建立后交给推送中心管理状态。
//! 写出统一走一个任务：推送中心的事件帧和命令的应答帧在这里汇合。

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use application::{Actor, ConnectionHandle};
use domain::{ClientCommand, ConnectionId, ErrorKind, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::{auth::authenticate, error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: String,
}

pub async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let claims = state.jwt.verify_token(&query.token)?;
    let actor = authenticate(&state, claims).await?;
    Ok(ws.on_upgrade(move |socket| run_connection(socket, state, actor)))
}

async fn run_connection(socket: WebSocket, state: AppState, actor: Actor) {
    let ConnectionHandle {
        id,
        receiver: mut events,
    } = state.hub.open().await;
    if let Err(err) = state.hub.authenticate(id, actor.user_id).await {
        tracing::warn!(connection_id = %id, error = %err, "连接认证失败");
        state.hub.disconnect(id).await;
        return;
    }
    tracing::info!(connection_id = %id, user_id = %actor.user_id, "WebSocket 连接已建立");

    let (mut sender, mut incoming) = socket.split();
    // 命令应答帧，和事件帧一起由发送任务写出
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let mut send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(frame) = events.recv() => frame,
                Some(frame) = reply_rx.recv() => frame,
                else => break,
            };
            let payload = match frame.to_json() {
                Ok(json) => json,
                Err(err) => {
                    tracing::warn!(error = %err, "帧序列化失败");
                    continue;
                }
            };
            if sender.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = incoming.next().await {
            match message {
                WsMessage::Text(text) => {
                    if let Some(reply) = handle_command(&recv_state, id, text.as_str()).await {
                        if reply_tx.send(reply).is_err() {
                            break;
                        }
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    // 任意一侧结束即关闭连接
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.disconnect(id).await;
    tracing::info!(connection_id = %id, user_id = %actor.user_id, "WebSocket 连接已关闭");
}

/// 处理一条客户端命令，返回需要回给该连接的帧
async fn handle_command(state: &AppState, id: ConnectionId, text: &str) -> Option<ServerFrame> {
    let command = match ClientCommand::parse(text) {
        Ok(command) => command,
        Err(err) => {
            return Some(ServerFrame::Error {
                kind: ErrorKind::Validation.as_str().to_string(),
                message: format!("invalid command: {err}"),
            })
        }
    };

    let result = match command {
        ClientCommand::Join { conversation_id } => state.hub.join(id, conversation_id).await,
        ClientCommand::Leave { conversation_id } => state.hub.leave(id, conversation_id).await,
        ClientCommand::TypingStart { conversation_id } => {
            state.hub.set_typing(id, conversation_id, true).await
        }
        ClientCommand::TypingStop { conversation_id } => {
            state.hub.set_typing(id, conversation_id, false).await
        }
        ClientCommand::Ping => return Some(ServerFrame::Pong),
    };

    match result {
        Ok(()) => None,
        Err(err) => {
            tracing::debug!(connection_id = %id, error = %err, "命令被拒绝");
            let api = ApiError::from(err);
            Some(ServerFrame::Error {
                kind: api.kind().as_str().to_string(),
                message: api.message().to_string(),
            })
        }
    }
}
