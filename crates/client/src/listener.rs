//! 实时通道客户端
//!
//! 一个后台任务持有 WebSocket：读到的事件帧校验版本后写入状态容器，
//! 命令经通道交给同一任务写出。pong 和 error 帧转交给调用方。

use std::sync::Arc;

use domain::{ClientCommand, ConversationId, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::error::ClientError;
use crate::store::ChatStore;

/// 解析服务端帧；事件帧必须通过版本和结构校验
pub fn decode_frame(text: &str) -> Result<ServerFrame, ClientError> {
    let frame: ServerFrame = serde_json::from_str(text)
        .map_err(|err| ClientError::Protocol(format!("malformed frame: {err}")))?;
    if let ServerFrame::Event(envelope) = &frame {
        envelope
            .validate()
            .map_err(|err| ClientError::Protocol(err.to_string()))?;
    }
    Ok(frame)
}

/// 处理一帧：事件写入状态容器，其余帧原样返回
pub fn dispatch_frame(store: &ChatStore, text: &str) -> Option<ServerFrame> {
    match decode_frame(text) {
        Ok(ServerFrame::Event(envelope)) => {
            tracing::debug!(kind = envelope.event.kind(), "收到推送事件");
            store.apply_event(envelope.event);
            None
        }
        Ok(frame) => Some(frame),
        Err(err) => {
            tracing::warn!(error = %err, "丢弃无法识别的帧");
            None
        }
    }
}

pub struct RealtimeLink {
    commands: Option<mpsc::UnboundedSender<ClientCommand>>,
    replies: mpsc::UnboundedReceiver<ServerFrame>,
    closed: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl RealtimeLink {
    pub async fn connect(url: &str, store: Arc<ChatStore>) -> Result<Self, ClientError> {
        let (socket, _) = connect_async(url).await?;
        let (mut sink, mut stream) = socket.split();
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<ClientCommand>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<ServerFrame>();
        let (closed_tx, closed_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    incoming = stream.next() => match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Some(frame) = dispatch_frame(&store, text.as_str()) {
                                if let ServerFrame::Error { kind, message } = &frame {
                                    tracing::warn!(%kind, %message, "服务端拒绝了命令");
                                }
                                let _ = reply_tx.send(frame);
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "实时通道读取失败");
                            break;
                        }
                    },
                    command = command_rx.recv() => {
                        let Some(command) = command else {
                            let _ = sink.close().await;
                            break;
                        };
                        let payload = match serde_json::to_string(&command) {
                            Ok(payload) => payload,
                            Err(err) => {
                                tracing::warn!(error = %err, "命令序列化失败");
                                continue;
                            }
                        };
                        if let Err(err) = sink.send(WsMessage::text(payload)).await {
                            tracing::warn!(error = %err, "实时通道写入失败");
                            break;
                        }
                    }
                }
            }
            tracing::info!("实时通道已断开");
            let _ = closed_tx.send(true);
        });

        Ok(Self {
            commands: Some(command_tx),
            replies: reply_rx,
            closed: closed_rx,
            task,
        })
    }

    pub fn send(&self, command: ClientCommand) -> Result<(), ClientError> {
        self.commands
            .as_ref()
            .and_then(|commands| commands.send(command).ok())
            .ok_or_else(|| ClientError::Protocol("realtime link closed".into()))
    }

    pub fn join(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        self.send(ClientCommand::Join { conversation_id })
    }

    pub fn leave(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        self.send(ClientCommand::Leave { conversation_id })
    }

    pub fn typing(&self, conversation_id: ConversationId, is_typing: bool) -> Result<(), ClientError> {
        self.send(if is_typing {
            ClientCommand::TypingStart { conversation_id }
        } else {
            ClientCommand::TypingStop { conversation_id }
        })
    }

    /// 发送 ping 并等到 pong，此前发出的命令都已被服务端处理
    pub async fn sync(&mut self) -> Result<(), ClientError> {
        self.send(ClientCommand::Ping)?;
        loop {
            match self.next_reply().await {
                Some(ServerFrame::Pong) => return Ok(()),
                Some(_) => continue,
                None => return Err(ClientError::Protocol("realtime link closed".into())),
            }
        }
    }

    /// 下一条非事件帧（pong 或 error）
    pub async fn next_reply(&mut self) -> Option<ServerFrame> {
        self.replies.recv().await
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// 等待连接断开
    pub async fn closed(&mut self) {
        while !*self.closed.borrow_and_update() {
            if self.closed.changed().await.is_err() {
                return;
            }
        }
    }

    /// 关闭命令通道，后台任务发出 close 帧后退出
    pub async fn close(mut self) {
        self.commands.take();
        self.closed().await;
    }
}

impl Drop for RealtimeLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{ServerEvent, UserId};

    #[test]
    fn version_mismatch_is_rejected() {
        let user_id = UserId::generate();
        let text = format!(
            r#"{{"frame":"event","v":2,"event":{{"kind":"presence","user_id":"{user_id}","online":true}}}}"#
        );
        assert!(matches!(decode_frame(&text), Err(ClientError::Protocol(_))));
    }

    #[test]
    fn events_are_applied_and_replies_returned() {
        let me = UserId::generate();
        let peer = UserId::generate();
        let store = ChatStore::new(me);
        let frame = ServerFrame::event(ServerEvent::Presence {
            user_id: peer,
            online: true,
        });
        let text = frame.to_json().unwrap();

        assert!(dispatch_frame(&store, &text).is_none());
        assert!(store.is_online(peer));
        assert_eq!(
            dispatch_frame(&store, r#"{"frame":"pong"}"#),
            Some(ServerFrame::Pong)
        );
        assert!(dispatch_frame(&store, "not json").is_none());
    }
}
