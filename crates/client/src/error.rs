use domain::{ErrorKind, Timestamp};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// 服务端错误响应体
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub reset_at: Option<Timestamp>,
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// 服务端按错误分类拒绝了请求
    #[error("{kind} ({status}): {message}")]
    Api {
        status: StatusCode,
        kind: ErrorKind,
        message: String,
        reset_at: Option<Timestamp>,
    },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    /// 同一资源有更新的请求，本次结果被丢弃
    #[error("request superseded by a newer one")]
    Superseded,
}

impl ClientError {
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        match serde_json::from_str::<ApiErrorBody>(body) {
            Ok(body) => ClientError::Api {
                status,
                kind: body.kind,
                message: body.message,
                reset_at: body.reset_at,
            },
            Err(_) => ClientError::Api {
                status,
                kind: if status.is_server_error() {
                    ErrorKind::Internal
                } else {
                    ErrorKind::Validation
                },
                message: body.to_string(),
                reset_at: None,
            },
        }
    }

    /// 网络抖动或 5xx，只读请求可以重试
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Api { status, .. } => status.is_server_error(),
            ClientError::Transport(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Api { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
