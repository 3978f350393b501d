//! 会话消息客户端
//!
//! 服务端接口的请求封装、可观察的本地状态容器，以及实时通道监听。

pub mod api;
pub mod error;
pub mod listener;
pub mod session;
pub mod store;

pub use api::{ChatApi, CreatedConversation, Idempotence};
pub use error::{ApiErrorBody, ClientError};
pub use listener::{decode_frame, dispatch_frame, RealtimeLink};
pub use session::{ChatSession, Ticket, Tickets};
pub use store::{ChatStore, StoreEvent, StoreObserver, TYPING_TTL_SECS};
