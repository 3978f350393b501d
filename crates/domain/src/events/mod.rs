//! 实时事件协议
//!
//! 服务端推送的领域事件、客户端命令以及带版本号的传输帧。

pub mod client_command;
pub mod server_event;

pub use client_command::ClientCommand;
pub use server_event::{DeliveryScope, EventEnvelope, ServerEvent, ServerFrame, PROTOCOL_VERSION};
