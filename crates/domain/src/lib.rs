//! 交易市场会话消息系统核心领域模型
//!
//! 包含会话、参与者、消息等核心实体，实时事件协议，以及仓储接口。

pub mod conversation;
pub mod cursor;
pub mod errors;
pub mod events;
pub mod message;
pub mod participant;
pub mod repository;
pub mod user;
pub mod value_objects;
pub mod views;

// 重新导出常用类型
pub use conversation::*;
pub use cursor::*;
pub use errors::*;
pub use events::*;
pub use message::*;
pub use participant::*;
pub use repository::*;
pub use user::*;
pub use value_objects::*;
pub use views::*;
