//! 应用层实现。
//!
//! 实时消息核心：连接注册表、在线状态、房间解析、打字指示器、
//! 消息存储契约以及把它们串起来的扇出引擎。共享状态按键加锁，
//! 跨会话操作之间互不阻塞。

pub mod clock;
pub mod connections;
pub mod error;
pub mod events;
pub mod presence;
pub mod repository;
pub mod rooms;
pub mod services;
pub mod typing;

pub use clock::{Clock, SystemClock};
pub use connections::{ConnectionHandle, ConnectionRegistry, DeliveryError};
pub use error::ApplicationError;
pub use events::ServerEvent;
pub use presence::{PresenceChange, PresenceInfo, PresenceTracker};
pub use repository::{MessageRepository, PrivateChatSummaryRepository, RepositoryResult};
pub use rooms::{GroupDirectory, RoomResolver};
pub use services::{
    ChatListing, ChatService, ChatServiceDependencies, PrivateChatEntry, SendMessageRequest,
};
pub use typing::{TypingSnapshot, TypingTracker};
