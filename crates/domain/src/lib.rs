//! 即时通讯系统核心领域模型
//!
//! 包含用户、会话引用、消息、会话摘要等核心类型，以及相关的业务规则。
//! 领域层不做任何 I/O，在线状态等派生信息由应用层维护。

pub mod chat;
pub mod errors;
pub mod message;
pub mod summary;
pub mod user;
pub mod value_objects;

pub use chat::{ChatRef, PairKey};
pub use errors::{DomainError, DomainResult, RepositoryError};
pub use message::{Message, MessageKind, NewMessage, ReadReceipt};
pub use summary::{GroupSummary, PrivateChatSummary};
pub use user::UserProfile;
pub use value_objects::{
    ConnectionId, DisplayName, GroupId, MessageContent, MessageId, Timestamp, UserId,
};
