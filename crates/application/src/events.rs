//! 推送给客户端的事件。
//!
//! 每条连接持有一个事件通道，扇出引擎向通道推送，
//! 持有连接的会话任务负责串行写入网络。

use domain::{ChatRef, Message, Timestamp, UserId};
use serde::Serialize;

/// 出站事件（服务端 → 客户端）。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// 新消息入库后推送给所有在线参与者。
    NewMessage { message: Message },
    /// 某房间打字集合发生变化。携带完整集合而非增量，
    /// 接收方整体替换本地视图，对丢失事件自愈。
    TypingUpdate { chat: ChatRef, users: Vec<UserId> },
    /// 某用户上线或下线。尽力投递，错过的事件由下一次
    /// 会话列表拉取自愈。
    PresenceChanged {
        user_id: UserId,
        is_online: bool,
        last_seen: Option<Timestamp>,
    },
    /// 发送给单个客户端的错误提示。
    Error { message: String },
}
