use crate::chat::ChatRef;
use crate::errors::DomainError;
use crate::value_objects::{MessageContent, MessageId, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
}

/// 单个用户的已读回执。每个用户至多一条（按身份去重，而非按连接）。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReadReceipt {
    pub user_id: UserId,
    pub read_at: Timestamp,
}

/// 待追加的消息。id 与时间戳由消息存储在追加时分配。
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub chat: ChatRef,
    pub content: MessageContent,
    pub kind: MessageKind,
}

/// 已持久化的消息。
///
/// 创建后 `content`、`sender_id`、`chat`、`created_at` 不可变；
/// 只有 `deleted` 可以翻转、`read_by` 可以追加。
/// 同一会话内的全序为 (created_at, id)。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub chat: ChatRef,
    pub content: MessageContent,
    pub kind: MessageKind,
    pub created_at: Timestamp,
    // 删除标记不暴露给客户端
    #[serde(skip_serializing, default)]
    pub deleted: bool,
    pub read_by: Vec<ReadReceipt>,
}

impl Message {
    pub fn new(
        id: MessageId,
        sender_id: UserId,
        chat: ChatRef,
        content: MessageContent,
        kind: MessageKind,
        created_at: Timestamp,
    ) -> Result<Self, DomainError> {
        Ok(Self {
            id,
            sender_id,
            chat,
            content,
            kind,
            created_at,
            deleted: false,
            read_by: Vec::new(),
        })
    }

    /// 软删除：记录保留以维持 id 与排序稳定，常规读取排除。幂等。
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    /// 追加已读回执。同一用户重复标记是无操作，返回 false。
    pub fn mark_read(&mut self, user_id: UserId, at: Timestamp) -> bool {
        if self.read_by.iter().any(|r| r.user_id == user_id) {
            return false;
        }
        self.read_by.push(ReadReceipt {
            user_id,
            read_at: at,
        });
        true
    }

    /// 会话内排序键：先按创建时间，再按 id 消除并列。
    pub fn order_key(&self) -> (Timestamp, MessageId) {
        (self.created_at, self.id)
    }
}
