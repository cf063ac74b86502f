use std::collections::HashSet;

use crate::chat::PairKey;
use crate::value_objects::{GroupId, MessageId, Timestamp, UserId};

/// 私聊会话摘要。
///
/// 一对用户首次互发消息时惰性创建；确定性 PairKey 保证
/// 每个无序对至多存在一条摘要。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PrivateChatSummary {
    pub pair: PairKey,
    pub last_message_id: Option<MessageId>,
    pub last_activity_at: Timestamp,
}

impl PrivateChatSummary {
    pub fn new(pair: PairKey, created_at: Timestamp) -> Self {
        Self {
            pair,
            last_message_id: None,
            last_activity_at: created_at,
        }
    }

    pub fn record_message(&mut self, message_id: MessageId, at: Timestamp) {
        self.last_message_id = Some(message_id);
        self.last_activity_at = at;
    }
}

/// 群组摘要。
///
/// 成员集合只由外部的成员审批协作方变更，消息核心只读。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GroupSummary {
    pub id: GroupId,
    pub name: String,
    pub member_ids: HashSet<UserId>,
    pub admin_id: UserId,
}

impl GroupSummary {
    pub fn is_member(&self, user_id: UserId) -> bool {
        self.member_ids.contains(&user_id)
    }

    pub fn is_admin(&self, user_id: UserId) -> bool {
        self.admin_id == user_id
    }
}
