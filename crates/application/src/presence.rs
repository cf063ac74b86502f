//! 在线状态跟踪。
//!
//! 完全由连接注册表的句柄计数支撑，自身不持有独立真相，
//! 从根上消除在线状态与连接不一致的一类错误。

use std::sync::Arc;

use domain::{Timestamp, UserId};
use serde::Serialize;

use crate::connections::ConnectionRegistry;

/// 某个身份的在线状态跃迁。
///
/// 首个句柄注册时 offline→online；最后一个句柄移除时
/// online→offline 并盖上最后在线时间戳。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    Online,
    Offline { last_seen: Timestamp },
}

/// 在线状态快照，用于装饰会话列表等显式拉取。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PresenceInfo {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen: Option<Timestamp>,
}

/// 在线状态跟踪器：连接注册表之上的只读视图。
#[derive(Clone)]
pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
}

impl PresenceTracker {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// 当且仅当该身份至少有一个活跃连接。
    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.registry.is_online(user_id).await
    }

    pub async fn last_seen(&self, user_id: UserId) -> Option<Timestamp> {
        self.registry.last_seen(user_id).await
    }

    pub async fn presence_of(&self, user_id: UserId) -> PresenceInfo {
        self.registry.presence_of(user_id).await
    }
}
