//! 连接注册表。
//!
//! 将用户身份映射到其活跃连接句柄的集合（一个用户可以有多个
//! 并行会话），是消息投递的基本单位。注册表独占持有句柄，
//! 断开即销毁，永不持久化。

use std::collections::HashMap;
use std::sync::Arc;

use domain::{ConnectionId, Timestamp, UserId, UserProfile};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::clock::Clock;
use crate::events::ServerEvent;
use crate::presence::{PresenceChange, PresenceInfo};

/// 单个句柄不可达（例如解析与推送之间对端断开）。
/// 吞掉并记日志，不作为整次发送失败的理由。
#[derive(Debug, Error)]
#[error("delivery failed: connection channel closed")]
pub struct DeliveryError;

/// 活跃连接句柄：身份 + 事件通道发送端。
///
/// 引擎向通道推送事件，会话任务排空通道并写入网络，
/// 由此解耦生产速度与单个客户端的写入速度。
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// 向该连接推送一条事件。
    pub fn push(&self, event: ServerEvent) -> Result<(), DeliveryError> {
        self.sender.send(event).map_err(|_| DeliveryError)
    }
}

#[derive(Default)]
struct RegistryInner {
    /// 用户 -> 该用户全部活跃句柄
    by_user: HashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>,
    /// 句柄 -> 所属用户，支持按句柄注销
    owner_of: HashMap<ConnectionId, UserId>,
    /// 转为离线时盖章
    last_seen: HashMap<UserId, Timestamp>,
    /// 握手时携带的身份记录。断开后保留，供会话列表装饰
    /// 已离线的对端。在线标志从不存在这里。
    profiles: HashMap<UserId, UserProfile>,
}

/// 连接注册表。
///
/// 一把锁同时覆盖句柄表与在线状态：注册返回之前身份即对
/// 在线状态可见，不存在"连接已存在但在线状态说离线"的窗口。
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    clock: Arc<dyn Clock>,
}

impl ConnectionRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            clock,
        }
    }

    /// 注册一条新连接。
    ///
    /// 某身份的第一个句柄触发 offline→online 跃迁。
    pub async fn register(
        &self,
        profile: UserProfile,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> (ConnectionHandle, Option<PresenceChange>) {
        let user_id = profile.id;
        let handle = ConnectionHandle {
            id: ConnectionId::generate(),
            user_id,
            sender,
        };

        let mut inner = self.inner.write().await;
        inner.profiles.insert(user_id, profile);
        let handles = inner.by_user.entry(user_id).or_default();
        let went_online = handles.is_empty();
        handles.insert(handle.id, handle.clone());
        inner.owner_of.insert(handle.id, user_id);

        let change = went_online.then_some(PresenceChange::Online);
        (handle, change)
    }

    /// 注销一条连接。幂等：未知句柄（含重复注销）是无操作。
    ///
    /// 移除某身份的最后一个句柄触发 online→offline 并
    /// 盖上最后在线时间。
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<PresenceChange> {
        let mut inner = self.inner.write().await;
        let user_id = inner.owner_of.remove(&connection_id)?;

        let went_offline = match inner.by_user.get_mut(&user_id) {
            Some(handles) => {
                handles.remove(&connection_id);
                if handles.is_empty() {
                    inner.by_user.remove(&user_id);
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        if went_offline {
            let last_seen = self.clock.now();
            inner.last_seen.insert(user_id, last_seen);
            Some(PresenceChange::Offline { last_seen })
        } else {
            None
        }
    }

    /// 某身份当前全部活跃句柄，可能为空。
    pub async fn connections_for(&self, user_id: UserId) -> Vec<ConnectionHandle> {
        let inner = self.inner.read().await;
        inner
            .by_user
            .get(&user_id)
            .map(|handles| handles.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        let inner = self.inner.read().await;
        inner.by_user.contains_key(&user_id)
    }

    pub async fn last_seen(&self, user_id: UserId) -> Option<Timestamp> {
        let inner = self.inner.read().await;
        inner.last_seen.get(&user_id).copied()
    }

    /// 最近一次握手携带的身份记录；从未连接过的身份返回 None。
    pub async fn profile_of(&self, user_id: UserId) -> Option<UserProfile> {
        let inner = self.inner.read().await;
        inner.profiles.get(&user_id).cloned()
    }

    pub async fn presence_of(&self, user_id: UserId) -> PresenceInfo {
        let inner = self.inner.read().await;
        PresenceInfo {
            user_id,
            is_online: inner.by_user.contains_key(&user_id),
            last_seen: inner.last_seen.get(&user_id).copied(),
        }
    }
}
