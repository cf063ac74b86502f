//! 打字指示器跟踪。
//!
//! 每个房间一个"正在打字"的身份集合，纯瞬态，无任何持久化。
//! 集合成员在固定的不活跃窗口后自动过期，即使没有收到显式的
//! stop 信号——客户端断线或丢失的 stop 事件不能留下永远的
//! "正在打字"幻影。

use std::collections::HashMap;
use std::time::Duration;

use domain::{ChatRef, UserId};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// 默认不活跃超时。
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(4);

/// 某房间打字集合变化后的完整快照。
///
/// 协议携带完整集合而非增量：接收方整体替换本地视图，
/// 对丢失的事件自愈。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSnapshot {
    pub chat: ChatRef,
    pub users: Vec<UserId>,
}

/// 打字指示器跟踪器。
///
/// 状态机（每个房间、每个身份）：`Idle → Typing` 收到 start；
/// `Typing → Idle` 收到显式 stop、发送消息（发送隐含 stop）、
/// 或距最近一次 start/刷新超过不活跃窗口。
pub struct TypingTracker {
    idle_timeout: Duration,
    /// 房间 -> (身份 -> 过期时刻)
    rooms: Mutex<HashMap<ChatRef, HashMap<UserId, Instant>>>,
}

impl TypingTracker {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// start 信号：加入集合或刷新既有条目的超时，从不拒绝。
    ///
    /// 始终返回快照重新广播完整集合，刷新也一样——这让错过
    /// 之前更新的客户端有机会纠正视图。
    pub async fn start(&self, chat: ChatRef, user_id: UserId) -> TypingSnapshot {
        let deadline = Instant::now() + self.idle_timeout;
        let mut rooms = self.rooms.lock().await;
        rooms.entry(chat).or_default().insert(user_id, deadline);
        snapshot(&rooms, chat)
    }

    /// 显式 stop。该身份本就不在集合中时静默忽略
    /// （迟到的 stop 信号），返回 None。
    pub async fn stop(&self, chat: ChatRef, user_id: UserId) -> Option<TypingSnapshot> {
        let mut rooms = self.rooms.lock().await;
        let entries = rooms.get_mut(&chat)?;
        if entries.remove(&user_id).is_none() {
            return None;
        }
        if entries.is_empty() {
            rooms.remove(&chat);
        }
        Some(snapshot(&rooms, chat))
    }

    /// 最后一条连接关闭：把该身份从它所属的每个房间集合里移除，
    /// 每个受影响的房间各返回一个快照用于重新广播。
    pub async fn remove_everywhere(&self, user_id: UserId) -> Vec<TypingSnapshot> {
        let mut rooms = self.rooms.lock().await;
        let affected: Vec<ChatRef> = rooms
            .iter()
            .filter(|(_, entries)| entries.contains_key(&user_id))
            .map(|(chat, _)| *chat)
            .collect();

        let mut snapshots = Vec::with_capacity(affected.len());
        for chat in affected {
            if let Some(entries) = rooms.get_mut(&chat) {
                entries.remove(&user_id);
                if entries.is_empty() {
                    rooms.remove(&chat);
                }
            }
            snapshots.push(snapshot(&rooms, chat));
        }
        snapshots
    }

    /// 收集所有已超时的条目并移除，每个受影响的房间返回一个快照。
    /// 由定时清扫任务驱动。
    pub async fn expire_due(&self) -> Vec<TypingSnapshot> {
        let now = Instant::now();
        let mut rooms = self.rooms.lock().await;

        let mut snapshots = Vec::new();
        let affected: Vec<ChatRef> = rooms
            .iter()
            .filter(|(_, entries)| entries.values().any(|deadline| *deadline <= now))
            .map(|(chat, _)| *chat)
            .collect();

        for chat in affected {
            if let Some(entries) = rooms.get_mut(&chat) {
                entries.retain(|_, deadline| *deadline > now);
                if entries.is_empty() {
                    rooms.remove(&chat);
                }
            }
            snapshots.push(snapshot(&rooms, chat));
        }
        snapshots
    }

    pub async fn currently_typing(&self, chat: ChatRef) -> Vec<UserId> {
        let rooms = self.rooms.lock().await;
        snapshot(&rooms, chat).users
    }
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

fn snapshot(rooms: &HashMap<ChatRef, HashMap<UserId, Instant>>, chat: ChatRef) -> TypingSnapshot {
    let mut users: Vec<UserId> = rooms
        .get(&chat)
        .map(|entries| entries.keys().copied().collect())
        .unwrap_or_default();
    users.sort();
    TypingSnapshot { chat, users }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    fn room() -> ChatRef {
        ChatRef::group(domain::GroupId::from(Uuid::new_v4()))
    }

    #[tokio::test]
    async fn start_then_stop_round_trip() {
        let tracker = TypingTracker::default();
        let (chat, a) = (room(), user());

        let added = tracker.start(chat, a).await;
        assert_eq!(added.users, vec![a]);

        let removed = tracker.stop(chat, a).await.unwrap();
        assert!(removed.users.is_empty());
    }

    #[tokio::test]
    async fn stale_stop_is_silently_ignored() {
        let tracker = TypingTracker::default();
        assert!(tracker.stop(room(), user()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_without_explicit_stop() {
        let tracker = TypingTracker::new(Duration::from_secs(4));
        let (chat, a) = (room(), user());

        tracker.start(chat, a).await;
        assert_eq!(tracker.currently_typing(chat).await, vec![a]);

        // 不发送也不显式 stop，等待超过超时窗口
        tokio::time::advance(Duration::from_secs(6)).await;

        let snapshots = tracker.expire_due().await;
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].users.is_empty());
        assert!(tracker.currently_typing(chat).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn start_refreshes_the_deadline() {
        let tracker = TypingTracker::new(Duration::from_secs(4));
        let (chat, a) = (room(), user());

        tracker.start(chat, a).await;
        tokio::time::advance(Duration::from_secs(3)).await;
        // 刷新而不是拒绝
        tracker.start(chat, a).await;
        tokio::time::advance(Duration::from_secs(3)).await;

        assert!(tracker.expire_due().await.is_empty());
        assert_eq!(tracker.currently_typing(chat).await, vec![a]);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tracker.expire_due().await.len(), 1);
    }

    #[tokio::test]
    async fn disconnect_purges_user_from_every_room() {
        let tracker = TypingTracker::default();
        let (room_a, room_b) = (room(), room());
        let (a, b) = (user(), user());

        tracker.start(room_a, a).await;
        tracker.start(room_b, a).await;
        tracker.start(room_b, b).await;

        let snapshots = tracker.remove_everywhere(a).await;
        assert_eq!(snapshots.len(), 2);

        assert!(tracker.currently_typing(room_a).await.is_empty());
        assert_eq!(tracker.currently_typing(room_b).await, vec![b]);
    }
}
