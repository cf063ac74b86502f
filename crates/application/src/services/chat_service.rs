//! 扇出引擎。
//!
//! 编排一次发送的完整链路：校验发送者是参与者 → 持久化消息 →
//! 经房间解析器与连接注册表解析接收方 → 推送到每条活跃连接 →
//! 更新会话摘要。在线状态与打字流程由连接生命周期驱动，
//! 完全绕过消息存储。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use domain::{
    ChatRef, ConnectionId, DomainError, GroupSummary, Message, MessageContent, MessageId,
    MessageKind, NewMessage, PairKey, Timestamp, UserId, UserProfile,
};
use tokio::sync::{mpsc, Mutex};

use crate::clock::Clock;
use crate::connections::{ConnectionHandle, ConnectionRegistry};
use crate::error::ApplicationError;
use crate::events::ServerEvent;
use crate::presence::{PresenceInfo, PresenceTracker};
use crate::repository::{MessageRepository, PrivateChatSummaryRepository};
use crate::rooms::{GroupDirectory, RoomResolver};
use crate::typing::{TypingSnapshot, TypingTracker};

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub sender_id: UserId,
    pub chat: ChatRef,
    pub content: String,
    pub kind: MessageKind,
}

/// 会话列表中的一条私聊。
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PrivateChatEntry {
    pub pair: PairKey,
    /// 对端身份与实时在线状态。错过的 presence 事件由这里自愈。
    pub peer: PresenceInfo,
    /// 对端最近一次握手携带的身份记录；从未连接过则为 None。
    pub peer_profile: Option<UserProfile>,
    pub last_message_id: Option<MessageId>,
    pub last_activity_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ChatListing {
    pub private_chats: Vec<PrivateChatEntry>,
    pub groups: Vec<GroupSummary>,
}

pub struct ChatServiceDependencies {
    pub registry: Arc<ConnectionRegistry>,
    pub groups: Arc<dyn GroupDirectory>,
    pub messages: Arc<dyn MessageRepository>,
    pub summaries: Arc<dyn PrivateChatSummaryRepository>,
    pub typing: Arc<TypingTracker>,
    pub clock: Arc<dyn Clock>,
}

pub struct ChatService {
    deps: ChatServiceDependencies,
    resolver: RoomResolver,
    presence: PresenceTracker,
    /// 每个会话一把锁：append+扇出对同一会话原子，
    /// 不同会话互不阻塞，没有全局锁。
    chat_locks: Mutex<HashMap<ChatRef, Arc<Mutex<()>>>>,
}

impl ChatService {
    pub fn new(deps: ChatServiceDependencies) -> Self {
        let resolver = RoomResolver::new(deps.groups.clone());
        let presence = PresenceTracker::new(deps.registry.clone());
        Self {
            deps,
            resolver,
            presence,
            chat_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.deps.registry
    }

    async fn chat_lock(&self, chat: ChatRef) -> Arc<Mutex<()>> {
        let mut locks = self.chat_locks.lock().await;
        locks.entry(chat).or_default().clone()
    }

    /// 释放后的回收：只有映射表自身还持有该锁时才移除条目，
    /// 防止锁表随会话数无限增长。计数检查和取用都在表锁内，
    /// 不存在"移除后别人还拿着旧锁"的并发窗口。
    async fn release_chat_lock(&self, chat: &ChatRef) {
        let mut locks = self.chat_locks.lock().await;
        if let Some(entry) = locks.get(chat) {
            if Arc::strong_count(entry) == 1 {
                locks.remove(chat);
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn chat_lock_count(&self) -> usize {
        self.chat_locks.lock().await.len()
    }

    /// 握手完成后注册连接。注册返回前身份即对在线状态可见；
    /// 首个句柄触发的上线事件向相关用户尽力广播。
    pub async fn connect(
        &self,
        profile: UserProfile,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> ConnectionHandle {
        let user_id = profile.id;
        let (handle, change) = self.deps.registry.register(profile, sender).await;
        if change.is_some() {
            tracing::info!(user_id = %user_id, connection_id = %handle.id(), "用户上线");
            self.broadcast_presence(user_id).await;
        }
        handle
    }

    /// 连接断开。注销是幂等的；某身份的最后一条连接关闭时，
    /// 将其从所有房间的打字集合移除并重新广播，然后广播下线。
    pub async fn disconnect(&self, user_id: UserId, connection_id: ConnectionId) {
        let change = self.deps.registry.unregister(connection_id).await;
        if change.is_none() {
            return;
        }
        tracing::info!(user_id = %user_id, connection_id = %connection_id, "用户下线");

        let snapshots = self.deps.typing.remove_everywhere(user_id).await;
        for snapshot in snapshots {
            self.broadcast_typing(&snapshot, Some(user_id)).await;
        }

        self.broadcast_presence(user_id).await;
    }

    /// 发送一条消息。
    ///
    /// 第 1、2 步失败在任何广播之前中止——未持久化的消息绝不
    /// 部分扇出。单个接收方句柄推送失败只记日志，不影响整次
    /// 发送：消息已经落盘，可经历史读取恢复。
    pub async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<Message, ApplicationError> {
        let content = MessageContent::new(request.content)?;
        let chat = request.chat;
        let sender_id = request.sender_id;

        // 1. 解析参与者；发送者不在集合内直接拒绝
        let participants = self.resolver.resolve_for_sender(sender_id, &chat).await?;

        // 同一会话内 append+扇出 串行化，保证观察到的 id 顺序
        let lock = self.chat_lock(chat).await;
        let _guard = lock.lock().await;

        // 2. 追加到消息日志，由存储分配 id 与时间戳
        let now = self.deps.clock.now();
        let message = self
            .deps
            .messages
            .append(
                NewMessage {
                    sender_id,
                    chat,
                    content,
                    kind: request.kind,
                },
                now,
            )
            .await?;

        // 3. 更新所属会话摘要（私聊摘要不存在则惰性创建）
        if let ChatRef::Private { pair } = chat {
            self.deps
                .summaries
                .record_activity(pair, message.id, now)
                .await?;
        }

        // 发送隐含打字停止
        if let Some(snapshot) = self.deps.typing.stop(chat, sender_id).await {
            self.broadcast_typing_to(&snapshot, Some(sender_id), &participants)
                .await;
        }

        // 4. 向每个参与者的每条活跃连接推送；离线参与者直接跳过
        self.deliver(
            &participants,
            ServerEvent::NewMessage {
                message: message.clone(),
            },
        )
        .await;

        tracing::debug!(
            chat = %chat,
            message_id = %message.id,
            recipients = participants.len(),
            "消息已持久化并扇出"
        );

        drop(_guard);
        drop(lock);
        self.release_chat_lock(&chat).await;

        Ok(message)
    }

    /// 打字开始。已在集合中则刷新超时而不是拒绝。
    /// 来自非参与者或已消失房间的信号静默忽略。
    pub async fn typing_start(&self, user_id: UserId, chat: ChatRef) {
        let participants = match self.resolver.resolve_for_sender(user_id, &chat).await {
            Ok(participants) => participants,
            Err(err) => {
                tracing::debug!(user_id = %user_id, chat = %chat, error = %err, "忽略无效的打字信号");
                return;
            }
        };

        let snapshot = self.deps.typing.start(chat, user_id).await;
        self.broadcast_typing_to(&snapshot, Some(user_id), &participants)
            .await;
    }

    /// 显式打字停止。该身份本就不在集合中时静默忽略。
    pub async fn typing_stop(&self, user_id: UserId, chat: ChatRef) {
        if let Some(snapshot) = self.deps.typing.stop(chat, user_id).await {
            self.broadcast_typing(&snapshot, Some(user_id)).await;
        }
    }

    /// 清理所有超时的打字条目并重新广播受影响的房间。
    /// 由二进制侧的定时任务按固定间隔驱动。
    pub async fn sweep_expired_typing(&self) {
        let snapshots = self.deps.typing.expire_due().await;
        for snapshot in snapshots {
            self.broadcast_typing(&snapshot, None).await;
        }
    }

    /// 历史分页读取。读取者必须是参与者。
    pub async fn get_messages(
        &self,
        reader_id: UserId,
        chat: ChatRef,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, ApplicationError> {
        self.resolver.resolve_for_sender(reader_id, &chat).await?;
        let page = self.deps.messages.page(&chat, before, limit).await?;
        Ok(page)
    }

    /// 会话列表：私聊摘要（带对端实时在线状态）+ 群组。
    pub async fn list_chats(&self, user_id: UserId) -> Result<ChatListing, ApplicationError> {
        let summaries = self.deps.summaries.list_for_user(user_id).await?;

        let mut private_chats = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let peer_id = match summary.pair.other(user_id) {
                Some(peer_id) => peer_id,
                None => continue,
            };
            private_chats.push(PrivateChatEntry {
                pair: summary.pair,
                peer: self.presence.presence_of(peer_id).await,
                peer_profile: self.deps.registry.profile_of(peer_id).await,
                last_message_id: summary.last_message_id,
                last_activity_at: summary.last_activity_at,
            });
        }

        let mut groups = self.deps.groups.groups_of(user_id).await?;
        groups.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(ChatListing {
            private_chats,
            groups,
        })
    }

    /// 追加已读回执。按身份单调：重复标记是无操作。
    pub async fn mark_read(
        &self,
        reader_id: UserId,
        message_id: MessageId,
    ) -> Result<(), ApplicationError> {
        let message = self
            .deps
            .messages
            .find_by_id(message_id)
            .await?
            .ok_or(DomainError::MessageNotFound)?;

        self.resolver
            .resolve_for_sender(reader_id, &message.chat)
            .await?;

        let now = self.deps.clock.now();
        self.deps
            .messages
            .mark_read(message_id, reader_id, now)
            .await?;
        Ok(())
    }

    /// 软删除一条消息。只有发送者本人可以删除。幂等。
    pub async fn delete_message(
        &self,
        requester_id: UserId,
        message_id: MessageId,
    ) -> Result<(), ApplicationError> {
        let message = self
            .deps
            .messages
            .find_by_id(message_id)
            .await?
            .ok_or(DomainError::MessageNotFound)?;

        if message.sender_id != requester_id {
            return Err(DomainError::OperationNotAllowed.into());
        }

        self.deps.messages.mark_deleted(message_id).await?;
        Ok(())
    }

    /// 向参与者集合投递一条事件。
    ///
    /// 零连接的身份直接跳过——对它们的投递通过后续的历史
    /// 分页读取完成，引擎不重试。同一身份的多条连接各收一次。
    async fn deliver(&self, recipients: &HashSet<UserId>, event: ServerEvent) {
        for user_id in recipients {
            for handle in self.deps.registry.connections_for(*user_id).await {
                if handle.push(event.clone()).is_err() {
                    // 解析与推送之间对端断开：吞掉，发送者不感知
                    tracing::warn!(
                        user_id = %user_id,
                        connection_id = %handle.id(),
                        "向连接推送事件失败"
                    );
                }
            }
        }
    }

    async fn broadcast_typing(&self, snapshot: &TypingSnapshot, origin: Option<UserId>) {
        let participants = match self.resolver.participants_of(&snapshot.chat).await {
            Ok(participants) => participants,
            Err(err) => {
                tracing::debug!(chat = %snapshot.chat, error = %err, "打字广播的房间已不可解析");
                return;
            }
        };
        self.broadcast_typing_to(snapshot, origin, &participants)
            .await;
    }

    async fn broadcast_typing_to(
        &self,
        snapshot: &TypingSnapshot,
        origin: Option<UserId>,
        participants: &HashSet<UserId>,
    ) {
        let recipients: HashSet<UserId> = participants
            .iter()
            .copied()
            .filter(|user_id| Some(*user_id) != origin)
            .collect();

        self.deliver(
            &recipients,
            ServerEvent::TypingUpdate {
                chat: snapshot.chat,
                users: snapshot.users.clone(),
            },
        )
        .await;
    }

    /// 在线状态变化的尽力广播：通知与该身份共享私聊或群组的
    /// 用户。错过的事件由下一次会话列表拉取自愈。
    async fn broadcast_presence(&self, user_id: UserId) {
        let audience = match self.presence_audience(user_id).await {
            Ok(audience) => audience,
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "解析在线状态受众失败");
                return;
            }
        };

        let info = self.presence.presence_of(user_id).await;
        self.deliver(
            &audience,
            ServerEvent::PresenceChanged {
                user_id,
                is_online: info.is_online,
                last_seen: info.last_seen,
            },
        )
        .await;
    }

    async fn presence_audience(
        &self,
        user_id: UserId,
    ) -> Result<HashSet<UserId>, ApplicationError> {
        let mut audience = HashSet::new();

        for summary in self.deps.summaries.list_for_user(user_id).await? {
            if let Some(peer_id) = summary.pair.other(user_id) {
                audience.insert(peer_id);
            }
        }
        for group in self.deps.groups.groups_of(user_id).await? {
            audience.extend(group.member_ids);
        }

        audience.remove(&user_id);
        Ok(audience)
    }
}
