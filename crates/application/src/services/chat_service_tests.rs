//! 扇出引擎单元测试。
//!
//! 覆盖发送链路、成员校验、打字指示器的广播与超时、
//! 连接生命周期驱动的清理，全部基于内存适配器。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use domain::{ChatRef, DisplayName, GroupId, GroupSummary, MessageKind, UserId, UserProfile};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::clock::SystemClock;
use crate::connections::{ConnectionHandle, ConnectionRegistry};
use crate::events::ServerEvent;
use crate::repository::memory::{InMemoryMessageStore, InMemoryPrivateChatSummaries};
use crate::rooms::memory::InMemoryGroupDirectory;
use crate::services::{ChatService, ChatServiceDependencies, SendMessageRequest};
use crate::typing::TypingTracker;

struct TestHarness {
    service: Arc<ChatService>,
    directory: Arc<InMemoryGroupDirectory>,
}

impl TestHarness {
    fn new() -> Self {
        let clock = Arc::new(SystemClock);
        let directory = Arc::new(InMemoryGroupDirectory::new());
        let service = ChatService::new(ChatServiceDependencies {
            registry: Arc::new(ConnectionRegistry::new(clock.clone())),
            groups: directory.clone(),
            messages: Arc::new(InMemoryMessageStore::new()),
            summaries: Arc::new(InMemoryPrivateChatSummaries::new()),
            typing: Arc::new(TypingTracker::new(Duration::from_secs(4))),
            clock,
        });
        Self {
            service: Arc::new(service),
            directory,
        }
    }

    async fn connect(
        &self,
        user_id: UserId,
    ) -> (
        ConnectionHandle,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let profile = UserProfile::new(user_id, DisplayName::parse("tester").unwrap());
        let handle = self.service.connect(profile, tx).await;
        (handle, rx)
    }

    async fn group_with(&self, members: &[UserId]) -> ChatRef {
        let group = GroupSummary {
            id: GroupId::from(Uuid::new_v4()),
            name: "team".to_owned(),
            member_ids: members.iter().copied().collect(),
            admin_id: members[0],
        };
        let chat = ChatRef::group(group.id);
        self.directory.upsert(group).await;
        chat
    }
}

fn user() -> UserId {
    UserId::from(Uuid::new_v4())
}

fn send(sender: UserId, chat: ChatRef, body: &str) -> SendMessageRequest {
    SendMessageRequest {
        sender_id: sender,
        chat,
        content: body.to_owned(),
        kind: MessageKind::Text,
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn first_private_message_creates_summary_and_reaches_online_peer() {
    let harness = TestHarness::new();
    let (a, b) = (user(), user());
    let chat = ChatRef::private(a, b).unwrap();

    let (_handle, mut rx_b) = harness.connect(b).await;

    // A 和 B 从未聊过；A 发出第一条消息
    let message = harness
        .service
        .send_message(send(a, chat, "hi"))
        .await
        .unwrap();

    // 惰性创建的摘要出现在双方的会话列表里
    let listing = harness.service.list_chats(a).await.unwrap();
    assert_eq!(listing.private_chats.len(), 1);
    assert_eq!(listing.private_chats[0].last_message_id, Some(message.id));
    // B 在线，列表条目应带上对端身份
    assert!(listing.private_chats[0].peer_profile.is_some());

    // 在线的 B 在同一因果步内收到 new_message
    let events = drain(&mut rx_b);
    assert!(events.iter().any(|event| matches!(
        event,
        ServerEvent::NewMessage { message: m } if m.content.as_str() == "hi"
    )));
}

#[tokio::test]
async fn offline_peer_recovers_message_via_history_page() {
    let harness = TestHarness::new();
    let (a, b) = (user(), user());
    let chat = ChatRef::private(a, b).unwrap();

    // B 没有任何活跃连接：投递被跳过，不重试
    harness
        .service
        .send_message(send(a, chat, "hi"))
        .await
        .unwrap();

    let page = harness.service.get_messages(b, chat, None, 50).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].content.as_str(), "hi");
}

#[tokio::test]
async fn non_member_group_send_is_rejected_without_side_effects() {
    let harness = TestHarness::new();
    let (a, b) = (user(), user());
    let chat = harness.group_with(&[a, b]).await;
    let outsider = user();

    let (_handle, mut rx_a) = harness.connect(a).await;

    let err = harness
        .service
        .send_message(send(outsider, chat, "intrude"))
        .await
        .unwrap_err();
    assert!(err.is_not_a_member());

    // 没有消息持久化，也没有广播
    let page = harness.service.get_messages(a, chat, None, 50).await.unwrap();
    assert!(page.is_empty());
    assert!(drain(&mut rx_a).is_empty());
}

#[tokio::test]
async fn send_to_deleted_group_is_chat_not_found() {
    let harness = TestHarness::new();
    let a = user();
    let chat = harness.group_with(&[a]).await;

    if let ChatRef::Group { group_id } = chat {
        harness.directory.remove(group_id).await;
    }

    let err = harness
        .service
        .send_message(send(a, chat, "anyone?"))
        .await
        .unwrap_err();
    assert!(err.is_chat_not_found());
}

#[tokio::test]
async fn group_message_reaches_all_connected_members_once_per_handle() {
    let harness = TestHarness::new();
    let (a, b, c) = (user(), user(), user());
    let chat = harness.group_with(&[a, b, c]).await;

    let (_ha, mut rx_a) = harness.connect(a).await;
    let (_hb1, mut rx_b1) = harness.connect(b).await;
    let (_hb2, mut rx_b2) = harness.connect(b).await; // B 的第二台设备

    harness
        .service
        .send_message(send(a, chat, "hello group"))
        .await
        .unwrap();

    for rx in [&mut rx_a, &mut rx_b1, &mut rx_b2] {
        let deliveries = drain(rx)
            .into_iter()
            .filter(|event| matches!(event, ServerEvent::NewMessage { .. }))
            .count();
        assert_eq!(deliveries, 1);
    }
}

#[tokio::test]
async fn typing_start_broadcasts_full_set_to_other_members() {
    let harness = TestHarness::new();
    let (a, b) = (user(), user());
    let chat = harness.group_with(&[a, b]).await;

    let (_ha, mut rx_a) = harness.connect(a).await;
    let (_hb, mut rx_b) = harness.connect(b).await;

    harness.service.typing_start(a, chat).await;

    let typing_of = |events: Vec<ServerEvent>| -> Vec<Vec<UserId>> {
        events
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::TypingUpdate { users, .. } => Some(users),
                _ => None,
            })
            .collect()
    };

    // 其他成员收到完整集合；发起者自己不收
    assert_eq!(typing_of(drain(&mut rx_b)), vec![vec![a]]);
    assert!(typing_of(drain(&mut rx_a)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn typing_expires_without_explicit_stop() {
    let harness = TestHarness::new();
    let (a, b) = (user(), user());
    let chat = harness.group_with(&[a, b]).await;

    let (_ha, _rx_a) = harness.connect(a).await;
    let (_hb, mut rx_b) = harness.connect(b).await;

    harness.service.typing_start(a, chat).await;

    // A 等待 6 秒，既不发送也不显式停止（超时 4 秒）
    tokio::time::advance(Duration::from_secs(6)).await;
    harness.service.sweep_expired_typing().await;

    let updates: Vec<Vec<UserId>> = drain(&mut rx_b)
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::TypingUpdate { users, .. } => Some(users),
            _ => None,
        })
        .collect();

    assert_eq!(updates, vec![vec![a], vec![]]);
}

#[tokio::test]
async fn send_implies_typing_stop() {
    let harness = TestHarness::new();
    let (a, b) = (user(), user());
    let chat = harness.group_with(&[a, b]).await;

    let (_ha, _rx_a) = harness.connect(a).await;
    let (_hb, mut rx_b) = harness.connect(b).await;

    harness.service.typing_start(a, chat).await;
    harness
        .service
        .send_message(send(a, chat, "done typing"))
        .await
        .unwrap();

    let last_typing = drain(&mut rx_b)
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::TypingUpdate { users, .. } => Some(users),
            _ => None,
        })
        .last();
    assert_eq!(last_typing, Some(vec![]));
}

#[tokio::test]
async fn disconnect_purges_typing_and_broadcasts_offline() {
    let harness = TestHarness::new();
    let (a, b) = (user(), user());
    let chat = harness.group_with(&[a, b]).await;

    let (handle_a, _rx_a) = harness.connect(a).await;
    let (_hb, mut rx_b) = harness.connect(b).await;

    harness.service.typing_start(a, chat).await;
    drain(&mut rx_b);

    harness.service.disconnect(a, handle_a.id()).await;

    let events = drain(&mut rx_b);
    assert!(events.iter().any(|event| matches!(
        event,
        ServerEvent::TypingUpdate { users, .. } if users.is_empty()
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        ServerEvent::PresenceChanged { user_id, is_online: false, last_seen: Some(_) } if *user_id == a
    )));

    // 断开处理完成后，打字集合不再包含没有连接的身份
    let err_free = harness.service.get_messages(b, chat, None, 10).await;
    assert!(err_free.is_ok());
}

#[tokio::test]
async fn disconnect_is_idempotent_and_multi_device_keeps_presence() {
    let harness = TestHarness::new();
    let (a, b) = (user(), user());
    let _chat = ChatRef::private(a, b).unwrap();

    let (h1, _rx1) = harness.connect(a).await;
    let (_h2, _rx2) = harness.connect(a).await;

    harness.service.disconnect(a, h1.id()).await;
    // 还剩一台设备在线
    assert!(harness.service.presence().is_online(a).await);

    // 对同一句柄重复断开是无操作
    harness.service.disconnect(a, h1.id()).await;
    assert!(harness.service.presence().is_online(a).await);
}

#[tokio::test]
async fn concurrent_sends_from_both_sides_lose_nothing() {
    let harness = TestHarness::new();
    let (a, b) = (user(), user());
    let chat = ChatRef::private(a, b).unwrap();

    const PER_SENDER: usize = 10;

    let tasks: Vec<_> = [(a, "a"), (b, "b")]
        .into_iter()
        .map(|(sender, tag)| {
            let service = harness.service.clone();
            tokio::spawn(async move {
                for i in 0..PER_SENDER {
                    service
                        .send_message(send(sender, chat, &format!("{tag}{i}")))
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    futures::future::join_all(tasks)
        .await
        .into_iter()
        .for_each(|result| result.unwrap());

    let page = harness
        .service
        .get_messages(a, chat, None, 100)
        .await
        .unwrap();

    // 没有丢写
    assert_eq!(page.len(), PER_SENDER * 2);
    let unique: HashSet<&str> = page.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(unique.len(), PER_SENDER * 2);

    // 全序与每个发送者自己的本地顺序一致
    for tag in ["a", "b"] {
        let own: Vec<&str> = page
            .iter()
            .map(|m| m.content.as_str())
            .filter(|c| c.starts_with(tag))
            .collect();
        let expected: Vec<String> = (0..PER_SENDER).map(|i| format!("{tag}{i}")).collect();
        assert_eq!(own, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn read_receipts_are_per_identity_monotonic() {
    let harness = TestHarness::new();
    let (a, b) = (user(), user());
    let chat = ChatRef::private(a, b).unwrap();

    let message = harness
        .service
        .send_message(send(a, chat, "read me"))
        .await
        .unwrap();

    harness.service.mark_read(b, message.id).await.unwrap();
    harness.service.mark_read(b, message.id).await.unwrap();

    let page = harness.service.get_messages(a, chat, None, 10).await.unwrap();
    assert_eq!(page[0].read_by.len(), 1);
    assert_eq!(page[0].read_by[0].user_id, b);
}

#[tokio::test]
async fn only_the_sender_may_delete_a_message() {
    let harness = TestHarness::new();
    let (a, b) = (user(), user());
    let chat = ChatRef::private(a, b).unwrap();

    let message = harness
        .service
        .send_message(send(a, chat, "oops"))
        .await
        .unwrap();

    assert!(harness.service.delete_message(b, message.id).await.is_err());

    harness.service.delete_message(a, message.id).await.unwrap();
    // 幂等：重复删除得到同样的最终状态
    harness.service.delete_message(a, message.id).await.unwrap();

    let page = harness.service.get_messages(b, chat, None, 10).await.unwrap();
    assert!(page.is_empty());
}

#[tokio::test]
async fn send_succeeds_when_recipient_channel_is_closed() {
    let harness = TestHarness::new();
    let (a, b) = (user(), user());
    let chat = ChatRef::private(a, b).unwrap();

    // B 的会话任务已消失但句柄仍在注册表里：
    // 推送失败只吞掉记日志，发送本身不受影响
    let (_hb, rx_b) = harness.connect(b).await;
    drop(rx_b);

    let message = harness
        .service
        .send_message(send(a, chat, "hi"))
        .await
        .unwrap();

    // 消息已落盘，可经历史读取恢复
    let page = harness.service.get_messages(b, chat, None, 10).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, message.id);
}

#[tokio::test]
async fn chat_lock_entries_are_reclaimed_after_send() {
    let harness = TestHarness::new();
    let (a, b, c) = (user(), user(), user());

    for peer in [b, c] {
        let chat = ChatRef::private(a, peer).unwrap();
        harness
            .service
            .send_message(send(a, chat, "hi"))
            .await
            .unwrap();
    }

    // 空闲会话不在锁表里积累条目
    assert_eq!(harness.service.chat_lock_count().await, 0);
}

#[tokio::test]
async fn history_read_requires_membership() {
    let harness = TestHarness::new();
    let (a, b) = (user(), user());
    let chat = harness.group_with(&[a, b]).await;
    let outsider = user();

    let err = harness
        .service
        .get_messages(outsider, chat, None, 10)
        .await
        .unwrap_err();
    assert!(err.is_not_a_member());
}
