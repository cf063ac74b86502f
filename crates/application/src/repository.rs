//! 持久化契约。
//!
//! 消息日志是按会话全序（(created_at, id)）的追加型存储，
//! 支持基于游标的倒序分页读取。私聊摘要惰性创建。

use domain::{
    ChatRef, Message, MessageId, NewMessage, PairKey, PrivateChatSummary, RepositoryError,
    Timestamp, UserId,
};

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait::async_trait]
pub trait MessageRepository: Send + Sync {
    /// 追加一条消息，由存储分配单调 id。对内容从不拒绝
    /// （校验是外部协作方的职责）。
    async fn append(&self, new_message: NewMessage, at: Timestamp) -> RepositoryResult<Message>;

    async fn find_by_id(&self, id: MessageId) -> RepositoryResult<Option<Message>>;

    /// 游标分页：返回严格早于 `before` 的至多 `limit` 条消息，
    /// 内部按最新在前筛选，返回时按最旧在前。游标基于消息 id
    /// 而不是偏移量，在并发插入下保持正确。软删除的消息被排除。
    async fn page(
        &self,
        chat: &ChatRef,
        before: Option<MessageId>,
        limit: u32,
    ) -> RepositoryResult<Vec<Message>>;

    /// 软删除：记录保留以维持 id 与排序稳定。幂等。
    async fn mark_deleted(&self, id: MessageId) -> RepositoryResult<()>;

    /// 追加已读回执。按身份单调：同一用户重复标记是无操作，
    /// 不产生重复条目。
    async fn mark_read(&self, id: MessageId, reader: UserId, at: Timestamp)
        -> RepositoryResult<()>;
}

#[async_trait::async_trait]
pub trait PrivateChatSummaryRepository: Send + Sync {
    /// 记录一次消息活动；摘要不存在时惰性创建。
    /// 确定性 PairKey 保证每个无序对至多一条摘要。
    async fn record_activity(
        &self,
        pair: PairKey,
        message_id: MessageId,
        at: Timestamp,
    ) -> RepositoryResult<PrivateChatSummary>;

    async fn find(&self, pair: PairKey) -> RepositoryResult<Option<PrivateChatSummary>>;

    /// 某用户的全部私聊摘要，按最近活动倒序。
    async fn list_for_user(&self, user_id: UserId) -> RepositoryResult<Vec<PrivateChatSummary>>;
}

/// 内存实现（用于测试和单机部署）。
pub mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicI64, Ordering};
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct InMemoryMessageStore {
        next_id: AtomicI64,
        /// 按 id 索引；id 即全局日志偏移
        messages: RwLock<BTreeMap<i64, Message>>,
    }

    impl InMemoryMessageStore {
        pub fn new() -> Self {
            Self {
                next_id: AtomicI64::new(1),
                messages: RwLock::new(BTreeMap::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl MessageRepository for InMemoryMessageStore {
        async fn append(
            &self,
            new_message: NewMessage,
            at: Timestamp,
        ) -> RepositoryResult<Message> {
            let mut messages = self.messages.write().await;
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let message = Message::new(
                MessageId::new(id),
                new_message.sender_id,
                new_message.chat,
                new_message.content,
                new_message.kind,
                at,
            )
            .map_err(|err| RepositoryError::storage(err.to_string()))?;
            messages.insert(id, message.clone());
            Ok(message)
        }

        async fn find_by_id(&self, id: MessageId) -> RepositoryResult<Option<Message>> {
            let messages = self.messages.read().await;
            Ok(messages.get(&id.0).cloned())
        }

        async fn page(
            &self,
            chat: &ChatRef,
            before: Option<MessageId>,
            limit: u32,
        ) -> RepositoryResult<Vec<Message>> {
            let messages = self.messages.read().await;
            let mut selected: Vec<Message> = messages
                .values()
                .filter(|m| m.chat == *chat && !m.deleted)
                .filter(|m| before.map_or(true, |cursor| m.id < cursor))
                .cloned()
                .collect();

            // 最新在前截断，返回时翻转为最旧在前
            selected.sort_by_key(|m| std::cmp::Reverse(m.order_key()));
            selected.truncate(limit as usize);
            selected.reverse();
            Ok(selected)
        }

        async fn mark_deleted(&self, id: MessageId) -> RepositoryResult<()> {
            let mut messages = self.messages.write().await;
            let message = messages.get_mut(&id.0).ok_or(RepositoryError::NotFound)?;
            message.mark_deleted();
            Ok(())
        }

        async fn mark_read(
            &self,
            id: MessageId,
            reader: UserId,
            at: Timestamp,
        ) -> RepositoryResult<()> {
            let mut messages = self.messages.write().await;
            let message = messages.get_mut(&id.0).ok_or(RepositoryError::NotFound)?;
            message.mark_read(reader, at);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct InMemoryPrivateChatSummaries {
        summaries: RwLock<HashMap<PairKey, PrivateChatSummary>>,
    }

    impl InMemoryPrivateChatSummaries {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait::async_trait]
    impl PrivateChatSummaryRepository for InMemoryPrivateChatSummaries {
        async fn record_activity(
            &self,
            pair: PairKey,
            message_id: MessageId,
            at: Timestamp,
        ) -> RepositoryResult<PrivateChatSummary> {
            let mut summaries = self.summaries.write().await;
            let summary = summaries
                .entry(pair)
                .or_insert_with(|| PrivateChatSummary::new(pair, at));
            summary.record_message(message_id, at);
            Ok(summary.clone())
        }

        async fn find(&self, pair: PairKey) -> RepositoryResult<Option<PrivateChatSummary>> {
            let summaries = self.summaries.read().await;
            Ok(summaries.get(&pair).cloned())
        }

        async fn list_for_user(
            &self,
            user_id: UserId,
        ) -> RepositoryResult<Vec<PrivateChatSummary>> {
            let summaries = self.summaries.read().await;
            let mut listed: Vec<PrivateChatSummary> = summaries
                .values()
                .filter(|s| s.pair.contains(user_id))
                .cloned()
                .collect();
            listed.sort_by_key(|s| std::cmp::Reverse((s.last_activity_at, s.pair.lo())));
            Ok(listed)
        }
    }
}
