//! 房间解析。
//!
//! 给定会话引用返回当前参与者集合。私聊参与者直接编码在
//! 引用里，O(1) 解析；群聊委托给成员协作方（群组 CRUD 由
//! 其独占，这里只做同步查询）。

use std::collections::HashSet;
use std::sync::Arc;

use domain::{ChatRef, DomainError, GroupId, GroupSummary, UserId};

use crate::error::ApplicationError;

/// 成员协作方接口。
///
/// 群组成员审批流程在本核心之外，这里只消费其状态。
#[async_trait::async_trait]
pub trait GroupDirectory: Send + Sync {
    /// 群组摘要；不存在或已删除返回 None。
    async fn members_of(&self, group_id: GroupId)
        -> Result<Option<GroupSummary>, ApplicationError>;

    /// 某用户所在的全部群组。
    async fn groups_of(&self, user_id: UserId) -> Result<Vec<GroupSummary>, ApplicationError>;

    async fn is_admin(&self, group_id: GroupId, user_id: UserId)
        -> Result<bool, ApplicationError>;
}

/// 房间解析器。
#[derive(Clone)]
pub struct RoomResolver {
    groups: Arc<dyn GroupDirectory>,
}

impl RoomResolver {
    pub fn new(groups: Arc<dyn GroupDirectory>) -> Self {
        Self { groups }
    }

    /// 解析参与者集合。
    ///
    /// 已删除或不存在的群组返回 `ChatNotFound` 而不是空集合，
    /// 以区分"没有可投递的人"和"房间已不存在"。
    pub async fn participants_of(
        &self,
        chat: &ChatRef,
    ) -> Result<HashSet<UserId>, ApplicationError> {
        match chat {
            ChatRef::Private { pair } => Ok(pair.participants().into_iter().collect()),
            ChatRef::Group { group_id } => {
                let summary = self
                    .groups
                    .members_of(*group_id)
                    .await?
                    .ok_or(DomainError::ChatNotFound)?;
                Ok(summary.member_ids)
            }
        }
    }

    /// 解析参与者并校验发送者在集合内，否则 `NotAMember`。
    pub async fn resolve_for_sender(
        &self,
        sender_id: UserId,
        chat: &ChatRef,
    ) -> Result<HashSet<UserId>, ApplicationError> {
        let participants = self.participants_of(chat).await?;
        if !participants.contains(&sender_id) {
            return Err(DomainError::NotAMember.into());
        }
        Ok(participants)
    }
}

/// 内存实现的群组目录（用于测试和单机部署）。
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct InMemoryGroupDirectory {
        groups: RwLock<HashMap<GroupId, GroupSummary>>,
    }

    impl InMemoryGroupDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn upsert(&self, summary: GroupSummary) {
            let mut groups = self.groups.write().await;
            groups.insert(summary.id, summary);
        }

        pub async fn remove(&self, group_id: GroupId) {
            let mut groups = self.groups.write().await;
            groups.remove(&group_id);
        }
    }

    #[async_trait::async_trait]
    impl GroupDirectory for InMemoryGroupDirectory {
        async fn members_of(
            &self,
            group_id: GroupId,
        ) -> Result<Option<GroupSummary>, ApplicationError> {
            let groups = self.groups.read().await;
            Ok(groups.get(&group_id).cloned())
        }

        async fn groups_of(&self, user_id: UserId) -> Result<Vec<GroupSummary>, ApplicationError> {
            let groups = self.groups.read().await;
            Ok(groups
                .values()
                .filter(|g| g.is_member(user_id))
                .cloned()
                .collect())
        }

        async fn is_admin(
            &self,
            group_id: GroupId,
            user_id: UserId,
        ) -> Result<bool, ApplicationError> {
            let groups = self.groups.read().await;
            match groups.get(&group_id) {
                Some(summary) => Ok(summary.is_admin(user_id)),
                None => Err(DomainError::ChatNotFound.into()),
            }
        }
    }
}
