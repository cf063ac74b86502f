//! Postgres 仓储实现。

use std::collections::HashMap;
use std::sync::Arc;

use application::{
    ApplicationError, GroupDirectory, MessageRepository, PrivateChatSummaryRepository,
    RepositoryResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    ChatRef, GroupId, GroupSummary, Message, MessageContent, MessageId, MessageKind, NewMessage,
    PairKey, PrivateChatSummary, ReadReceipt, RepositoryError, Timestamp, UserId,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    RepositoryError::storage(err.to_string())
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

fn map_directory_err(err: sqlx::Error) -> ApplicationError {
    ApplicationError::infrastructure(err.to_string())
}

const MESSAGE_COLUMNS: &str =
    "id, chat_type, pair_lo, pair_hi, group_id, sender_id, content, kind, created_at, is_deleted";

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: i64,
    chat_type: String,
    pair_lo: Option<Uuid>,
    pair_hi: Option<Uuid>,
    group_id: Option<Uuid>,
    sender_id: Uuid,
    content: String,
    kind: String,
    created_at: DateTime<Utc>,
    is_deleted: bool,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let chat = match value.chat_type.as_str() {
            "private" => {
                let (lo, hi) = value
                    .pair_lo
                    .zip(value.pair_hi)
                    .ok_or_else(|| invalid_data("private message without pair columns"))?;
                ChatRef::private(UserId::from(lo), UserId::from(hi))
                    .map_err(|err| invalid_data(err.to_string()))?
            }
            "group" => {
                let group_id = value
                    .group_id
                    .ok_or_else(|| invalid_data("group message without group_id"))?;
                ChatRef::group(GroupId::from(group_id))
            }
            other => return Err(invalid_data(format!("unknown chat_type: {other}"))),
        };

        let kind = parse_kind(&value.kind)?;
        let content =
            MessageContent::new(value.content).map_err(|err| invalid_data(err.to_string()))?;

        let mut message = Message::new(
            MessageId::from(value.id),
            UserId::from(value.sender_id),
            chat,
            content,
            kind,
            value.created_at,
        )
        .map_err(|err| invalid_data(err.to_string()))?;
        message.deleted = value.is_deleted;
        Ok(message)
    }
}

fn parse_kind(value: &str) -> Result<MessageKind, RepositoryError> {
    match value {
        "text" => Ok(MessageKind::Text),
        "image" => Ok(MessageKind::Image),
        "file" => Ok(MessageKind::File),
        other => Err(invalid_data(format!("unknown message kind: {other}"))),
    }
}

fn kind_as_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Image => "image",
        MessageKind::File => "file",
    }
}

/// 会话引用拆成存储列。私聊键已排序，直接落 (pair_lo, pair_hi)。
fn chat_columns(chat: &ChatRef) -> (&'static str, Option<Uuid>, Option<Uuid>, Option<Uuid>) {
    match chat {
        ChatRef::Private { pair } => (
            "private",
            Some(Uuid::from(pair.lo())),
            Some(Uuid::from(pair.hi())),
            None,
        ),
        ChatRef::Group { group_id } => ("group", None, None, Some(Uuid::from(*group_id))),
    }
}

#[derive(Debug, FromRow)]
struct ReadRecord {
    message_id: i64,
    user_id: Uuid,
    read_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct SummaryRecord {
    pair_lo: Uuid,
    pair_hi: Uuid,
    last_message_id: Option<i64>,
    last_activity_at: DateTime<Utc>,
}

impl TryFrom<SummaryRecord> for PrivateChatSummary {
    type Error = RepositoryError;

    fn try_from(value: SummaryRecord) -> Result<Self, Self::Error> {
        let pair = PairKey::of(UserId::from(value.pair_lo), UserId::from(value.pair_hi))
            .map_err(|err| invalid_data(err.to_string()))?;
        Ok(PrivateChatSummary {
            pair,
            last_message_id: value.last_message_id.map(MessageId::from),
            last_activity_at: value.last_activity_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct GroupRecord {
    id: Uuid,
    name: String,
    admin_id: Uuid,
}

/// 消息日志的 Postgres 实现。id 由 BIGSERIAL 分配，兼作游标。
#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn attach_receipts(&self, messages: &mut [Message]) -> RepositoryResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = messages.iter().map(|m| i64::from(m.id)).collect();
        let records = sqlx::query_as::<_, ReadRecord>(
            r#"
            SELECT message_id, user_id, read_at
            FROM message_reads
            WHERE message_id = ANY($1)
            ORDER BY read_at
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut by_message: HashMap<i64, Vec<ReadReceipt>> = HashMap::new();
        for record in records {
            by_message
                .entry(record.message_id)
                .or_default()
                .push(ReadReceipt {
                    user_id: UserId::from(record.user_id),
                    read_at: record.read_at,
                });
        }
        for message in messages.iter_mut() {
            if let Some(receipts) = by_message.remove(&i64::from(message.id)) {
                message.read_by = receipts;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn append(&self, new_message: NewMessage, at: Timestamp) -> RepositoryResult<Message> {
        let (chat_type, pair_lo, pair_hi, group_id) = chat_columns(&new_message.chat);

        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            INSERT INTO messages (chat_type, pair_lo, pair_hi, group_id, sender_id, content, kind, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {MESSAGE_COLUMNS}
            "#,
        ))
        .bind(chat_type)
        .bind(pair_lo)
        .bind(pair_hi)
        .bind(group_id)
        .bind(Uuid::from(new_message.sender_id))
        .bind(new_message.content.as_str())
        .bind(kind_as_str(new_message.kind))
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Message::try_from(record)
    }

    async fn find_by_id(&self, id: MessageId) -> RepositoryResult<Option<Message>> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1",
        ))
        .bind(i64::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        match record {
            Some(record) => {
                let mut messages = vec![Message::try_from(record)?];
                self.attach_receipts(&mut messages).await?;
                Ok(messages.pop())
            }
            None => Ok(None),
        }
    }

    async fn page(
        &self,
        chat: &ChatRef,
        before: Option<MessageId>,
        limit: u32,
    ) -> RepositoryResult<Vec<Message>> {
        let cursor = before.map(i64::from);

        // 最新在前取 limit 条，返回时翻转为最旧在前
        let records: Vec<MessageRecord> = match chat {
            ChatRef::Private { pair } => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {MESSAGE_COLUMNS}
                    FROM messages
                    WHERE chat_type = 'private' AND pair_lo = $1 AND pair_hi = $2
                      AND is_deleted = FALSE
                      AND ($3::BIGINT IS NULL OR id < $3)
                    ORDER BY created_at DESC, id DESC
                    LIMIT $4
                    "#,
                ))
                .bind(Uuid::from(pair.lo()))
                .bind(Uuid::from(pair.hi()))
                .bind(cursor)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            ChatRef::Group { group_id } => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {MESSAGE_COLUMNS}
                    FROM messages
                    WHERE chat_type = 'group' AND group_id = $1
                      AND is_deleted = FALSE
                      AND ($2::BIGINT IS NULL OR id < $2)
                    ORDER BY created_at DESC, id DESC
                    LIMIT $3
                    "#,
                ))
                .bind(Uuid::from(*group_id))
                .bind(cursor)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(map_sqlx_err)?;

        let mut messages = records
            .into_iter()
            .map(Message::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        self.attach_receipts(&mut messages).await?;
        Ok(messages)
    }

    async fn mark_deleted(&self, id: MessageId) -> RepositoryResult<()> {
        let result = sqlx::query("UPDATE messages SET is_deleted = TRUE WHERE id = $1")
            .bind(i64::from(id))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn mark_read(
        &self,
        id: MessageId,
        reader: UserId,
        at: Timestamp,
    ) -> RepositoryResult<()> {
        // 冲突即无操作，保留最早的回执时间
        let result = sqlx::query(
            r#"
            INSERT INTO message_reads (message_id, user_id, read_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (message_id, user_id) DO NOTHING
            "#,
        )
        .bind(i64::from(id))
        .bind(Uuid::from(reader))
        .bind(at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                Err(RepositoryError::NotFound)
            }
            Err(err) => Err(map_sqlx_err(err)),
        }
    }
}

/// 私聊摘要的 Postgres 实现。
#[derive(Clone)]
pub struct PgPrivateChatSummaries {
    pool: PgPool,
}

impl PgPrivateChatSummaries {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PrivateChatSummaryRepository for PgPrivateChatSummaries {
    async fn record_activity(
        &self,
        pair: PairKey,
        message_id: MessageId,
        at: Timestamp,
    ) -> RepositoryResult<PrivateChatSummary> {
        let record = sqlx::query_as::<_, SummaryRecord>(
            r#"
            INSERT INTO private_chat_summaries (pair_lo, pair_hi, last_message_id, last_activity_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (pair_lo, pair_hi)
            DO UPDATE SET last_message_id = EXCLUDED.last_message_id,
                          last_activity_at = EXCLUDED.last_activity_at
            RETURNING pair_lo, pair_hi, last_message_id, last_activity_at
            "#,
        )
        .bind(Uuid::from(pair.lo()))
        .bind(Uuid::from(pair.hi()))
        .bind(i64::from(message_id))
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        PrivateChatSummary::try_from(record)
    }

    async fn find(&self, pair: PairKey) -> RepositoryResult<Option<PrivateChatSummary>> {
        let record = sqlx::query_as::<_, SummaryRecord>(
            r#"
            SELECT pair_lo, pair_hi, last_message_id, last_activity_at
            FROM private_chat_summaries
            WHERE pair_lo = $1 AND pair_hi = $2
            "#,
        )
        .bind(Uuid::from(pair.lo()))
        .bind(Uuid::from(pair.hi()))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(PrivateChatSummary::try_from).transpose()
    }

    async fn list_for_user(&self, user_id: UserId) -> RepositoryResult<Vec<PrivateChatSummary>> {
        let records = sqlx::query_as::<_, SummaryRecord>(
            r#"
            SELECT pair_lo, pair_hi, last_message_id, last_activity_at
            FROM private_chat_summaries
            WHERE pair_lo = $1 OR pair_hi = $1
            ORDER BY last_activity_at DESC, pair_lo
            "#,
        )
        .bind(Uuid::from(user_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records
            .into_iter()
            .map(PrivateChatSummary::try_from)
            .collect()
    }
}

/// 群组目录的 Postgres 实现。成员写入由外部审批协作方负责，这里只读。
#[derive(Clone)]
pub struct PgGroupDirectory {
    pool: PgPool,
}

impl PgGroupDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn members_by_group(
        &self,
        group_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<Uuid>>, ApplicationError> {
        let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
            "SELECT group_id, user_id FROM group_members WHERE group_id = ANY($1)",
        )
        .bind(group_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(map_directory_err)?;

        let mut by_group: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for (group_id, user_id) in rows {
            by_group.entry(group_id).or_default().push(user_id);
        }
        Ok(by_group)
    }
}

fn build_summary(record: GroupRecord, members: Vec<Uuid>) -> GroupSummary {
    GroupSummary {
        id: GroupId::from(record.id),
        name: record.name,
        member_ids: members.into_iter().map(UserId::from).collect(),
        admin_id: UserId::from(record.admin_id),
    }
}

#[async_trait]
impl GroupDirectory for PgGroupDirectory {
    async fn members_of(
        &self,
        group_id: GroupId,
    ) -> Result<Option<GroupSummary>, ApplicationError> {
        let record = sqlx::query_as::<_, GroupRecord>(
            "SELECT id, name, admin_id FROM groups WHERE id = $1 AND is_deleted = FALSE",
        )
        .bind(Uuid::from(group_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_directory_err)?;

        let Some(record) = record else {
            return Ok(None);
        };
        let mut members = self.members_by_group(&[record.id]).await?;
        let member_ids = members.remove(&record.id).unwrap_or_default();
        Ok(Some(build_summary(record, member_ids)))
    }

    async fn groups_of(&self, user_id: UserId) -> Result<Vec<GroupSummary>, ApplicationError> {
        let records = sqlx::query_as::<_, GroupRecord>(
            r#"
            SELECT g.id, g.name, g.admin_id
            FROM groups g
            JOIN group_members m ON m.group_id = g.id
            WHERE m.user_id = $1 AND g.is_deleted = FALSE
            "#,
        )
        .bind(Uuid::from(user_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_directory_err)?;

        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let mut members = self.members_by_group(&ids).await?;

        Ok(records
            .into_iter()
            .map(|record| {
                let member_ids = members.remove(&record.id).unwrap_or_default();
                build_summary(record, member_ids)
            })
            .collect())
    }

    async fn is_admin(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<bool, ApplicationError> {
        let admin_id: Option<(Uuid,)> = sqlx::query_as(
            "SELECT admin_id FROM groups WHERE id = $1 AND is_deleted = FALSE",
        )
        .bind(Uuid::from(group_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_directory_err)?;

        match admin_id {
            Some((admin_id,)) => Ok(UserId::from(admin_id) == user_id),
            None => Err(domain::DomainError::ChatNotFound.into()),
        }
    }
}

/// 全部 Postgres 仓储的聚合入口。
#[derive(Clone)]
pub struct PgStorage {
    pub pool: PgPool,
    pub messages: Arc<PgMessageRepository>,
    pub summaries: Arc<PgPrivateChatSummaries>,
    pub groups: Arc<PgGroupDirectory>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            messages: Arc::new(PgMessageRepository::new(pool.clone())),
            summaries: Arc::new(PgPrivateChatSummaries::new(pool.clone())),
            groups: Arc::new(PgGroupDirectory::new(pool.clone())),
            pool,
        }
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
