//! 基础设施层实现。
//!
//! 提供消息日志、私聊摘要、群组目录的 Postgres 适配器，
//! 实现应用层定义的持久化接口。

pub mod builder;
pub mod migrations;
pub mod repository;

pub use builder::{Infrastructure, InfrastructureError};
pub use migrations::MIGRATOR;
pub use repository::{
    create_pg_pool, PgGroupDirectory, PgMessageRepository, PgPrivateChatSummaries, PgStorage,
};
