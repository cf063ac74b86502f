//! 内嵌数据库迁移。
//!
//! SQL 文件位于仓库根的 `migrations/` 目录，编译期打包进二进制，
//! 启动时由 [`crate::builder::Infrastructure`] 执行。

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");
