use std::sync::Arc;

use config::DatabaseConfig;
use thiserror::Error;

use crate::migrations::MIGRATOR;
use crate::repository::{create_pg_pool, PgStorage};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// 基础设施装配入口：连接池、迁移、仓储。
#[derive(Clone)]
pub struct Infrastructure {
    pub storage: Arc<PgStorage>,
}

impl Infrastructure {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, InfrastructureError> {
        let pool = create_pg_pool(&config.url, config.max_connections).await?;
        MIGRATOR.run(&pool).await?;

        tracing::info!(max_connections = config.max_connections, "数据库已连接，迁移完成");

        Ok(Self {
            storage: Arc::new(PgStorage::new(pool)),
        })
    }
}
