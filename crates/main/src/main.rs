//! 主应用程序入口
//!
//! 启动 Axum Web API 服务。

use std::sync::Arc;
use std::time::Duration;

use application::{
    services::{ChatService, ChatServiceDependencies},
    ConnectionRegistry, SystemClock, TypingTracker,
};
use config::AppConfig;
use infrastructure::Infrastructure;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env_with_defaults();

    tracing::info!(
        "连接数据库: {}",
        config.database.url.split('@').last().unwrap_or("unknown")
    );

    // 连接池 + 迁移 + Postgres 仓储
    let infra = Infrastructure::connect(&config.database).await?;

    // 应用层装配
    let clock: Arc<dyn application::Clock> = Arc::new(SystemClock);
    let registry = Arc::new(ConnectionRegistry::new(clock.clone()));
    let typing = Arc::new(TypingTracker::new(Duration::from_secs(
        config.realtime.typing_idle_timeout_secs,
    )));

    let chat_service = Arc::new(ChatService::new(ChatServiceDependencies {
        registry,
        groups: infra.storage.groups.clone(),
        messages: infra.storage.messages.clone(),
        summaries: infra.storage.summaries.clone(),
        typing,
        clock,
    }));

    // 打字集合的超时清扫任务
    let sweeper = chat_service.clone();
    let sweep_interval = Duration::from_secs(config.realtime.typing_sweep_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            sweeper.sweep_expired_typing().await;
        }
    });

    let jwt_service = Arc::new(JwtService::new(&config.jwt));
    let state = AppState::new(chat_service, jwt_service);

    // 启动 Web 服务器
    let app = router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("消息服务器启动在 http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
