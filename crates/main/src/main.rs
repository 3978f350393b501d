//! 主应用程序入口
//!
//! 读取配置、装配存储与服务，启动 Axum Web API 与后台任务。

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use application::{AggregateReconciler, Clock, SystemClock};
use config::AppConfig;
use infrastructure::Infrastructure;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("加载配置失败")?;
    tracing::info!(config = %config.sanitize(), "配置已加载");

    let infrastructure = Infrastructure::connect(&config)
        .await
        .context("初始化存储失败")?;
    let conversations = infrastructure.conversations.clone();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState::build(&config, infrastructure, clock);

    // 后台任务：输入状态过期与聚合修复
    let sweeper = state
        .hub
        .spawn_typing_sweeper(Duration::from_millis(config.realtime.typing_sweep_interval_ms));
    let reconciler = Arc::new(AggregateReconciler::new(conversations))
        .spawn(Duration::from_secs(config.realtime.reconcile_interval_secs));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("无法监听 {addr}"))?;
    tracing::info!("会话消息服务启动在 http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    reconciler.abort();
    tracing::info!("服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "无法监听退出信号");
        std::future::pending::<()>().await;
    }
    tracing::info!("收到退出信号");
}
