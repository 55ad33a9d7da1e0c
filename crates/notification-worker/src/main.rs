//! 通知工作者服务
//!
//! 常驻进程：轮询队列中的图片上传通知并发送到 Discord 频道。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notification_worker::lifecycle::{WorkerCredentials, WorkerLifecycle};
use notification_worker::sender::DiscordClient;
use relay_shared::config::AppConfig;
use relay_shared::observability;
use relay_shared::queue::SqsQueue;
use relay_shared::secrets::SsmParameterStore;
use tokio::signal;
use tracing::info;

const SERVICE_NAME: &str = "notification-worker";

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;
    let _guard = observability::init(&config.service_name, &config.observability).await?;
    config.validate()?;

    info!(
        environment = %config.environment,
        queue_url = %config.queue.url,
        "Starting notification-worker..."
    );

    let sdk_config = aws_config::load_from_env().await;
    let parameters = SsmParameterStore::new(aws_sdk_ssm::Client::new(&sdk_config));
    let credentials = WorkerCredentials::resolve(&config, &parameters).await?;

    let sqs = aws_sdk_sqs::Client::new(&sdk_config);
    let queue = Arc::new(SqsQueue::new(sqs.clone(), config.queue.url.clone()));
    let chat = Arc::new(DiscordClient::new(
        config.discord.api_base.clone(),
        Duration::from_secs(config.discord.request_timeout_seconds),
    )?);

    let dead_letter_url = config.queue.dead_letter_url.clone();
    let mut lifecycle = WorkerLifecycle::new(config, queue, chat);
    if let Some(url) = dead_letter_url.filter(|u| !u.trim().is_empty()) {
        info!(dead_letter_url = %url, "缺少图片地址的消息将转投死信队列");
        lifecycle = lifecycle.with_dead_letter(Arc::new(SqsQueue::new(sqs, url)));
    }

    lifecycle.start(&credentials).await?;

    shutdown_signal().await;
    lifecycle.shutdown().await;

    info!("Service shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
///
/// 监听 Ctrl+C 和 SIGTERM 信号
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "无法监听 Ctrl+C 信号");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "无法监听 SIGTERM 信号");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
