//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl Drop for MetricsHandle {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    // 保存到全局，供其他地方获取指标快照
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册管道指标的描述，出现在 /metrics 的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "ingest_records_total",
        "Storage event records seen by ingest, by outcome"
    );
    metrics::describe_counter!(
        "queue_messages_published_total",
        "Notifications published to the durable queue"
    );
    metrics::describe_counter!("queue_poll_cycles_total", "Completed queue polling cycles");
    metrics::describe_counter!(
        "notifications_delivered_total",
        "Notifications delivered to the chat channel and deleted from the queue"
    );
    metrics::describe_counter!(
        "notifications_failed_total",
        "Notification processing attempts that left the message queued"
    );
    metrics::describe_counter!(
        "queue_receive_errors_total",
        "Queue receive calls that failed before any message was fetched"
    );
    metrics::describe_counter!(
        "queue_messages_dead_lettered_total",
        "Messages forwarded to the dead-letter queue"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一条存储事件记录的处理结果（processed / skipped / error）
#[inline]
pub fn record_ingest_record(outcome: &str) {
    metrics::counter!("ingest_records_total", "outcome" => outcome.to_string()).increment(1);
}

#[inline]
pub fn record_published(environment: &str) {
    metrics::counter!(
        "queue_messages_published_total",
        "environment" => environment.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_poll_cycle(fetched: usize) {
    metrics::counter!("queue_poll_cycles_total").increment(1);
    metrics::histogram!("queue_poll_batch_size").record(fetched as f64);
}

/// 拉取调用本身失败，与单条消息的处理失败分开统计
#[inline]
pub fn record_receive_failed() {
    metrics::counter!("queue_receive_errors_total").increment(1);
}

#[inline]
pub fn record_delivered() {
    metrics::counter!("notifications_delivered_total").increment(1);
}

#[inline]
pub fn record_failed(reason: &str) {
    metrics::counter!("notifications_failed_total", "reason" => reason.to_string()).increment(1);
}

#[inline]
pub fn record_dead_lettered() {
    metrics::counter!("queue_messages_dead_lettered_total").increment(1);
}
