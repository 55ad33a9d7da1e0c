//! 队列轮询
//!
//! 按固定间隔从队列长轮询拉取一批消息，逐条交给分发器处理。
//! 拉取周期之间互不重叠：上一轮未完成时新的调度直接忽略。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use relay_shared::config::QueueConfig;
use relay_shared::observability::metrics;
use relay_shared::queue::MessageQueue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DeliveryDispatcher, DispatchOutcome};

/// 一次调度的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// 上一轮仍在进行，本次调度被忽略
    AlreadyPolling,
    /// 轮询器已停止
    Stopped,
    /// 拉取出错，本轮结束
    ReceiveFailed,
    Empty,
    /// 本批消息全部处理完毕
    Drained {
        fetched: usize,
        delivered: usize,
        failed: usize,
    },
}

/// 拉取周期结束时复位 polling 标记，处理过程中 panic 也不会卡死轮询器
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct QueuePoller {
    queue: Arc<dyn MessageQueue>,
    dispatcher: Arc<DeliveryDispatcher>,
    max_messages: i32,
    wait_time_seconds: i32,
    polling: AtomicBool,
    running: AtomicBool,
}

impl QueuePoller {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        dispatcher: Arc<DeliveryDispatcher>,
        max_messages: i32,
        wait_time_seconds: i32,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            max_messages,
            wait_time_seconds,
            polling: AtomicBool::new(false),
            running: AtomicBool::new(true),
        }
    }

    pub fn from_config(
        config: &QueueConfig,
        queue: Arc<dyn MessageQueue>,
        dispatcher: Arc<DeliveryDispatcher>,
    ) -> Self {
        Self::new(queue, dispatcher, config.receive_batch(), config.wait_time())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    /// 停止后不再开始新的拉取周期，正在进行的一轮会把当前批次处理完
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// 执行一轮拉取
    pub async fn poll_once(&self) -> PollOutcome {
        if !self.is_running() {
            return PollOutcome::Stopped;
        }

        if self
            .polling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("上一轮拉取尚未完成，忽略本次调度");
            return PollOutcome::AlreadyPolling;
        }
        let _guard = CycleGuard(&self.polling);

        let messages = match self
            .queue
            .receive(self.max_messages, self.wait_time_seconds)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "从队列拉取消息失败");
                metrics::record_receive_failed();
                return PollOutcome::ReceiveFailed;
            }
        };

        let fetched = messages.len();
        metrics::record_poll_cycle(fetched);
        if fetched == 0 {
            return PollOutcome::Empty;
        }

        info!(count = fetched, "收到队列消息");

        let mut delivered = 0;
        let mut failed = 0;
        for message in &messages {
            match self.dispatcher.dispatch(message).await {
                Ok(DispatchOutcome::Delivered { .. }) => delivered += 1,
                Ok(outcome) => {
                    debug!(message_id = %message.message_id, ?outcome, "消息未投递");
                }
                Err(e) => {
                    failed += 1;
                    metrics::record_failed(e.kind());
                    if e.is_retryable() {
                        warn!(
                            message_id = %message.message_id,
                            error = %e,
                            "处理队列消息失败，等待重新投递"
                        );
                    } else {
                        error!(
                            message_id = %message.message_id,
                            error = %e,
                            "处理队列消息失败，重新投递无法恢复，需由死信策略处理"
                        );
                    }
                }
            }
        }

        PollOutcome::Drained {
            fetched,
            delivered,
            failed,
        }
    }

    /// 启动调度循环，直到收到 shutdown 信号
    ///
    /// 收到信号后停止调度，并等待正在进行的一轮拉取结束再返回。
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<PollOutcome>> = None;

        // 订阅前已经发出的关闭信号不会触发 changed()
        if *shutdown.borrow() {
            self.stop();
            info!("启动前已收到关闭信号，不再轮询");
            return;
        }

        info!(interval_secs = interval.as_secs(), "队列轮询已启动");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("收到关闭信号，停止队列轮询");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if !self.is_running() {
                        break;
                    }
                    if in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
                        debug!("上一轮拉取尚未完成，跳过本次调度");
                        continue;
                    }
                    let poller = Arc::clone(&self);
                    in_flight = Some(tokio::spawn(async move { poller.poll_once().await }));
                }
            }
        }

        self.stop();
        if let Some(handle) = in_flight {
            if let Err(e) = handle.await {
                warn!(error = %e, "拉取任务异常结束");
            }
        }

        info!("队列轮询已停止");
    }
}
