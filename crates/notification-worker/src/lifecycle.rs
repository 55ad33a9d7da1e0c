//! 生命周期管理
//!
//! 负责启动与关闭的先后顺序：解析凭据 -> 登录 -> 校验频道 -> 启动轮询；
//! 关闭时先停止调度，等待正在进行的一轮拉取结束，再断开聊天平台连接。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use relay_shared::config::AppConfig;
use relay_shared::queue::MessageQueue;
use relay_shared::secrets::{ParameterStore, parameter_names, resolve_secret};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::dispatcher::DeliveryDispatcher;
use crate::error::NotificationError;
use crate::poller::QueuePoller;
use crate::sender::{ChatClient, parse_channel_id};
use crate::templates::NotificationRenderer;

/// 启动所需的凭据
#[derive(Clone, PartialEq, Eq)]
pub struct WorkerCredentials {
    pub bot_token: String,
    pub channel_id: u64,
}

impl std::fmt::Debug for WorkerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCredentials")
            .field("bot_token", &"***")
            .field("channel_id", &self.channel_id)
            .finish()
    }
}

impl WorkerCredentials {
    /// 优先使用进程配置，缺失时按环境从参数存储读取；任一项取不到都是致命错误
    pub async fn resolve<S>(config: &AppConfig, store: &S) -> Result<Self, NotificationError>
    where
        S: ParameterStore + ?Sized,
    {
        let bot_token = resolve_secret(
            store,
            config.discord.bot_token.as_deref(),
            &parameter_names::bot_token(&config.environment),
            true,
        )
        .await?;

        let raw_channel_id = resolve_secret(
            store,
            config.discord.channel_id.as_deref(),
            &parameter_names::channel_id(&config.environment),
            false,
        )
        .await?;

        Ok(Self {
            bot_token,
            channel_id: parse_channel_id(&raw_channel_id)?,
        })
    }
}

/// 工作进程生命周期控制器
pub struct WorkerLifecycle {
    config: AppConfig,
    queue: Arc<dyn MessageQueue>,
    dead_letter: Option<Arc<dyn MessageQueue>>,
    chat: Arc<dyn ChatClient>,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    poller_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerLifecycle {
    pub fn new(config: AppConfig, queue: Arc<dyn MessageQueue>, chat: Arc<dyn ChatClient>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            queue,
            dead_letter: None,
            chat,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown_tx,
            poller_task: Mutex::new(None),
        }
    }

    pub fn with_dead_letter(mut self, dead_letter: Arc<dyn MessageQueue>) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// 登录、校验频道并启动轮询
    ///
    /// 重复调用不会再次启动轮询。频道不可用时会先执行关闭流程再返回错误。
    pub async fn start(&self, credentials: &WorkerCredentials) -> Result<(), NotificationError> {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("工作进程已启动，忽略重复启动");
            return Ok(());
        }

        let identity = self.chat.connect(&credentials.bot_token).await?;
        info!(bot = %identity.username, "已连接到聊天平台");

        match self.chat.get_channel(credentials.channel_id).await {
            Ok(Some(channel)) => {
                info!(
                    channel_id = credentials.channel_id,
                    channel_name = channel.name.as_deref().unwrap_or_default(),
                    "目标频道可用"
                );
            }
            Ok(None) => {
                error!(channel_id = credentials.channel_id, "找不到目标频道或没有访问权限");
                self.shutdown().await;
                return Err(NotificationError::ChannelUnavailable {
                    channel_id: credentials.channel_id,
                });
            }
            Err(e) => {
                error!(channel_id = credentials.channel_id, error = %e, "校验目标频道失败");
                self.shutdown().await;
                return Err(e);
            }
        }

        let mut dispatcher = DeliveryDispatcher::new(
            self.queue.clone(),
            self.chat.clone(),
            credentials.channel_id,
            NotificationRenderer::new(&self.config.environment),
        );
        if let Some(dead_letter) = &self.dead_letter {
            dispatcher = dispatcher.with_dead_letter(dead_letter.clone());
        }

        let poller = Arc::new(QueuePoller::from_config(
            &self.config.queue,
            self.queue.clone(),
            Arc::new(dispatcher),
        ));
        let interval = Duration::from_secs(self.config.queue.poll_interval_seconds.max(1));
        let handle = tokio::spawn(poller.run(interval, self.shutdown_tx.subscribe()));
        *self.poller_task.lock().await = Some(handle);

        info!(environment = %self.config.environment, "通知工作进程已启动");
        Ok(())
    }

    /// 关闭工作进程，可安全地重复调用
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("开始关闭通知工作进程");
        self.shutdown_tx.send_replace(true);

        if let Some(handle) = self.poller_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "轮询任务异常结束");
            }
        }

        self.chat.close().await;
        info!("通知工作进程已关闭");
    }
}
