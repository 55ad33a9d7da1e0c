//! 聊天平台发送器
//!
//! 通过 `ChatClient` trait 抽象登录、频道查询和发送行为，
//! `DiscordClient` 基于 Discord REST API 实现（机器人 token 鉴权）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use relay_shared::error::RelayError;
use tracing::{debug, info, warn};

use crate::error::NotificationError;
use crate::templates::RenderedNotification;

/// 429 响应的最大重试次数
const MAX_RATE_LIMIT_RETRIES: u32 = 3;
/// 进程内愿意等待的最长限流时间
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);
/// 429 响应没有给出等待时间时使用
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);
const CHANNEL_NAME: &str = "discord";

/// 登录后的机器人身份
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BotIdentity {
    pub id: String,
    pub username: String,
}

/// 频道信息
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// 聊天平台客户端接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// 使用机器人 token 登录
    async fn connect(&self, token: &str) -> Result<BotIdentity, NotificationError>;

    /// 查询频道；无权限或不存在时返回 None
    async fn get_channel(&self, channel_id: u64) -> Result<Option<ChannelInfo>, NotificationError>;

    /// 发送渲染后的通知，返回平台消息 ID
    async fn send(
        &self,
        channel_id: u64,
        notification: &RenderedNotification,
    ) -> Result<String, NotificationError>;

    /// 关闭连接
    async fn close(&self);

    fn is_connected(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Discord
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreatedMessage {
    id: String,
}

/// Discord REST 客户端
pub struct DiscordClient {
    client: Client,
    api_base: String,
    token: RwLock<Option<String>>,
    connected: AtomicBool,
}

impl DiscordClient {
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Result<Self, NotificationError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("notification-worker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| platform_error(format!("创建 HTTP 客户端失败: {e}")))?;

        let api_base: String = api_base.into();
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
            connected: AtomicBool::new(false),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn auth_header(&self) -> Result<String, NotificationError> {
        self.token
            .read()
            .await
            .as_ref()
            .map(|token| format!("Bot {token}"))
            .ok_or_else(|| platform_error("尚未登录".to_string()))
    }

    /// 发送请求，遇到 429 时按 Retry-After 等待后重试
    async fn post_with_retry(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, NotificationError> {
        let auth = self.auth_header().await?;
        let mut attempts = 0;

        loop {
            attempts += 1;

            let response = self
                .client
                .post(url)
                .header(reqwest::header::AUTHORIZATION, &auth)
                .json(payload)
                .send()
                .await
                .map_err(|e| send_error(format!("请求失败: {e}")))?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = parse_retry_after(&response);
                if attempts >= MAX_RATE_LIMIT_RETRIES {
                    warn!(attempts, ?retry_after, "Discord 限流重试次数耗尽");
                    return Err(send_error(format!(
                        "限流重试 {MAX_RATE_LIMIT_RETRIES} 次后仍失败"
                    )));
                }

                let wait = retry_after.unwrap_or(DEFAULT_RETRY_AFTER);
                if wait > MAX_RETRY_AFTER {
                    // 超过上限不在进程内等待，交给队列重新投递
                    warn!(?wait, "Discord 限流等待时间过长，放弃本次发送");
                    return Err(send_error(format!("限流等待 {wait:?} 超过上限")));
                }
                debug!(?wait, attempts, "Discord 限流，等待后重试");
                tokio::time::sleep(wait).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(send_error(format!("{status} - {body}")));
        }
    }
}

#[async_trait]
impl ChatClient for DiscordClient {
    async fn connect(&self, token: &str) -> Result<BotIdentity, NotificationError> {
        let response = self
            .client
            .get(self.url("/users/@me"))
            .header(reqwest::header::AUTHORIZATION, format!("Bot {token}"))
            .send()
            .await
            .map_err(|e| platform_error(format!("登录请求失败: {e}")))?;

        if !response.status().is_success() {
            return Err(platform_error(format!("登录失败: {}", response.status())));
        }

        let identity: BotIdentity = response
            .json()
            .await
            .map_err(|e| platform_error(format!("登录响应解析失败: {e}")))?;

        *self.token.write().await = Some(token.to_string());
        self.connected.store(true, Ordering::SeqCst);
        info!(bot_id = %identity.id, username = %identity.username, "Discord 机器人已登录");
        Ok(identity)
    }

    async fn get_channel(&self, channel_id: u64) -> Result<Option<ChannelInfo>, NotificationError> {
        let auth = self.auth_header().await?;
        let response = self
            .client
            .get(self.url(&format!("/channels/{channel_id}")))
            .header(reqwest::header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| platform_error(format!("查询频道失败: {e}")))?;

        match response.status() {
            status if status.is_success() => response
                .json()
                .await
                .map(Some)
                .map_err(|e| platform_error(format!("频道响应解析失败: {e}"))),
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Ok(None),
            status => Err(platform_error(format!("查询频道失败: {status}"))),
        }
    }

    async fn send(
        &self,
        channel_id: u64,
        notification: &RenderedNotification,
    ) -> Result<String, NotificationError> {
        let url = self.url(&format!("/channels/{channel_id}/messages"));
        let payload = json!({ "embeds": [notification] });

        let response = self.post_with_retry(&url, &payload).await?;
        let created: CreatedMessage = response
            .json()
            .await
            .map_err(|e| send_error(format!("发送响应解析失败: {e}")))?;

        debug!(channel_id, message_id = %created.id, "Discord 消息已发送");
        Ok(created.id)
    }

    async fn close(&self) {
        *self.token.write().await = None;
        self.connected.store(false, Ordering::SeqCst);
        info!("Discord 连接已关闭");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// 发送阶段的失败，消息留在队列中等待重新投递
fn send_error(reason: String) -> NotificationError {
    NotificationError::SendFailed {
        channel: CHANNEL_NAME.to_string(),
        reason,
    }
}

/// 登录、频道查询等平台调用的失败
fn platform_error(reason: String) -> NotificationError {
    RelayError::Chat(reason).into()
}

/// 解析 429 响应的等待时长，无法表示为 `Duration` 的值视为缺失
fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    ["Retry-After", "X-RateLimit-Reset-After"]
        .iter()
        .filter_map(|name| response.headers().get(*name))
        .filter_map(|value| value.to_str().ok()?.parse::<f64>().ok())
        .find_map(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// 解析频道 ID（Discord snowflake）
pub fn parse_channel_id(raw: &str) -> Result<u64, NotificationError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| NotificationError::InvalidChannelId(raw.to_string()))
}
