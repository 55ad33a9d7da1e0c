//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::error::{RelayError, Result};

/// SQS 单次拉取上限
pub const MAX_RECEIVE_BATCH: i32 = 10;
/// 长轮询等待上限（秒）
pub const MAX_WAIT_TIME_SECONDS: i32 = 5;

/// 队列配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub url: String,
    pub max_messages: i32,
    pub wait_time_seconds: i32,
    pub poll_interval_seconds: u64,
    /// 缺少图片地址的消息转投的死信队列；未配置时消息留在原队列
    pub dead_letter_url: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_messages: MAX_RECEIVE_BATCH,
            wait_time_seconds: 5,
            poll_interval_seconds: 10,
            dead_letter_url: None,
        }
    }
}

impl QueueConfig {
    /// 单次拉取至多 10 条
    pub fn receive_batch(&self) -> i32 {
        self.max_messages.clamp(1, MAX_RECEIVE_BATCH)
    }

    /// 长轮询等待不超过 5 秒
    pub fn wait_time(&self) -> i32 {
        self.wait_time_seconds.clamp(0, MAX_WAIT_TIME_SECONDS)
    }
}

/// 对象存储配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub presign_ttl_seconds: u64,
    pub allowed_extensions: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            presign_ttl_seconds: 24 * 60 * 60,
            allowed_extensions: ["jpg", "jpeg", "png", "gif", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Discord 配置
///
/// token 与频道 ID 可以留空，启动时再从参数存储中解析。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub bot_token: Option<String>,
    pub channel_id: Option<String>,
    pub api_base: String,
    pub request_timeout_seconds: u64,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            channel_id: None,
            api_base: "https://discord.com/api/v10".to_string(),
            request_timeout_seconds: 10,
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_port: 9090,
        }
    }
}

impl ObservabilityConfig {
    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub discord: DiscordConfig,
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: "relay".to_string(),
            environment: "dev".to_string(),
            queue: QueueConfig::default(),
            storage: StorageConfig::default(),
            discord: DiscordConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（RELAY_ 前缀，如 RELAY_QUEUE__URL -> queue.url）
    /// 5. 部署脚本沿用的扁平变量（SQS_QUEUE_URL、ENVIRONMENT 等）
    pub fn load(service_name: &str) -> Result<Self> {
        // .env 不存在时忽略
        let _ = dotenvy::dotenv();

        let env = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: Self = builder.build()?.try_deserialize()?;
        config.apply_env_overrides(|name| std::env::var(name).ok());

        Ok(config)
    }

    /// 应用扁平环境变量覆盖
    ///
    /// 变量查找通过闭包注入，测试时无需修改进程环境。
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("SQS_QUEUE_URL") {
            self.queue.url = url;
        }
        if let Some(env) = non_empty("ENVIRONMENT") {
            self.environment = env;
        }
        if let Some(url) = non_empty("DEAD_LETTER_QUEUE_URL") {
            self.queue.dead_letter_url = Some(url);
        }
        if let Some(token) = non_empty("DISCORD_BOT_TOKEN") {
            self.discord.bot_token = Some(token);
        }
        if let Some(channel_id) = non_empty("DISCORD_CHANNEL_ID") {
            self.discord.channel_id = Some(channel_id);
        }
    }

    /// 校验启动必需的配置项
    pub fn validate(&self) -> Result<()> {
        if self.queue.url.trim().is_empty() {
            return Err(RelayError::Configuration(
                "SQS_QUEUE_URL 未配置，队列地址为必填项".to_string(),
            ));
        }
        if self.environment.trim().is_empty() {
            return Err(RelayError::Configuration("environment 不能为空".to_string()));
        }
        Ok(())
    }

}
