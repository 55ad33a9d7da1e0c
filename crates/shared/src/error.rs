//! 统一错误处理模块
//!
//! 定义投递管道中所有共享的错误类型，使用 thiserror 提供良好的错误信息。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum RelayError {
    // ==================== 配置错误 ====================
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("配置加载失败: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    // ==================== 外部服务错误 ====================
    #[error("队列错误: {0}")]
    Queue(String),

    #[error("对象存储错误: {0}")]
    Storage(String),

    #[error("参数存储错误: {name} - {message}")]
    SecretStore { name: String, message: String },

    #[error("聊天平台错误: {0}")]
    Chat(String),

    // ==================== 消息错误 ====================
    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("消息格式错误: {0}")]
    MalformedMessage(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) | Self::ConfigLoad(_) => "CONFIGURATION_ERROR",
            Self::Queue(_) => "QUEUE_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::SecretStore { .. } => "SECRET_STORE_ERROR",
            Self::Chat(_) => "CHAT_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::MalformedMessage(_) => "MALFORMED_MESSAGE",
        }
    }

    /// 是否为瞬时错误
    ///
    /// 瞬时错误依赖队列的重新投递恢复，本地不做重试循环。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Queue(_) | Self::Storage(_) | Self::Chat(_))
    }

    /// 启动阶段遇到即拒绝启动的错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::ConfigLoad(_) | Self::SecretStore { .. }
        )
    }
}
