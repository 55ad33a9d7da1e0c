//! 通知服务错误类型
//!
//! 定义消息解析、渠道投递和队列确认等场景的错误分类。
//! 所有错误都不会让消费循环退出：消息留在队列中，由可见性超时或死信策略处理。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("通知反序列化失败: {0}")]
    DeserializationFailed(String),

    #[error("通知发送失败: 渠道={channel}, 原因={reason}")]
    SendFailed { channel: String, reason: String },

    #[error("频道不可用: {channel_id}")]
    ChannelUnavailable { channel_id: u64 },

    #[error("消息确认失败: message_id={message_id}, 原因={reason}")]
    AckFailed { message_id: String, reason: String },

    #[error("无效的频道 ID: {0}")]
    InvalidChannelId(String),

    #[error(transparent)]
    Shared(#[from] relay_shared::error::RelayError),
}

impl NotificationError {
    /// 指标标签
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeserializationFailed(_) => "malformed",
            Self::SendFailed { .. } => "send",
            Self::ChannelUnavailable { .. } => "channel",
            Self::AckFailed { .. } => "ack",
            Self::InvalidChannelId(_) => "config",
            Self::Shared(_) => "shared",
        }
    }

    /// 是否可以依赖队列重新投递恢复
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SendFailed { .. } | Self::AckFailed { .. } => true,
            Self::Shared(e) => e.is_retryable(),
            _ => false,
        }
    }
}
