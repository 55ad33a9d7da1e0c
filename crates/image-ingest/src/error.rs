//! 入队服务专用错误类型
//!
//! 在共享库 RelayError 基础上定义本服务特有的错误变体，
//! 使编排层可以把单条记录的失败原因原样写入处理结果。

use relay_shared::error::RelayError;

/// 存储事件处理错误
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// 事件文档整体无法解析，整次调用失败
    #[error("存储事件解析失败: {0}")]
    InvalidEvent(String),

    /// 入队前的不变量检查失败（地址或对象键为空）
    #[error("通知不完整: {0}")]
    InvalidNotification(String),

    /// 队列发送失败，只影响当前记录
    #[error("消息发布失败: {0}")]
    PublishFailed(String),

    /// 透传共享库错误，避免在每个 match 分支手动转换
    #[error(transparent)]
    Shared(#[from] RelayError),
}
