//! 共享库
//!
//! 包含入队服务与通知消费者共用的配置、错误处理、队列消息模型、
//! SQS / SSM 客户端封装和可观测性等基础设施代码。

pub mod config;
pub mod error;
pub mod events;
pub mod observability;
pub mod queue;
pub mod secrets;
pub mod test_utils;
