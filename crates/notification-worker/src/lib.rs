//! 通知工作者服务
//!
//! 从持久化队列拉取图片上传通知，渲染为 Discord embed 并发送到目标频道。
//! 只有发送成功的消息才会从队列删除，失败的消息依赖队列的重新投递。

pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod poller;
pub mod sender;
pub mod templates;
