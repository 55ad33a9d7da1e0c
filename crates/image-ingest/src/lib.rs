//! 图片上传入队服务
//!
//! 接收对象存储的变更通知，过滤出图片文件，生成访问地址后
//! 以标准通知格式写入持久化队列，供通知消费者投递。

pub mod error;
pub mod normalizer;
pub mod orchestrator;
pub mod publisher;
pub mod storage;
