//! 持久化队列基础设施封装
//!
//! 将 aws-sdk-sqs 的底层 API 封装为业务友好的 `MessageQueue` 抽象，
//! 统一消息序列化、错误映射语义，入队和出队两侧共用。

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::MessageAttributeValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{RelayError, Result};

/// 消息属性（名称 -> 字符串值）
pub type MessageAttributes = HashMap<String, String>;

// ---------------------------------------------------------------------------
// QueueMessage
// ---------------------------------------------------------------------------

/// 拉取到的队列消息
///
/// 只在一次处理尝试内有效；消息本身始终归队列服务所有，
/// 处理成功后凭 `receipt_handle` 删除。
#[derive(Debug, Clone, Default)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub attributes: MessageAttributes,
}

impl QueueMessage {
    /// 将 JSON 格式的消息体反序列化为目标类型
    pub fn deserialize_body<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body)
            .map_err(|e| RelayError::MalformedMessage(format!("消息体反序列化失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// MessageQueue
// ---------------------------------------------------------------------------

/// 持久化队列接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// 发布一条消息，返回队列分配的消息 ID
    async fn publish(&self, body: &str, attributes: &MessageAttributes) -> Result<String>;

    /// 长轮询拉取至多 `max_messages` 条消息，最多等待 `wait_time_seconds` 秒
    async fn receive(&self, max_messages: i32, wait_time_seconds: i32)
    -> Result<Vec<QueueMessage>>;

    /// 凭回执永久删除消息
    async fn delete(&self, receipt_handle: &str) -> Result<()>;
}

/// 将值序列化为 JSON 后发布
///
/// 序列化与网络发送拆分为两步，便于独立定位故障原因。
pub async fn publish_json<Q, T>(queue: &Q, value: &T, attributes: &MessageAttributes) -> Result<String>
where
    Q: MessageQueue + ?Sized,
    T: Serialize,
{
    let body = serde_json::to_string(value)?;
    queue.publish(&body, attributes).await
}

// ---------------------------------------------------------------------------
// SqsQueue
// ---------------------------------------------------------------------------

/// 基于 Amazon SQS 的队列实现
///
/// 每个实例绑定一个队列 URL；`Client` 内部是 Arc 包装的，可廉价克隆。
#[derive(Clone)]
pub struct SqsQueue {
    client: Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        let queue_url = queue_url.into();
        info!(queue_url = %queue_url, "SQS 队列客户端已初始化");
        Self { client, queue_url }
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn publish(&self, body: &str, attributes: &MessageAttributes) -> Result<String> {
        let mut request = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body);

        for (name, value) in attributes {
            let attribute = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(|e| RelayError::Queue(format!("构造消息属性失败: {e}")))?;
            request = request.message_attributes(name, attribute);
        }

        let output = request
            .send()
            .await
            .map_err(|e| RelayError::Queue(format!("发送消息失败: {}", DisplayErrorContext(&e))))?;

        let message_id = output.message_id().unwrap_or_default().to_string();
        debug!(queue_url = %self.queue_url, message_id = %message_id, "消息已发送");
        Ok(message_id)
    }

    async fn receive(
        &self,
        max_messages: i32,
        wait_time_seconds: i32,
    ) -> Result<Vec<QueueMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_time_seconds)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| RelayError::Queue(format!("拉取消息失败: {}", DisplayErrorContext(&e))))?;

        let messages = output
            .messages()
            .iter()
            .map(|m| QueueMessage {
                message_id: m.message_id().unwrap_or("unknown").to_string(),
                receipt_handle: m.receipt_handle().unwrap_or_default().to_string(),
                body: m.body().unwrap_or_default().to_string(),
                attributes: m
                    .message_attributes()
                    .map(|attrs| {
                        attrs
                            .iter()
                            .filter_map(|(k, v)| {
                                v.string_value().map(|s| (k.clone(), s.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect();

        Ok(messages)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        if receipt_handle.is_empty() {
            return Err(RelayError::Queue("回执为空，无法删除消息".to_string()));
        }

        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| RelayError::Queue(format!("删除消息失败: {}", DisplayErrorContext(&e))))?;

        debug!(queue_url = %self.queue_url, "消息已删除");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;

    #[test]
    fn test_deserialize_body() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct Body {
            image_url: String,
        }

        let msg = QueueMessage {
            message_id: "m-1".to_string(),
            receipt_handle: "rh-1".to_string(),
            body: r#"{"image_url":"https://x/y.png"}"#.to_string(),
            attributes: MessageAttributes::new(),
        };

        let body: Body = msg.deserialize_body().unwrap();
        assert_eq!(body.image_url, "https://x/y.png");
    }

    #[test]
    fn test_deserialize_body_invalid_json() {
        let msg = QueueMessage {
            body: "not json".to_string(),
            ..Default::default()
        };

        let result: Result<serde_json::Value> = msg.deserialize_body();
        assert_eq!(result.unwrap_err().code(), "MALFORMED_MESSAGE");
    }

    #[tokio::test]
    async fn test_publish_json_serializes_before_sending() {
        let mut queue = MockMessageQueue::new();
        queue
            .expect_publish()
            .with(eq(r#"{"key":"a.png"}"#), always())
            .times(1)
            .returning(|_, _| Ok("msg-1".to_string()));

        let attrs = MessageAttributes::from([("MessageType".to_string(), "X".to_string())]);
        let id = publish_json(&queue, &serde_json::json!({"key": "a.png"}), &attrs)
            .await
            .unwrap();
        assert_eq!(id, "msg-1");
    }
}
