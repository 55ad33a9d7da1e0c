//! 投递分发
//!
//! 处理单条队列消息：解析 -> 校验图片地址 -> 渲染 -> 发送 -> 删除。
//! 只有发送成功之后才删除消息，删除从不提前发生；任何一步失败，消息都留在
//! 队列中等待可见性超时后重新投递（至少一次语义）。

use std::sync::Arc;

use relay_shared::events::CanonicalNotification;
use relay_shared::observability::metrics;
use relay_shared::queue::{MessageQueue, QueueMessage};
use tracing::{error, info, warn};

use crate::error::NotificationError;
use crate::sender::ChatClient;
use crate::templates::NotificationRenderer;

/// 单条消息的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 已发送并从队列删除
    Delivered { chat_message_id: String },
    /// 缺少图片地址，消息留在队列中
    SkippedMissingUrl,
    /// 缺少图片地址，已转投死信队列并从原队列删除
    DeadLettered { dead_letter_message_id: String },
}

/// 投递分发器
pub struct DeliveryDispatcher {
    queue: Arc<dyn MessageQueue>,
    dead_letter: Option<Arc<dyn MessageQueue>>,
    chat: Arc<dyn ChatClient>,
    channel_id: u64,
    renderer: NotificationRenderer,
}

impl DeliveryDispatcher {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        chat: Arc<dyn ChatClient>,
        channel_id: u64,
        renderer: NotificationRenderer,
    ) -> Self {
        Self {
            queue,
            dead_letter: None,
            chat,
            channel_id,
            renderer,
        }
    }

    /// 配置死信队列后，缺少图片地址的消息会被转投而不是无限重试
    pub fn with_dead_letter(mut self, dead_letter: Arc<dyn MessageQueue>) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    /// 处理单条队列消息
    pub async fn dispatch(&self, message: &QueueMessage) -> Result<DispatchOutcome, NotificationError> {
        let notification: CanonicalNotification = message.deserialize_body().map_err(|e| {
            error!(message_id = %message.message_id, error = %e, "消息体不是合法 JSON");
            NotificationError::DeserializationFailed(e.to_string())
        })?;

        if !notification.has_image_url() {
            warn!(
                message_id = %message.message_id,
                body = %message.body,
                "消息中没有图片地址"
            );
            return self.handle_missing_url(message).await;
        }

        info!(message_id = %message.message_id, object_key = %notification.object_key, "处理图片通知");

        let embed = self.renderer.render(&notification);
        let chat_message_id = self.chat.send(self.channel_id, &embed).await?;
        info!(
            message_id = %message.message_id,
            chat_message_id = %chat_message_id,
            object_key = %notification.object_key,
            "图片已发送到频道"
        );

        self.acknowledge(message).await?;
        metrics::record_delivered();

        Ok(DispatchOutcome::Delivered { chat_message_id })
    }

    async fn handle_missing_url(&self, message: &QueueMessage) -> Result<DispatchOutcome, NotificationError> {
        let Some(dead_letter) = &self.dead_letter else {
            return Ok(DispatchOutcome::SkippedMissingUrl);
        };

        // 原样转投，保留原始属性便于排查
        let dead_letter_message_id = dead_letter
            .publish(&message.body, &message.attributes)
            .await?;
        self.acknowledge(message).await?;
        metrics::record_dead_lettered();

        warn!(
            message_id = %message.message_id,
            dead_letter_message_id = %dead_letter_message_id,
            "缺少图片地址的消息已转投死信队列"
        );
        Ok(DispatchOutcome::DeadLettered {
            dead_letter_message_id,
        })
    }

    async fn acknowledge(&self, message: &QueueMessage) -> Result<(), NotificationError> {
        self.queue
            .delete(&message.receipt_handle)
            .await
            .map_err(|e| NotificationError::AckFailed {
                message_id: message.message_id.clone(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::MockChatClient;
    use relay_shared::events::ObjectMetadata;
    use relay_shared::test_utils::InMemoryQueue;

    const CHANNEL: u64 = 100;

    async fn received(queue: &InMemoryQueue, body: &str) -> QueueMessage {
        queue.push_raw(body).await;
        queue.receive(1, 0).await.unwrap().remove(0)
    }

    fn valid_body() -> String {
        serde_json::to_string(&CanonicalNotification::new(
            "https://imgs.s3.amazonaws.com/a/b.png",
            "a/b.png",
            "dev",
            ObjectMetadata {
                size: Some(2048),
                ..Default::default()
            },
        ))
        .unwrap()
    }

    fn dispatcher(queue: Arc<InMemoryQueue>, chat: MockChatClient) -> DeliveryDispatcher {
        DeliveryDispatcher::new(queue, Arc::new(chat), CHANNEL, NotificationRenderer::new("dev"))
    }

    #[tokio::test]
    async fn test_delivered_then_deleted() {
        let queue = Arc::new(InMemoryQueue::new());
        let msg = received(&queue, &valid_body()).await;

        let mut chat = MockChatClient::new();
        chat.expect_send()
            .withf(|channel, embed| {
                *channel == CHANNEL
                    && embed.image.url == "https://imgs.s3.amazonaws.com/a/b.png"
                    && embed.field("File Size") == Some("2.0 KB")
            })
            .times(1)
            .returning(|_, _| Ok("chat-1".to_string()));

        let outcome = dispatcher(queue.clone(), chat).dispatch(&msg).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Delivered {
                chat_message_id: "chat-1".to_string()
            }
        );
        assert_eq!(queue.delete_calls(), 1);
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_send_failure_keeps_message() {
        let queue = Arc::new(InMemoryQueue::new());
        let msg = received(&queue, &valid_body()).await;

        let mut chat = MockChatClient::new();
        chat.expect_send().returning(|_, _| {
            Err(NotificationError::SendFailed {
                channel: "discord".to_string(),
                reason: "503".to_string(),
            })
        });

        let err = dispatcher(queue.clone(), chat).dispatch(&msg).await.unwrap_err();
        assert!(matches!(err, NotificationError::SendFailed { .. }));
        assert_eq!(queue.delete_calls(), 0);
        assert_eq!(queue.in_flight_len().await, 1);
    }

    #[tokio::test]
    async fn test_missing_image_url_is_not_deleted() {
        let queue = Arc::new(InMemoryQueue::new());
        let msg = received(&queue, r#"{"object_key":"a/b.png","metadata":{}}"#).await;

        let mut chat = MockChatClient::new();
        chat.expect_send().never();

        let outcome = dispatcher(queue.clone(), chat).dispatch(&msg).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::SkippedMissingUrl);
        assert_eq!(queue.delete_calls(), 0);
        assert_eq!(queue.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_missing_image_url_dead_lettered_when_configured() {
        let queue = Arc::new(InMemoryQueue::new());
        let dlq = Arc::new(InMemoryQueue::new());
        let msg = received(&queue, r#"{"object_key":"a/b.png"}"#).await;

        let mut chat = MockChatClient::new();
        chat.expect_send().never();

        let outcome = dispatcher(queue.clone(), chat)
            .with_dead_letter(dlq.clone())
            .dispatch(&msg)
            .await
            .unwrap();

        assert!(matches!(outcome, DispatchOutcome::DeadLettered { .. }));
        assert_eq!(queue.pending_len().await, 0);
        assert_eq!(dlq.visible_messages().await[0].body, r#"{"object_key":"a/b.png"}"#);
    }

    #[tokio::test]
    async fn test_malformed_json_is_error_and_kept() {
        let queue = Arc::new(InMemoryQueue::new());
        let msg = received(&queue, "not json").await;

        let mut chat = MockChatClient::new();
        chat.expect_send().never();

        let err = dispatcher(queue.clone(), chat).dispatch(&msg).await.unwrap_err();
        assert!(matches!(err, NotificationError::DeserializationFailed(_)));
        assert_eq!(queue.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_delete_failure_reported_after_delivery() {
        let queue = Arc::new(InMemoryQueue::new());
        let msg = received(&queue, &valid_body()).await;
        queue.set_fail_deletes(true).await;

        let mut chat = MockChatClient::new();
        chat.expect_send().times(1).returning(|_, _| Ok("chat-1".to_string()));

        let err = dispatcher(queue.clone(), chat).dispatch(&msg).await.unwrap_err();
        assert!(matches!(err, NotificationError::AckFailed { .. }));
        assert_eq!(queue.in_flight_len().await, 1);
    }

    #[tokio::test]
    async fn test_redelivered_message_dispatches_again() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.push_raw(valid_body()).await;

        let mut chat = MockChatClient::new();
        let mut calls = 0;
        chat.expect_send().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(NotificationError::SendFailed {
                    channel: "discord".to_string(),
                    reason: "timeout".to_string(),
                })
            } else {
                Ok("chat-2".to_string())
            }
        });
        let dispatcher = dispatcher(queue.clone(), chat);

        let first = queue.receive(1, 0).await.unwrap().remove(0);
        assert!(dispatcher.dispatch(&first).await.is_err());

        // 可见性超时后同一条消息再次投递
        queue.expire_visibility().await;
        let second = queue.receive(1, 0).await.unwrap().remove(0);
        assert_eq!(second.message_id, first.message_id);
        assert!(matches!(
            dispatcher.dispatch(&second).await.unwrap(),
            DispatchOutcome::Delivered { .. }
        ));
        assert_eq!(queue.pending_len().await, 0);
    }
}
