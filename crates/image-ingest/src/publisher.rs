//! 消息发布
//!
//! 每条通知只做一次入队调用，并附带路由属性（部署环境、消息类型）。

use std::sync::Arc;

use relay_shared::events::{CanonicalNotification, MESSAGE_TYPE_IMAGE_UPLOAD, attributes};
use relay_shared::observability::metrics;
use relay_shared::queue::{MessageAttributes, MessageQueue, publish_json};
use tracing::{error, info};

use crate::error::IngestError;

/// 消息发布器
pub struct MessagePublisher {
    queue: Arc<dyn MessageQueue>,
    environment: String,
}

impl MessagePublisher {
    pub fn new(queue: Arc<dyn MessageQueue>, environment: impl Into<String>) -> Self {
        Self {
            queue,
            environment: environment.into(),
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// 路由属性
    pub fn routing_attributes(&self) -> MessageAttributes {
        MessageAttributes::from([
            (attributes::ENVIRONMENT.to_string(), self.environment.clone()),
            (
                attributes::MESSAGE_TYPE.to_string(),
                MESSAGE_TYPE_IMAGE_UPLOAD.to_string(),
            ),
        ])
    }

    /// 发布通知，返回队列分配的消息 ID
    pub async fn publish(&self, notification: &CanonicalNotification) -> Result<String, IngestError> {
        if !notification.is_publishable() {
            return Err(IngestError::InvalidNotification(format!(
                "image_url 或 object_key 为空: object_key={}",
                notification.object_key
            )));
        }

        let message_id = publish_json(self.queue.as_ref(), notification, &self.routing_attributes())
            .await
            .map_err(|e| {
                error!(object_key = %notification.object_key, error = %e, "发送消息到队列失败");
                IngestError::PublishFailed(e.to_string())
            })?;

        metrics::record_published(&self.environment);
        info!(
            message_id = %message_id,
            object_key = %notification.object_key,
            "消息已发送到队列"
        );
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_shared::events::ObjectMetadata;
    use relay_shared::test_utils::InMemoryQueue;

    fn notification(url: &str, key: &str) -> CanonicalNotification {
        CanonicalNotification::new(url, key, "prod", ObjectMetadata::default())
    }

    #[tokio::test]
    async fn test_publish_attaches_routing_attributes() {
        let queue = Arc::new(InMemoryQueue::new());
        let publisher = MessagePublisher::new(queue.clone(), "prod");

        let id = tokio_test::assert_ok!(
            publisher
                .publish(&notification("https://x/a.png", "a.png"))
                .await
        );
        assert!(!id.is_empty());

        let messages = queue.visible_messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].attributes.get("Environment").unwrap(), "prod");
        assert_eq!(
            messages[0].attributes.get("MessageType").unwrap(),
            "InstagramImageUpload"
        );

        let body: CanonicalNotification = messages[0].deserialize_body().unwrap();
        assert_eq!(body.object_key, "a.png");
        assert_eq!(body.environment, "prod");
    }

    #[tokio::test]
    async fn test_publish_rejects_incomplete_notification() {
        let queue = Arc::new(InMemoryQueue::new());
        let publisher = MessagePublisher::new(queue.clone(), "dev");

        let err = publisher.publish(&notification("", "a.png")).await.unwrap_err();
        assert!(matches!(err, IngestError::InvalidNotification(_)));
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_publish_failure_propagates() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.fail_next_publishes(1).await;
        let publisher = MessagePublisher::new(queue, "dev");

        let err = publisher
            .publish(&notification("https://x/a.png", "a.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::PublishFailed(_)));
    }
}
