//! 入队编排
//!
//! 对一批存储事件逐条执行 规范化 -> 元数据 -> 签名地址 -> 发布，
//! 单条记录的失败只记入错误列表，不会影响同批次其他记录。

use std::sync::Arc;
use std::time::Duration;

use relay_shared::config::AppConfig;
use relay_shared::events::CanonicalNotification;
use relay_shared::observability::metrics;
use serde::Serialize;
use tracing::{error, info};

use crate::error::IngestError;
use crate::normalizer::{EventNormalizer, Normalized, ObjectRef, RawEventRecord, StorageEventDocument};
use crate::publisher::MessagePublisher;
use crate::storage::{ObjectStore, metadata_or_empty, signed_url_or_fallback};

/// HTTP 风格的状态码
pub mod status {
    pub const OK: u16 = 200;
    pub const PARTIAL_SUCCESS: u16 = 207;
    pub const INVOCATION_FAILED: u16 = 500;
}

/// 成功入队的对象
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessedImage {
    pub bucket: String,
    pub key: String,
    pub url: String,
}

/// 一次调用的汇总结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResult {
    pub status: u16,
    pub processed_count: usize,
    pub error_count: usize,
    pub processed: Vec<ProcessedImage>,
    pub errors: Vec<String>,
}

impl IngestResult {
    fn from_parts(processed: Vec<ProcessedImage>, errors: Vec<String>) -> Self {
        let status = if errors.is_empty() {
            status::OK
        } else {
            status::PARTIAL_SUCCESS
        };
        Self {
            status,
            processed_count: processed.len(),
            error_count: errors.len(),
            processed,
            errors,
        }
    }

    /// 调用级失败：单条错误，空的处理列表
    pub fn invocation_failure(message: impl Into<String>) -> Self {
        Self {
            status: status::INVOCATION_FAILED,
            processed_count: 0,
            error_count: 1,
            processed: Vec::new(),
            errors: vec![message.into()],
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == status::OK
    }
}

/// 入队编排器
pub struct IngestOrchestrator {
    store: Arc<dyn ObjectStore>,
    normalizer: EventNormalizer,
    publisher: MessagePublisher,
    presign_ttl: Duration,
}

impl IngestOrchestrator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        normalizer: EventNormalizer,
        publisher: MessagePublisher,
        presign_ttl: Duration,
    ) -> Self {
        Self {
            store,
            normalizer,
            publisher,
            presign_ttl,
        }
    }

    /// 按应用配置组装
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn ObjectStore>,
        queue: Arc<dyn relay_shared::queue::MessageQueue>,
    ) -> Self {
        Self::new(
            store,
            EventNormalizer::new(&config.storage.allowed_extensions),
            MessagePublisher::new(queue, config.environment.clone()),
            Duration::from_secs(config.storage.presign_ttl_seconds),
        )
    }

    /// 处理原始通知文档
    ///
    /// 文档无法解析时返回 500 且不处理任何记录。
    pub async fn handle_document(&self, raw: &str) -> IngestResult {
        match StorageEventDocument::parse(raw) {
            Ok(document) => self.process_batch(&document.into_raw_records()).await,
            Err(e) => {
                let message = format!("Error processing storage event: {e}");
                error!(error = %e, "存储事件文档无法解析");
                IngestResult::invocation_failure(message)
            }
        }
    }

    /// 处理一批记录
    pub async fn process_batch(&self, records: &[RawEventRecord]) -> IngestResult {
        info!(records = records.len(), "开始处理存储事件");

        let mut processed = Vec::new();
        let mut errors = Vec::new();

        for record in records {
            let object = match self.normalizer.normalize(record) {
                Normalized::Accepted(object) => object,
                Normalized::Skipped(reason) => {
                    metrics::record_ingest_record("skipped");
                    tracing::debug!(record = %record.describe(), ?reason, "记录已跳过");
                    continue;
                }
            };

            match self.process_object(&object).await {
                Ok(image) => {
                    metrics::record_ingest_record("processed");
                    processed.push(image);
                }
                Err(e) => {
                    metrics::record_ingest_record("error");
                    let message = format!("Error processing record {}/{}: {e}", object.bucket, object.key);
                    error!(bucket = %object.bucket, key = %object.key, error = %e, "记录处理失败");
                    errors.push(message);
                }
            }
        }

        let result = IngestResult::from_parts(processed, errors);
        info!(
            status = result.status,
            processed_count = result.processed_count,
            error_count = result.error_count,
            "存储事件处理完成"
        );
        result
    }

    async fn process_object(&self, object: &ObjectRef) -> Result<ProcessedImage, IngestError> {
        info!(bucket = %object.bucket, key = %object.key, "处理图片");

        let metadata = metadata_or_empty(self.store.as_ref(), &object.bucket, &object.key).await;
        let url = signed_url_or_fallback(
            self.store.as_ref(),
            &object.bucket,
            &object.key,
            self.presign_ttl,
        )
        .await;

        let notification = CanonicalNotification::new(
            url.clone(),
            object.key.clone(),
            self.publisher.environment(),
            metadata,
        );
        self.publisher.publish(&notification).await?;

        Ok(ProcessedImage {
            bucket: object.bucket.clone(),
            key: object.key.clone(),
            url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockObjectStore;
    use relay_shared::error::RelayError;
    use relay_shared::events::ObjectMetadata;
    use relay_shared::test_utils::InMemoryQueue;

    fn store_ok() -> MockObjectStore {
        let mut store = MockObjectStore::new();
        store.expect_head_object().returning(|_, _| {
            Ok(ObjectMetadata {
                size: Some(2048),
                content_type: Some("image/png".to_string()),
                ..Default::default()
            })
        });
        store
            .expect_presigned_get_url()
            .returning(|bucket, key, _| Ok(format!("https://{bucket}.signed/{key}?sig=1")));
        store
    }

    fn orchestrator(store: MockObjectStore, queue: Arc<InMemoryQueue>) -> IngestOrchestrator {
        IngestOrchestrator::new(
            Arc::new(store),
            EventNormalizer::default(),
            MessagePublisher::new(queue, "dev"),
            Duration::from_secs(86_400),
        )
    }

    #[tokio::test]
    async fn test_single_encoded_record() {
        let queue = Arc::new(InMemoryQueue::new());
        let orch = orchestrator(store_ok(), queue.clone());

        let result = orch
            .process_batch(&[RawEventRecord::new("imgs", "a%2Fb.png")])
            .await;

        assert_eq!(result.status, 200);
        assert_eq!(result.processed_count, 1);
        assert_eq!(result.error_count, 0);
        assert_eq!(result.processed[0].key, "a/b.png");
        assert_eq!(result.processed[0].url, "https://imgs.signed/a/b.png?sig=1");
        assert_eq!(queue.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_disallowed_extension_appears_nowhere() {
        let queue = Arc::new(InMemoryQueue::new());
        let orch = orchestrator(MockObjectStore::new(), queue.clone());

        let result = orch
            .process_batch(&[
                RawEventRecord::new("imgs", "readme.txt"),
                RawEventRecord::new("imgs", "clip.mov"),
            ])
            .await;

        assert_eq!(result.status, 200);
        assert!(result.processed.is_empty());
        assert!(result.errors.is_empty());
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_publish_failure_is_isolated() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.fail_next_publishes(1).await;
        let orch = orchestrator(store_ok(), queue.clone());

        let records = vec![
            RawEventRecord::new("imgs", "first.png"),
            RawEventRecord::new("imgs", "second.jpg"),
            RawEventRecord::new("imgs", "notes.txt"),
            RawEventRecord::default(),
        ];
        let result = orch.process_batch(&records).await;

        assert_eq!(result.status, 207);
        assert_eq!(result.error_count, 1);
        assert!(result.errors[0].contains("imgs/first.png"));
        assert_eq!(result.processed_count, 1);
        assert_eq!(result.processed[0].key, "second.jpg");
        assert!(result.processed_count + result.error_count <= records.len());
        assert_eq!(queue.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_storage_failures_do_not_fail_record() {
        let mut store = MockObjectStore::new();
        store
            .expect_head_object()
            .returning(|_, _| Err(RelayError::Storage("timeout".to_string())));
        store
            .expect_presigned_get_url()
            .returning(|_, _, _| Err(RelayError::Storage("no credentials".to_string())));

        let queue = Arc::new(InMemoryQueue::new());
        let orch = orchestrator(store, queue.clone());

        let result = orch
            .process_batch(&[RawEventRecord::new("imgs", "dir/pic.webp")])
            .await;

        assert_eq!(result.status, 200);
        assert_eq!(result.processed[0].url, "https://imgs.s3.amazonaws.com/dir/pic.webp");

        let body: CanonicalNotification = queue.visible_messages().await[0].deserialize_body().unwrap();
        assert!(body.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_document_is_invocation_failure() {
        let queue = Arc::new(InMemoryQueue::new());
        let orch = orchestrator(MockObjectStore::new(), queue);

        let result = orch.handle_document("{\"Records\": 42}").await;
        assert_eq!(result.status, 500);
        assert_eq!(result.error_count, 1);
        assert!(result.processed.is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let queue = Arc::new(InMemoryQueue::new());
        let orch = orchestrator(MockObjectStore::new(), queue);

        let result = orch.process_batch(&[]).await;
        assert!(result.is_success());
        assert_eq!(result.processed_count, 0);
    }

    #[test]
    fn test_result_wire_format() {
        let result = IngestResult::from_parts(
            vec![ProcessedImage {
                bucket: "imgs".to_string(),
                key: "a.png".to_string(),
                url: "https://x".to_string(),
            }],
            vec![],
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], 200);
        assert_eq!(json["processedCount"], 1);
        assert_eq!(json["errorCount"], 0);
        assert_eq!(json["processed"][0]["bucket"], "imgs");
        assert!(json["errors"].as_array().unwrap().is_empty());
    }
}
