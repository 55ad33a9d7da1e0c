//! 测试工具模块
//!
//! 提供无外部依赖的内存队列和参数存储，供各 crate 的单元测试与集成测试
//! 串联入队 -> 拉取 -> 投递 -> 删除的完整流程。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{RelayError, Result};
use crate::queue::{MessageAttributes, MessageQueue, QueueMessage};
use crate::secrets::ParameterStore;

// ==================== 内存队列 ====================

#[derive(Default)]
struct QueueState {
    visible: VecDeque<QueueMessage>,
    /// 已被拉取、尚未删除的消息（receipt -> message）
    in_flight: HashMap<String, QueueMessage>,
    /// 接下来若干次 publish 返回错误
    failing_publishes: usize,
    /// 接下来若干次 receive 返回错误
    failing_receives: usize,
    /// 让所有 delete 调用失败
    fail_deletes: bool,
}

/// 内存队列
///
/// 模拟 SQS 的可见性语义：拉取后的消息进入 in-flight，删除后才真正消失；
/// 调用 [`InMemoryQueue::expire_visibility`] 模拟可见性超时后的重新投递。
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    next_id: AtomicU64,
    receive_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    receive_delay: Option<Duration>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次 receive 先等待指定时长，用于模拟长轮询
    pub fn with_receive_delay(delay: Duration) -> Self {
        Self {
            receive_delay: Some(delay),
            ..Default::default()
        }
    }

    /// 直接放入一条原始消息体（绕过 publish 计数）
    pub async fn push_raw(&self, body: impl Into<String>) -> String {
        let id = self.allocate_id();
        let mut state = self.state.lock().await;
        state.visible.push_back(QueueMessage {
            message_id: id.clone(),
            receipt_handle: String::new(),
            body: body.into(),
            attributes: MessageAttributes::new(),
        });
        id
    }

    pub async fn fail_next_publishes(&self, count: usize) {
        self.state.lock().await.failing_publishes = count;
    }

    pub async fn fail_next_receives(&self, count: usize) {
        self.state.lock().await.failing_receives = count;
    }

    pub async fn set_fail_deletes(&self, fail: bool) {
        self.state.lock().await.fail_deletes = fail;
    }

    /// 所有 in-flight 消息重新变为可见
    pub async fn expire_visibility(&self) {
        let mut state = self.state.lock().await;
        let expired: Vec<QueueMessage> = state.in_flight.drain().map(|(_, m)| m).collect();
        state.visible.extend(expired);
    }

    pub async fn visible_len(&self) -> usize {
        self.state.lock().await.visible.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// 队列中尚未删除的消息总数
    pub async fn pending_len(&self) -> usize {
        let state = self.state.lock().await;
        state.visible.len() + state.in_flight.len()
    }

    /// 可见消息的快照
    pub async fn visible_messages(&self) -> Vec<QueueMessage> {
        self.state.lock().await.visible.iter().cloned().collect()
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn allocate_id(&self) -> String {
        format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn publish(&self, body: &str, attributes: &MessageAttributes) -> Result<String> {
        let mut state = self.state.lock().await;
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(RelayError::Queue("模拟发送失败".to_string()));
        }

        let id = self.allocate_id();
        state.visible.push_back(QueueMessage {
            message_id: id.clone(),
            receipt_handle: String::new(),
            body: body.to_string(),
            attributes: attributes.clone(),
        });
        Ok(id)
    }

    async fn receive(
        &self,
        max_messages: i32,
        _wait_time_seconds: i32,
    ) -> Result<Vec<QueueMessage>> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.receive_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.failing_receives > 0 {
            state.failing_receives -= 1;
            return Err(RelayError::Queue("模拟拉取失败".to_string()));
        }

        let take = usize::try_from(max_messages.max(0)).unwrap_or(0);
        let mut batch = Vec::with_capacity(take);
        while batch.len() < take {
            let Some(mut msg) = state.visible.pop_front() else {
                break;
            };
            // 每次投递生成新的回执，与 SQS 一致
            msg.receipt_handle = format!("{}-rh-{}", msg.message_id, self.receive_calls());
            state
                .in_flight
                .insert(msg.receipt_handle.clone(), msg.clone());
            batch.push(msg);
        }
        Ok(batch)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if state.fail_deletes {
            return Err(RelayError::Queue("模拟删除失败".to_string()));
        }
        state
            .in_flight
            .remove(receipt_handle)
            .map(|_| ())
            .ok_or_else(|| RelayError::Queue(format!("回执无效: {receipt_handle}")))
    }
}

// ==================== 内存参数存储 ====================

/// 预置参数的内存参数存储
#[derive(Debug, Default)]
pub struct StaticParameterStore {
    values: HashMap<String, String>,
}

impl StaticParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl ParameterStore for StaticParameterStore {
    async fn get_parameter(&self, name: &str, _decrypt: bool) -> Result<String> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| RelayError::SecretStore {
                name: name.to_string(),
                message: "ParameterNotFound".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_queue_visibility_cycle() {
        let queue = InMemoryQueue::new();
        queue.publish("a", &MessageAttributes::new()).await.unwrap();
        queue.publish("b", &MessageAttributes::new()).await.unwrap();

        let batch = queue.receive(10, 0).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.visible_len().await, 0);
        assert_eq!(queue.in_flight_len().await, 2);

        queue.delete(&batch[0].receipt_handle).await.unwrap();
        assert_eq!(queue.pending_len().await, 1);

        // 未删除的消息在可见性超时后重新出现
        queue.expire_visibility().await;
        let again = queue.receive(10, 0).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].body, "b");
        assert_ne!(again[0].receipt_handle, batch[1].receipt_handle);
    }

    #[tokio::test]
    async fn test_in_memory_queue_respects_batch_size() {
        let queue = InMemoryQueue::new();
        for i in 0..15 {
            queue.push_raw(format!("m{i}")).await;
        }
        assert_eq!(queue.receive(10, 5).await.unwrap().len(), 10);
        assert_eq!(queue.receive(10, 5).await.unwrap().len(), 5);
        assert_eq!(queue.receive_calls(), 2);
    }

    #[tokio::test]
    async fn test_failing_publish() {
        let queue = InMemoryQueue::new();
        queue.fail_next_publishes(1).await;
        tokio_test::assert_err!(queue.publish("x", &MessageAttributes::new()).await);
        tokio_test::assert_ok!(queue.publish("x", &MessageAttributes::new()).await);
    }

    #[tokio::test]
    async fn test_static_parameter_store() {
        let store = StaticParameterStore::new().with("/dev/discord/bot-token", "t");
        assert_eq!(
            store.get_parameter("/dev/discord/bot-token", true).await.unwrap(),
            "t"
        );
        tokio_test::assert_err!(store.get_parameter("/dev/missing", false).await);
    }
}
