//! 队列消息模型
//!
//! 定义上传通知在队列中的标准格式。入队侧（image-ingest）负责构造，
//! 出队侧（notification-worker）负责解析，两端共用同一份结构体以保证字段一致。

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// 队列消息属性名
pub mod attributes {
    pub const ENVIRONMENT: &str = "Environment";
    pub const MESSAGE_TYPE: &str = "MessageType";
}

/// 图片上传消息的类型标识，写入消息属性供路由使用
pub const MESSAGE_TYPE_IMAGE_UPLOAD: &str = "InstagramImageUpload";

/// 对象元数据
///
/// 所有字段都是可选的：元数据查询失败时整个结构为空，消息照常入队。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// 对象上的用户自定义元数据
    #[serde(default, rename = "metadata", skip_serializing_if = "HashMap::is_empty")]
    pub user_metadata: HashMap<String, String>,
}

impl ObjectMetadata {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// 标准上传通知
///
/// 字段名与已部署的消费者保持一致（`image_url`、`object_key`、`timestamp`）。
/// 反序列化时各字段都有默认值，缺失字段由消费侧判断如何处理。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalNotification {
    /// 预签名访问地址（24 小时有效）或公共地址
    #[serde(default)]
    pub image_url: String,
    #[serde(default = "unknown_key")]
    pub object_key: String,
    /// ISO-8601 UTC 时间
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub metadata: ObjectMetadata,
}

fn unknown_key() -> String {
    "unknown".to_string()
}

impl CanonicalNotification {
    /// 以当前时间创建通知
    pub fn new(
        image_url: impl Into<String>,
        object_key: impl Into<String>,
        environment: impl Into<String>,
        metadata: ObjectMetadata,
    ) -> Self {
        Self {
            image_url: image_url.into(),
            object_key: object_key.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            environment: environment.into(),
            metadata,
        }
    }

    /// 入队前的不变量：地址与对象键都不能为空
    pub fn is_publishable(&self) -> bool {
        !self.image_url.trim().is_empty() && !self.object_key.trim().is_empty()
    }

    pub fn has_image_url(&self) -> bool {
        !self.image_url.trim().is_empty()
    }

    /// 解析创建时间
    ///
    /// 同时接受带时区的 RFC 3339 与不带时区的 ISO-8601（按 UTC 处理），
    /// 无法解析时返回 None。
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.timestamp.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// 文件名：对象键的最后一段
    pub fn file_name(&self) -> &str {
        self.object_key
            .rsplit('/')
            .next()
            .unwrap_or(&self.object_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn sample() -> CanonicalNotification {
        CanonicalNotification {
            image_url: "https://imgs.s3.amazonaws.com/a/b.png?X-Amz-Signature=abc".to_string(),
            object_key: "a/b.png".to_string(),
            timestamp: "2024-05-01T08:30:00.000Z".to_string(),
            environment: "dev".to_string(),
            metadata: ObjectMetadata {
                size: Some(2048),
                content_type: Some("image/png".to_string()),
                etag: Some("d41d8cd98f00b204e9800998ecf8427e".to_string()),
                user_metadata: HashMap::from([("source".to_string(), "instagram".to_string())]),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("image_url").is_some());
        assert!(json.get("object_key").is_some());
        assert!(json.get("timestamp").is_some());
        assert_eq!(json["metadata"]["metadata"]["source"], "instagram");
        // 空的可选字段不输出
        assert!(json["metadata"].get("last_modified").is_none());
    }

    #[test]
    fn test_serialized_message_reparses_identically() {
        let original = sample();
        let body = serde_json::to_string(&original).unwrap();
        let parsed: CanonicalNotification = serde_json::from_str(&body).unwrap();

        assert_eq!(parsed.object_key, original.object_key);
        assert_eq!(parsed.image_url, original.image_url);
        assert_eq!(parsed.metadata, original.metadata);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let parsed: CanonicalNotification =
            serde_json::from_str(r#"{"timestamp":"2024-01-01T00:00:00"}"#).unwrap();
        assert!(!parsed.has_image_url());
        assert_eq!(parsed.object_key, "unknown");
        assert!(parsed.metadata.is_empty());
        assert!(!parsed.is_publishable());
    }

    #[test]
    fn test_empty_metadata_object_parses() {
        let parsed: CanonicalNotification = serde_json::from_str(
            r#"{"image_url":"https://x/y.png","object_key":"y.png","metadata":{}}"#,
        )
        .unwrap();
        assert!(parsed.metadata.is_empty());
        assert!(parsed.is_publishable());
    }

    #[test]
    fn test_created_at_formats() {
        let mut n = sample();
        let ts = n.created_at().unwrap();
        assert_eq!((ts.year(), ts.month(), ts.day(), ts.hour()), (2024, 5, 1, 8));

        n.timestamp = "2024-05-01T08:30:00.123456".to_string();
        assert_eq!(n.created_at().unwrap().minute(), 30);

        n.timestamp = "yesterday".to_string();
        assert!(n.created_at().is_none());

        n.timestamp = String::new();
        assert!(n.created_at().is_none());
    }

    #[test]
    fn test_file_name() {
        let mut n = sample();
        assert_eq!(n.file_name(), "b.png");
        n.object_key = "plain.jpg".to_string();
        assert_eq!(n.file_name(), "plain.jpg");
    }

    #[test]
    fn test_new_sets_utc_timestamp() {
        let n = CanonicalNotification::new("u", "k.png", "prod", ObjectMetadata::default());
        assert!(n.timestamp.ends_with('Z'));
        assert!(n.created_at().is_some());
    }
}
