//! 存储事件规范化
//!
//! 把存储服务的变更通知解析为 `RawEventRecord`，再逐条校验：
//! 缺少桶名或对象键、扩展名不在白名单内的记录直接跳过（不算错误）。

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::IngestError;

/// 默认允许的图片扩展名
pub const DEFAULT_IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

// ---------------------------------------------------------------------------
// 存储服务原生通知格式
// ---------------------------------------------------------------------------

/// 存储服务推送的通知文档
#[derive(Debug, Default, Deserialize)]
pub struct StorageEventDocument {
    #[serde(rename = "Records", default)]
    pub records: Vec<StorageEventRecord>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StorageEventRecord {
    #[serde(rename = "eventTime", default)]
    pub event_time: Option<String>,
    #[serde(default)]
    pub s3: Option<S3Entity>,
}

#[derive(Debug, Default, Deserialize)]
pub struct S3Entity {
    #[serde(default)]
    pub bucket: Option<S3Bucket>,
    #[serde(default)]
    pub object: Option<S3Object>,
}

#[derive(Debug, Default, Deserialize)]
pub struct S3Bucket {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct S3Object {
    #[serde(default)]
    pub key: Option<String>,
}

impl StorageEventDocument {
    /// 解析通知文档；整体无法解析时整次调用失败
    pub fn parse(raw: &str) -> Result<Self, IngestError> {
        serde_json::from_str(raw).map_err(|e| IngestError::InvalidEvent(e.to_string()))
    }

    pub fn into_raw_records(self) -> Vec<RawEventRecord> {
        self.records.into_iter().map(RawEventRecord::from).collect()
    }
}

// ---------------------------------------------------------------------------
// RawEventRecord
// ---------------------------------------------------------------------------

/// 单条存储变更记录
///
/// `key` 保留通知中的编码形式，由规范化步骤解码。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEventRecord {
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub event_time: Option<String>,
}

impl RawEventRecord {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: Some(bucket.into()),
            key: Some(key.into()),
            event_time: None,
        }
    }

    /// 用于日志和错误描述
    pub fn describe(&self) -> String {
        format!(
            "{}/{}",
            self.bucket.as_deref().unwrap_or("<none>"),
            self.key.as_deref().unwrap_or("<none>")
        )
    }
}

impl From<StorageEventRecord> for RawEventRecord {
    fn from(record: StorageEventRecord) -> Self {
        let (bucket, key) = match record.s3 {
            Some(s3) => (
                s3.bucket.and_then(|b| b.name),
                s3.object.and_then(|o| o.key),
            ),
            None => (None, None),
        };
        Self {
            bucket,
            key,
            event_time: record.event_time,
        }
    }
}

// ---------------------------------------------------------------------------
// 规范化
// ---------------------------------------------------------------------------

/// 通过校验的对象引用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub bucket: String,
    /// 已解码的对象键
    pub key: String,
}

/// 跳过原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingBucketOrKey,
    UnsupportedExtension(String),
}

/// 规范化结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Accepted(ObjectRef),
    Skipped(SkipReason),
}

/// 事件规范化器
#[derive(Debug, Clone)]
pub struct EventNormalizer {
    allowed_extensions: HashSet<String>,
}

impl Default for EventNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_EXTENSIONS)
    }
}

impl EventNormalizer {
    /// 扩展名不区分大小写，可带或不带前导点
    pub fn new<I, S>(allowed_extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed_extensions = allowed_extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        Self { allowed_extensions }
    }

    /// 规范化单条记录
    pub fn normalize(&self, record: &RawEventRecord) -> Normalized {
        let bucket = record.bucket.as_deref().unwrap_or_default().trim();
        let key = decode_object_key(record.key.as_deref().unwrap_or_default());

        if bucket.is_empty() || key.is_empty() {
            warn!(record = %record.describe(), "记录缺少桶名或对象键，跳过");
            return Normalized::Skipped(SkipReason::MissingBucketOrKey);
        }

        if !self.is_allowed(&key) {
            warn!(bucket, key = %key, "非图片文件，跳过");
            return Normalized::Skipped(SkipReason::UnsupportedExtension(key));
        }

        debug!(bucket, key = %key, "记录通过校验");
        Normalized::Accepted(ObjectRef {
            bucket: bucket.to_string(),
            key,
        })
    }

    /// 按小写扩展名判断是否为允许的图片
    pub fn is_allowed(&self, key: &str) -> bool {
        Path::new(key)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.allowed_extensions.contains(&ext.to_ascii_lowercase()))
            .unwrap_or(false)
    }
}

/// 解码通知中的对象键
///
/// 通知里的键经过表单编码：`+` 表示空格，其余为百分号编码。
/// 非法 UTF-8 序列按替换字符处理，不会让记录失败。
pub fn decode_object_key(raw: &str) -> String {
    let plus_decoded = raw.replace('+', " ");
    let bytes = urlencoding::decode_binary(plus_decoded.as_bytes());
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_object_key() {
        assert_eq!(decode_object_key("a%2Fb.png"), "a/b.png");
        assert_eq!(decode_object_key("my+photo%21.jpg"), "my photo!.jpg");
        assert_eq!(decode_object_key("%E5%9B%BE.png"), "图.png");
        // 字面量加号以 %2B 编码
        assert_eq!(decode_object_key("a%2Bb.png"), "a+b.png");
    }

    #[test]
    fn test_accepts_allowed_extensions_case_insensitive() {
        let normalizer = EventNormalizer::default();
        for key in ["x.jpg", "x.JPEG", "dir/x.Png", "x.gif", "x.webp"] {
            let record = RawEventRecord::new("imgs", key);
            assert!(
                matches!(normalizer.normalize(&record), Normalized::Accepted(_)),
                "{key} should be accepted"
            );
        }
    }

    #[test]
    fn test_skips_disallowed_extensions() {
        let normalizer = EventNormalizer::default();
        for key in ["notes.txt", "video.mp4", "archive.png.zip", "noext", "dir/.png"] {
            let record = RawEventRecord::new("imgs", key);
            assert!(
                matches!(
                    normalizer.normalize(&record),
                    Normalized::Skipped(SkipReason::UnsupportedExtension(_))
                ),
                "{key} should be skipped"
            );
        }
    }

    #[test]
    fn test_skips_missing_bucket_or_key() {
        let normalizer = EventNormalizer::default();

        let no_bucket = RawEventRecord {
            key: Some("a.png".to_string()),
            ..Default::default()
        };
        assert_eq!(
            normalizer.normalize(&no_bucket),
            Normalized::Skipped(SkipReason::MissingBucketOrKey)
        );

        let empty_key = RawEventRecord::new("imgs", "");
        assert_eq!(
            normalizer.normalize(&empty_key),
            Normalized::Skipped(SkipReason::MissingBucketOrKey)
        );
    }

    #[test]
    fn test_decoded_key_in_result() {
        let normalizer = EventNormalizer::default();
        let record = RawEventRecord::new("imgs", "a%2Fb.png");
        assert_eq!(
            normalizer.normalize(&record),
            Normalized::Accepted(ObjectRef {
                bucket: "imgs".to_string(),
                key: "a/b.png".to_string(),
            })
        );
    }

    #[test]
    fn test_custom_extensions() {
        let normalizer = EventNormalizer::new([".HEIC", "png"]);
        assert!(normalizer.is_allowed("x.heic"));
        assert!(normalizer.is_allowed("x.png"));
        assert!(!normalizer.is_allowed("x.jpg"));
    }

    #[test]
    fn test_parse_document() {
        let raw = r#"{
            "Records": [
                {
                    "eventTime": "2024-05-01T08:30:00.000Z",
                    "s3": {
                        "bucket": {"name": "imgs"},
                        "object": {"key": "a%2Fb.png", "size": 2048}
                    }
                },
                {"eventName": "ObjectCreated:Put"}
            ]
        }"#;

        let records = StorageEventDocument::parse(raw).unwrap().into_raw_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].bucket.as_deref(), Some("imgs"));
        assert_eq!(records[0].key.as_deref(), Some("a%2Fb.png"));
        assert_eq!(records[0].event_time.as_deref(), Some("2024-05-01T08:30:00.000Z"));
        assert_eq!(records[1], RawEventRecord::default());
    }

    #[test]
    fn test_parse_document_without_records() {
        let doc = StorageEventDocument::parse("{}").unwrap();
        assert!(doc.records.is_empty());
    }

    #[test]
    fn test_parse_malformed_document() {
        let err = StorageEventDocument::parse("[not json").unwrap_err();
        assert!(matches!(err, IngestError::InvalidEvent(_)));
    }
}
