//! 对象存储协作者
//!
//! 通过 `ObjectStore` trait 抽象元数据查询与预签名地址生成，S3 实现基于 aws-sdk-s3。
//! 两个操作都是尽力而为：元数据失败时为空，签名失败时回退到公共地址。

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::DateTimeFormat;
use relay_shared::error::{RelayError, Result};
use relay_shared::events::ObjectMetadata;
use tracing::{error, warn};

/// 对象存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 查询对象元数据
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata>;

    /// 生成限时 GET 地址
    async fn presigned_get_url(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String>;
}

/// 基于 Amazon S3 的实现
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| RelayError::Storage(format!("查询元数据失败: {}", DisplayErrorContext(&e))))?;

        Ok(ObjectMetadata {
            size: output.content_length().and_then(|len| u64::try_from(len).ok()),
            last_modified: output
                .last_modified()
                .and_then(|ts| ts.fmt(DateTimeFormat::DateTime).ok()),
            content_type: output
                .content_type()
                .filter(|ct| !ct.is_empty())
                .map(str::to_string),
            // S3 返回的 ETag 带引号
            etag: output
                .e_tag()
                .map(|etag| etag.trim_matches('"').to_string())
                .filter(|etag| !etag.is_empty()),
            user_metadata: output.metadata().cloned().unwrap_or_default(),
        })
    }

    async fn presigned_get_url(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| RelayError::Storage(format!("预签名配置无效: {e}")))?;

        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| RelayError::Storage(format!("生成预签名地址失败: {}", DisplayErrorContext(&e))))?;

        Ok(request.uri().to_string())
    }
}

/// 公共访问地址
///
/// 对象键按路径段编码，保留 `/` 分隔符。
pub fn public_url(bucket: &str, key: &str) -> String {
    let encoded_key = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("https://{bucket}.s3.amazonaws.com/{encoded_key}")
}

/// 元数据查询，失败时返回空元数据
pub async fn metadata_or_empty<S>(store: &S, bucket: &str, key: &str) -> ObjectMetadata
where
    S: ObjectStore + ?Sized,
{
    match store.head_object(bucket, key).await {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!(bucket, key, error = %e, "无法获取对象元数据，按空元数据继续");
            ObjectMetadata::default()
        }
    }
}

/// 预签名地址，失败时回退到公共地址
pub async fn signed_url_or_fallback<S>(store: &S, bucket: &str, key: &str, ttl: Duration) -> String
where
    S: ObjectStore + ?Sized,
{
    match store.presigned_get_url(bucket, key, ttl).await {
        Ok(url) if !url.is_empty() => url,
        Ok(_) => public_url(bucket, key),
        Err(e) => {
            error!(bucket, key, error = %e, "生成预签名地址失败，回退到公共地址");
            public_url(bucket, key)
        }
    }
}
