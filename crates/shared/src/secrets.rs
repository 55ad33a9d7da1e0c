//! 参数存储
//!
//! 启动时解析机器人凭证和频道 ID：优先使用进程配置，缺失时回退到 SSM Parameter Store。

use async_trait::async_trait;
use aws_sdk_ssm::Client;
use aws_sdk_ssm::error::DisplayErrorContext;
use tracing::{debug, error};

use crate::error::{RelayError, Result};

/// 参数存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ParameterStore: Send + Sync {
    async fn get_parameter(&self, name: &str, decrypt: bool) -> Result<String>;
}

/// 基于 SSM Parameter Store 的实现
#[derive(Clone)]
pub struct SsmParameterStore {
    client: Client,
}

impl SsmParameterStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ParameterStore for SsmParameterStore {
    async fn get_parameter(&self, name: &str, decrypt: bool) -> Result<String> {
        let output = self
            .client
            .get_parameter()
            .name(name)
            .with_decryption(decrypt)
            .send()
            .await
            .map_err(|e| RelayError::SecretStore {
                name: name.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        output
            .parameter()
            .and_then(|p| p.value())
            .map(str::to_string)
            .ok_or_else(|| RelayError::SecretStore {
                name: name.to_string(),
                message: "参数没有值".to_string(),
            })
    }
}

/// 参数存储中的路径，按部署环境隔离
pub mod parameter_names {
    pub fn bot_token(environment: &str) -> String {
        format!("/{environment}/discord/bot-token")
    }

    pub fn channel_id(environment: &str) -> String {
        format!("/{environment}/discord/channel-id")
    }
}

/// 解析一个必需的密钥
///
/// `configured` 非空时直接使用，否则查询参数存储。两处都取不到时返回
/// `SecretStore` 错误，调用方据此拒绝启动。
pub async fn resolve_secret<S>(
    store: &S,
    configured: Option<&str>,
    parameter_name: &str,
    decrypt: bool,
) -> Result<String>
where
    S: ParameterStore + ?Sized,
{
    if let Some(value) = configured.map(str::trim).filter(|v| !v.is_empty()) {
        debug!(parameter = parameter_name, "使用进程配置中的值");
        return Ok(value.to_string());
    }

    match store.get_parameter(parameter_name, decrypt).await {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        Ok(_) => Err(RelayError::SecretStore {
            name: parameter_name.to_string(),
            message: "参数值为空".to_string(),
        }),
        Err(e) => {
            error!(parameter = parameter_name, error = %e, "无法从参数存储获取配置");
            Err(e)
        }
    }
}
