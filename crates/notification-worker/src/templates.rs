//! 通知渲染
//!
//! 把队列中的标准通知映射为 Discord embed。渲染是纯函数：
//! 同一条消息重复投递时得到相同的 embed（时间戳缺失时除外，回退到当前时间）。

use chrono::{DateTime, Utc};
use relay_shared::events::CanonicalNotification;
use serde::Serialize;

pub const EMBED_TITLE: &str = "📸 New Instagram Post";
pub const EMBED_DESCRIPTION: &str = "Image uploaded from Instagram";
/// Instagram 品牌色
pub const EMBED_COLOR: u32 = 0xE4405F;
pub const FOOTER_ICON_URL: &str =
    "https://cdn.jsdelivr.net/gh/walkxcode/dashboard-icons/png/instagram.png";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedImage {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedFooter {
    pub text: String,
    pub icon_url: String,
}

/// 渲染后的通知（Discord embed 结构）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedNotification {
    pub title: String,
    pub description: String,
    pub color: u32,
    /// RFC 3339
    pub timestamp: String,
    pub image: EmbedImage,
    pub fields: Vec<EmbedField>,
    pub footer: EmbedFooter,
}

impl RenderedNotification {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }
}

/// 通知渲染器
///
/// 页脚展示的是消费端所在的部署环境。
#[derive(Debug, Clone)]
pub struct NotificationRenderer {
    environment: String,
}

impl NotificationRenderer {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
        }
    }

    pub fn render(&self, notification: &CanonicalNotification) -> RenderedNotification {
        self.render_at(notification, Utc::now())
    }

    /// `fallback_now` 只在通知时间戳缺失或无法解析时使用
    pub fn render_at(
        &self,
        notification: &CanonicalNotification,
        fallback_now: DateTime<Utc>,
    ) -> RenderedNotification {
        let timestamp = notification.created_at().unwrap_or(fallback_now);
        let metadata = &notification.metadata;

        let mut fields = Vec::with_capacity(3);
        if let Some(size) = metadata.size.filter(|s| *s > 0) {
            fields.push(inline_field("File Size", format_file_size(size)));
        }
        if let Some(content_type) = metadata.content_type.as_deref().filter(|c| !c.is_empty()) {
            fields.push(inline_field("Type", content_type));
        }
        fields.push(inline_field("Filename", notification.file_name()));

        RenderedNotification {
            title: EMBED_TITLE.to_string(),
            description: EMBED_DESCRIPTION.to_string(),
            color: EMBED_COLOR,
            timestamp: timestamp.to_rfc3339(),
            image: EmbedImage {
                url: notification.image_url.clone(),
            },
            fields,
            footer: EmbedFooter {
                text: format!("Environment: {}", self.environment),
                icon_url: FOOTER_ICON_URL.to_string(),
            },
        }
    }
}

fn inline_field(name: &str, value: impl Into<String>) -> EmbedField {
    EmbedField {
        name: name.to_string(),
        value: value.into(),
        inline: true,
    }
}

/// 二进制单位的文件大小
pub fn format_file_size(size_bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match size_bytes {
        s if s < KB => format!("{s} B"),
        s if s < MB => format!("{:.1} KB", s as f64 / KB as f64),
        s if s < GB => format!("{:.1} MB", s as f64 / MB as f64),
        s => format!("{:.1} GB", s as f64 / GB as f64),
    }
}
