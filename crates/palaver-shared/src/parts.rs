//! Typed message parts.
//!
//! A message is an ordered list of parts. Only `text` parts contribute to the
//! message's plain-text `content`; see [`derive_content`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    File {
        url: String,
        name: String,
        #[serde(rename = "mediaType")]
        media_type: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alt: Option<String>,
    },
    ToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        result: Value,
    },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// URL of the blob this part points at, if any.
    pub fn blob_url(&self) -> Option<&str> {
        match self {
            Self::File { url, .. } | Self::Image { url, .. } => Some(url),
            Self::Text { .. } | Self::ToolCall { .. } | Self::ToolResult { .. } => None,
        }
    }

    pub fn set_blob_url(&mut self, new_url: String) {
        match self {
            Self::File { url, .. } | Self::Image { url, .. } => *url = new_url,
            Self::Text { .. } | Self::ToolCall { .. } | Self::ToolResult { .. } => {}
        }
    }
}

/// Concatenate the text parts in order, without separators.
pub fn derive_content(parts: &[MessagePart]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            MessagePart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// First text of a message, trimmed to `max_chars`, for use as a chat title.
pub fn title_from_parts(parts: &[MessagePart], max_chars: usize) -> String {
    let content = derive_content(parts);
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return "New chat".to_string();
    }
    trimmed.chars().take(max_chars).collect()
}
