//! Wire types for the web-chat API: chat creation, the completion message
//! envelope, streaming deltas, and the model catalogue.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use qwengate_core::openai::ChatType;

// ── Chat creation ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct NewChatRequest {
    pub title: String,
    pub models: Vec<String>,
    pub chat_mode: String,
    pub chat_type: ChatType,
    /// Milliseconds, unlike the message envelope timestamps.
    pub timestamp: i64,
}

impl NewChatRequest {
    pub fn new(model: &str, chat_type: ChatType, timestamp_ms: i64) -> Self {
        Self {
            title: "New Chat".to_string(),
            models: vec![model.to_string()],
            chat_mode: "normal".to_string(),
            chat_type,
            timestamp: timestamp_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NewChatResponse {
    #[serde(default)]
    pub data: Option<NewChatData>,
}

#[derive(Debug, Deserialize)]
pub struct NewChatData {
    #[serde(default)]
    pub id: Option<String>,
}

// ── Completion envelope ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ChatCompletionEnvelope {
    pub stream: bool,
    pub incremental_output: bool,
    pub chat_id: String,
    pub chat_mode: String,
    pub model: String,
    pub parent_id: Option<String>,
    pub messages: Vec<UpstreamMessage>,
    /// Unix seconds, shared by every message in the envelope.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UpstreamMessage {
    pub fid: String,
    pub parent_id: Option<String>,
    #[serde(rename = "childrenIds")]
    pub children_ids: Vec<String>,
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_action: Option<String>,
    pub files: Vec<FileDescriptor>,
    pub timestamp: i64,
    pub models: Vec<String>,
    pub chat_type: ChatType,
    pub sub_chat_type: ChatType,
    pub feature_config: FeatureConfig,
    pub extra: MessageExtra,
}

impl UpstreamMessage {
    pub fn user(
        content: String,
        files: Vec<FileDescriptor>,
        model: &str,
        chat_type: ChatType,
        thinking: bool,
        timestamp: i64,
    ) -> Self {
        Self {
            fid: Uuid::new_v4().to_string(),
            parent_id: None,
            children_ids: Vec::new(),
            role: "user".to_string(),
            content,
            user_action: Some("chat".to_string()),
            files,
            timestamp,
            models: vec![model.to_string()],
            chat_type,
            sub_chat_type: chat_type,
            feature_config: FeatureConfig {
                thinking_enabled: thinking,
                output_schema: "phase".to_string(),
            },
            extra: MessageExtra {
                meta: MessageMeta {
                    sub_chat_type: chat_type,
                },
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FeatureConfig {
    pub thinking_enabled: bool,
    pub output_schema: String,
}

#[derive(Debug, Serialize)]
pub struct MessageExtra {
    pub meta: MessageMeta,
}

#[derive(Debug, Serialize)]
pub struct MessageMeta {
    #[serde(rename = "subChatType")]
    pub sub_chat_type: ChatType,
}

/// Image attachment passed by URL; nothing is re-uploaded, so size stays 0
/// and the hash is absent.
#[derive(Debug, Clone, Serialize)]
pub struct FileDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub file_type: String,
    pub name: String,
    pub file_class: String,
    pub url: String,
    pub size: u64,
    pub status: String,
    pub id: String,
    #[serde(rename = "itemId")]
    pub item_id: String,
    #[serde(rename = "uploadTaskId")]
    pub upload_task_id: String,
    #[serde(rename = "showType")]
    pub show_type: String,
}

impl FileDescriptor {
    pub fn image(url: &str, timestamp_ms: i64) -> Self {
        let file_type = guess_content_type(url);
        let ext = file_type.rsplit('/').next().unwrap_or("png");
        Self {
            kind: "image".to_string(),
            name: format!("image-{timestamp_ms}.{ext}"),
            file_class: "vision".to_string(),
            url: url.to_string(),
            size: 0,
            status: "uploaded".to_string(),
            id: Uuid::new_v4().to_string(),
            item_id: Uuid::new_v4().to_string(),
            upload_task_id: Uuid::new_v4().to_string(),
            show_type: "image".to_string(),
            file_type,
        }
    }
}

/// MIME type from a data URL, else from the URL extension, else image/png.
pub fn guess_content_type(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some(mime) = rest.split(|c| c == ';' || c == ',').next() {
            if !mime.is_empty() {
                return mime.to_string();
            }
        }
    }

    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg".to_string(),
        "gif" => "image/gif".to_string(),
        "webp" => "image/webp".to_string(),
        "bmp" => "image/bmp".to_string(),
        "svg" => "image/svg+xml".to_string(),
        _ => "image/png".to_string(),
    }
}

// ── Streaming deltas ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct StreamFrame {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    /// "thinking", "answer", "tool_use", … — unknown values read as answer.
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<serde_json::Value>,
}

// ── Chat listing (housekeeping) ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatListResponse {
    #[serde(default)]
    pub data: Vec<ChatSummary>,
}

#[derive(Debug, Deserialize)]
pub struct ChatSummary {
    pub id: String,
}

// ── Model catalogue ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ModelCatalogue {
    #[serde(default)]
    pub data: Vec<CatalogueModel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogueModel {
    pub id: String,
    #[serde(default)]
    pub info: ModelInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelInfo {
    #[serde(default)]
    pub meta: ModelMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelMeta {
    #[serde(default)]
    pub capabilities: ModelCapabilities,
    #[serde(default)]
    pub chat_type: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default)]
    pub thinking: bool,
}
