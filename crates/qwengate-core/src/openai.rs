//! OpenAI-compatible surface types: the inbound chat request with its
//! string-or-parts message content, model suffix parsing, and the outbound
//! chunk / completion shapes.

use serde::{Deserialize, Serialize};

/// POST /v1/chat/completions request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Streaming is the default; only an explicit `false` disables it.
    pub stream: Option<bool>,
    /// Image-generation size as "WxH" (e.g. "1792x1024").
    pub size: Option<String>,
    /// Body-field api key, accepted in server auth mode.
    pub api_key: Option<String>,
}

impl ChatCompletionRequest {
    pub fn wants_stream(&self) -> bool {
        self.stream != Some(false)
    }

    pub fn last_user_message(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    pub fn system_message(&self) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.role == Role::System)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Message content is either a plain string or a sequence of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Concatenated text, parts joined with single spaces.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Image references carried by this content, in part order.
    pub fn image_urls(&self) -> Vec<String> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ImageUrl { image_url } => Some(image_url.url.clone()),
                    ContentPart::Image { image } => Some(image.clone()),
                    ContentPart::Text { .. } => None,
                })
                .collect(),
        }
    }

    pub fn has_images(&self) -> bool {
        !self.image_urls().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    Image { image: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Upstream conversational modality, derived from the model suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatType {
    #[serde(rename = "t2t")]
    T2t,
    #[serde(rename = "t2i")]
    T2i,
    #[serde(rename = "image_edit")]
    ImageEdit,
    #[serde(rename = "t2v")]
    T2v,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::T2t => "t2t",
            ChatType::T2i => "t2i",
            ChatType::ImageEdit => "image_edit",
            ChatType::T2v => "t2v",
        }
    }

    pub fn is_image_mode(&self) -> bool {
        matches!(self, ChatType::T2i | ChatType::ImageEdit | ChatType::T2v)
    }
}

/// Result of stripping the feature suffix from a requested model name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTarget {
    /// Model name with the feature suffix removed.
    pub upstream_model: String,
    pub chat_type: ChatType,
    pub thinking: bool,
    pub search: bool,
}

/// Strip a trailing feature suffix and derive the chat type. At most one
/// suffix is recognized; `-image_edit` is matched before `-image` so the
/// longer suffix wins.
pub fn parse_model(model: &str) -> ModelTarget {
    const SUFFIXES: &[(&str, ChatType, bool, bool)] = &[
        ("-image_edit", ChatType::ImageEdit, false, false),
        ("-image", ChatType::T2i, false, false),
        ("-video", ChatType::T2v, false, false),
        ("-thinking", ChatType::T2t, true, false),
        ("-search", ChatType::T2t, false, true),
    ];

    for (suffix, chat_type, thinking, search) in SUFFIXES {
        if let Some(base) = model.strip_suffix(suffix) {
            if !base.is_empty() {
                return ModelTarget {
                    upstream_model: base.to_string(),
                    chat_type: *chat_type,
                    thinking: *thinking,
                    search: *search,
                };
            }
        }
    }

    ModelTarget {
        upstream_model: model.to_string(),
        chat_type: ChatType::T2t,
        thinking: false,
        search: false,
    }
}

// ── Outbound shapes ──────────────────────────────────────────────────────────

pub fn chatcmpl_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

/// One frame of the OpenAI streaming format.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
}

impl ChatCompletionChunk {
    fn base(id: &str, model: &str, delta: Delta, finish_reason: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    pub fn role(id: &str, model: &str) -> Self {
        Self::base(
            id,
            model,
            Delta {
                role: Some("assistant".to_string()),
                ..Delta::default()
            },
            None,
        )
    }

    pub fn content(id: &str, model: &str, text: impl Into<String>) -> Self {
        Self::base(
            id,
            model,
            Delta {
                content: Some(text.into()),
                ..Delta::default()
            },
            None,
        )
    }

    pub fn tool_calls(id: &str, model: &str, calls: serde_json::Value) -> Self {
        Self::base(
            id,
            model,
            Delta {
                tool_calls: Some(calls),
                ..Delta::default()
            },
            None,
        )
    }

    pub fn finish(id: &str, model: &str, finish_reason: &str) -> Self {
        Self::base(id, model, Delta::default(), Some(finish_reason.to_string()))
    }
}

/// Non-streaming completion body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: CompletionMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionMessage {
    pub role: &'static str,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
}

impl ChatCompletion {
    pub fn new(
        model: &str,
        content: String,
        tool_calls: Option<serde_json::Value>,
        finish_reason: &str,
    ) -> Self {
        Self {
            id: chatcmpl_id(),
            object: "chat.completion",
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![CompletionChoice {
                index: 0,
                message: CompletionMessage {
                    role: "assistant",
                    content,
                    tool_calls,
                },
                finish_reason: finish_reason.to_string(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_model_is_t2t() {
        let target = parse_model("qwen-max");
        assert_eq!(target.upstream_model, "qwen-max");
        assert_eq!(target.chat_type, ChatType::T2t);
        assert!(!target.thinking);
    }

    #[test]
    fn image_edit_wins_over_image() {
        let target = parse_model("qwen-max-image_edit");
        assert_eq!(target.upstream_model, "qwen-max");
        assert_eq!(target.chat_type, ChatType::ImageEdit);
    }

    #[test]
    fn thinking_suffix_sets_flag_only() {
        let target = parse_model("qwen-max-thinking");
        assert_eq!(target.upstream_model, "qwen-max");
        assert_eq!(target.chat_type, ChatType::T2t);
        assert!(target.thinking);
    }

    #[test]
    fn search_suffix_keeps_t2t() {
        let target = parse_model("qwen-max-search");
        assert_eq!(target.upstream_model, "qwen-max");
        assert!(target.search);
        assert_eq!(target.chat_type, ChatType::T2t);
    }

    #[test]
    fn video_suffix_maps_to_t2v() {
        assert_eq!(parse_model("wanx-video").chat_type, ChatType::T2v);
    }

    #[test]
    fn content_text_joins_parts_with_spaces() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "what is".into(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "https://x/y.png".into(),
                },
            },
            ContentPart::Text {
                text: "this?".into(),
            },
        ]);
        assert_eq!(content.text(), "what is this?");
        assert_eq!(content.image_urls(), vec!["https://x/y.png".to_string()]);
    }

    #[test]
    fn string_or_parts_both_deserialize() {
        let plain: ChatMessage =
            serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert_eq!(plain.content.text(), "hi");

        let parts: ChatMessage = serde_json::from_str(
            r#"{"role":"user","content":[{"type":"text","text":"hi"},{"type":"image","image":"ref-1"}]}"#,
        )
        .unwrap();
        assert!(parts.content.has_images());
    }

    #[test]
    fn chunk_serialization_omits_empty_fields() {
        let chunk = ChatCompletionChunk::content("chatcmpl-x", "qwen-max", "he");
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.contains(r#""content":"he""#));
        assert!(!json.contains("finish_reason"));
        assert!(!json.contains("role"));

        let finish = ChatCompletionChunk::finish("chatcmpl-x", "qwen-max", "stop");
        let json = serde_json::to_string(&finish).unwrap();
        assert!(json.contains(r#""finish_reason":"stop""#));
    }
}
