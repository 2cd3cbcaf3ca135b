//! OpenAI request → upstream envelope translation: modality routing from the
//! model suffix, vision-model fallback, image attachment normalization, and
//! multi-turn history compression into a single upstream user message.

use chrono::Utc;
use tracing::debug;

use qwengate_core::openai::{
    parse_model, ChatCompletionRequest, ChatMessage, ChatType, MessageContent, Role,
};
use qwengate_pool::Identity;

use crate::api::QwenClient;
use crate::error::UpstreamError;
use crate::wire::{ChatCompletionEnvelope, FileDescriptor, UpstreamMessage};

/// Prepended to single-turn messages so the upstream starts from a clean
/// conversational state instead of reusing short-term memory.
const RESET_MARKER: &str = "(新对话，请忽略之前的上下文)";

const HISTORY_HEADER: &str = "对话历史：";
const QUESTION_HEADER: &str = "当前问题：";
const USER_LABEL: &str = "用户";
const ASSISTANT_LABEL: &str = "助手";

const T2I_PLACEHOLDER: &str = "生成一张图片";
const EDIT_PLACEHOLDER: &str = "编辑图片";

/// At most this many images are carried into an image_edit request.
const MAX_EDIT_IMAGES: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct TranslateOptions {
    pub vision_fallback_model: Option<String>,
    pub disable_vision_fallback: bool,
}

/// Resolved model and modality for one request, before any upstream call.
#[derive(Debug, Clone)]
pub struct RequestPlan {
    pub model: String,
    pub chat_type: ChatType,
    pub thinking: bool,
    pub used_fallback: bool,
}

#[derive(Debug)]
pub struct TranslationOutcome {
    pub envelope: ChatCompletionEnvelope,
    pub chat_id: String,
    pub model: String,
    pub thinking: bool,
    pub used_fallback: bool,
}

/// Full translation: plan, create the upstream chat, build and validate the
/// message envelope. The chat id is scoped to the identity that created it.
pub async fn translate(
    qwen: &QwenClient,
    ident: &Identity,
    req: &ChatCompletionRequest,
    opts: &TranslateOptions,
) -> Result<TranslationOutcome, UpstreamError> {
    let plan = plan_request(req, opts)?;

    let now = Utc::now();
    let chat_id = qwen
        .create_chat(ident, &plan.model, plan.chat_type, now.timestamp_millis())
        .await?;

    let envelope = build_envelope(req, &plan, &chat_id, now.timestamp(), now.timestamp_millis())?;
    validate_envelope(&envelope)?;

    Ok(TranslationOutcome {
        envelope,
        chat_id,
        model: plan.model.clone(),
        thinking: plan.thinking,
        used_fallback: plan.used_fallback,
    })
}

/// Validate the request and resolve model, modality, and fallback. Pure.
pub fn plan_request(
    req: &ChatCompletionRequest,
    opts: &TranslateOptions,
) -> Result<RequestPlan, UpstreamError> {
    if req.messages.is_empty() {
        return Err(UpstreamError::Invalid(
            "messages must be a non-empty array".to_string(),
        ));
    }

    let target = parse_model(&req.model);
    let has_images = req.messages.iter().any(|m| m.content.has_images());

    let mut model = target.upstream_model;
    let mut used_fallback = false;
    if has_images && !target.chat_type.is_image_mode() && !opts.disable_vision_fallback {
        if let Some(fallback) = &opts.vision_fallback_model {
            debug!(from = %model, to = %fallback, "vision fallback engaged");
            model = fallback.clone();
            used_fallback = true;
        }
    }

    Ok(RequestPlan {
        model,
        chat_type: target.chat_type,
        thinking: target.thinking,
        used_fallback,
    })
}

/// Build the message envelope for an already-created chat. Pure apart from
/// fresh uuids; timestamps are injected so the result is reproducible.
pub fn build_envelope(
    req: &ChatCompletionRequest,
    plan: &RequestPlan,
    chat_id: &str,
    timestamp: i64,
    timestamp_ms: i64,
) -> Result<ChatCompletionEnvelope, UpstreamError> {
    let (messages, size) = match plan.chat_type {
        ChatType::T2i | ChatType::T2v => media_prompt(req, plan, plan.chat_type, timestamp)?,
        ChatType::ImageEdit => image_edit_prompt(req, plan, timestamp, timestamp_ms)?,
        ChatType::T2t => (vec![text_prompt(req, plan, timestamp)?], None),
    };

    Ok(ChatCompletionEnvelope {
        // The upstream only ever streams; stream=false would still answer
        // with an event stream.
        stream: true,
        incremental_output: true,
        chat_id: chat_id.to_string(),
        chat_mode: "normal".to_string(),
        model: plan.model.clone(),
        parent_id: None,
        messages,
        timestamp,
        size,
    })
}

fn last_user(req: &ChatCompletionRequest) -> Result<&ChatMessage, UpstreamError> {
    req.last_user_message()
        .ok_or_else(|| UpstreamError::Invalid("no user message in request".to_string()))
}

/// t2i / t2v: a single user message from the last user turn, no files,
/// image size mapped to an aspect ratio.
fn media_prompt(
    req: &ChatCompletionRequest,
    plan: &RequestPlan,
    chat_type: ChatType,
    timestamp: i64,
) -> Result<(Vec<UpstreamMessage>, Option<String>), UpstreamError> {
    let text = last_user(req)?.content.text();
    let content = if text.trim().is_empty() {
        T2I_PLACEHOLDER.to_string()
    } else {
        text
    };
    let size = req.size.as_deref().and_then(aspect_ratio);

    let message = UpstreamMessage::user(
        content,
        Vec::new(),
        &plan.model,
        chat_type,
        plan.thinking,
        timestamp,
    );
    Ok((vec![message], size))
}

/// image_edit: attach the most recent usable image; with none to work on,
/// the request downgrades to plain generation.
fn image_edit_prompt(
    req: &ChatCompletionRequest,
    plan: &RequestPlan,
    timestamp: i64,
    timestamp_ms: i64,
) -> Result<(Vec<UpstreamMessage>, Option<String>), UpstreamError> {
    let images = harvest_images(req)?;
    let Some(url) = images.last() else {
        debug!("image_edit without attachments, downgrading to t2i");
        return media_prompt(req, plan, ChatType::T2i, timestamp);
    };

    let text = last_user(req)?.content.text();
    let content = if text.trim().is_empty() {
        EDIT_PLACEHOLDER.to_string()
    } else {
        text
    };

    let file = FileDescriptor::image(url, timestamp_ms);
    let message = UpstreamMessage::user(
        content,
        vec![file],
        &plan.model,
        ChatType::ImageEdit,
        plan.thinking,
        timestamp,
    );
    Ok((vec![message], None))
}

/// Collect candidate images for editing: the current user message's parts
/// first, then history from newest to oldest (assistant Markdown, user parts
/// and Markdown). Capped to the last [`MAX_EDIT_IMAGES`].
fn harvest_images(req: &ChatCompletionRequest) -> Result<Vec<String>, UpstreamError> {
    let last_idx = req
        .messages
        .iter()
        .rposition(|m| m.role == Role::User)
        .ok_or_else(|| UpstreamError::Invalid("no user message in request".to_string()))?;

    let mut images = req.messages[last_idx].content.image_urls();

    for message in req.messages[..last_idx].iter().rev() {
        match message.role {
            Role::Assistant => {
                if let MessageContent::Text(text) = &message.content {
                    images.extend(markdown_image_urls(text));
                }
            }
            Role::User => {
                images.extend(message.content.image_urls());
                images.extend(markdown_image_urls(&message.content.text()));
            }
            Role::System => {}
        }
    }

    if images.len() > MAX_EDIT_IMAGES {
        images.drain(..images.len() - MAX_EDIT_IMAGES);
    }
    Ok(images)
}

/// t2t: fold the conversation into one user message. The upstream rejects
/// multi-turn assistant history in a freshly created chat, so prior turns
/// become an inline transcript and the final user turn the actual question.
fn text_prompt(
    req: &ChatCompletionRequest,
    plan: &RequestPlan,
    timestamp: i64,
) -> Result<UpstreamMessage, UpstreamError> {
    let last_idx = req
        .messages
        .iter()
        .rposition(|m| m.role == Role::User)
        .ok_or_else(|| UpstreamError::Invalid("no user message in request".to_string()))?;

    let question = req.messages[last_idx].content.text();
    let system = req
        .system_message()
        .map(|m| m.content.text())
        .filter(|s| !s.trim().is_empty());

    let prior: Vec<&ChatMessage> = req.messages[..last_idx]
        .iter()
        .filter(|m| m.role != Role::System)
        .collect();

    let mut content = String::new();
    if let Some(system) = &system {
        content.push_str(system);
        content.push_str("\n\n");
    }

    if prior.is_empty() {
        if system.is_none() {
            content.push_str(RESET_MARKER);
            content.push('\n');
        }
        content.push_str(&question);
    } else {
        content.push_str(HISTORY_HEADER);
        content.push('\n');
        for message in prior {
            let label = match message.role {
                Role::Assistant => ASSISTANT_LABEL,
                _ => USER_LABEL,
            };
            content.push_str(label);
            content.push_str(": ");
            content.push_str(&message.content.text());
            content.push('\n');
        }
        content.push_str(QUESTION_HEADER);
        content.push_str(&question);
    }

    let files = req.messages[last_idx]
        .content
        .image_urls()
        .iter()
        .map(|url| FileDescriptor::image(url, timestamp * 1000))
        .collect();

    Ok(UpstreamMessage::user(
        content,
        files,
        &plan.model,
        ChatType::T2t,
        plan.thinking,
        timestamp,
    ))
}

/// Map an OpenAI pixel size to the upstream aspect-ratio form. Common sizes
/// use a fixed table; anything else is reduced by GCD.
pub fn aspect_ratio(size: &str) -> Option<String> {
    let fixed = match size {
        "256x256" | "512x512" | "1024x1024" | "2048x2048" => Some("1:1"),
        "1792x1024" => Some("16:9"),
        "1024x1792" => Some("9:16"),
        "1152x768" => Some("3:2"),
        "768x1152" => Some("2:3"),
        _ => None,
    };
    if let Some(ratio) = fixed {
        return Some(ratio.to_string());
    }

    let (w, h) = size.split_once(['x', 'X'])?;
    let w: u64 = w.trim().parse().ok()?;
    let h: u64 = h.trim().parse().ok()?;
    if w == 0 || h == 0 {
        return None;
    }
    let g = gcd(w, h);
    Some(format!("{}:{}", w / g, h / g))
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Extract the url component of each `![...](url)` occurrence. Optional
/// Markdown titles after the url are dropped.
fn markdown_image_urls(text: &str) -> Vec<String> {
    let mut urls = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("![") {
        let after = &rest[start + 2..];
        let Some(close) = after.find("](") else { break };
        let after_paren = &after[close + 2..];
        let Some(end) = after_paren.find(')') else { break };
        let url = after_paren[..end].trim();
        if let Some(url) = url.split_whitespace().next() {
            urls.push(url.to_string());
        }
        rest = &after_paren[end + 1..];
    }
    urls
}

/// Post-translation consistency check: anything failing here is a proxy bug,
/// not a client mistake.
pub fn validate_envelope(envelope: &ChatCompletionEnvelope) -> Result<(), UpstreamError> {
    if envelope.chat_id.is_empty() {
        return Err(UpstreamError::Translation("missing chat_id".to_string()));
    }
    if envelope.messages.is_empty() {
        return Err(UpstreamError::Translation("empty message list".to_string()));
    }
    for message in &envelope.messages {
        if message.fid.is_empty() || message.role.is_empty() {
            return Err(UpstreamError::Translation(
                "message missing fid or role".to_string(),
            ));
        }
        if message.role == "user" {
            if message.user_action.is_none() {
                return Err(UpstreamError::Translation(
                    "user message missing user_action".to_string(),
                ));
            }
            if message.timestamp <= 0 || message.models.is_empty() {
                return Err(UpstreamError::Translation(
                    "user message missing timestamp or models".to_string(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qwengate_core::openai::{ContentPart, ImageUrl};

    fn user(text: &str) -> ChatMessage {
        ChatMessage {
            role: Role::User,
            content: MessageContent::Text(text.to_string()),
        }
    }

    fn assistant(text: &str) -> ChatMessage {
        ChatMessage {
            role: Role::Assistant,
            content: MessageContent::Text(text.to_string()),
        }
    }

    fn request(model: &str, messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages,
            stream: None,
            size: None,
            api_key: None,
        }
    }

    fn image_part(url: &str) -> ContentPart {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.to_string(),
            },
        }
    }

    #[test]
    fn empty_messages_is_invalid() {
        let req = request("qwen-max", Vec::new());
        let err = plan_request(&req, &TranslateOptions::default()).unwrap_err();
        assert!(matches!(err, UpstreamError::Invalid(_)));
    }

    #[test]
    fn vision_fallback_engages_for_images_on_text_model() {
        let req = request(
            "qwen-max",
            vec![ChatMessage {
                role: Role::User,
                content: MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: "what is this?".into(),
                    },
                    image_part("https://cdn/x.png"),
                ]),
            }],
        );
        let opts = TranslateOptions {
            vision_fallback_model: Some("qwen3-vl-plus".into()),
            disable_vision_fallback: false,
        };
        let plan = plan_request(&req, &opts).unwrap();
        assert!(plan.used_fallback);
        assert_eq!(plan.model, "qwen3-vl-plus");
        assert_eq!(plan.chat_type, ChatType::T2t);
    }

    #[test]
    fn fallback_skipped_for_image_models_and_when_disabled() {
        let mut req = request(
            "qwen-max-image",
            vec![ChatMessage {
                role: Role::User,
                content: MessageContent::Parts(vec![image_part("https://cdn/x.png")]),
            }],
        );
        let opts = TranslateOptions {
            vision_fallback_model: Some("qwen3-vl-plus".into()),
            disable_vision_fallback: false,
        };
        assert!(!plan_request(&req, &opts).unwrap().used_fallback);

        req.model = "qwen-max".into();
        let disabled = TranslateOptions {
            vision_fallback_model: Some("qwen3-vl-plus".into()),
            disable_vision_fallback: true,
        };
        let plan = plan_request(&req, &disabled).unwrap();
        assert!(!plan.used_fallback);
        assert_eq!(plan.model, "qwen-max");
    }

    #[test]
    fn single_turn_gets_reset_marker() {
        let req = request("qwen-max", vec![user("hi")]);
        let plan = plan_request(&req, &TranslateOptions::default()).unwrap();
        let envelope = build_envelope(&req, &plan, "C1", 1_700_000_000, 1_700_000_000_000).unwrap();

        let content = &envelope.messages[0].content;
        assert!(content.starts_with(RESET_MARKER));
        assert!(content.ends_with("hi"));
        assert!(!content.contains(HISTORY_HEADER));
    }

    #[test]
    fn multi_turn_compresses_to_transcript() {
        let req = request("qwen-max", vec![user("a"), assistant("b"), user("c")]);
        let plan = plan_request(&req, &TranslateOptions::default()).unwrap();
        let envelope = build_envelope(&req, &plan, "C1", 1_700_000_000, 1_700_000_000_000).unwrap();

        assert_eq!(envelope.messages.len(), 1);
        let content = &envelope.messages[0].content;
        assert!(content.starts_with(HISTORY_HEADER));
        assert!(content.contains("用户: a"));
        assert!(content.contains("助手: b"));
        assert!(content.ends_with("当前问题：c"));
        assert!(!content.contains(RESET_MARKER));
        assert!(!envelope.messages[0].feature_config.thinking_enabled);
    }

    #[test]
    fn system_message_is_prepended() {
        let req = request(
            "qwen-max",
            vec![
                ChatMessage {
                    role: Role::System,
                    content: MessageContent::Text("be brief".into()),
                },
                user("a"),
                assistant("b"),
                user("c"),
            ],
        );
        let plan = plan_request(&req, &TranslateOptions::default()).unwrap();
        let envelope = build_envelope(&req, &plan, "C1", 1_700_000_000, 1_700_000_000_000).unwrap();

        let content = &envelope.messages[0].content;
        assert!(content.starts_with("be brief\n\n"));
        assert!(!content.contains("用户: be brief"));
    }

    #[test]
    fn thinking_suffix_sets_feature_flag() {
        let req = request("qwen-max-thinking", vec![user("hi")]);
        let plan = plan_request(&req, &TranslateOptions::default()).unwrap();
        assert!(plan.thinking);
        let envelope = build_envelope(&req, &plan, "C1", 1_700_000_000, 1_700_000_000_000).unwrap();
        assert!(envelope.messages[0].feature_config.thinking_enabled);
        assert_eq!(envelope.model, "qwen-max");
    }

    #[test]
    fn t2i_maps_size_table_and_defaults_prompt() {
        let mut req = request("qwen-max-image", vec![user("draw a cat")]);
        req.size = Some("1792x1024".into());
        let plan = plan_request(&req, &TranslateOptions::default()).unwrap();
        let envelope = build_envelope(&req, &plan, "C1", 1_700_000_000, 1_700_000_000_000).unwrap();

        assert_eq!(envelope.size.as_deref(), Some("16:9"));
        let message = &envelope.messages[0];
        assert_eq!(message.chat_type, ChatType::T2i);
        assert!(message.files.is_empty());
        assert_eq!(message.content, "draw a cat");
        assert!(!message.feature_config.thinking_enabled);

        let empty = request("qwen-max-image", vec![user("   ")]);
        let plan = plan_request(&empty, &TranslateOptions::default()).unwrap();
        let envelope =
            build_envelope(&empty, &plan, "C1", 1_700_000_000, 1_700_000_000_000).unwrap();
        assert_eq!(envelope.messages[0].content, T2I_PLACEHOLDER);
    }

    #[test]
    fn aspect_ratio_gcd_reduction() {
        assert_eq!(aspect_ratio("1920x1080").as_deref(), Some("16:9"));
        assert_eq!(aspect_ratio("1000x1000").as_deref(), Some("1:1"));
        assert_eq!(aspect_ratio("512x512").as_deref(), Some("1:1"));
        assert_eq!(aspect_ratio("768x1152").as_deref(), Some("2:3"));
        assert_eq!(aspect_ratio("nonsense"), None);
        assert_eq!(aspect_ratio("0x100"), None);
    }

    #[test]
    fn image_edit_attaches_latest_image() {
        let req = request(
            "qwen-max-image_edit",
            vec![ChatMessage {
                role: Role::User,
                content: MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: "remove the background".into(),
                    },
                    image_part("https://cdn/photo.jpg"),
                ]),
            }],
        );
        let plan = plan_request(&req, &TranslateOptions::default()).unwrap();
        let envelope = build_envelope(&req, &plan, "C1", 1_700_000_000, 1_700_000_000_000).unwrap();

        let message = &envelope.messages[0];
        assert_eq!(message.chat_type, ChatType::ImageEdit);
        assert_eq!(message.files.len(), 1);
        assert_eq!(message.files[0].url, "https://cdn/photo.jpg");
        assert_eq!(message.files[0].file_type, "image/jpeg");
    }

    #[test]
    fn image_edit_without_images_downgrades_to_t2i() {
        let req = request("qwen-max-image_edit", vec![user("make it prettier")]);
        let plan = plan_request(&req, &TranslateOptions::default()).unwrap();
        let envelope = build_envelope(&req, &plan, "C1", 1_700_000_000, 1_700_000_000_000).unwrap();

        let message = &envelope.messages[0];
        assert_eq!(message.chat_type, ChatType::T2i);
        assert!(message.files.is_empty());
    }

    #[test]
    fn harvest_caps_at_three_images() {
        let req = request(
            "qwen-max-image_edit",
            vec![
                assistant("here ![one](https://cdn/1.png) and ![two](https://cdn/2.png)"),
                user("see ![three](https://cdn/3.png)"),
                ChatMessage {
                    role: Role::User,
                    content: MessageContent::Parts(vec![
                        ContentPart::Text { text: "edit".into() },
                        image_part("https://cdn/current.png"),
                    ]),
                },
            ],
        );
        let images = harvest_images(&req).unwrap();
        // insertion order: current first, then newest history upward; last 3 kept
        assert_eq!(images.len(), 3);
        assert_eq!(images.last().unwrap(), "https://cdn/2.png");
        assert!(!images.contains(&"https://cdn/current.png".to_string()));
    }

    #[test]
    fn markdown_urls_drop_titles() {
        let urls = markdown_image_urls("x ![a](https://cdn/a.png \"title\") y ![](https://cdn/b.png)");
        assert_eq!(
            urls,
            vec!["https://cdn/a.png".to_string(), "https://cdn/b.png".to_string()]
        );
    }

    #[test]
    fn t2t_attaches_images_from_last_turn() {
        let req = request(
            "qwen-max",
            vec![ChatMessage {
                role: Role::User,
                content: MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: "what is this?".into(),
                    },
                    image_part("https://cdn/x.png"),
                ]),
            }],
        );
        let opts = TranslateOptions {
            vision_fallback_model: Some("qwen3-vl-plus".into()),
            disable_vision_fallback: false,
        };
        let plan = plan_request(&req, &opts).unwrap();
        let envelope = build_envelope(&req, &plan, "C1", 1_700_000_000, 1_700_000_000_000).unwrap();

        let message = &envelope.messages[0];
        assert_eq!(envelope.model, "qwen3-vl-plus");
        assert_eq!(message.chat_type, ChatType::T2t);
        assert_eq!(message.files.len(), 1);
        assert_eq!(message.files[0].url, "https://cdn/x.png");
        assert_eq!(message.files[0].file_type, "image/png");
    }

    #[test]
    fn repeat_translation_differs_only_in_fresh_ids() {
        let req = request("qwen-max", vec![user("a"), assistant("b"), user("c")]);
        let plan = plan_request(&req, &TranslateOptions::default()).unwrap();
        let first = build_envelope(&req, &plan, "C1", 1_700_000_000, 1_700_000_000_000).unwrap();
        let second = build_envelope(&req, &plan, "C1", 1_700_000_000, 1_700_000_000_000).unwrap();

        assert_eq!(first.messages[0].content, second.messages[0].content);
        assert_eq!(first.timestamp, second.timestamp);
        assert_eq!(first.model, second.model);
        assert_ne!(first.messages[0].fid, second.messages[0].fid);
    }

    #[test]
    fn validation_catches_missing_chat_id() {
        let req = request("qwen-max", vec![user("hi")]);
        let plan = plan_request(&req, &TranslateOptions::default()).unwrap();
        let envelope = build_envelope(&req, &plan, "", 1_700_000_000, 1_700_000_000_000).unwrap();
        assert!(matches!(
            validate_envelope(&envelope),
            Err(UpstreamError::Translation(_))
        ));
    }
}
