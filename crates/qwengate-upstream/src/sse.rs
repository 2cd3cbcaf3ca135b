//! SSE framing over the upstream byte stream, the event vocabulary the
//! stream translator emits, and the `<think>` wrapping shared by the
//! streaming and aggregation paths.

/// Events emitted while translating an upstream response stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental answer text.
    TextDelta { text: String },

    /// Incremental reasoning text (upstream phase "thinking").
    Thinking { text: String },

    /// Tool-call fragments, already in OpenAI's delta.tool_calls shape.
    ToolCallDelta { calls: serde_json::Value },

    /// Stream completed. Sent exactly once per upstream connection, also on
    /// abrupt close.
    Done { finish_reason: FinishReason },

    /// Upstream failed mid-stream.
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
        }
    }

    pub fn from_upstream(reason: &str) -> Self {
        if reason == "length" {
            FinishReason::Length
        } else {
            FinishReason::Stop
        }
    }
}

#[derive(Debug)]
pub enum SseLine {
    Data(String),
    Event(String),
    Comment,
    Other,
}

/// Classify a single line of an event stream.
pub fn parse_sse_line(line: &str) -> SseLine {
    if line.starts_with(':') {
        return SseLine::Comment;
    }
    if let Some(data) = line.strip_prefix("data:") {
        return SseLine::Data(data.strip_prefix(' ').unwrap_or(data).to_string());
    }
    if let Some(event) = line.strip_prefix("event:") {
        return SseLine::Event(event.trim_start().to_string());
    }
    SseLine::Other
}

/// Accumulates raw bytes and yields the `data:` payloads of complete lines.
/// Partial lines are buffered across network chunks; comments and non-data
/// fields are dropped. The `[DONE]` sentinel is returned as a payload for
/// the caller to act on.
#[derive(Default)]
pub struct SseFrameBuffer {
    buf: String,
}

impl SseFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));

        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                continue;
            }
            if let SseLine::Data(data) = parse_sse_line(line) {
                payloads.push(data);
            }
        }
        payloads
    }
}

/// Wraps thinking-phase text in `<think>` markers on the outgoing content.
/// The opening tag is emitted with the first thinking fragment, the closing
/// tag on the phase transition back to answer text or at end of stream.
#[derive(Default)]
pub struct ThinkTagger {
    in_think: bool,
}

impl ThinkTagger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thinking(&mut self, text: &str) -> String {
        if self.in_think {
            text.to_string()
        } else {
            self.in_think = true;
            format!("<think>{text}")
        }
    }

    pub fn answer(&mut self, text: &str) -> String {
        if self.in_think {
            self.in_think = false;
            format!("</think>\n{text}")
        } else {
            text.to_string()
        }
    }

    /// Closing tag if the stream ended mid-think.
    pub fn finish(&mut self) -> Option<String> {
        if self.in_think {
            self.in_think = false;
            Some("</think>\n".to_string())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_across_chunks() {
        let mut buf = SseFrameBuffer::new();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        let payloads = buf.push(b":1}\n\ndata: [DONE]\n\n");
        assert_eq!(payloads, vec![r#"{"a":1}"#.to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn comments_and_fields_are_dropped() {
        let mut buf = SseFrameBuffer::new();
        let payloads = buf.push(b": keep-alive\nevent: message\nretry: 100\ndata: x\n\n");
        assert_eq!(payloads, vec!["x".to_string()]);
    }

    #[test]
    fn crlf_line_endings_are_handled() {
        let mut buf = SseFrameBuffer::new();
        let payloads = buf.push(b"data: one\r\n\r\ndata: two\r\n\r\n");
        assert_eq!(payloads, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn data_without_space_is_accepted() {
        let mut buf = SseFrameBuffer::new();
        assert_eq!(buf.push(b"data:x\n"), vec!["x".to_string()]);
    }

    #[test]
    fn think_tags_open_once_and_close_on_transition() {
        let mut tagger = ThinkTagger::new();
        assert_eq!(tagger.thinking("a"), "<think>a");
        assert_eq!(tagger.thinking("b"), "b");
        assert_eq!(tagger.answer("c"), "</think>\nc");
        assert_eq!(tagger.answer("d"), "d");
        assert_eq!(tagger.finish(), None);
    }

    #[test]
    fn finish_closes_open_think() {
        let mut tagger = ThinkTagger::new();
        tagger.thinking("a");
        assert_eq!(tagger.finish().as_deref(), Some("</think>\n"));
        assert_eq!(tagger.finish(), None);
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(FinishReason::from_upstream("length"), FinishReason::Length);
        assert_eq!(FinishReason::from_upstream("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::from_upstream("whatever"), FinishReason::Stop);
    }
}
