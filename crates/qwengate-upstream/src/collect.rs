//! Non-streaming aggregation: fold a translated event stream into one
//! assistant message, merging tool-call fragments the way OpenAI clients
//! accumulate them (by index, concatenating argument strings).

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::UpstreamError;
use crate::sse::{FinishReason, StreamEvent, ThinkTagger};

#[derive(Debug)]
pub struct Aggregated {
    pub content: String,
    pub tool_calls: Option<Value>,
    pub finish_reason: FinishReason,
}

/// Drain the event channel into a single completion. An `Error` event aborts
/// with the upstream message so the caller can retry or surface it.
pub async fn collect_completion(
    mut rx: mpsc::Receiver<StreamEvent>,
) -> Result<Aggregated, UpstreamError> {
    let mut tagger = ThinkTagger::new();
    let mut merger = ToolCallMerger::default();
    let mut content = String::new();
    let mut finish = FinishReason::Stop;

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::TextDelta { text } => content.push_str(&tagger.answer(&text)),
            StreamEvent::Thinking { text } => content.push_str(&tagger.thinking(&text)),
            StreamEvent::ToolCallDelta { calls } => merger.absorb(&calls),
            StreamEvent::Done { finish_reason } => {
                finish = finish_reason;
                break;
            }
            StreamEvent::Error { message } => {
                return Err(UpstreamError::Unavailable(message));
            }
        }
    }

    if let Some(close) = tagger.finish() {
        content.push_str(&close);
    }

    Ok(Aggregated {
        content,
        tool_calls: merger.into_value(),
        finish_reason: finish,
    })
}

#[derive(Debug, Default)]
pub struct ToolCallMerger {
    calls: Vec<MergedCall>,
}

#[derive(Debug)]
struct MergedCall {
    index: u64,
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallMerger {
    pub fn absorb(&mut self, delta: &Value) {
        let Some(fragments) = delta.as_array() else {
            return;
        };
        for fragment in fragments {
            let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
            let entry = self.entry(index);
            if let Some(id) = fragment.get("id").and_then(Value::as_str) {
                entry.id = Some(id.to_string());
            }
            if let Some(function) = fragment.get("function") {
                if let Some(name) = function.get("name").and_then(Value::as_str) {
                    entry.name = Some(name.to_string());
                }
                if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
                    entry.arguments.push_str(arguments);
                }
            }
        }
    }

    pub fn into_value(mut self) -> Option<Value> {
        if self.calls.is_empty() {
            return None;
        }
        self.calls.sort_by_key(|c| c.index);
        let calls: Vec<Value> = self
            .calls
            .into_iter()
            .map(|c| {
                json!({
                    "id": c.id.unwrap_or_else(|| format!("call_{}", c.index)),
                    "type": "function",
                    "function": {
                        "name": c.name.unwrap_or_default(),
                        "arguments": c.arguments,
                    }
                })
            })
            .collect();
        Some(Value::Array(calls))
    }

    fn entry(&mut self, index: u64) -> &mut MergedCall {
        if let Some(pos) = self.calls.iter().position(|c| c.index == index) {
            return &mut self.calls[pos];
        }
        self.calls.push(MergedCall {
            index,
            id: None,
            name: None,
            arguments: String::new(),
        });
        self.calls.last_mut().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::frame_events;

    fn channel_with(events: Vec<StreamEvent>) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            tx.try_send(event).unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn concatenates_text_and_wraps_thinking() {
        let rx = channel_with(vec![
            StreamEvent::Thinking { text: "hm".into() },
            StreamEvent::Thinking { text: "m".into() },
            StreamEvent::TextDelta { text: "he".into() },
            StreamEvent::TextDelta { text: "llo".into() },
            StreamEvent::Done {
                finish_reason: FinishReason::Stop,
            },
        ]);
        let agg = collect_completion(rx).await.unwrap();
        assert_eq!(agg.content, "<think>hmm</think>\nhello");
        assert_eq!(agg.finish_reason, FinishReason::Stop);
        assert!(agg.tool_calls.is_none());
    }

    #[tokio::test]
    async fn closes_think_when_stream_ends_mid_think() {
        let rx = channel_with(vec![
            StreamEvent::Thinking { text: "only".into() },
            StreamEvent::Done {
                finish_reason: FinishReason::Length,
            },
        ]);
        let agg = collect_completion(rx).await.unwrap();
        assert_eq!(agg.content, "<think>only</think>\n");
        assert_eq!(agg.finish_reason, FinishReason::Length);
    }

    #[tokio::test]
    async fn error_event_aborts_collection() {
        let rx = channel_with(vec![
            StreamEvent::TextDelta { text: "par".into() },
            StreamEvent::Error {
                message: "connection reset".into(),
            },
        ]);
        let err = collect_completion(rx).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Unavailable(_)));
    }

    #[tokio::test]
    async fn channel_close_without_done_still_completes() {
        let rx = channel_with(vec![StreamEvent::TextDelta { text: "hi".into() }]);
        let agg = collect_completion(rx).await.unwrap();
        assert_eq!(agg.content, "hi");
        assert_eq!(agg.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn tool_call_fragments_merge_by_index() {
        let mut merger = ToolCallMerger::default();
        merger.absorb(&serde_json::json!([
            {"index": 0, "id": "call_a", "function": {"name": "get_weather", "arguments": "{\"ci"}}
        ]));
        merger.absorb(&serde_json::json!([
            {"index": 0, "function": {"arguments": "ty\":\"sf\"}"}},
            {"index": 1, "id": "call_b", "function": {"name": "get_time", "arguments": "{}"}}
        ]));

        let calls = merger.into_value().unwrap();
        assert_eq!(calls[0]["id"], "call_a");
        assert_eq!(calls[0]["function"]["arguments"], "{\"city\":\"sf\"}");
        assert_eq!(calls[1]["function"]["name"], "get_time");
    }

    /// Replaying the same upstream transcript through the chunk path and the
    /// aggregation path must yield the same final assistant content.
    #[tokio::test]
    async fn streaming_and_aggregation_agree() {
        let payloads = [
            r#"{"choices":[{"delta":{"role":"assistant","phase":"thinking","content":"let me see"}}]}"#,
            r#"{"choices":[{"delta":{"phase":"answer","content":"it is "}}]}"#,
            r#"{"choices":[{"delta":{"phase":"answer","content":"blue"}}]}"#,
            r#"{"choices":[{"delta":{"status":"finished"},"finish_reason":"stop"}]}"#,
        ];

        let mut finish = FinishReason::Stop;
        let mut events = Vec::new();
        for payload in payloads {
            events.extend(frame_events(payload, &mut finish));
        }
        events.push(StreamEvent::Done {
            finish_reason: finish,
        });

        // streaming path: tagger applied per event, chunks concatenated
        let mut tagger = ThinkTagger::new();
        let mut streamed = String::new();
        for event in &events {
            match event {
                StreamEvent::TextDelta { text } => streamed.push_str(&tagger.answer(text)),
                StreamEvent::Thinking { text } => streamed.push_str(&tagger.thinking(text)),
                _ => {}
            }
        }
        if let Some(close) = tagger.finish() {
            streamed.push_str(&close);
        }

        let agg = collect_completion(channel_with(events)).await.unwrap();
        assert_eq!(agg.content, streamed);
        assert_eq!(agg.content, "<think>let me see</think>\nit is blue");
    }
}
