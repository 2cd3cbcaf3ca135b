//! Qwen web-chat API client: chat creation, completion dispatch, the stream
//! translator, the model catalogue, housekeeping deletes, and the cookie →
//! token exchange backing pool refresh.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use qwengate_core::openai::ChatType;
use qwengate_pool::{ExchangeError, Identity, RefreshedToken, TokenExchanger};

use crate::client::{build_client, request_timeout};
use crate::error::UpstreamError;
use crate::headers::{chat_headers, USER_AGENT};
use crate::sse::{FinishReason, SseFrameBuffer, StreamEvent};
use crate::wire::{
    CatalogueModel, ChatCompletionEnvelope, ChatListResponse, ModelCatalogue, NewChatRequest,
    NewChatResponse, StreamFrame,
};

const NEW_CHAT_PATH: &str = "/api/v2/chats/new";
const COMPLETIONS_PATH: &str = "/api/v2/chat/completions";
const CHATS_PATH: &str = "/api/v2/chats";
const MODELS_PATH: &str = "/api/models";
const AUTHS_PATH: &str = "/api/v1/auths/";

#[derive(Clone)]
pub struct QwenClient {
    http: reqwest::Client,
    base_url: String,
}

impl QwenClient {
    pub fn new(base_url: &str) -> reqwest::Result<Self> {
        Ok(Self {
            http: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create a fresh upstream chat and return its id.
    pub async fn create_chat(
        &self,
        ident: &Identity,
        model: &str,
        chat_type: ChatType,
        timestamp_ms: i64,
    ) -> Result<String, UpstreamError> {
        let url = format!("{}{}", self.base_url, NEW_CHAT_PATH);
        let headers = chat_headers(&ident.token, &ident.cookie, &self.base_url, false)?;
        let body = NewChatRequest::new(model, chat_type, timestamp_ms);

        debug!(model, chat_type = chat_type.as_str(), "creating upstream chat");
        let resp = self
            .http
            .post(&url)
            .headers(headers)
            .timeout(request_timeout())
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "create chat rejected");
            return Err(UpstreamError::Api {
                status,
                message: text,
            });
        }

        let parsed: NewChatResponse = resp
            .json()
            .await
            .map_err(|e| UpstreamError::Parse(e.to_string()))?;
        parsed
            .data
            .and_then(|d| d.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| UpstreamError::CreateChat("no chat id in response".to_string()))
    }

    /// Dispatch a completion envelope. The response handle streams SSE; no
    /// body deadline is applied. Non-2xx statuses are turned into errors
    /// before any bytes reach the caller.
    pub async fn send_completion(
        &self,
        ident: &Identity,
        envelope: &ChatCompletionEnvelope,
        fingerprint: bool,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = format!(
            "{}{}?chat_id={}",
            self.base_url, COMPLETIONS_PATH, envelope.chat_id
        );
        let headers = chat_headers(&ident.token, &ident.cookie, &self.base_url, fingerprint)?;

        debug!(chat_id = %envelope.chat_id, model = %envelope.model, "dispatching completion");
        let resp = self
            .http
            .post(&url)
            .headers(headers)
            .json(envelope)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "completion rejected");
            return Err(UpstreamError::Api {
                status,
                message: text,
            });
        }
        Ok(resp)
    }

    pub async fn list_models(&self, ident: &Identity) -> Result<Vec<CatalogueModel>, UpstreamError> {
        let url = format!("{}{}", self.base_url, MODELS_PATH);
        let headers = chat_headers(&ident.token, &ident.cookie, &self.base_url, false)?;

        let resp = self
            .http
            .get(&url)
            .headers(headers)
            .timeout(request_timeout())
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Api {
                status,
                message: text,
            });
        }

        let catalogue: ModelCatalogue = resp
            .json()
            .await
            .map_err(|e| UpstreamError::Parse(e.to_string()))?;
        Ok(catalogue.data)
    }

    /// Delete up to `limit` of the oldest upstream chats. Best-effort:
    /// individual delete failures are logged and skipped.
    pub async fn delete_old_chats(
        &self,
        ident: &Identity,
        limit: usize,
    ) -> Result<usize, UpstreamError> {
        let url = format!("{}{}?page=1", self.base_url, CHATS_PATH);
        let headers = chat_headers(&ident.token, &ident.cookie, &self.base_url, false)?;

        let resp = self
            .http
            .get(&url)
            .headers(headers)
            .timeout(request_timeout())
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Api {
                status,
                message: text,
            });
        }

        let listing: ChatListResponse = resp
            .json()
            .await
            .map_err(|e| UpstreamError::Parse(e.to_string()))?;

        // listing is newest-first; the tail holds the chats to reap
        let targets: Vec<_> = listing
            .data
            .iter()
            .rev()
            .take(limit)
            .map(|c| c.id.clone())
            .collect();

        let mut deleted = 0usize;
        for chat_id in targets {
            let url = format!("{}{}/{}", self.base_url, CHATS_PATH, chat_id);
            let headers = chat_headers(&ident.token, &ident.cookie, &self.base_url, false)?;
            match self
                .http
                .delete(&url)
                .headers(headers)
                .timeout(request_timeout())
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => deleted += 1,
                Ok(resp) => {
                    debug!(chat_id = %chat_id, status = resp.status().as_u16(), "chat delete refused")
                }
                Err(e) => debug!(chat_id = %chat_id, error = %e, "chat delete failed"),
            }
        }
        if deleted > 0 {
            info!(deleted, "reaped old upstream chats");
        }
        Ok(deleted)
    }
}

/// Read the upstream SSE body and emit translated events. Sends exactly one
/// `Done` unless the receiver goes away or an error event is emitted first;
/// an abrupt upstream close still finishes the stream. Cancellation drops
/// the connection without emitting anything further.
pub async fn process_chat_stream(
    resp: reqwest::Response,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) {
    use futures_util::StreamExt;

    let mut frames = SseFrameBuffer::new();
    let mut finish = FinishReason::Stop;
    let mut bytes = resp.bytes_stream();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("client gone, dropping upstream stream");
                return;
            }
            chunk = bytes.next() => chunk,
        };
        let Some(chunk) = chunk else { break };

        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "upstream stream failed mid-body");
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        for payload in frames.push(&chunk) {
            if payload.trim() == "[DONE]" {
                let _ = tx
                    .send(StreamEvent::Done {
                        finish_reason: finish,
                    })
                    .await;
                return;
            }
            for event in frame_events(&payload, &mut finish) {
                if tx.send(event).await.is_err() {
                    return; // receiver dropped
                }
            }
        }
    }

    // upstream closed without [DONE]; finish the stream anyway
    let _ = tx
        .send(StreamEvent::Done {
            finish_reason: finish,
        })
        .await;
}

/// Translate one upstream JSON payload into events, updating the pending
/// finish reason. Malformed frames are skipped, not fatal.
pub fn frame_events(payload: &str, finish: &mut FinishReason) -> Vec<StreamEvent> {
    let frame: StreamFrame = match serde_json::from_str(payload) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "skipping malformed stream frame");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    for choice in frame.choices {
        if let Some(reason) = &choice.finish_reason {
            *finish = FinishReason::from_upstream(reason);
        }

        let delta = choice.delta;
        if let Some(calls) = delta.tool_calls {
            events.push(StreamEvent::ToolCallDelta { calls });
        }
        if let Some(content) = delta.content {
            if !content.is_empty() {
                // unknown phases read as answer text
                match delta.phase.as_deref() {
                    Some("thinking") => events.push(StreamEvent::Thinking { text: content }),
                    _ => events.push(StreamEvent::TextDelta { text: content }),
                }
            }
        }
    }
    events
}

/// Cookie → token exchange against the auth endpoint, used to admit and
/// refresh pool identities.
pub struct CookieTokenExchanger {
    http: reqwest::Client,
    base_url: String,
}

impl CookieTokenExchanger {
    pub fn new(base_url: &str) -> reqwest::Result<Self> {
        Ok(Self {
            http: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TokenExchanger for CookieTokenExchanger {
    async fn exchange(&self, cookie: &str) -> Result<RefreshedToken, ExchangeError> {
        if cookie.is_empty() {
            return Err(ExchangeError::MissingCookie);
        }

        let url = format!("{}{}", self.base_url, AUTHS_PATH);
        let resp = self
            .http
            .get(&url)
            .header("cookie", cookie)
            .header("user-agent", USER_AGENT)
            .header("accept", "application/json")
            .timeout(request_timeout())
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ExchangeError::Rejected {
                status,
                message: text,
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let token = body
            .get("token")
            .or_else(|| body.pointer("/data/token"))
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ExchangeError::Rejected {
                status,
                message: "no token in auth response".to_string(),
            })?;

        info!("cookie exchange produced a fresh token");
        Ok(RefreshedToken {
            token: token.to_string(),
            expires_at: body.get("expires_at").and_then(|v| v.as_i64()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_events_splits_phases() {
        let mut finish = FinishReason::Stop;
        let events = frame_events(
            r#"{"choices":[{"delta":{"phase":"thinking","content":"hm"}}]}"#,
            &mut finish,
        );
        assert!(matches!(&events[0], StreamEvent::Thinking { text } if text == "hm"));

        let events = frame_events(
            r#"{"choices":[{"delta":{"phase":"speculation","content":"hi"}}]}"#,
            &mut finish,
        );
        assert!(matches!(&events[0], StreamEvent::TextDelta { text } if text == "hi"));
    }

    #[test]
    fn frame_events_tracks_finish_reason() {
        let mut finish = FinishReason::Stop;
        frame_events(
            r#"{"choices":[{"delta":{},"finish_reason":"length"}]}"#,
            &mut finish,
        );
        assert_eq!(finish, FinishReason::Length);
    }

    #[test]
    fn malformed_frames_are_skipped() {
        let mut finish = FinishReason::Stop;
        assert!(frame_events("{not json", &mut finish).is_empty());
        assert!(frame_events(r#"{"choices":[]}"#, &mut finish).is_empty());
    }

    #[test]
    fn tool_calls_pass_through() {
        let mut finish = FinishReason::Stop;
        let events = frame_events(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"f","arguments":"{"}}]}}]}"#,
            &mut finish,
        );
        assert!(matches!(&events[0], StreamEvent::ToolCallDelta { calls } if calls.is_array()));
    }

    #[test]
    fn empty_content_emits_nothing() {
        let mut finish = FinishReason::Stop;
        let events = frame_events(
            r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#,
            &mut finish,
        );
        assert!(events.is_empty());
    }
}
