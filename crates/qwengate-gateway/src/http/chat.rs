//! POST /v1/chat/completions — the execution orchestrator. Picks an
//! identity, translates, dispatches, and retries with alternate identities
//! while nothing has reached the client. Once bytes have flowed the stream
//! is finished with a synthetic error chunk instead.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use qwengate_core::config::KEEP_ALIVE_SECS;
use qwengate_core::openai::{
    chatcmpl_id, ChatCompletion, ChatCompletionChunk, ChatCompletionRequest,
};
use qwengate_core::GateError;
use qwengate_pool::Identity;
use qwengate_upstream::api::process_chat_stream;
use qwengate_upstream::collect::collect_completion;
use qwengate_upstream::sse::{StreamEvent, ThinkTagger};
use qwengate_upstream::translate::{translate, TranslateOptions, TranslationOutcome};
use qwengate_upstream::UpstreamError;

use crate::app::AppState;
use crate::auth::{self, CredentialSource};
use crate::http::{error_response, gate_error};

/// Additional attempts after the first failed dispatch.
const RETRY_BUDGET: usize = 2;

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(req): Json<ChatCompletionRequest>,
) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let source = match auth::authenticate(&state.config, &headers, &query, req.api_key.as_deref())
    {
        Ok(source) => source,
        Err(e) => return error_response(&e, &request_id),
    };

    if req.messages.is_empty() {
        return error_response(
            &GateError::BadRequest("messages must be a non-empty array".to_string()),
            &request_id,
        );
    }

    let wants_stream = req.wants_stream();
    info!(
        model = %req.model,
        stream = wants_stream,
        request_id = %request_id,
        "chat completion request"
    );

    if wants_stream {
        run_streaming(state, source, req, request_id).await
    } else {
        run_non_streaming(state, source, req, request_id).await
    }
}

fn translate_options(state: &AppState) -> TranslateOptions {
    TranslateOptions {
        vision_fallback_model: state.config.upstream.vision_fallback_model.clone(),
        disable_vision_fallback: state.config.upstream.disable_vision_fallback,
    }
}

/// Pick an identity not yet tried this request. Pool selection may hand back
/// an already-tried identity when little else is selectable; a bounded number
/// of draws guards against spinning.
fn next_identity(
    pool: &qwengate_pool::IdentityPool,
    source: &CredentialSource,
    tried: &mut HashSet<String>,
) -> Option<Identity> {
    match source {
        CredentialSource::PerRequest(ident) => {
            tried.insert(ident.id.clone()).then(|| ident.clone())
        }
        CredentialSource::Pool => {
            let draws = pool.status().total.max(1);
            for _ in 0..draws {
                let ident = pool.acquire()?;
                if tried.insert(ident.id.clone()) {
                    return Some(ident);
                }
            }
            None
        }
    }
}

/// Translate and dispatch one attempt. Chat ids are identity-scoped, so every
/// attempt re-runs create-chat with the identity it will stream with.
async fn dispatch(
    state: &AppState,
    ident: &Identity,
    req: &ChatCompletionRequest,
) -> Result<(TranslationOutcome, reqwest::Response), UpstreamError> {
    let outcome = translate(&state.qwen, ident, req, &translate_options(state)).await?;
    let resp = state
        .qwen
        .send_completion(ident, &outcome.envelope, outcome.used_fallback)
        .await?;
    Ok((outcome, resp))
}

async fn run_streaming(
    state: Arc<AppState>,
    source: CredentialSource,
    req: ChatCompletionRequest,
    request_id: String,
) -> Response {
    let from_pool = matches!(source, CredentialSource::Pool);
    let mut tried = HashSet::new();
    let mut last_err: Option<UpstreamError> = None;

    for attempt in 0..=RETRY_BUDGET {
        let Some(ident) = next_identity(&state.pool, &source, &mut tried) else {
            break;
        };

        match dispatch(&state, &ident, &req).await {
            Ok((_, upstream)) => {
                if from_pool {
                    state.pool.mark_success(&ident.id);
                }
                if attempt > 0 {
                    info!(attempt, identity = %ident.id, "dispatch succeeded after failover");
                }
                return stream_response(state, upstream, req.model.clone(), request_id);
            }
            Err(e) => {
                if from_pool {
                    state.pool.mark_failure(&ident.id, e.failure_kind());
                }
                warn!(identity = %ident.id, attempt, error = %e, "dispatch failed");
                if !e.is_retryable() {
                    return error_response(&gate_error(e), &request_id);
                }
                last_err = Some(e);
            }
        }
    }

    let err = last_err
        .map(gate_error)
        .unwrap_or_else(|| GateError::UpstreamUnavailable("no selectable identity".to_string()));
    error_response(&err, &request_id)
}

async fn run_non_streaming(
    state: Arc<AppState>,
    source: CredentialSource,
    req: ChatCompletionRequest,
    request_id: String,
) -> Response {
    let from_pool = matches!(source, CredentialSource::Pool);
    let mut tried = HashSet::new();
    let mut last_err: Option<UpstreamError> = None;

    for attempt in 0..=RETRY_BUDGET {
        let Some(ident) = next_identity(&state.pool, &source, &mut tried) else {
            break;
        };

        let upstream = match dispatch(&state, &ident, &req).await {
            Ok((_, upstream)) => upstream,
            Err(e) => {
                if from_pool {
                    state.pool.mark_failure(&ident.id, e.failure_kind());
                }
                warn!(identity = %ident.id, attempt, error = %e, "dispatch failed");
                if !e.is_retryable() {
                    return error_response(&gate_error(e), &request_id);
                }
                last_err = Some(e);
                continue;
            }
        };

        // The upstream always answers with an event stream; aggregate it
        // into a single completion. Nothing reached the client yet, so a
        // mid-body failure is still retryable.
        let (tx, rx) = mpsc::channel::<StreamEvent>(64);
        tokio::spawn(process_chat_stream(upstream, tx, CancellationToken::new()));

        match collect_completion(rx).await {
            Ok(agg) => {
                if from_pool {
                    state.pool.mark_success(&ident.id);
                }
                let completion = ChatCompletion::new(
                    &req.model,
                    agg.content,
                    agg.tool_calls,
                    agg.finish_reason.as_str(),
                );
                return Json(completion).into_response();
            }
            Err(e) => {
                if from_pool {
                    state.pool.mark_failure(&ident.id, e.failure_kind());
                }
                warn!(identity = %ident.id, attempt, error = %e, "aggregation failed");
                last_err = Some(e);
            }
        }
    }

    let err = last_err
        .map(gate_error)
        .unwrap_or_else(|| GateError::UpstreamUnavailable("no selectable identity".to_string()));
    error_response(&err, &request_id)
}

/// Removes the request's bookkeeping and cancels the upstream pump when the
/// response stream is dropped, whether it finished or the client went away.
struct RequestGuard {
    state: Arc<AppState>,
    request_id: String,
    cancel: CancellationToken,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.state.active_requests.remove(&self.request_id);
    }
}

fn stream_response(
    state: Arc<AppState>,
    upstream: reqwest::Response,
    model: String,
    request_id: String,
) -> Response {
    let (tx, rx) = mpsc::channel::<StreamEvent>(64);
    let cancel = CancellationToken::new();
    state
        .active_requests
        .insert(request_id.clone(), cancel.clone());
    tokio::spawn(process_chat_stream(upstream, tx, cancel.clone()));

    let guard = RequestGuard {
        state,
        request_id,
        cancel,
    };

    Sse::new(chunk_stream(rx, model, guard))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(KEEP_ALIVE_SECS)))
        .into_response()
}

/// Convert translated events into OpenAI chunks. The role delta is emitted
/// once before any content; `[DONE]` is written exactly once on every path,
/// including mid-stream upstream failure.
fn chunk_stream(
    mut rx: mpsc::Receiver<StreamEvent>,
    model: String,
    guard: RequestGuard,
) -> impl futures_util::Stream<Item = Result<Event, Infallible>> {
    let id = chatcmpl_id();

    async_stream::stream! {
        let _guard = guard;
        let mut tagger = ThinkTagger::new();
        let mut sent_role = false;
        let mut finished = false;

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::TextDelta { text } => {
                    if !sent_role {
                        sent_role = true;
                        yield Ok(data_event(&ChatCompletionChunk::role(&id, &model)));
                    }
                    let text = tagger.answer(&text);
                    if !text.is_empty() {
                        yield Ok(data_event(&ChatCompletionChunk::content(&id, &model, text)));
                    }
                }
                StreamEvent::Thinking { text } => {
                    if !sent_role {
                        sent_role = true;
                        yield Ok(data_event(&ChatCompletionChunk::role(&id, &model)));
                    }
                    let text = tagger.thinking(&text);
                    if !text.is_empty() {
                        yield Ok(data_event(&ChatCompletionChunk::content(&id, &model, text)));
                    }
                }
                StreamEvent::ToolCallDelta { calls } => {
                    if !sent_role {
                        sent_role = true;
                        yield Ok(data_event(&ChatCompletionChunk::role(&id, &model)));
                    }
                    yield Ok(data_event(&ChatCompletionChunk::tool_calls(&id, &model, calls)));
                }
                StreamEvent::Done { finish_reason } => {
                    if let Some(close) = tagger.finish() {
                        yield Ok(data_event(&ChatCompletionChunk::content(&id, &model, close)));
                    }
                    yield Ok(data_event(&ChatCompletionChunk::finish(&id, &model, finish_reason.as_str())));
                    yield Ok(Event::default().data("[DONE]"));
                    finished = true;
                    break;
                }
                StreamEvent::Error { message } => {
                    // headers are long gone; keep the SSE well-formed
                    if !sent_role {
                        sent_role = true;
                        yield Ok(data_event(&ChatCompletionChunk::role(&id, &model)));
                    }
                    if let Some(close) = tagger.finish() {
                        yield Ok(data_event(&ChatCompletionChunk::content(&id, &model, close)));
                    }
                    yield Ok(data_event(&ChatCompletionChunk::content(&id, &model, message)));
                    yield Ok(data_event(&ChatCompletionChunk::finish(&id, &model, "stop")));
                    yield Ok(Event::default().data("[DONE]"));
                    finished = true;
                    break;
                }
            }
        }

        // channel closed without a terminal event
        if !finished {
            yield Ok(data_event(&ChatCompletionChunk::finish(&id, &model, "stop")));
            yield Ok(Event::default().data("[DONE]"));
        }
    }
}

fn data_event(chunk: &ChatCompletionChunk) -> Event {
    Event::default().data(serde_json::to_string(chunk).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qwengate_pool::{ExchangeError, IdentityPool, RefreshedToken, TokenExchanger};

    struct NoExchange;

    #[async_trait]
    impl TokenExchanger for NoExchange {
        async fn exchange(&self, _cookie: &str) -> Result<RefreshedToken, ExchangeError> {
            Err(ExchangeError::MissingCookie)
        }
    }

    async fn pool_of(n: usize) -> IdentityPool {
        let pool = IdentityPool::new();
        // opaque non-empty tokens are admitted without an exchange
        let pairs = (0..n)
            .map(|i| (format!("token-{i}"), String::new()))
            .collect();
        pool.initialize(pairs, &NoExchange).await;
        pool
    }

    #[tokio::test]
    async fn pool_attempts_never_reuse_an_identity() {
        let pool = pool_of(2).await;
        let mut tried = HashSet::new();

        let first = next_identity(&pool, &CredentialSource::Pool, &mut tried).unwrap();
        let second = next_identity(&pool, &CredentialSource::Pool, &mut tried).unwrap();
        assert_ne!(first.id, second.id);

        // both identities are spent for this request
        assert!(next_identity(&pool, &CredentialSource::Pool, &mut tried).is_none());
    }

    #[tokio::test]
    async fn empty_pool_yields_no_identity() {
        let pool = IdentityPool::new();
        let mut tried = HashSet::new();
        assert!(next_identity(&pool, &CredentialSource::Pool, &mut tried).is_none());
    }

    #[tokio::test]
    async fn per_request_identity_is_single_shot() {
        let pool = IdentityPool::new();
        let source = CredentialSource::PerRequest(Identity::new("client", "tok", "c=1"));
        let mut tried = HashSet::new();

        let first = next_identity(&pool, &source, &mut tried).unwrap();
        assert_eq!(first.id, "client");
        assert!(next_identity(&pool, &source, &mut tried).is_none());
    }
}
