//! Upstream side of the proxy: the web-chat wire protocol, request
//! translation from the OpenAI surface, and SSE stream translation back.

pub mod api;
pub mod client;
pub mod collect;
pub mod error;
pub mod headers;
pub mod sse;
pub mod translate;
pub mod wire;

pub use api::{CookieTokenExchanger, QwenClient};
pub use error::UpstreamError;
pub use sse::{FinishReason, StreamEvent};
pub use translate::{translate, TranslateOptions, TranslationOutcome};
