//! Shared HTTP client construction. One client per process; non-streaming
//! calls apply a request deadline on top of the connect timeout, streaming
//! calls read without a body deadline.

use std::time::Duration;

use qwengate_core::config::{CONNECT_TIMEOUT_SECS, REQUEST_TIMEOUT_SECS};

pub fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .build()
}

/// Deadline for calls that return a complete body (create-chat, catalogue).
pub fn request_timeout() -> Duration {
    Duration::from_secs(REQUEST_TIMEOUT_SECS)
}
