use async_trait::async_trait;

/// Result of a cookie → token exchange at the upstream.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub token: String,
    /// Unix expiry when the upstream reports one.
    pub expires_at: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("exchange rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("exchange transport error: {0}")]
    Transport(String),

    #[error("identity has no cookie to exchange")]
    MissingCookie,
}

/// Abstract cookie → token exchange. The pool drives refresh through this
/// trait so it never performs I/O itself; the upstream crate provides the
/// real implementation, tests provide mocks.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, cookie: &str) -> Result<RefreshedToken, ExchangeError>;
}
