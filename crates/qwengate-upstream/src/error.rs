use qwengate_pool::FailureKind;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("create chat failed: {0}")]
    CreateChat(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("translation produced an inconsistent envelope: {0}")]
    Translation(String),

    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// How the identity pool should account for this failure.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            UpstreamError::Api { status, message } => {
                if *status == 401 || *status == 403 || body_signals_bad_token(message) {
                    FailureKind::Auth
                } else {
                    FailureKind::Upstream
                }
            }
            UpstreamError::CreateChat(message) => {
                if body_signals_bad_token(message) {
                    FailureKind::Auth
                } else {
                    FailureKind::Upstream
                }
            }
            _ => FailureKind::Transport,
        }
    }

    /// Whether a retry with a different identity could succeed. Client
    /// mistakes and cancellations are final.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            UpstreamError::Invalid(_) | UpstreamError::Translation(_) | UpstreamError::Cancelled
        )
    }
}

fn body_signals_bad_token(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("unauthorized")
        || (lower.contains("token") && (lower.contains("invalid") || lower.contains("expired")))
}
