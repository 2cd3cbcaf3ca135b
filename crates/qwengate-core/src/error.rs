use thiserror::Error;

/// Client-facing failure kinds. Each maps to an HTTP status and a short
/// machine code surfaced in error bodies.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Authentication required: {0}")]
    AuthRequired(String),

    #[error("Authentication failed: {0}")]
    AuthInvalid(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Create chat failed: {0}")]
    CreateChatFailed(String),

    #[error("Upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Translation error: {0}")]
    Translation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GateError {
    /// Short error code string sent to clients in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GateError::BadRequest(_) => "bad_request",
            GateError::AuthRequired(_) => "auth_required",
            GateError::AuthInvalid(_) => "auth_invalid",
            GateError::UpstreamUnavailable(_) => "upstream_unavailable",
            GateError::CreateChatFailed(_) => "upstream_create_chat_failed",
            GateError::Upstream { .. } => "upstream_error",
            GateError::Translation(_) => "translation_error",
            GateError::Config(_) => "config_error",
            GateError::Serialization(_) => "serialization_error",
        }
    }

    /// HTTP status for the client. Upstream statuses are mirrored when they
    /// are plausible HTTP codes, otherwise capped at 502.
    pub fn http_status(&self) -> u16 {
        match self {
            GateError::BadRequest(_) => 400,
            GateError::AuthRequired(_) | GateError::AuthInvalid(_) => 401,
            GateError::UpstreamUnavailable(_) => 503,
            GateError::CreateChatFailed(_) => 502,
            GateError::Upstream { status, .. } => {
                if (400..=599).contains(status) {
                    *status
                } else {
                    502
                }
            }
            GateError::Translation(_) => 500,
            GateError::Config(_) | GateError::Serialization(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, GateError>;
