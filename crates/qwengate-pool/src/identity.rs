use base64::Engine;
use chrono::Utc;
use serde::Serialize;

/// Identity health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Quarantined,
}

/// A (token, cookie) credential pair impersonating one logged-in session.
/// Mutated only through the pool, which serializes all state transitions.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub token: String,
    pub cookie: String,
    pub health: HealthState,
    pub consecutive_failures: u32,
    pub last_success_at: Option<i64>,
    pub last_failure_at: Option<i64>,
    pub last_used_at: Option<i64>,
    pub last_refresh_at: Option<i64>,
    pub refresh_failures: u32,
    /// Set on strong auth failures; cleared once a refresh succeeds.
    pub needs_refresh: bool,
    pub quarantined_at: Option<i64>,
}

impl Identity {
    pub fn new(id: impl Into<String>, token: impl Into<String>, cookie: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
            cookie: cookie.into(),
            health: HealthState::Healthy,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            last_used_at: None,
            last_refresh_at: None,
            refresh_failures: 0,
            needs_refresh: false,
            quarantined_at: None,
        }
    }

    /// Unix expiry of the bearer token, read from the JWT `exp` claim.
    /// `None` when the token is not a decodable JWT.
    pub fn token_expiry(&self) -> Option<i64> {
        jwt_exp(&self.token)
    }

    /// A token without a readable `exp` never counts as expired on its own.
    pub fn is_token_expired(&self) -> bool {
        match self.token_expiry() {
            Some(exp) => exp <= Utc::now().timestamp(),
            None => self.token.is_empty(),
        }
    }

    pub fn expires_within(&self, secs: i64) -> bool {
        match self.token_expiry() {
            Some(exp) => exp <= Utc::now().timestamp() + secs,
            None => false,
        }
    }
}

/// Read the `exp` claim from a JWT payload without verifying the signature.
pub(crate) fn jwt_exp(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp")?.as_i64()
}

#[cfg(test)]
pub(crate) fn jwt_with_exp(exp: i64) -> String {
    let payload =
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(format!("{{\"exp\":{exp}}}"));
    format!("eyJhbGciOiJIUzI1NiJ9.{payload}.sig")
}
