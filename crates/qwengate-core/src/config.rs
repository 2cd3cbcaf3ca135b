use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8264;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_UPSTREAM_BASE: &str = "https://chat.qwen.ai";
pub const MAX_BODY_BYTES: usize = 50 * 1024 * 1024; // 50 MB request cap on /v1/chat/completions
pub const KEEP_ALIVE_SECS: u64 = 15; // SSE comment cadence while the response is idle
pub const CONNECT_TIMEOUT_SECS: u64 = 10;
pub const REQUEST_TIMEOUT_SECS: u64 = 30; // non-streaming calls only

/// Top-level config (qwengate.toml + QWENGATE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Credential pairs for the identity pool. May be empty when the server
    /// runs in client mode (credentials arrive per-request).
    #[serde(default)]
    pub identities: Vec<IdentityConfig>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            upstream: UpstreamConfig::default(),
            refresh: RefreshConfig::default(),
            cleanup: CleanupConfig::default(),
            identities: Vec::new(),
        }
    }
}

impl GateConfig {
    /// Load config: explicit path > QWENGATE_CONFIG env > ~/.qwengate/qwengate.toml.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: GateConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("QWENGATE_").split("_"))
            .extract()
            .map_err(|e| crate::error::GateError::Config(e.to_string()))?;

        Ok(config)
    }

    /// All (token, cookie) pairs the pool is seeded with. The legacy
    /// single-credential fields on `[upstream]` are folded in first so
    /// existing deployments keep their identity ordering.
    pub fn identity_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if self.upstream.token.is_some() || self.upstream.cookie.is_some() {
            pairs.push((
                self.upstream.token.clone().unwrap_or_default(),
                self.upstream.cookie.clone().unwrap_or_default(),
            ));
        }
        for entry in &self.identities {
            pairs.push((entry.token.clone(), entry.cookie.clone().unwrap_or_default()));
        }
        pairs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    /// API key required from clients. In client mode it becomes the first
    /// segment of the semicolon-delimited bearer tuple.
    pub api_key: Option<String>,
}

/// Where upstream credentials come from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Credentials are configured server-side; clients present an api key.
    #[default]
    Server,
    /// Each request carries `api_key;token;cookie` in the Authorization bearer.
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_base")]
    pub base_url: String,
    /// Substitute model when image content hits a text-only model.
    #[serde(default = "default_vision_fallback")]
    pub vision_fallback_model: Option<String>,
    #[serde(default)]
    pub disable_vision_fallback: bool,
    /// Legacy single-credential fields, folded into the identity pool.
    pub token: Option<String>,
    pub cookie: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base(),
            vision_fallback_model: default_vision_fallback(),
            disable_vision_fallback: false,
            token: None,
            cookie: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Hours between token-refresh sweeps.
    #[serde(default = "default_refresh_interval_hours")]
    pub interval_hours: u64,
    /// Refresh tokens expiring within this many days ahead of time.
    #[serde(default = "default_warn_window_days")]
    pub warn_window_days: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_hours: default_refresh_interval_hours(),
            warn_window_days: default_warn_window_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_interval_minutes")]
    pub interval_minutes: u64,
    /// Upper bound on chats deleted per sweep.
    #[serde(default = "default_cleanup_page_size")]
    pub page_size: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_cleanup_interval_minutes(),
            page_size: default_cleanup_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub token: String,
    pub cookie: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_upstream_base() -> String {
    DEFAULT_UPSTREAM_BASE.to_string()
}

fn default_vision_fallback() -> Option<String> {
    Some("qwen3-vl-plus".to_string())
}

fn default_refresh_interval_hours() -> u64 {
    24
}

fn default_warn_window_days() -> u64 {
    7
}

fn default_cleanup_interval_minutes() -> u64 {
    60
}

fn default_cleanup_page_size() -> usize {
    20
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.qwengate/qwengate.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = GateConfig::default();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.upstream.base_url, DEFAULT_UPSTREAM_BASE);
        assert_eq!(config.refresh.interval_hours, 24);
        assert_eq!(config.cleanup.interval_minutes, 60);
        assert!(config.identity_pairs().is_empty());
    }

    #[test]
    fn legacy_credentials_come_first() {
        let mut config = GateConfig::default();
        config.upstream.token = Some("legacy-token".into());
        config.identities.push(IdentityConfig {
            token: "pool-token".into(),
            cookie: Some("c=1".into()),
        });

        let pairs = config.identity_pairs();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "legacy-token");
        assert_eq!(pairs[1], ("pool-token".to_string(), "c=1".to_string()));
    }
}
