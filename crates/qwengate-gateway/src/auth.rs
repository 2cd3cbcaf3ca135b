//! Request authentication. Server mode checks a configured api key
//! (bearer, X-API-Key, query parameter, or body field) and routes through
//! the shared pool; client mode parses a semicolon-delimited bearer tuple
//! into a one-shot identity.

use std::collections::HashMap;

use axum::http::HeaderMap;

use qwengate_core::config::{AuthMode, GateConfig};
use qwengate_core::GateError;
use qwengate_pool::Identity;

/// Where a request's upstream credentials come from.
pub enum CredentialSource {
    /// The shared identity pool.
    Pool,
    /// One-shot identity from the client's bearer tuple.
    PerRequest(Identity),
}

pub fn authenticate(
    config: &GateConfig,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body_key: Option<&str>,
) -> Result<CredentialSource, GateError> {
    match config.auth.mode {
        AuthMode::Server => {
            check_api_key(config, headers, query, body_key)?;
            Ok(CredentialSource::Pool)
        }
        AuthMode::Client => Ok(CredentialSource::PerRequest(client_identity(
            config, headers,
        )?)),
    }
}

/// Server-mode api key check. A server without a configured key is open.
pub fn check_api_key(
    config: &GateConfig,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body_key: Option<&str>,
) -> Result<(), GateError> {
    let Some(expected) = &config.auth.api_key else {
        return Ok(());
    };

    let provided = bearer(headers)
        .or_else(|| header_value(headers, "x-api-key"))
        .or_else(|| query.get("key").cloned())
        .or_else(|| query.get("api_key").cloned())
        .or_else(|| body_key.map(String::from));

    match provided {
        None => Err(GateError::AuthRequired("api key missing".to_string())),
        Some(key) if key == *expected => Ok(()),
        Some(_) => Err(GateError::AuthInvalid("api key mismatch".to_string())),
    }
}

/// Client-mode credential tuple: `api_key;token;cookie` when the server has
/// a configured key, `token;cookie` otherwise. The cookie segment keeps its
/// internal semicolons.
pub fn client_identity(config: &GateConfig, headers: &HeaderMap) -> Result<Identity, GateError> {
    let bearer = bearer(headers)
        .ok_or_else(|| GateError::AuthRequired("bearer credentials required".to_string()))?;

    let (token, cookie) = if let Some(expected) = &config.auth.api_key {
        let mut parts = bearer.splitn(3, ';');
        let key = parts.next().unwrap_or_default();
        let token = parts.next().ok_or_else(|| {
            GateError::AuthInvalid("expected api_key;token;cookie".to_string())
        })?;
        if key != expected {
            return Err(GateError::AuthInvalid("api key mismatch".to_string()));
        }
        (token.to_string(), parts.next().unwrap_or_default().to_string())
    } else {
        let mut parts = bearer.splitn(2, ';');
        let token = parts.next().unwrap_or_default().to_string();
        (token, parts.next().unwrap_or_default().to_string())
    };

    if token.is_empty() {
        return Err(GateError::AuthRequired("upstream token missing".to_string()));
    }
    Ok(Identity::new("client", token, cookie))
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config(mode: AuthMode, api_key: Option<&str>) -> GateConfig {
        let mut config = GateConfig::default();
        config.auth.mode = mode;
        config.auth.api_key = api_key.map(String::from);
        config
    }

    fn headers_with_bearer(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {value}")).unwrap(),
        );
        headers
    }

    #[test]
    fn open_server_accepts_anything() {
        let config = config(AuthMode::Server, None);
        let result = authenticate(&config, &HeaderMap::new(), &HashMap::new(), None);
        assert!(matches!(result, Ok(CredentialSource::Pool)));
    }

    #[test]
    fn server_mode_accepts_key_from_any_channel() {
        let config = config(AuthMode::Server, Some("k1"));

        assert!(check_api_key(&config, &headers_with_bearer("k1"), &HashMap::new(), None).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("k1"));
        assert!(check_api_key(&config, &headers, &HashMap::new(), None).is_ok());

        let query: HashMap<_, _> = [("api_key".to_string(), "k1".to_string())].into();
        assert!(check_api_key(&config, &HeaderMap::new(), &query, None).is_ok());

        assert!(check_api_key(&config, &HeaderMap::new(), &HashMap::new(), Some("k1")).is_ok());
    }

    #[test]
    fn server_mode_rejects_wrong_and_missing_keys() {
        let config = config(AuthMode::Server, Some("k1"));
        let wrong = check_api_key(&config, &headers_with_bearer("nope"), &HashMap::new(), None);
        assert!(matches!(wrong, Err(GateError::AuthInvalid(_))));

        let missing = check_api_key(&config, &HeaderMap::new(), &HashMap::new(), None);
        assert!(matches!(missing, Err(GateError::AuthRequired(_))));
    }

    #[test]
    fn client_tuple_with_server_key() {
        let config = config(AuthMode::Client, Some("k1"));
        let headers = headers_with_bearer("k1;tok-abc;ssxmod=a; other=b");
        let ident = client_identity(&config, &headers).unwrap();
        assert_eq!(ident.token, "tok-abc");
        assert_eq!(ident.cookie, "ssxmod=a; other=b");
    }

    #[test]
    fn client_tuple_without_server_key() {
        let config = config(AuthMode::Client, None);
        let headers = headers_with_bearer("tok-abc;ssxmod=a");
        let ident = client_identity(&config, &headers).unwrap();
        assert_eq!(ident.token, "tok-abc");
        assert_eq!(ident.cookie, "ssxmod=a");
    }

    #[test]
    fn client_tuple_cookie_is_optional() {
        let config = config(AuthMode::Client, None);
        let ident = client_identity(&config, &headers_with_bearer("tok-abc")).unwrap();
        assert_eq!(ident.token, "tok-abc");
        assert!(ident.cookie.is_empty());
    }

    #[test]
    fn client_mode_rejects_wrong_key_and_missing_bearer() {
        let config = config(AuthMode::Client, Some("k1"));
        let wrong = client_identity(&config, &headers_with_bearer("bad;tok;c"));
        assert!(matches!(wrong, Err(GateError::AuthInvalid(_))));

        let missing = client_identity(&config, &HeaderMap::new());
        assert!(matches!(missing, Err(GateError::AuthRequired(_))));
    }
}
