//! Browser-like request headers for the web-chat origin. The upstream
//! rejects obviously non-browser traffic, so the header set mimics a
//! desktop Chrome session; the fingerprint extension is attached when the
//! vision fallback swapped the model mid-request.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

use crate::error::UpstreamError;

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36";

const SEC_CH_UA: &str = "\"Chromium\";v=\"125\", \"Google Chrome\";v=\"125\", \"Not.A/Brand\";v=\"24\"";

/// Headers for chat API calls (create-chat and completions).
pub fn chat_headers(
    token: &str,
    cookie: &str,
    origin: &str,
    fingerprint: bool,
) -> Result<HeaderMap, UpstreamError> {
    let mut headers = HeaderMap::new();
    insert(&mut headers, "authorization", &format!("Bearer {token}"))?;
    insert(&mut headers, "content-type", "application/json")?;
    insert(&mut headers, "user-agent", USER_AGENT)?;
    insert(&mut headers, "source", "web")?;
    insert(&mut headers, "x-request-id", &Uuid::new_v4().to_string())?;
    insert(&mut headers, "accept", "*/*")?;
    insert(&mut headers, "x-accel-buffering", "no")?;
    if !cookie.is_empty() {
        insert(&mut headers, "cookie", cookie)?;
    }

    if fingerprint {
        insert(&mut headers, "sec-ch-ua", SEC_CH_UA)?;
        insert(&mut headers, "sec-ch-ua-mobile", "?0")?;
        insert(&mut headers, "sec-ch-ua-platform", "\"Windows\"")?;
        insert(&mut headers, "sec-fetch-dest", "empty")?;
        insert(&mut headers, "sec-fetch-mode", "cors")?;
        insert(&mut headers, "sec-fetch-site", "same-origin")?;
        insert(&mut headers, "referer", &format!("{origin}/"))?;
    }

    Ok(headers)
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<(), UpstreamError> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| UpstreamError::Invalid(format!("bad header {name}: {e}")))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_headers_without_fingerprint() {
        let headers = chat_headers("tok", "ssxmod=abc", "https://chat.qwen.ai", false).unwrap();
        assert_eq!(headers.get("authorization").unwrap(), "Bearer tok");
        assert_eq!(headers.get("source").unwrap(), "web");
        assert_eq!(headers.get("cookie").unwrap(), "ssxmod=abc");
        assert!(headers.get("x-request-id").is_some());
        assert!(headers.get("sec-ch-ua").is_none());
        assert!(headers.get("referer").is_none());
    }

    #[test]
    fn fingerprint_adds_browser_headers() {
        let headers = chat_headers("tok", "", "https://chat.qwen.ai", true).unwrap();
        assert!(headers.get("cookie").is_none());
        assert_eq!(headers.get("sec-fetch-mode").unwrap(), "cors");
        assert_eq!(headers.get("referer").unwrap(), "https://chat.qwen.ai/");
    }

    #[test]
    fn control_characters_in_token_are_rejected() {
        assert!(chat_headers("bad\ntoken", "", "https://chat.qwen.ai", false).is_err());
    }
}
