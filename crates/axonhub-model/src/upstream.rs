//! Transport-facing contracts shared by transformers and executors.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

pub type Headers = Vec<(String, String)>;

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
        Some((_, v)) => *v = value,
        None => headers.push((name, value)),
    }
}

pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let idx = headers.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))?;
    Some(headers.remove(idx).1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// How the executor authenticates the upstream call. Transformers describe
/// intent; the HTTP layer writes the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthConfig {
    None,
    Bearer(String),
    ApiKey { header: String, key: String },
}

impl AuthConfig {
    pub fn api_key(header: impl Into<String>, key: impl Into<String>) -> Self {
        AuthConfig::ApiKey {
            header: header.into(),
            key: key.into(),
        }
    }
}

/// An upstream HTTP request built by an outbound transformer. The body is
/// pre-serialized: transformers own JSON marshaling. `meta` never goes on
/// the wire; it carries executor hints such as the routing model name.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub auth: AuthConfig,
    pub body: Option<Bytes>,
    pub is_stream: bool,
    pub meta: Headers,
}

impl UpstreamRequest {
    pub fn post_json(url: impl Into<String>, body: Bytes) -> Self {
        let mut headers = Vec::new();
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(&mut headers, "Accept", "application/json");
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers,
            auth: AuthConfig::None,
            body: Some(body),
            is_stream: false,
            meta: Vec::new(),
        }
    }

    pub fn meta_get(&self, key: &str) -> Option<&str> {
        header_get(&self.meta, key)
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        header_set(&mut self.meta, key, value);
    }

    /// Swap the scheme+authority while keeping path, query, headers and body.
    pub fn with_base_url(&self, base: &str) -> Self {
        let mut cloned = self.clone();
        if let Some(rest) = strip_origin(&self.url) {
            cloned.url = format!("{}{rest}", base.trim_end_matches('/'));
        }
        cloned
    }
}

fn strip_origin(url: &str) -> Option<&str> {
    let after_scheme = url.split_once("://")?.1;
    match after_scheme.find('/') {
        Some(idx) => Some(&after_scheme[idx..]),
        None => Some(""),
    }
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    /// Raw body chunks of a streaming response.
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

/// Why an upstream call failed before a usable response existed.
#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// No HTTP response at all.
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    /// HTTP error response captured as bytes.
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
        method: String,
        url: String,
    },
}

impl UpstreamFailure {
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamFailure::Transport { .. } => None,
            UpstreamFailure::Http { status, .. } => Some(*status),
        }
    }
}

impl From<UpstreamFailure> for GatewayError {
    fn from(failure: UpstreamFailure) -> Self {
        match failure {
            UpstreamFailure::Transport { message, .. } => GatewayError::Transport(message),
            UpstreamFailure::Http { status, body, .. } => GatewayError::upstream(
                status,
                crate::error::ErrorDetail::new(
                    "api_error",
                    String::from_utf8_lossy(&body).to_string(),
                ),
            ),
        }
    }
}

/// The unary/streaming HTTP seam. Implementations: the wreq-backed client
/// and the endpoint-fallback wrapper.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_helpers_are_case_insensitive() {
        let mut headers = Vec::new();
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(&mut headers, "content-type", "text/event-stream");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "CONTENT-TYPE"), Some("text/event-stream"));
        assert_eq!(header_remove(&mut headers, "content-Type").as_deref(), Some("text/event-stream"));
        assert!(headers.is_empty());
    }

    #[test]
    fn with_base_url_keeps_path_and_query() {
        let request = UpstreamRequest::post_json(
            "https://daily.example.com/v1internal:streamGenerateContent?alt=sse",
            Bytes::from_static(b"{}"),
        );
        let moved = request.with_base_url("https://autopush.example.com/");
        assert_eq!(
            moved.url,
            "https://autopush.example.com/v1internal:streamGenerateContent?alt=sse"
        );
    }
}
