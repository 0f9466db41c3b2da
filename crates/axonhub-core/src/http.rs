//! The wreq-backed [`HttpExecutor`]: JSON + SSE transport with typed
//! transport-error classification and auth header injection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use wreq::{Client, Method};

use axonhub_common::GatewayConfig;
use axonhub_model::{
    AuthConfig, Headers, HttpExecutor, HttpMethod, TransportErrorKind, UpstreamBody,
    UpstreamFailure, UpstreamRequest, UpstreamResponse, header_set,
};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Already normalized: a blank proxy setting means "no proxy".
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl HttpClientConfig {
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            proxy: config
                .proxy
                .as_deref()
                .map(str::trim)
                .filter(|proxy| !proxy.is_empty())
                .map(str::to_string),
            stream_idle_timeout: Duration::from_secs(config.stream_idle_secs),
            ..Self::default()
        }
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(86400),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// The egress proxy is part of the gateway config and fixed for the life of
/// the process, so one connection pool built up front serves every upstream
/// call.
pub struct WreqExecutor {
    client: Client,
    stream_idle_timeout: Duration,
}

impl WreqExecutor {
    pub fn new(config: HttpClientConfig) -> Result<Arc<Self>, wreq::Error> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout);
        if let Some(proxy) = config.proxy.as_deref() {
            builder = builder.proxy(wreq::Proxy::all(proxy)?);
        }
        Ok(Arc::new(Self {
            client: builder.build()?,
            stream_idle_timeout: config.stream_idle_timeout,
        }))
    }
}

/// Write the auth header described by the transformer.
pub fn apply_auth(headers: &mut Headers, auth: &AuthConfig) {
    match auth {
        AuthConfig::None => {}
        AuthConfig::Bearer(token) => {
            header_set(headers, "Authorization", format!("Bearer {token}"));
        }
        AuthConfig::ApiKey { header, key } => {
            header_set(headers, header.clone(), key.clone());
        }
    }
}

#[async_trait]
impl HttpExecutor for WreqExecutor {
    async fn execute(
        &self,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamFailure> {
        let method = match request.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        };
        let mut headers = request.headers.clone();
        apply_auth(&mut headers, &request.auth);

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(transport_failure)?;
        let status = response.status().as_u16();
        let response_headers: Headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                let value = value.to_str().ok()?;
                Some((name.as_str().to_string(), value.to_string()))
            })
            .collect();

        // Error statuses come back as bytes even on stream requests; the
        // caller turns them into a typed failure.
        if !(200..300).contains(&status) {
            let body = response.bytes().await.map_err(transport_failure)?;
            return Err(UpstreamFailure::Http {
                status,
                headers: response_headers,
                body,
                method: request.method.as_str().to_string(),
                url: request.url.clone(),
            });
        }

        if !request.is_stream {
            let body = response.bytes().await.map_err(transport_failure)?;
            return Ok(UpstreamResponse {
                status,
                headers: response_headers,
                body: UpstreamBody::Bytes(body),
            });
        }

        let idle = self.stream_idle_timeout;
        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            loop {
                let next = tokio::time::timeout(idle, stream.next()).await;
                let Ok(item) = next else {
                    break;
                };
                let Some(Ok(chunk)) = item else {
                    break;
                };
                if tx.send(chunk).await.is_err() {
                    // Consumer went away; dropping the stream closes upstream.
                    break;
                }
            }
        });
        Ok(UpstreamResponse {
            status,
            headers: response_headers,
            body: UpstreamBody::Stream(rx),
        })
    }
}

/// Sort a wreq error into the transport taxonomy. The crate only exposes
/// coarse predicates, so the finer kinds (DNS vs TCP connect, read vs
/// connect timeout) are sniffed out of the error text.
fn transport_failure(err: wreq::Error) -> UpstreamFailure {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    let mentions = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

    let kind = if err.is_timeout() {
        if mentions(&["read", "idle"]) {
            TransportErrorKind::ReadTimeout
        } else {
            TransportErrorKind::Timeout
        }
    } else if mentions(&["tls", "ssl", "certificate"]) {
        TransportErrorKind::Tls
    } else if err.is_connect() || err.is_connection_reset() {
        if mentions(&["dns", "resolve", "lookup"]) {
            TransportErrorKind::Dns
        } else {
            TransportErrorKind::Connect
        }
    } else {
        TransportErrorKind::Other
    };
    UpstreamFailure::Transport { kind, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_injection_writes_the_right_header() {
        let mut headers = Headers::new();
        apply_auth(&mut headers, &AuthConfig::Bearer("tok".to_string()));
        assert_eq!(
            axonhub_model::header_get(&headers, "authorization"),
            Some("Bearer tok")
        );

        let mut headers = Headers::new();
        apply_auth(&mut headers, &AuthConfig::api_key("x-goog-api-key", "gk"));
        assert_eq!(axonhub_model::header_get(&headers, "x-goog-api-key"), Some("gk"));

        let mut headers = Headers::new();
        apply_auth(&mut headers, &AuthConfig::None);
        assert!(headers.is_empty());
    }

    #[test]
    fn blank_proxy_settings_normalize_to_none() {
        let gateway = axonhub_common::GatewayConfig {
            host: "0.0.0.0".to_string(),
            port: 8790,
            proxy: Some("   ".to_string()),
            channels_path: "channels.json".to_string(),
            stream_idle_secs: 45,
        };
        let config = HttpClientConfig::from_gateway(&gateway);
        assert_eq!(config.proxy, None);
        assert_eq!(config.stream_idle_timeout, Duration::from_secs(45));

        let gateway = axonhub_common::GatewayConfig {
            proxy: Some(" http://egress:3128 ".to_string()),
            ..gateway
        };
        let config = HttpClientConfig::from_gateway(&gateway);
        assert_eq!(config.proxy.as_deref(), Some("http://egress:3128"));
    }
}
