//! OAuth access-token provider: a cached token with refresh-on-expiry and
//! pluggable exchange strategies. Refreshes are single-flighted per
//! credential; a failed refresh is surfaced, never papered over with
//! another auth mode.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use axonhub_model::{AuthError, OAuthTokens, TokenGetter};

const EXPIRY_SKEW: Duration = Duration::from_secs(30);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_EXPIRES_IN: i64 = 3600;

pub const ANTIGRAVITY_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const ANTIGRAVITY_CLIENT_ID: &str =
    "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";
pub const ANTIGRAVITY_CLIENT_SECRET: &str = "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";
pub const CLAUDE_CODE_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
pub const CLAUDE_CODE_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Exchanges a refresh token for fresh credentials.
#[async_trait]
pub trait ExchangeStrategy: Send + Sync {
    async fn refresh(&self, current: &OAuthTokens) -> Result<OAuthTokens, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// The common `grant_type=refresh_token` form post.
pub struct RefreshTokenExchange {
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
}

impl RefreshTokenExchange {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }

    pub fn antigravity() -> Self {
        Self::new(
            ANTIGRAVITY_TOKEN_URL,
            ANTIGRAVITY_CLIENT_ID,
            Some(ANTIGRAVITY_CLIENT_SECRET.to_string()),
        )
    }

    pub fn claude_code() -> Self {
        Self::new(CLAUDE_CODE_TOKEN_URL, CLAUDE_CODE_CLIENT_ID, None)
    }

    fn refresh_form(&self, current: &OAuthTokens) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("client_id", self.client_id.clone()),
            ("refresh_token", current.refresh_token.clone()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        form
    }
}

#[async_trait]
impl ExchangeStrategy for RefreshTokenExchange {
    async fn refresh(&self, current: &OAuthTokens) -> Result<OAuthTokens, AuthError> {
        if current.refresh_token.is_empty() {
            return Err(AuthError::MissingField("refresh_token"));
        }
        let form = serde_urlencoded::to_string(self.refresh_form(current))
            .map_err(|err| AuthError::Refresh(err.to_string()))?;
        let client = wreq::Client::builder()
            .timeout(EXCHANGE_TIMEOUT)
            .build()
            .map_err(|err| AuthError::Refresh(err.to_string()))?;
        let response = client
            .post(&self.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(form)
            .send()
            .await
            .map_err(|err| AuthError::Refresh(err.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| AuthError::Refresh(err.to_string()))?;
        if !status.is_success() {
            return Err(AuthError::Refresh(format!(
                "token endpoint returned {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|err| AuthError::Refresh(err.to_string()))?;
        Ok(OAuthTokens {
            access_token: parsed.access_token,
            refresh_token: parsed
                .refresh_token
                .unwrap_or_else(|| current.refresh_token.clone()),
            expires_at: now_unix() + parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
            client_id: Some(self.client_id.clone()),
            scopes: current.scopes.clone(),
        })
    }
}

pub type RefreshHook = Box<dyn Fn(&OAuthTokens) + Send + Sync>;

pub struct OAuthTokenProvider {
    strategy: Box<dyn ExchangeStrategy>,
    current: ArcSwap<OAuthTokens>,
    refresh_lock: tokio::sync::Mutex<()>,
    on_refreshed: Option<RefreshHook>,
}

impl OAuthTokenProvider {
    pub fn new(initial: OAuthTokens, strategy: Box<dyn ExchangeStrategy>) -> Self {
        Self {
            strategy,
            current: ArcSwap::from_pointee(initial),
            refresh_lock: tokio::sync::Mutex::new(()),
            on_refreshed: None,
        }
    }

    /// Invoked with the fresh credentials after every successful refresh,
    /// so the caller can persist them.
    pub fn with_refresh_hook(mut self, hook: RefreshHook) -> Self {
        self.on_refreshed = Some(hook);
        self
    }

    fn live(tokens: &OAuthTokens) -> bool {
        now_unix() < tokens.expires_at - EXPIRY_SKEW.as_secs() as i64
    }
}

#[async_trait]
impl TokenGetter for OAuthTokenProvider {
    async fn get(&self) -> Result<OAuthTokens, AuthError> {
        let tokens = self.current.load();
        if Self::live(&tokens) {
            return Ok(OAuthTokens::clone(&tokens));
        }

        let _flight = self.refresh_lock.lock().await;
        // A concurrent caller may have refreshed while this one waited.
        let tokens = self.current.load();
        if Self::live(&tokens) {
            return Ok(OAuthTokens::clone(&tokens));
        }

        debug!("access token expiring, refreshing");
        let fresh = self.strategy.refresh(&tokens).await?;
        self.current.store(Arc::new(fresh.clone()));
        if let Some(hook) = &self.on_refreshed {
            hook(&fresh);
        }
        Ok(fresh)
    }
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_form_is_url_encoded_with_optional_secret() {
        let exchange = RefreshTokenExchange::antigravity();
        let tokens = OAuthTokens {
            refresh_token: "1//rt".to_string(),
            ..Default::default()
        };
        let form = serde_urlencoded::to_string(exchange.refresh_form(&tokens)).unwrap();
        assert!(form.contains("grant_type=refresh_token"));
        assert!(form.contains("client_secret="));
        assert!(form.contains("refresh_token=1%2F%2Frt"));

        let exchange = RefreshTokenExchange::claude_code();
        let form = serde_urlencoded::to_string(exchange.refresh_form(&tokens)).unwrap();
        assert!(!form.contains("client_secret"));
    }

    #[tokio::test]
    async fn missing_refresh_token_fails_fast() {
        let exchange = RefreshTokenExchange::claude_code();
        let err = exchange.refresh(&OAuthTokens::default()).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingField("refresh_token")));
    }
}
