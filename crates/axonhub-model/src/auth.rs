use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A live OAuth credential set. `expires_at` is unix seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("token refresh failed: {0}")]
    Refresh(String),
    #[error("missing credential field: {0}")]
    MissingField(&'static str),
}

/// Hands out a live access token, refreshing behind the scenes when the
/// cached one is about to expire. Never falls back to another auth mode.
#[async_trait]
pub trait TokenGetter: Send + Sync {
    async fn get(&self) -> Result<OAuthTokens, AuthError>;
}
