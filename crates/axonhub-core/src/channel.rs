//! Channels: one (provider, base URL, credential) tuple serving a set of
//! models. The store is an indexed cache over whatever persistence backs
//! the deployment; here a JSON file loader stands behind the seam.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use axonhub_model::{OAuthTokens, TokenGetter};
use axonhub_transform::outbound::antigravity::AntigravityOutbound;
use axonhub_transform::outbound::claude::{AnthropicOutbound, ClaudeAuth};
use axonhub_transform::outbound::claudecode::ClaudeCodeOutbound;
use axonhub_transform::outbound::gemini::GeminiOutbound;
use axonhub_transform::outbound::jina::JinaOutbound;
use axonhub_transform::outbound::openai::{OpenAiDialect, OpenAiOutbound, OpenAiWire};
use axonhub_transform::outbound::zai::ZaiOutbound;
use axonhub_transform::{HealthTracker, OutboundTransformer};

use crate::cache::{CacheError, IndexedCache, IndexedCacheConfig, IndexedLoader};

pub const ANTIGRAVITY_ENDPOINTS: [&str; 3] = [
    "https://daily-cloudcode-pa.sandbox.googleapis.com",
    "https://autopush-cloudcode-pa.sandbox.googleapis.com",
    "https://cloudcode-pa.googleapis.com",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai-responses")]
    OpenAiResponses,
    #[serde(rename = "azure-openai")]
    AzureOpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "antigravity")]
    Antigravity,
    #[serde(rename = "claude-code")]
    ClaudeCode,
    #[serde(rename = "jina")]
    Jina,
    #[serde(rename = "zai")]
    Zai,
}

impl Provider {
    pub fn uses_oauth(&self) -> bool {
        matches!(self, Provider::Antigravity | Provider::ClaudeCode)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelCredential {
    #[serde(rename = "api_key")]
    ApiKey { key: String },
    #[serde(rename = "oauth")]
    OAuth(OAuthTokens),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub r#type: Provider,
    pub base_url: String,
    pub credential: ChannelCredential,
    #[serde(default)]
    pub models: Vec<String>,
    /// Client-visible model name -> upstream model name.
    #[serde(default)]
    pub model_mapping: BTreeMap<String, String>,
    /// Antigravity needs a cloud project to bill against.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Official channels pass selected client headers through untouched.
    #[serde(default)]
    pub is_official: bool,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
}

impl Channel {
    pub fn serves(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model) || self.model_mapping.contains_key(model)
    }

    /// The model name sent upstream for a client-requested model.
    pub fn upstream_model(&self, model: &str) -> String {
        self.model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    pub fn api_key(&self) -> Option<&str> {
        match &self.credential {
            ChannelCredential::ApiKey { key } => Some(key),
            ChannelCredential::OAuth(_) => None,
        }
    }

    pub fn oauth_tokens(&self) -> Option<&OAuthTokens> {
        match &self.credential {
            ChannelCredential::OAuth(tokens) => Some(tokens),
            ChannelCredential::ApiKey { .. } => None,
        }
    }
}

/// Reads the whole channel file and answers both loader calls from it.
pub struct ChannelFileLoader {
    path: PathBuf,
}

impl ChannelFileLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_all(&self) -> Result<Vec<Channel>, CacheError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|err| CacheError::Load(format!("{}: {err}", self.path.display())))?;
        serde_json::from_slice(&raw).map_err(|err| CacheError::Load(err.to_string()))
    }
}

#[async_trait]
impl IndexedLoader<i64, Channel> for ChannelFileLoader {
    async fn load_one(&self, key: &i64) -> Result<Option<Channel>, CacheError> {
        let channels = self.read_all().await?;
        Ok(channels
            .into_iter()
            .find(|channel| channel.id == *key && !channel.deleted))
    }

    async fn load_since(&self, watermark: i64) -> Result<(Vec<Channel>, i64), CacheError> {
        let channels = self.read_all().await?;
        let new_watermark = channels
            .iter()
            .map(|channel| channel.updated_at)
            .max()
            .unwrap_or(watermark);
        let fresh = channels
            .into_iter()
            .filter(|channel| channel.updated_at > watermark)
            .collect();
        Ok((fresh, new_watermark))
    }
}

pub struct ChannelStore {
    cache: IndexedCache<i64, Channel>,
}

impl ChannelStore {
    pub fn new(loader: Arc<dyn IndexedLoader<i64, Channel>>, refresh_interval: Duration) -> Self {
        let cache = IndexedCache::new(
            loader,
            Box::new(|channel: &Channel| channel.id),
            Some(Box::new(|channel: &Channel| channel.deleted)),
            IndexedCacheConfig::new(refresh_interval),
        );
        Self { cache }
    }

    pub async fn warm_up(&self) {
        self.cache.refresh_now().await;
    }

    pub async fn get(&self, id: i64) -> Result<Channel, CacheError> {
        self.cache.get(&id).await
    }

    pub async fn resolve_model(&self, model: &str) -> Option<Channel> {
        self.cache.find(|channel| channel.serves(model)).await
    }

    pub fn stop(&self) {
        self.cache.stop();
    }
}

/// Shared Antigravity routing state: one health tracker per process so
/// cooldowns survive across requests.
pub struct AntigravityRouting {
    pub endpoints: Vec<String>,
    pub tracker: Arc<HealthTracker>,
}

impl Default for AntigravityRouting {
    fn default() -> Self {
        Self {
            endpoints: ANTIGRAVITY_ENDPOINTS
                .iter()
                .map(|endpoint| endpoint.to_string())
                .collect(),
            tracker: Arc::new(HealthTracker::default()),
        }
    }
}

/// Build the outbound transformer for a channel. OAuth-backed providers
/// take the live token getter; key-backed providers read the channel key.
/// `outbound_proxy` is handed to providers that fetch outside the executor
/// path so their side channels use the same egress.
pub fn outbound_for_channel(
    channel: &Channel,
    token_getter: Option<Arc<dyn TokenGetter>>,
    antigravity: &AntigravityRouting,
    outbound_proxy: Option<&str>,
) -> Result<Box<dyn OutboundTransformer>, CacheError> {
    let key = || channel.api_key().unwrap_or("").to_string();
    let tokens = |provider: &str| {
        token_getter.clone().ok_or_else(|| {
            CacheError::Load(format!("channel {} ({provider}) has no oauth credential", channel.id))
        })
    };
    Ok(match channel.r#type {
        Provider::OpenAi => Box::new(OpenAiOutbound::new(&channel.base_url, key())),
        Provider::OpenAiResponses => Box::new(
            OpenAiOutbound::new(&channel.base_url, key()).with_wire(OpenAiWire::Responses),
        ),
        Provider::AzureOpenAi => Box::new(
            OpenAiOutbound::new(&channel.base_url, key()).with_dialect(OpenAiDialect::Azure),
        ),
        Provider::Anthropic => Box::new(AnthropicOutbound::new(
            &channel.base_url,
            ClaudeAuth::ApiKey(key()),
        )),
        Provider::Gemini => Box::new(GeminiOutbound::new(&channel.base_url, key())),
        Provider::Antigravity => Box::new(AntigravityOutbound::new(
            &channel.base_url,
            channel.project_id.clone().unwrap_or_default(),
            tokens("antigravity")?,
            antigravity.endpoints.clone(),
            antigravity.tracker.clone(),
        )),
        Provider::ClaudeCode => Box::new(ClaudeCodeOutbound::new(
            &channel.base_url,
            tokens("claude-code")?,
        )),
        Provider::Jina => Box::new(JinaOutbound::new(&channel.base_url, key())),
        Provider::Zai => Box::new(
            ZaiOutbound::new(&channel.base_url, key())
                .with_proxy(outbound_proxy.map(str::to_string)),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: i64, models: &[&str]) -> Channel {
        Channel {
            id,
            name: format!("ch-{id}"),
            r#type: Provider::OpenAi,
            base_url: "https://api.openai.com".to_string(),
            credential: ChannelCredential::ApiKey {
                key: "sk-test".to_string(),
            },
            models: models.iter().map(|m| m.to_string()).collect(),
            model_mapping: BTreeMap::new(),
            project_id: None,
            is_official: false,
            updated_at: 1,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn resolves_models_through_mapping() {
        let mut mapped = channel(2, &[]);
        mapped
            .model_mapping
            .insert("gpt-4o-alias".to_string(), "gpt-4o".to_string());
        assert!(mapped.serves("gpt-4o-alias"));
        assert_eq!(mapped.upstream_model("gpt-4o-alias"), "gpt-4o");
        assert_eq!(mapped.upstream_model("unmapped"), "unmapped");
    }

    #[tokio::test]
    async fn file_loader_roundtrip() {
        let dir = std::env::temp_dir().join(format!("axonhub-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("channels.json");
        let channels = vec![channel(1, &["gpt-4o"]), channel(2, &["claude-3-5-sonnet"])];
        tokio::fs::write(&path, serde_json::to_vec(&channels).unwrap())
            .await
            .unwrap();

        let store = ChannelStore::new(
            Arc::new(ChannelFileLoader::new(&path)),
            Duration::from_secs(3600),
        );
        store.warm_up().await;
        assert_eq!(store.get(1).await.unwrap().models, vec!["gpt-4o"]);
        let resolved = store.resolve_model("claude-3-5-sonnet").await.unwrap();
        assert_eq!(resolved.id, 2);
        assert!(store.resolve_model("missing").await.is_none());
        store.stop();
    }

    #[test]
    fn oauth_channels_require_a_token_getter() {
        let mut ch = channel(3, &["claude-sonnet-4-5"]);
        ch.r#type = Provider::ClaudeCode;
        let err =
            outbound_for_channel(&ch, None, &AntigravityRouting::default(), None).unwrap_err();
        assert!(matches!(err, CacheError::Load(_)));
    }
}
