use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error("missing required gateway config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged gateway configuration used by the running process.
///
/// Merge order: CLI > ENV > built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    /// Path to the channel definition file consumed by the channel store.
    pub channels_path: String,
    /// Seconds of upstream SSE silence before a stream is abandoned.
    pub stream_idle_secs: u64,
}

/// Optional layer used when merging gateway config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub proxy: Option<String>,
    pub channels_path: Option<String>,
    pub stream_idle_secs: Option<u64>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.channels_path.is_some() {
            self.channels_path = other.channels_path;
        }
        if other.stream_idle_secs.is_some() {
            self.stream_idle_secs = other.stream_idle_secs;
        }
    }

    pub fn into_config(self) -> Result<GatewayConfig, GatewayConfigError> {
        Ok(GatewayConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8790),
            proxy: self.proxy,
            channels_path: self
                .channels_path
                .ok_or(GatewayConfigError::MissingField("channels_path"))?,
            stream_idle_secs: self.stream_idle_secs.unwrap_or(30),
        })
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            proxy: value.proxy,
            channels_path: Some(value.channels_path),
            stream_idle_secs: Some(value.stream_idle_secs),
        }
    }
}

/// Generate a sortable per-request trace id.
pub fn new_trace_id() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_layer() {
        let mut base = GatewayConfigPatch {
            host: Some("127.0.0.1".to_string()),
            port: Some(9000),
            ..Default::default()
        };
        base.overlay(GatewayConfigPatch {
            port: Some(9100),
            channels_path: Some("channels.json".to_string()),
            ..Default::default()
        });
        let config = base.into_config().expect("config should merge");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9100);
        assert_eq!(config.channels_path, "channels.json");
        assert_eq!(config.stream_idle_secs, 30);
    }

    #[test]
    fn missing_channels_path_is_an_error() {
        let err = GatewayConfigPatch::default().into_config().unwrap_err();
        assert!(matches!(err, GatewayConfigError::MissingField("channels_path")));
    }
}
