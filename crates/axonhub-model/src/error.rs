use serde::{Deserialize, Serialize};

/// Provider-supplied error detail, preserved across the translation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

impl ErrorDetail {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            r#type: kind.into(),
            code: None,
            param: None,
        }
    }
}

/// A decoded upstream error: HTTP status plus provider detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub status: u16,
    pub detail: ErrorDetail,
}

/// The gateway-wide error taxonomy. The inbound transformer renders the
/// terminal wire shape; everything below it only classifies.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Inbound decode or validation failure: always 400.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// No channel serves the requested model: always 422.
    #[error("no channel available for model {0}")]
    InvalidModel(String),
    /// Upstream returned >= 400 with a parseable error body.
    #[error("upstream error {}: {}", .0.status, .0.detail.message)]
    Upstream(ResponseError),
    /// Network/TLS/IO failure before any HTTP status.
    #[error("upstream transport error: {0}")]
    Transport(String),
    /// Upstream 2xx whose body the outbound transformer cannot decode.
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),
    /// Failure after streaming headers were already sent.
    #[error("stream error: {0}")]
    Stream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn upstream(status: u16, detail: ErrorDetail) -> Self {
        GatewayError::Upstream(ResponseError { status, detail })
    }

    /// HTTP status the client sees.
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::InvalidModel(_) => 422,
            GatewayError::Upstream(err) => err.status,
            GatewayError::Transport(_)
            | GatewayError::MalformedResponse(_)
            | GatewayError::Stream(_)
            | GatewayError::Internal(_) => 500,
        }
    }

    /// Error-type label used by the OpenAI-compatible renderings.
    pub fn type_label(&self) -> &str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request_error",
            GatewayError::InvalidModel(_) => "invalid_model_error",
            GatewayError::Upstream(err) if !err.detail.r#type.is_empty() => &err.detail.r#type,
            GatewayError::Upstream(_) => "api_error",
            GatewayError::Transport(_) | GatewayError::Stream(_) => "api_error",
            GatewayError::MalformedResponse(_) | GatewayError::Internal(_) => "api_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            GatewayError::Upstream(err) => err.detail.message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<ResponseError> for GatewayError {
    fn from(err: ResponseError) -> Self {
        GatewayError::Upstream(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(GatewayError::InvalidRequest("x".into()).status(), 400);
        assert_eq!(GatewayError::InvalidModel("m".into()).status(), 422);
        assert_eq!(
            GatewayError::upstream(429, ErrorDetail::new("rate_limit_error", "slow down")).status(),
            429
        );
        assert_eq!(GatewayError::Transport("reset".into()).status(), 500);
    }

    #[test]
    fn upstream_type_label_is_preserved() {
        let err = GatewayError::upstream(429, ErrorDetail::new("rate_limit_error", "slow down"));
        assert_eq!(err.type_label(), "rate_limit_error");
    }
}
