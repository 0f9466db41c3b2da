use axonhub_model::{AuthError, GatewayError};

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("missing credential field: {0}")]
    MissingCredential(&'static str),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed upstream payload: {0}")]
    MalformedUpstream(String),
    #[error("{0}")]
    Other(String),
}

impl TransformError {
    pub fn invalid(message: impl Into<String>) -> Self {
        TransformError::InvalidRequest(message.into())
    }
}

impl From<TransformError> for GatewayError {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::InvalidRequest(message) => GatewayError::InvalidRequest(message),
            TransformError::Unsupported(what) => {
                GatewayError::InvalidRequest(format!("unsupported: {what}"))
            }
            TransformError::MalformedUpstream(message) => {
                GatewayError::MalformedResponse(message)
            }
            TransformError::Json(err) => GatewayError::MalformedResponse(err.to_string()),
            TransformError::Auth(err) => GatewayError::Internal(err.to_string()),
            TransformError::MissingCredential(field) => {
                GatewayError::Internal(format!("missing credential field: {field}"))
            }
            TransformError::Other(message) => GatewayError::Internal(message),
        }
    }
}
