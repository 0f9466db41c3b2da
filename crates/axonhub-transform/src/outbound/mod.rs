pub mod antigravity;
pub mod claude;
pub mod claudecode;
pub mod fallback;
pub mod gemini;
mod http_fetch;
pub mod jina;
pub mod openai;
pub mod zai;

use axonhub_model::{ErrorDetail, ResponseError};
use axonhub_protocol::error::OpenAiErrorBody;

/// Decode an OpenAI-shaped error body, falling back to the raw text.
pub(crate) fn parse_openai_error(status: u16, body: &[u8]) -> ResponseError {
    if let Ok(parsed) = serde_json::from_slice::<OpenAiErrorBody>(body) {
        return ResponseError {
            status,
            detail: ErrorDetail {
                message: parsed.error.message,
                r#type: if parsed.error.r#type.is_empty() {
                    "api_error".to_string()
                } else {
                    parsed.error.r#type
                },
                code: parsed.error.code,
                param: parsed.error.param,
            },
        };
    }
    ResponseError {
        status,
        detail: ErrorDetail::new("api_error", String::from_utf8_lossy(body).to_string()),
    }
}
