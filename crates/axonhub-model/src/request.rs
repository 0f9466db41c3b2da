use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::message::{Message, Tool, ToolChoice};

/// The wire format a request arrived in (or a response must leave in).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiFormat {
    #[serde(rename = "openai")]
    OpenAiChat,
    #[serde(rename = "openai-responses")]
    OpenAiResponses,
    #[serde(rename = "anthropic")]
    Claude,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "openai-embeddings")]
    OpenAiEmbeddings,
    #[serde(rename = "jina-embeddings")]
    JinaEmbeddings,
    #[serde(rename = "jina-rerank")]
    JinaRerank,
    #[serde(rename = "openai-image-generation")]
    OpenAiImageGeneration,
}

impl ApiFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFormat::OpenAiChat => "openai",
            ApiFormat::OpenAiResponses => "openai-responses",
            ApiFormat::Claude => "anthropic",
            ApiFormat::Gemini => "gemini",
            ApiFormat::OpenAiEmbeddings => "openai-embeddings",
            ApiFormat::JinaEmbeddings => "jina-embeddings",
            ApiFormat::JinaRerank => "jina-rerank",
            ApiFormat::OpenAiImageGeneration => "openai-image-generation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Chat,
    Embedding,
    Image,
    Rerank,
}

/// The raw inbound HTTP request as seen by ingress. Transformers read the
/// body; providers may consult or strip client headers.
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RawRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        crate::upstream::header_get(&self.headers, name)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }
}

/// Knobs that alter how a transformer chain treats one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformOptions {
    /// Forward client-supplied provider headers verbatim (official channels).
    pub pass_client_headers: bool,
}

/// Well-known `transformer_metadata` keys.
pub mod meta_keys {
    pub const IMAGE_OUTPUT_FORMAT: &str = "image_output_format";
    pub const INCLUDE: &str = "include";
    pub const MAX_TOOL_CALLS: &str = "max_tool_calls";
    pub const PROMPT_CACHE_KEY: &str = "prompt_cache_key";
    pub const PROMPT_CACHE_RETENTION: &str = "prompt_cache_retention";
    pub const TRUNCATION: &str = "truncation";
    pub const ANTIGRAVITY_MODEL: &str = "antigravity_model";
    pub const STRIP_TOOL_PREFIX: &str = "strip_tool_prefix";
    pub const MODEL: &str = "model";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingParams {
    /// Pre-validated input, kept in wire shape.
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerankParams {
    pub query: String,
    pub documents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_documents: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageParams {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// The protocol-neutral request.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub model: String,
    pub request_type: Option<RequestType>,
    pub api_format: Option<ApiFormat>,
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
    pub tool_choice: Option<ToolChoice>,
    pub response_format: Option<Value>,
    pub stream: Option<bool>,
    pub max_completion_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_logprobs: Option<u32>,
    pub reasoning_effort: Option<String>,
    pub reasoning_budget: Option<u32>,
    /// User-visible metadata, passed through to providers that accept it.
    pub metadata: BTreeMap<String, String>,
    /// Private per-request scratch shared along the transformer chain.
    pub transformer_metadata: BTreeMap<String, Value>,
    pub embedding: Option<EmbeddingParams>,
    pub rerank: Option<RerankParams>,
    pub image: Option<ImageParams>,
    pub raw_request: Option<RawRequest>,
    pub transform_options: TransformOptions,
}

impl Request {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.transformer_metadata.get(key).and_then(Value::as_str)
    }

    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.transformer_metadata.get(key).and_then(Value::as_bool)
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.transformer_metadata.insert(key.to_string(), value.into());
    }

    pub fn client_user_agent(&self) -> Option<&str> {
        self.raw_request.as_ref().and_then(RawRequest::user_agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_metadata_accessors() {
        let mut request = Request::default();
        request.set_meta(meta_keys::STRIP_TOOL_PREFIX, true);
        request.set_meta(meta_keys::ANTIGRAVITY_MODEL, "gemini-3-pro");
        assert_eq!(request.meta_bool(meta_keys::STRIP_TOOL_PREFIX), Some(true));
        assert_eq!(
            request.meta_str(meta_keys::ANTIGRAVITY_MODEL),
            Some("gemini-3-pro")
        );
        assert_eq!(request.meta_str("absent"), None);
    }
}
