pub mod claude;
pub mod embeddings;
pub mod gemini;
pub mod images;
pub mod openai_chat;
pub mod openai_responses;

use axonhub_model::{ApiFormat, FinishReason};

use crate::{InboundTransformer, TransformError};

/// Look up the inbound transformer for a wire format.
pub fn inbound_for(format: ApiFormat) -> Box<dyn InboundTransformer> {
    match format {
        ApiFormat::OpenAiChat => Box::new(openai_chat::OpenAiChatInbound),
        ApiFormat::OpenAiResponses => Box::new(openai_responses::OpenAiResponsesInbound),
        ApiFormat::Claude => Box::new(claude::ClaudeInbound),
        ApiFormat::Gemini => Box::new(gemini::GeminiInbound),
        ApiFormat::OpenAiEmbeddings => {
            Box::new(embeddings::EmbeddingsInbound::new(ApiFormat::OpenAiEmbeddings))
        }
        ApiFormat::JinaEmbeddings => {
            Box::new(embeddings::EmbeddingsInbound::new(ApiFormat::JinaEmbeddings))
        }
        ApiFormat::JinaRerank => Box::new(embeddings::RerankInbound),
        ApiFormat::OpenAiImageGeneration => Box::new(images::ImagesInbound),
    }
}

pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, TransformError> {
    serde_json::from_slice(body).map_err(|err| TransformError::invalid(err.to_string()))
}

pub(crate) fn parse_finish_reason(value: &str) -> Option<FinishReason> {
    match value {
        "stop" | "end_turn" | "stop_sequence" | "STOP" => Some(FinishReason::Stop),
        "length" | "max_tokens" | "MAX_TOKENS" => Some(FinishReason::Length),
        "tool_calls" | "tool_use" | "function_call" => Some(FinishReason::ToolCalls),
        "error" | "content_filter" => Some(FinishReason::Error),
        _ => None,
    }
}
