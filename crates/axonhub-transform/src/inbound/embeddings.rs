//! OpenAI and Jina embeddings as client-facing formats. The two differ only
//! in the `task` dialect and the label used in error bodies.

use bytes::Bytes;

use axonhub_model::{
    ApiFormat, EmbeddingParams, GatewayError, RawRequest, Request, RequestType, Response,
    ResponseMeta,
};
use axonhub_protocol::jina::JinaTask;
use axonhub_protocol::openai::embeddings::{
    EmbeddingObject, EmbeddingsRequest, EmbeddingsResponse, EmbeddingsUsage,
};
use axonhub_protocol::sse::SseEvent;

use super::{openai_chat::render_openai_error, parse_body};
use crate::{InboundTransformer, RenderedResponse, StreamEncoder, TransformError};

pub struct EmbeddingsInbound {
    format: ApiFormat,
}

impl EmbeddingsInbound {
    pub fn new(format: ApiFormat) -> Self {
        Self { format }
    }
}

impl InboundTransformer for EmbeddingsInbound {
    fn api_format(&self) -> ApiFormat {
        self.format
    }

    fn transform_request(&self, raw: &RawRequest) -> Result<Request, TransformError> {
        if let Ok(probe) = serde_json::from_slice::<serde_json::Value>(&raw.body)
            && probe.get("stream").and_then(serde_json::Value::as_bool) == Some(true)
        {
            return Err(TransformError::invalid(
                "streaming is not supported for embeddings",
            ));
        }
        let wire: EmbeddingsRequest = parse_body(&raw.body)?;
        if wire.model.is_empty() {
            return Err(TransformError::invalid("model is required"));
        }
        if wire.input.is_empty() {
            return Err(TransformError::invalid("input must not be empty"));
        }
        let task = match self.format {
            ApiFormat::JinaEmbeddings => {
                let task = wire.task.as_deref().unwrap_or("");
                let task = JinaTask::parse(task)
                    .ok_or_else(|| TransformError::invalid(format!("unknown task: {task}")))?;
                Some(task.as_str().to_string())
            }
            _ => wire.task,
        };
        Ok(Request {
            model: wire.model,
            request_type: Some(RequestType::Embedding),
            api_format: Some(self.format),
            stream: Some(false),
            embedding: Some(EmbeddingParams {
                input: serde_json::to_value(&wire.input)?,
                task,
                dimensions: wire.dimensions,
                encoding_format: wire.encoding_format,
            }),
            raw_request: Some(raw.clone()),
            ..Default::default()
        })
    }

    fn transform_response(&self, response: &Response) -> Result<RenderedResponse, TransformError> {
        let wire = EmbeddingsResponse {
            object: "list".to_string(),
            data: response
                .embeddings
                .iter()
                .map(|item| EmbeddingObject {
                    object: "embedding".to_string(),
                    index: item.index,
                    embedding: item.embedding.clone(),
                })
                .collect(),
            model: response.model.clone(),
            usage: response.usage.as_ref().map(|usage| EmbeddingsUsage {
                prompt_tokens: usage.prompt_tokens,
                total_tokens: usage.total_tokens,
            }),
        };
        Ok(RenderedResponse::json(200, Bytes::from(serde_json::to_vec(&wire)?)))
    }

    fn stream_encoder(&self, _request: &Request) -> Box<dyn StreamEncoder> {
        Box::new(RefusingEncoder)
    }

    fn aggregate_stream(
        &self,
        _frames: &[SseEvent],
    ) -> Result<(Bytes, ResponseMeta), TransformError> {
        Err(TransformError::Unsupported("embeddings streaming"))
    }

    fn render_error(&self, error: &GatewayError) -> RenderedResponse {
        render_openai_error(error)
    }
}

pub(super) struct RefusingEncoder;

impl StreamEncoder for RefusingEncoder {
    fn encode(&mut self, _delta: &Response) -> Result<Vec<Bytes>, TransformError> {
        Err(TransformError::Unsupported("streaming for this format"))
    }
}

/// Jina rerank as a client-facing format. Unary only.
pub struct RerankInbound;

impl InboundTransformer for RerankInbound {
    fn api_format(&self) -> ApiFormat {
        ApiFormat::JinaRerank
    }

    fn transform_request(&self, raw: &RawRequest) -> Result<Request, TransformError> {
        let wire: axonhub_protocol::jina::RerankRequest = parse_body(&raw.body)?;
        if wire.model.is_empty() {
            return Err(TransformError::invalid("model is required"));
        }
        if wire.query.is_empty() {
            return Err(TransformError::invalid("query must not be empty"));
        }
        if wire.documents.is_empty() {
            return Err(TransformError::invalid("documents must not be empty"));
        }
        Ok(Request {
            model: wire.model,
            request_type: Some(axonhub_model::RequestType::Rerank),
            api_format: Some(ApiFormat::JinaRerank),
            stream: Some(false),
            rerank: Some(axonhub_model::RerankParams {
                query: wire.query,
                documents: wire.documents,
                top_n: wire.top_n,
                return_documents: wire.return_documents,
            }),
            raw_request: Some(raw.clone()),
            ..Default::default()
        })
    }

    fn transform_response(&self, response: &Response) -> Result<RenderedResponse, TransformError> {
        let wire = axonhub_protocol::jina::RerankResponse {
            model: (!response.model.is_empty()).then(|| response.model.clone()),
            results: response
                .rerank
                .iter()
                .map(|score| axonhub_protocol::jina::RerankResult {
                    index: score.index,
                    relevance_score: score.relevance_score,
                    document: score
                        .document
                        .clone()
                        .map(|text| axonhub_protocol::jina::RerankDocument { text }),
                })
                .collect(),
            usage: response
                .usage
                .as_ref()
                .map(|usage| axonhub_protocol::jina::RerankUsage {
                    total_tokens: usage.total_tokens,
                }),
        };
        Ok(RenderedResponse::json(200, Bytes::from(serde_json::to_vec(&wire)?)))
    }

    fn stream_encoder(&self, _request: &Request) -> Box<dyn StreamEncoder> {
        Box::new(RefusingEncoder)
    }

    fn aggregate_stream(
        &self,
        _frames: &[SseEvent],
    ) -> Result<(Bytes, ResponseMeta), TransformError> {
        Err(TransformError::Unsupported("rerank streaming"))
    }

    fn render_error(&self, error: &GatewayError) -> RenderedResponse {
        render_openai_error(error)
    }
}
