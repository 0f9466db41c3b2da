//! Jina upstream: embeddings and rerank. No streaming surface at all.

use async_trait::async_trait;
use bytes::Bytes;

use axonhub_model::{
    AuthConfig, Request, RequestType, Response, ResponseError, ResponseMeta, RerankScore,
    UpstreamRequest, Usage,
};
use axonhub_protocol::jina::{RerankRequest, RerankResponse};
use axonhub_protocol::openai::embeddings::EmbeddingsRequest;
use axonhub_protocol::sse::SseEvent;

use super::openai::decode_embeddings_response;
use super::parse_openai_error;
use crate::util::build_url;
use crate::{OutboundTransformer, StreamDecoder, TransformError};

pub struct JinaOutbound {
    base_url: String,
    api_key: String,
}

impl JinaOutbound {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl OutboundTransformer for JinaOutbound {
    fn name(&self) -> &'static str {
        "jina"
    }

    async fn transform_request(
        &self,
        request: &Request,
    ) -> Result<UpstreamRequest, TransformError> {
        if request.is_stream() {
            return Err(TransformError::invalid(
                "jina does not support streaming responses",
            ));
        }
        let (path, body) = match request.request_type {
            Some(RequestType::Rerank) => {
                let params = request
                    .rerank
                    .as_ref()
                    .ok_or_else(|| TransformError::invalid("missing rerank parameters"))?;
                let body = RerankRequest {
                    model: request.model.clone(),
                    query: params.query.clone(),
                    documents: params.documents.clone(),
                    top_n: params.top_n,
                    return_documents: params.return_documents,
                };
                ("v1/rerank", serde_json::to_vec(&body)?)
            }
            _ => {
                let params = request
                    .embedding
                    .as_ref()
                    .ok_or_else(|| TransformError::invalid("missing embedding input"))?;
                let body = EmbeddingsRequest {
                    model: request.model.clone(),
                    input: serde_json::from_value(params.input.clone())?,
                    encoding_format: params.encoding_format.clone(),
                    dimensions: params.dimensions,
                    task: params.task.clone(),
                    user: None,
                };
                ("v1/embeddings", serde_json::to_vec(&body)?)
            }
        };
        let mut upstream =
            UpstreamRequest::post_json(build_url(&self.base_url, path), Bytes::from(body));
        upstream.auth = AuthConfig::Bearer(self.api_key.clone());
        Ok(upstream)
    }

    async fn transform_response(
        &self,
        request: &Request,
        _status: u16,
        body: &Bytes,
    ) -> Result<Response, TransformError> {
        match request.request_type {
            Some(RequestType::Rerank) => {
                let wire: RerankResponse = serde_json::from_slice(body)
                    .map_err(|err| TransformError::MalformedUpstream(err.to_string()))?;
                Ok(Response {
                    model: wire.model.unwrap_or_else(|| request.model.clone()),
                    rerank: wire
                        .results
                        .into_iter()
                        .map(|result| RerankScore {
                            index: result.index,
                            relevance_score: result.relevance_score,
                            document: result.document.map(|doc| doc.text),
                        })
                        .collect(),
                    usage: wire.usage.map(|usage| Usage {
                        total_tokens: usage.total_tokens,
                        ..Default::default()
                    }),
                    request_type: request.request_type,
                    api_format: request.api_format,
                    ..Default::default()
                })
            }
            _ => decode_embeddings_response(request, body),
        }
    }

    fn stream_decoder(&self, _request: &Request) -> Box<dyn StreamDecoder> {
        Box::new(RefusingDecoder)
    }

    fn aggregate_stream(
        &self,
        _request: &Request,
        _events: &[SseEvent],
    ) -> Result<(Bytes, ResponseMeta), TransformError> {
        Err(TransformError::Unsupported("jina streaming"))
    }

    fn transform_error(&self, status: u16, body: &[u8]) -> ResponseError {
        parse_openai_error(status, body)
    }
}

pub(crate) struct RefusingDecoder;

impl StreamDecoder for RefusingDecoder {
    fn decode(&mut self, _event: &SseEvent) -> Result<Vec<Response>, TransformError> {
        Err(TransformError::Unsupported("streaming for this provider"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axonhub_model::{ApiFormat, EmbeddingParams, RerankParams};

    #[tokio::test]
    async fn embeddings_carry_the_task() {
        let outbound = JinaOutbound::new("https://api.jina.ai", "jina_key");
        let request = Request {
            model: "jina-embeddings-v3".to_string(),
            request_type: Some(RequestType::Embedding),
            api_format: Some(ApiFormat::JinaEmbeddings),
            embedding: Some(EmbeddingParams {
                input: serde_json::json!(["hello"]),
                task: Some("retrieval.query".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let upstream = outbound.transform_request(&request).await.unwrap();
        assert_eq!(upstream.url, "https://api.jina.ai/v1/embeddings");
        let body: serde_json::Value =
            serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["task"], "retrieval.query");
    }

    #[tokio::test]
    async fn streaming_is_refused() {
        let outbound = JinaOutbound::new("https://api.jina.ai", "jina_key");
        let request = Request {
            model: "jina-embeddings-v3".to_string(),
            stream: Some(true),
            ..Default::default()
        };
        assert!(outbound.transform_request(&request).await.is_err());
    }

    #[tokio::test]
    async fn rerank_round_trips() {
        let outbound = JinaOutbound::new("https://api.jina.ai/v1", "jina_key");
        let request = Request {
            model: "jina-reranker-v2".to_string(),
            request_type: Some(RequestType::Rerank),
            api_format: Some(ApiFormat::JinaRerank),
            rerank: Some(RerankParams {
                query: "rust".to_string(),
                documents: vec!["go".to_string(), "rust book".to_string()],
                top_n: Some(1),
                return_documents: Some(true),
            }),
            ..Default::default()
        };
        let upstream = outbound.transform_request(&request).await.unwrap();
        assert_eq!(upstream.url, "https://api.jina.ai/v1/rerank");

        let body = Bytes::from(
            serde_json::json!({
                "model": "jina-reranker-v2",
                "results": [{"index": 1, "relevance_score": 0.91, "document": {"text": "rust book"}}],
                "usage": {"total_tokens": 12}
            })
            .to_string(),
        );
        let neutral = outbound.transform_response(&request, 200, &body).await.unwrap();
        assert_eq!(neutral.rerank[0].index, 1);
        assert_eq!(neutral.rerank[0].document.as_deref(), Some("rust book"));
    }
}
