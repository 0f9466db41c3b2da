//! Bidirectional protocol transformers.
//!
//! An [`InboundTransformer`] owns one client-facing wire format: it decodes
//! raw HTTP into the neutral model, re-encodes neutral output (unary body or
//! SSE frames), and renders protocol-correct errors. An
//! [`OutboundTransformer`] owns one provider: it builds the upstream HTTP
//! request and maps the provider's unary body or SSE stream back into the
//! neutral model.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use axonhub_model::{
    ApiFormat, GatewayError, Headers, HttpExecutor, RawRequest, Request, Response, ResponseError,
    ResponseMeta, UpstreamRequest,
};
use axonhub_protocol::sse::SseEvent;

pub mod error;
pub mod inbound;
pub mod outbound;
pub mod schema;
mod util;

pub use error::TransformError;
pub use outbound::fallback::{EndpointFallbackExecutor, HealthStats, HealthTracker};

/// A fully rendered client-facing HTTP response.
#[derive(Debug, Clone)]
pub struct RenderedResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl RenderedResponse {
    pub fn json(status: u16, body: Bytes) -> Self {
        let mut headers = Vec::new();
        axonhub_model::header_set(&mut headers, "Content-Type", "application/json");
        axonhub_model::header_set(&mut headers, "Cache-Control", "no-cache");
        Self {
            status,
            headers,
            body,
        }
    }
}

/// Per-stream state machine turning neutral deltas into one wire format's
/// SSE frames. The end-of-stream sentinel ([`Response::done`]) arrives as a
/// regular delta; the encoder answers with its terminal frames.
pub trait StreamEncoder: Send {
    fn encode(&mut self, delta: &Response) -> Result<Vec<Bytes>, TransformError>;
}

/// Per-stream state machine turning one provider's SSE events into neutral
/// deltas. `finish` flushes whatever the provider left implicit when the
/// connection closed without a terminal event.
pub trait StreamDecoder: Send {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<Response>, TransformError>;

    fn finish(&mut self) -> Result<Vec<Response>, TransformError> {
        Ok(Vec::new())
    }
}

pub trait InboundTransformer: Send + Sync {
    fn api_format(&self) -> ApiFormat;

    fn transform_request(&self, raw: &RawRequest) -> Result<Request, TransformError>;

    fn transform_response(&self, response: &Response) -> Result<RenderedResponse, TransformError>;

    fn stream_encoder(&self, request: &Request) -> Box<dyn StreamEncoder>;

    /// Rebuild the canonical unary body from the SSE frames that were sent
    /// to the client, for logging/storage of streamed calls.
    fn aggregate_stream(
        &self,
        frames: &[SseEvent],
    ) -> Result<(Bytes, ResponseMeta), TransformError>;

    fn render_error(&self, error: &GatewayError) -> RenderedResponse;
}

#[async_trait]
pub trait OutboundTransformer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn transform_request(&self, request: &Request)
    -> Result<UpstreamRequest, TransformError>;

    async fn transform_response(
        &self,
        request: &Request,
        status: u16,
        body: &Bytes,
    ) -> Result<Response, TransformError>;

    fn stream_decoder(&self, request: &Request) -> Box<dyn StreamDecoder>;

    /// Rebuild the provider's canonical unary body from raw upstream SSE
    /// events, for logging/storage of streamed calls.
    fn aggregate_stream(
        &self,
        request: &Request,
        events: &[SseEvent],
    ) -> Result<(Bytes, ResponseMeta), TransformError>;

    fn transform_error(&self, status: u16, body: &[u8]) -> ResponseError;

    /// Providers with multiple interchangeable endpoints wrap the base
    /// executor here (endpoint fallback). Default: use the base as-is.
    fn customize_executor(&self, base: Arc<dyn HttpExecutor>) -> Option<Arc<dyn HttpExecutor>> {
        let _ = base;
        None
    }
}
