//! OpenAI image generation as a client-facing format. Unary only.

use bytes::Bytes;

use axonhub_model::{
    ApiFormat, GatewayError, ImageParams, RawRequest, Request, RequestType, Response, ResponseMeta,
    meta_keys,
};
use axonhub_protocol::openai::images::{
    ImageGenerationRequest, ImageGenerationResponse, ImageObject,
};
use axonhub_protocol::sse::SseEvent;

use super::embeddings::RefusingEncoder;
use super::{openai_chat::render_openai_error, parse_body};
use crate::util::now_unix;
use crate::{InboundTransformer, RenderedResponse, StreamEncoder, TransformError};

pub struct ImagesInbound;

impl InboundTransformer for ImagesInbound {
    fn api_format(&self) -> ApiFormat {
        ApiFormat::OpenAiImageGeneration
    }

    fn transform_request(&self, raw: &RawRequest) -> Result<Request, TransformError> {
        let wire: ImageGenerationRequest = parse_body(&raw.body)?;
        let model = wire.model.unwrap_or_default();
        if model.is_empty() {
            return Err(TransformError::invalid("model is required"));
        }
        if wire.prompt.is_empty() {
            return Err(TransformError::invalid("prompt is required"));
        }
        let mut request = Request {
            model,
            request_type: Some(RequestType::Image),
            api_format: Some(ApiFormat::OpenAiImageGeneration),
            stream: Some(false),
            image: Some(ImageParams {
                prompt: wire.prompt,
                n: wire.n,
                size: wire.size,
                quality: wire.quality,
                response_format: wire.response_format,
                user: wire.user,
            }),
            raw_request: Some(raw.clone()),
            ..Default::default()
        };
        if let Some(format) = wire.output_format {
            request.set_meta(meta_keys::IMAGE_OUTPUT_FORMAT, format);
        }
        Ok(request)
    }

    fn transform_response(&self, response: &Response) -> Result<RenderedResponse, TransformError> {
        let wire = ImageGenerationResponse {
            created: if response.created > 0 {
                response.created
            } else {
                now_unix()
            },
            data: response
                .images
                .iter()
                .map(|image| ImageObject {
                    url: image.url.clone(),
                    b64_json: image.b64_json.clone(),
                    revised_prompt: image.revised_prompt.clone(),
                })
                .collect(),
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
        Err(TransformError::Unsupported("image generation streaming"))
    }

    fn render_error(&self, error: &GatewayError) -> RenderedResponse {
        render_openai_error(error)
    }
}
