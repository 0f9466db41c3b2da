//! ZAI upstream: OpenAI-shaped chat under `/v4`, plus image generation
//! where returned URLs are downloaded and inlined as base64.

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;

use axonhub_model::{
    AuthConfig, ImageData, Request, RequestType, Response, ResponseError, ResponseMeta,
    UpstreamRequest,
};
use axonhub_protocol::sse::SseEvent;
use axonhub_protocol::zai::{ZaiImageRequest, ZaiImageResponse};

use super::http_fetch::fetch_client;
use super::openai::{
    ChatStreamDecoder, aggregate_chat_stream, build_chat_request, decode_chat_response,
};
use super::parse_openai_error;
use crate::util::build_url;
use crate::{OutboundTransformer, StreamDecoder, TransformError};

pub struct ZaiOutbound {
    base_url: String,
    api_key: String,
    /// Egress proxy for the image-download side channel, matching the
    /// gateway's upstream proxy.
    proxy: Option<String>,
}

impl ZaiOutbound {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            proxy: None,
        }
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }
}

#[async_trait]
impl OutboundTransformer for ZaiOutbound {
    fn name(&self) -> &'static str {
        "zai"
    }

    async fn transform_request(
        &self,
        request: &Request,
    ) -> Result<UpstreamRequest, TransformError> {
        let (path, body) = match request.request_type {
            Some(RequestType::Image) => {
                let params = request
                    .image
                    .as_ref()
                    .ok_or_else(|| TransformError::invalid("missing image prompt"))?;
                let body = ZaiImageRequest {
                    model: request.model.clone(),
                    prompt: params.prompt.clone(),
                    quality: match params.quality.as_deref() {
                        Some("hd") | Some("high") => "hd".to_string(),
                        _ => "standard".to_string(),
                    },
                    size: params.size.clone(),
                    watermark_enabled: false,
                    user_id: params.user.clone(),
                };
                ("v4/images/generations", serde_json::to_vec(&body)?)
            }
            _ => (
                "v4/chat/completions",
                serde_json::to_vec(&build_chat_request(request))?,
            ),
        };
        let mut upstream =
            UpstreamRequest::post_json(build_url(&self.base_url, path), Bytes::from(body));
        upstream.auth = AuthConfig::Bearer(self.api_key.clone());
        upstream.is_stream = request.is_stream();
        Ok(upstream)
    }

    async fn transform_response(
        &self,
        request: &Request,
        _status: u16,
        body: &Bytes,
    ) -> Result<Response, TransformError> {
        match request.request_type {
            Some(RequestType::Image) => {
                let wire: ZaiImageResponse = serde_json::from_slice(body)
                    .map_err(|err| TransformError::MalformedUpstream(err.to_string()))?;
                let client = fetch_client(self.proxy.as_deref())?;
                let mut images = Vec::with_capacity(wire.data.len());
                for image in wire.data {
                    images.push(download_image(&client, &image.url).await?);
                }
                Ok(Response {
                    created: wire.created.unwrap_or(0),
                    model: request.model.clone(),
                    images,
                    request_type: request.request_type,
                    api_format: request.api_format,
                    ..Default::default()
                })
            }
            _ => decode_chat_response(request, body),
        }
    }

    fn stream_decoder(&self, _request: &Request) -> Box<dyn StreamDecoder> {
        Box::new(ChatStreamDecoder)
    }

    fn aggregate_stream(
        &self,
        _request: &Request,
        events: &[SseEvent],
    ) -> Result<(Bytes, ResponseMeta), TransformError> {
        aggregate_chat_stream(events)
    }

    fn transform_error(&self, status: u16, body: &[u8]) -> ResponseError {
        parse_openai_error(status, body)
    }
}

async fn download_image(client: &wreq::Client, url: &str) -> Result<ImageData, TransformError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| TransformError::Other(format!("image download failed: {err}")))?;
    if !response.status().is_success() {
        return Err(TransformError::Other(format!(
            "image download failed: {}",
            response.status()
        )));
    }
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("image/png")
        .to_string();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| TransformError::Other(format!("image download failed: {err}")))?;
    Ok(ImageData {
        url: Some(url.to_string()),
        b64_json: Some(base64::engine::general_purpose::STANDARD.encode(&bytes)),
        content_type: Some(content_type),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axonhub_model::{ApiFormat, ImageParams, Message};

    #[tokio::test]
    async fn chat_path_lands_under_v4_exactly_once() {
        let outbound = ZaiOutbound::new("https://api.z.ai/api/paas/v4", "zk");
        let request = Request {
            model: "glm-4.6".to_string(),
            request_type: Some(RequestType::Chat),
            api_format: Some(ApiFormat::OpenAiChat),
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        let upstream = outbound.transform_request(&request).await.unwrap();
        assert_eq!(upstream.url, "https://api.z.ai/api/paas/v4/chat/completions");

        let outbound = ZaiOutbound::new("https://api.z.ai/api/paas", "zk");
        let upstream = outbound.transform_request(&request).await.unwrap();
        assert_eq!(upstream.url, "https://api.z.ai/api/paas/v4/chat/completions");
    }

    #[tokio::test]
    async fn image_request_disables_watermarks() {
        let outbound = ZaiOutbound::new("https://api.z.ai/api/paas/v4", "zk");
        let request = Request {
            model: "cogview-4".to_string(),
            request_type: Some(RequestType::Image),
            api_format: Some(ApiFormat::OpenAiImageGeneration),
            image: Some(ImageParams {
                prompt: "a fox".to_string(),
                quality: Some("hd".to_string()),
                size: Some("1024x1024".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let upstream = outbound.transform_request(&request).await.unwrap();
        assert_eq!(
            upstream.url,
            "https://api.z.ai/api/paas/v4/images/generations"
        );
        let body: ZaiImageRequest =
            serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
        assert_eq!(body.quality, "hd");
        assert!(!body.watermark_enabled);
    }
}
