//! The pipeline executor: drives one client request end-to-end through
//! inbound decode, channel resolution, outbound encode, upstream I/O and
//! the streaming re-encode path.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use axonhub_common::new_trace_id;
use axonhub_model::{
    ApiFormat, Choice, Delta, GatewayError, HttpExecutor, RawRequest, Request, Response,
    TokenGetter, UpstreamBody, UpstreamFailure, UpstreamRequest, meta_keys,
};
use axonhub_protocol::sse::encode_sse;
use axonhub_transform::inbound::inbound_for;
use axonhub_transform::{InboundTransformer, OutboundTransformer, RenderedResponse};

use crate::channel::{AntigravityRouting, Channel, ChannelStore, outbound_for_channel};
use crate::oauth::{OAuthTokenProvider, RefreshTokenExchange};
use crate::stream::SseEventStream;

/// Frames queued toward a slow client before the producer blocks.
const STREAM_BUFFER: usize = 16;

pub enum PipelineOutcome {
    Unary(RenderedResponse),
    Stream {
        content_type: &'static str,
        frames: mpsc::Receiver<Bytes>,
    },
}

pub struct Pipeline {
    channels: Arc<ChannelStore>,
    base_executor: Arc<dyn HttpExecutor>,
    antigravity: AntigravityRouting,
    outbound_proxy: Option<String>,
    token_providers: tokio::sync::Mutex<HashMap<i64, Arc<OAuthTokenProvider>>>,
}

impl Pipeline {
    pub fn new(channels: Arc<ChannelStore>, base_executor: Arc<dyn HttpExecutor>) -> Self {
        Self {
            channels,
            base_executor,
            antigravity: AntigravityRouting::default(),
            outbound_proxy: None,
            token_providers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Egress proxy shared with providers that fetch outside the executor
    /// path (ZAI image downloads).
    pub fn with_outbound_proxy(mut self, proxy: Option<String>) -> Self {
        self.outbound_proxy = proxy;
        self
    }

    pub async fn handle(&self, format: ApiFormat, raw: RawRequest) -> PipelineOutcome {
        let inbound = inbound_for(format);
        let trace_id = new_trace_id();

        let mut request = match inbound.transform_request(&raw) {
            Ok(request) => request,
            Err(err) => {
                let err = GatewayError::from(err);
                debug!(%trace_id, error = %err, "inbound decode failed");
                return PipelineOutcome::Unary(inbound.render_error(&err));
            }
        };

        let Some(channel) = self.channels.resolve_model(&request.model).await else {
            let err = GatewayError::InvalidModel(request.model.clone());
            debug!(%trace_id, model = %request.model, "no channel for model");
            return PipelineOutcome::Unary(inbound.render_error(&err));
        };
        debug!(
            %trace_id,
            channel = channel.id,
            provider = ?channel.r#type,
            model = %request.model,
            stream = request.is_stream(),
            "dispatching"
        );

        let requested_model = request.model.clone();
        request.model = channel.upstream_model(&requested_model);
        request.set_meta(meta_keys::MODEL, requested_model);
        request.transform_options.pass_client_headers = channel.is_official;

        let token_getter: Option<Arc<dyn TokenGetter>> = if channel.r#type.uses_oauth() {
            match self.token_provider(&channel).await {
                Some(provider) => Some(provider),
                None => {
                    let err = GatewayError::Internal(format!(
                        "channel {} has no oauth credential",
                        channel.id
                    ));
                    return PipelineOutcome::Unary(inbound.render_error(&err));
                }
            }
        } else {
            None
        };
        let outbound = match outbound_for_channel(
            &channel,
            token_getter,
            &self.antigravity,
            self.outbound_proxy.as_deref(),
        ) {
            Ok(outbound) => outbound,
            Err(err) => {
                let err = GatewayError::Internal(err.to_string());
                return PipelineOutcome::Unary(inbound.render_error(&err));
            }
        };

        let upstream_request = match outbound.transform_request(&request).await {
            Ok(upstream) => upstream,
            Err(err) => {
                let err = GatewayError::from(err);
                debug!(%trace_id, error = %err, "outbound encode failed");
                return PipelineOutcome::Unary(inbound.render_error(&err));
            }
        };
        let executor = outbound
            .customize_executor(self.base_executor.clone())
            .unwrap_or_else(|| self.base_executor.clone());

        if request.is_stream() {
            self.run_stream(trace_id, inbound, outbound, request, upstream_request, executor)
                .await
        } else {
            self.run_unary(trace_id, inbound, outbound, request, upstream_request, executor)
                .await
        }
    }

    /// One token provider per channel, shared so refreshes are
    /// single-flighted across concurrent requests.
    async fn token_provider(&self, channel: &Channel) -> Option<Arc<OAuthTokenProvider>> {
        let mut providers = self.token_providers.lock().await;
        if let Some(provider) = providers.get(&channel.id) {
            return Some(provider.clone());
        }
        let tokens = channel.oauth_tokens()?.clone();
        let strategy = match channel.r#type {
            crate::channel::Provider::Antigravity => RefreshTokenExchange::antigravity(),
            _ => RefreshTokenExchange::claude_code(),
        };
        let channel_id = channel.id;
        let provider = Arc::new(
            OAuthTokenProvider::new(tokens, Box::new(strategy)).with_refresh_hook(Box::new(
                move |fresh| {
                    // Persistence is owned by the admin layer; surface the
                    // rotation so operators can reconcile stored state.
                    debug!(channel = channel_id, expires_at = fresh.expires_at, "oauth tokens rotated");
                },
            )),
        );
        providers.insert(channel.id, provider.clone());
        Some(provider)
    }

    async fn run_unary(
        &self,
        trace_id: String,
        inbound: Box<dyn InboundTransformer>,
        outbound: Box<dyn OutboundTransformer>,
        request: Request,
        upstream_request: UpstreamRequest,
        executor: Arc<dyn HttpExecutor>,
    ) -> PipelineOutcome {
        let response = match executor.execute(upstream_request).await {
            Ok(response) => response,
            Err(failure) => {
                let err = upstream_error(&*outbound, failure);
                debug!(%trace_id, error = %err, "upstream call failed");
                return PipelineOutcome::Unary(inbound.render_error(&err));
            }
        };
        let UpstreamBody::Bytes(body) = response.body else {
            let err = GatewayError::Internal("unexpected streaming body".to_string());
            return PipelineOutcome::Unary(inbound.render_error(&err));
        };
        let neutral = match outbound.transform_response(&request, response.status, &body).await {
            Ok(neutral) => neutral,
            Err(err) => {
                let err = GatewayError::from(err);
                warn!(%trace_id, error = %err, "upstream body did not decode");
                return PipelineOutcome::Unary(inbound.render_error(&err));
            }
        };
        if let Some(usage) = neutral.usage.as_ref() {
            debug!(
                %trace_id,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "request complete"
            );
        }
        match inbound.transform_response(&neutral) {
            Ok(rendered) => PipelineOutcome::Unary(rendered),
            Err(err) => PipelineOutcome::Unary(inbound.render_error(&GatewayError::from(err))),
        }
    }

    async fn run_stream(
        &self,
        trace_id: String,
        inbound: Box<dyn InboundTransformer>,
        outbound: Box<dyn OutboundTransformer>,
        request: Request,
        upstream_request: UpstreamRequest,
        executor: Arc<dyn HttpExecutor>,
    ) -> PipelineOutcome {
        let format = inbound.api_format();
        let response = match executor.execute(upstream_request).await {
            Ok(response) => response,
            Err(failure) => {
                let err = upstream_error(&*outbound, failure);
                debug!(%trace_id, error = %err, "upstream call failed");
                return PipelineOutcome::Unary(inbound.render_error(&err));
            }
        };

        let (tx, frames) = mpsc::channel::<Bytes>(STREAM_BUFFER);
        match response.body {
            UpstreamBody::Stream(rx) => {
                tokio::spawn(stream_worker(
                    trace_id, inbound, outbound, request, rx, tx, format,
                ));
            }
            UpstreamBody::Bytes(body) => {
                // Upstream answered unary even though a stream was asked
                // for; replay it through the encoder as one delta.
                tokio::spawn(replay_unary(
                    trace_id, inbound, outbound, request, body, tx, format,
                ));
            }
        }
        PipelineOutcome::Stream {
            content_type: "text/event-stream",
            frames,
        }
    }
}

fn upstream_error(outbound: &dyn OutboundTransformer, failure: UpstreamFailure) -> GatewayError {
    match failure {
        UpstreamFailure::Http { status, body, .. } => {
            GatewayError::Upstream(outbound.transform_error(status, &body))
        }
        UpstreamFailure::Transport { message, .. } => GatewayError::Transport(message),
    }
}

/// A protocol-appropriate terminal `error` SSE frame.
fn error_frame(format: ApiFormat, err: &GatewayError) -> Bytes {
    match format {
        ApiFormat::Claude => {
            let payload = serde_json::json!({
                "type": "error",
                "error": {"type": err.type_label(), "message": err.message()},
            });
            encode_sse(Some("error"), &payload.to_string())
        }
        ApiFormat::OpenAiResponses => {
            let payload = serde_json::json!({
                "type": "error",
                "code": err.type_label(),
                "message": err.message(),
            });
            encode_sse(Some("error"), &payload.to_string())
        }
        _ => {
            let payload = serde_json::json!({
                "error": {"message": err.message(), "type": err.type_label()},
            });
            encode_sse(None, &payload.to_string())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn stream_worker(
    trace_id: String,
    inbound: Box<dyn InboundTransformer>,
    outbound: Box<dyn OutboundTransformer>,
    request: Request,
    rx: mpsc::Receiver<Bytes>,
    tx: mpsc::Sender<Bytes>,
    format: ApiFormat,
) {
    let mut events = SseEventStream::new(rx);
    let mut decoder = outbound.stream_decoder(&request);
    let mut encoder = inbound.stream_encoder(&request);
    let mut raw_events = Vec::new();

    while let Some(event) = events.next().await {
        raw_events.push(event.clone());
        let deltas = match decoder.decode(&event) {
            Ok(deltas) => deltas,
            Err(err) => {
                let err = GatewayError::from(err);
                warn!(%trace_id, error = %err, "stream decode failed");
                let _ = tx.send(error_frame(format, &err)).await;
                return;
            }
        };
        if !forward_deltas(&deltas, &mut *encoder, &tx, format, &trace_id).await {
            return;
        }
    }

    if let Ok(deltas) = decoder.finish()
        && !forward_deltas(&deltas, &mut *encoder, &tx, format, &trace_id).await
    {
        return;
    }
    // Terminal events, exactly once, always last.
    let _ = forward_deltas(
        &[Response::done()],
        &mut *encoder,
        &tx,
        format,
        &trace_id,
    )
    .await;

    match outbound.aggregate_stream(&request, &raw_events) {
        Ok((_, meta)) => {
            debug!(
                %trace_id,
                response_id = %meta.id,
                usage = ?meta.usage,
                chunks = raw_events.len(),
                "stream complete"
            );
        }
        Err(err) => debug!(%trace_id, error = %err, "stream aggregation failed"),
    }
}

async fn forward_deltas(
    deltas: &[Response],
    encoder: &mut dyn axonhub_transform::StreamEncoder,
    tx: &mpsc::Sender<Bytes>,
    format: ApiFormat,
    trace_id: &str,
) -> bool {
    for delta in deltas {
        let frames = match encoder.encode(delta) {
            Ok(frames) => frames,
            Err(err) => {
                let err = GatewayError::from(err);
                warn!(%trace_id, error = %err, "stream encode failed");
                let _ = tx.send(error_frame(format, &err)).await;
                return false;
            }
        };
        for frame in frames {
            if tx.send(frame).await.is_err() {
                // Client went away; dropping the upstream stream cancels it.
                return false;
            }
        }
    }
    true
}

#[allow(clippy::too_many_arguments)]
async fn replay_unary(
    trace_id: String,
    inbound: Box<dyn InboundTransformer>,
    outbound: Box<dyn OutboundTransformer>,
    request: Request,
    body: Bytes,
    tx: mpsc::Sender<Bytes>,
    format: ApiFormat,
) {
    let mut encoder = inbound.stream_encoder(&request);
    let neutral = match outbound.transform_response(&request, 200, &body).await {
        Ok(neutral) => neutral,
        Err(err) => {
            let err = GatewayError::from(err);
            warn!(%trace_id, error = %err, "unary replay decode failed");
            let _ = tx.send(error_frame(format, &err)).await;
            return;
        }
    };
    let delta = unary_as_delta(&neutral);
    let _ = forward_deltas(
        &[delta, Response::done()],
        &mut *encoder,
        &tx,
        format,
        &trace_id,
    )
    .await;
}

fn unary_as_delta(neutral: &Response) -> Response {
    let mut delta = neutral.clone();
    delta.choices = neutral
        .choices
        .iter()
        .map(|choice| {
            let message = choice.message.clone().unwrap_or_default();
            Choice {
                index: choice.index,
                message: None,
                delta: Some(Delta {
                    role: Some("assistant".to_string()),
                    content: message
                        .content
                        .as_ref()
                        .map(axonhub_model::Content::joined_text),
                    reasoning_content: message.reasoning_content.clone(),
                    reasoning_signature: message.reasoning_signature.clone(),
                    tool_calls: message
                        .tool_calls
                        .iter()
                        .enumerate()
                        .map(|(index, call)| axonhub_model::ToolCallDelta {
                            index: index as u32,
                            id: Some(call.id.clone()),
                            name: Some(call.function.name.clone()),
                            arguments: Some(call.function.arguments.clone()),
                        })
                        .collect(),
                    image_b64: None,
                }),
                finish_reason: choice.finish_reason,
            }
        })
        .collect();
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axonhub_model::{Headers, UpstreamResponse};
    use std::time::Duration;

    use crate::cache::CacheError;
    use crate::cache::IndexedLoader;
    use crate::channel::{Channel, ChannelCredential, Provider};

    struct StaticChannels(Vec<Channel>);

    #[async_trait]
    impl IndexedLoader<i64, Channel> for StaticChannels {
        async fn load_one(&self, key: &i64) -> Result<Option<Channel>, CacheError> {
            Ok(self.0.iter().find(|channel| channel.id == *key).cloned())
        }

        async fn load_since(&self, _watermark: i64) -> Result<(Vec<Channel>, i64), CacheError> {
            Ok((self.0.clone(), 1))
        }
    }

    struct ScriptedUpstream {
        status: u16,
        body: &'static str,
        stream: bool,
    }

    #[async_trait]
    impl HttpExecutor for ScriptedUpstream {
        async fn execute(
            &self,
            request: UpstreamRequest,
        ) -> Result<UpstreamResponse, UpstreamFailure> {
            if self.status >= 400 {
                return Err(UpstreamFailure::Http {
                    status: self.status,
                    headers: Headers::new(),
                    body: Bytes::from_static(self.body.as_bytes()),
                    method: "POST".to_string(),
                    url: request.url,
                });
            }
            if self.stream {
                let (tx, rx) = mpsc::channel(4);
                let body = self.body;
                tokio::spawn(async move {
                    for line in body.split('|') {
                        if tx.send(Bytes::from(format!("data: {line}\n\n"))).await.is_err() {
                            return;
                        }
                    }
                });
                return Ok(UpstreamResponse {
                    status: 200,
                    headers: Headers::new(),
                    body: UpstreamBody::Stream(rx),
                });
            }
            Ok(UpstreamResponse {
                status: self.status,
                headers: Headers::new(),
                body: UpstreamBody::Bytes(Bytes::from_static(self.body.as_bytes())),
            })
        }
    }

    fn openai_channel() -> Channel {
        Channel {
            id: 1,
            name: "primary".to_string(),
            r#type: Provider::OpenAi,
            base_url: "https://api.openai.com".to_string(),
            credential: ChannelCredential::ApiKey {
                key: "sk-test".to_string(),
            },
            models: vec!["gpt-4o".to_string()],
            model_mapping: Default::default(),
            project_id: None,
            is_official: false,
            updated_at: 1,
            deleted: false,
        }
    }

    async fn pipeline_with(upstream: ScriptedUpstream) -> Pipeline {
        let store = Arc::new(ChannelStore::new(
            Arc::new(StaticChannels(vec![openai_channel()])),
            Duration::from_secs(3600),
        ));
        store.warm_up().await;
        Pipeline::new(store, Arc::new(upstream))
    }

    fn chat_raw(body: serde_json::Value) -> RawRequest {
        RawRequest {
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unknown_model_renders_422() {
        let pipeline = pipeline_with(ScriptedUpstream {
            status: 200,
            body: "{}",
            stream: false,
        })
        .await;
        let outcome = pipeline
            .handle(
                ApiFormat::OpenAiChat,
                chat_raw(serde_json::json!({"model": "missing", "messages": []})),
            )
            .await;
        let PipelineOutcome::Unary(rendered) = outcome else {
            panic!("expected unary outcome");
        };
        assert_eq!(rendered.status, 422);
        let body: serde_json::Value = serde_json::from_slice(&rendered.body).unwrap();
        assert_eq!(body["error"]["type"], "invalid_model_error");
    }

    #[tokio::test]
    async fn unary_round_trip_through_openai() {
        let pipeline = pipeline_with(ScriptedUpstream {
            status: 200,
            body: r#"{"id":"chatcmpl-1","object":"chat.completion","created":3,"model":"gpt-4o",
                "choices":[{"index":0,"message":{"role":"assistant","content":"hey"},"finish_reason":"stop"}],
                "usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}"#,
            stream: false,
        })
        .await;
        let outcome = pipeline
            .handle(
                ApiFormat::OpenAiChat,
                chat_raw(serde_json::json!({
                    "model": "gpt-4o",
                    "messages": [{"role": "user", "content": "hi"}]
                })),
            )
            .await;
        let PipelineOutcome::Unary(rendered) = outcome else {
            panic!("expected unary outcome");
        };
        assert_eq!(rendered.status, 200);
        let body: serde_json::Value = serde_json::from_slice(&rendered.body).unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "hey");
    }

    #[tokio::test]
    async fn upstream_error_status_is_preserved() {
        let pipeline = pipeline_with(ScriptedUpstream {
            status: 429,
            body: r#"{"error":{"message":"slow down","type":"rate_limit_error"}}"#,
            stream: false,
        })
        .await;
        let outcome = pipeline
            .handle(
                ApiFormat::OpenAiChat,
                chat_raw(serde_json::json!({
                    "model": "gpt-4o",
                    "messages": [{"role": "user", "content": "hi"}]
                })),
            )
            .await;
        let PipelineOutcome::Unary(rendered) = outcome else {
            panic!("expected unary outcome");
        };
        assert_eq!(rendered.status, 429);
        let body: serde_json::Value = serde_json::from_slice(&rendered.body).unwrap();
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(body["error"]["message"], "slow down");
    }

    #[tokio::test]
    async fn streamed_chat_ends_with_done() {
        let chunk1 = serde_json::json!({
            "id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": "He"}, "finish_reason": null}]
        });
        let chunk2 = serde_json::json!({
            "id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"content": "y"}, "finish_reason": "stop"}]
        });
        let script = format!("{chunk1}|{chunk2}|[DONE]");
        let pipeline = pipeline_with(ScriptedUpstream {
            status: 200,
            body: Box::leak(script.into_boxed_str()),
            stream: true,
        })
        .await;
        let outcome = pipeline
            .handle(
                ApiFormat::OpenAiChat,
                chat_raw(serde_json::json!({
                    "model": "gpt-4o", "stream": true,
                    "messages": [{"role": "user", "content": "hi"}]
                })),
            )
            .await;
        let PipelineOutcome::Stream { mut frames, content_type } = outcome else {
            panic!("expected stream outcome");
        };
        assert_eq!(content_type, "text/event-stream");
        let mut collected = String::new();
        while let Some(frame) = frames.recv().await {
            collected.push_str(std::str::from_utf8(&frame).unwrap());
        }
        assert!(collected.contains("\"content\":\"He\""));
        assert!(collected.contains("\"content\":\"y\""));
        assert!(collected.trim_end().ends_with("data: [DONE]"));
    }
}
