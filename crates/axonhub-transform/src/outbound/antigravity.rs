//! Antigravity upstream: Gemini's wire format inside a `v1internal`
//! envelope, OAuth-only auth, and quota fallback across the Daily /
//! Autopush / Prod endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use axonhub_model::{
    AuthConfig, HttpExecutor, Request, Response, ResponseError, ResponseMeta, TokenGetter,
    UpstreamRequest, header_set,
};
use axonhub_protocol::gemini::generate::GenerateContentResponse;
use axonhub_protocol::sse::SseEvent;

use super::fallback::{EndpointFallbackExecutor, HealthTracker, MODEL_META_KEY};
use super::gemini::{
    GeminiStreamDecoder, aggregate_generate_stream, build_generate_request,
    neutral_from_generate, parse_gemini_error,
};
use crate::{OutboundTransformer, StreamDecoder, TransformError};

const ANTIGRAVITY_USER_AGENT: &str = "antigravity/1.15.8 windows/amd64";
const ANTIGRAVITY_API_CLIENT: &str = "google-cloud-sdk vscode_cloudshelleditor/0.1";
const ANTIGRAVITY_CLIENT_METADATA: &str =
    r#"{"ideType":"ANTIGRAVITY","platform":"PLATFORM_UNSPECIFIED","pluginType":"GEMINI"}"#;
const ANTIGRAVITY_SYSTEM_TEXT: &str = "You are Antigravity, an agentic coding assistant \
operating inside the user's IDE. Follow the user's instructions precisely and prefer \
taking action over asking questions.";
const TOOL_HARDENING_TEXT: &str = "Only call functions that are declared in the tool list, \
and always pass arguments that conform to the declared schema.";

pub struct AntigravityOutbound {
    base_url: String,
    project_id: String,
    token_getter: Arc<dyn TokenGetter>,
    endpoints: Vec<String>,
    tracker: Arc<HealthTracker>,
}

impl AntigravityOutbound {
    pub fn new(
        base_url: impl Into<String>,
        project_id: impl Into<String>,
        token_getter: Arc<dyn TokenGetter>,
        endpoints: Vec<String>,
        tracker: Arc<HealthTracker>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            project_id: project_id.into(),
            token_getter,
            endpoints,
            tracker,
        }
    }
}

#[async_trait]
impl OutboundTransformer for AntigravityOutbound {
    fn name(&self) -> &'static str {
        "antigravity"
    }

    async fn transform_request(
        &self,
        request: &Request,
    ) -> Result<UpstreamRequest, TransformError> {
        let mut inner = build_generate_request(request)?;

        if inner.tools.is_some() {
            let config = inner
                .tool_config
                .get_or_insert_with(Default::default)
                .function_calling_config
                .get_or_insert_with(Default::default);
            config.mode = Some("VALIDATED".to_string());
        }

        // System instruction gains the fixed prelude (and tool hardening)
        // and is always sent with the user role.
        let mut system = inner.system_instruction.take().unwrap_or_default();
        if inner.tools.is_some() {
            system.parts.insert(
                0,
                axonhub_protocol::gemini::generate::Part::text(TOOL_HARDENING_TEXT),
            );
        }
        system.parts.insert(
            0,
            axonhub_protocol::gemini::generate::Part::text(ANTIGRAVITY_SYSTEM_TEXT),
        );
        system.role = Some("user".to_string());
        inner.system_instruction = Some(system);

        let model = normalize_model(&request.model);
        if model.starts_with("claude") {
            for content in &mut inner.contents {
                if content.role.as_deref() == Some("model") {
                    content.parts.retain(|part| !part.thought.unwrap_or(false));
                }
            }
        }

        let envelope = serde_json::json!({
            "project": self.project_id,
            "model": model,
            "request": inner,
            "requestType": "agent",
            "userAgent": "antigravity",
            "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
        });

        let action = if request.is_stream() {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let url = format!(
            "{}/v1internal:{action}",
            self.base_url.trim_end_matches('/')
        );
        let mut upstream =
            UpstreamRequest::post_json(url, Bytes::from(serde_json::to_vec(&envelope)?));
        // OAuth only: a Google API key alongside the bearer token trips
        // upstream license validation.
        let tokens = self.token_getter.get().await?;
        upstream.auth = AuthConfig::Bearer(tokens.access_token);
        header_set(&mut upstream.headers, "User-Agent", ANTIGRAVITY_USER_AGENT);
        header_set(&mut upstream.headers, "X-Goog-Api-Client", ANTIGRAVITY_API_CLIENT);
        header_set(&mut upstream.headers, "Client-Metadata", ANTIGRAVITY_CLIENT_METADATA);
        upstream.is_stream = request.is_stream();
        upstream.set_meta(MODEL_META_KEY, model);
        Ok(upstream)
    }

    async fn transform_response(
        &self,
        request: &Request,
        _status: u16,
        body: &Bytes,
    ) -> Result<Response, TransformError> {
        let wire = unwrap_envelope(body)?;
        Ok(neutral_from_generate(request, wire))
    }

    fn stream_decoder(&self, _request: &Request) -> Box<dyn StreamDecoder> {
        Box::new(AntigravityStreamDecoder::default())
    }

    fn aggregate_stream(
        &self,
        _request: &Request,
        events: &[SseEvent],
    ) -> Result<(Bytes, ResponseMeta), TransformError> {
        let unwrapped: Vec<SseEvent> = events
            .iter()
            .map(|event| SseEvent {
                event: event.event.clone(),
                data: unwrap_event_data(&event.data),
            })
            .collect();
        aggregate_generate_stream(&unwrapped)
    }

    fn transform_error(&self, status: u16, body: &[u8]) -> ResponseError {
        parse_gemini_error(status, body)
    }

    fn customize_executor(&self, base: Arc<dyn HttpExecutor>) -> Option<Arc<dyn HttpExecutor>> {
        Some(Arc::new(EndpointFallbackExecutor::new(
            self.endpoints.clone(),
            self.tracker.clone(),
            base,
        )))
    }
}

fn normalize_model(model: &str) -> String {
    let model = model.strip_prefix("models/").unwrap_or(model);
    if model.starts_with("gemini-3-pro") && !has_tier_suffix(model) {
        return format!("{model}-low");
    }
    model.to_string()
}

fn has_tier_suffix(model: &str) -> bool {
    ["-low", "-medium", "-high"]
        .iter()
        .any(|suffix| model.ends_with(suffix))
}

fn unwrap_envelope(body: &[u8]) -> Result<GenerateContentResponse, TransformError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| TransformError::MalformedUpstream(err.to_string()))?;
    let inner = value.get("response").cloned().unwrap_or(value);
    serde_json::from_value(inner).map_err(|err| TransformError::MalformedUpstream(err.to_string()))
}

fn unwrap_event_data(data: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return data.to_string();
    };
    match value.get("response") {
        Some(inner) => inner.to_string(),
        None => data.to_string(),
    }
}

/// Unwraps each `{response: …}` event before the Gemini decoding.
#[derive(Default)]
struct AntigravityStreamDecoder {
    inner: GeminiStreamDecoder,
}

impl StreamDecoder for AntigravityStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<Response>, TransformError> {
        if event.data.trim().is_empty() || event.is_done() {
            return Ok(Vec::new());
        }
        let Ok(chunk) =
            serde_json::from_str::<GenerateContentResponse>(&unwrap_event_data(&event.data))
        else {
            return Ok(Vec::new());
        };
        Ok(self.inner.push_chunk(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axonhub_model::{
        ApiFormat, AuthError, FunctionDef, Message, OAuthTokens, RequestType, Tool,
    };

    struct FixedTokens;

    #[async_trait]
    impl TokenGetter for FixedTokens {
        async fn get(&self) -> Result<OAuthTokens, AuthError> {
            Ok(OAuthTokens {
                access_token: "ya29.test".to_string(),
                ..Default::default()
            })
        }
    }

    fn outbound() -> AntigravityOutbound {
        AntigravityOutbound::new(
            "https://daily-cloudcode-pa.sandbox.googleapis.com",
            "project-1",
            Arc::new(FixedTokens),
            vec![
                "https://daily-cloudcode-pa.sandbox.googleapis.com".to_string(),
                "https://autopush-cloudcode-pa.sandbox.googleapis.com".to_string(),
                "https://cloudcode-pa.googleapis.com".to_string(),
            ],
            Arc::new(HealthTracker::default()),
        )
    }

    fn request_with_tool() -> Request {
        Request {
            model: "gemini-3-pro".to_string(),
            request_type: Some(RequestType::Chat),
            api_format: Some(ApiFormat::OpenAiChat),
            messages: vec![Message::user("hi")],
            tools: vec![Tool::function(FunctionDef {
                name: "t".to_string(),
                description: None,
                parameters: Some(serde_json::json!({"type": "object"})),
            })],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn wraps_the_gemini_body_in_the_agent_envelope() {
        let upstream = outbound().transform_request(&request_with_tool()).await.unwrap();
        assert_eq!(
            upstream.url,
            "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal:generateContent"
        );
        assert_eq!(upstream.auth, AuthConfig::Bearer("ya29.test".to_string()));
        assert!(
            axonhub_model::header_get(&upstream.headers, "x-goog-api-key").is_none(),
            "api key must never ride along with oauth"
        );
        let body: Value = serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["project"], "project-1");
        assert_eq!(body["requestType"], "agent");
        assert_eq!(body["userAgent"], "antigravity");
        assert!(body["requestId"].as_str().unwrap().starts_with("agent-"));
        // Tier suffix is appended for gemini-3-pro without one.
        assert_eq!(body["model"], "gemini-3-pro-low");
        assert_eq!(upstream.meta_get(MODEL_META_KEY), Some("gemini-3-pro-low"));
    }

    #[tokio::test]
    async fn tool_schema_is_validated_and_uppercased() {
        let upstream = outbound().transform_request(&request_with_tool()).await.unwrap();
        let body: Value = serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
        let request = &body["request"];
        assert_eq!(
            request["toolConfig"]["functionCallingConfig"]["mode"],
            "VALIDATED"
        );
        let parameters = &request["tools"][0]["functionDeclarations"][0]["parameters"];
        assert_eq!(parameters["type"], "OBJECT");
        assert!(
            !body.to_string().contains("parametersJsonSchema"),
            "legacy schema key must not appear"
        );
        let system = &request["systemInstruction"];
        assert_eq!(system["role"], "user");
        let first = system["parts"][0]["text"].as_str().unwrap();
        assert!(first.starts_with("You are Antigravity"));
    }

    #[tokio::test]
    async fn claude_models_lose_assistant_thinking_parts() {
        let mut request = request_with_tool();
        request.model = "claude-sonnet-4-5".to_string();
        request.messages = vec![
            Message::user("hi"),
            Message {
                role: Some(axonhub_model::Role::Assistant),
                content: Some(axonhub_model::Content::text("answer")),
                reasoning_content: Some("secret thinking".to_string()),
                ..Default::default()
            },
        ];
        let upstream = outbound().transform_request(&request).await.unwrap();
        let body: Value = serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
        assert!(!body["request"]["contents"].to_string().contains("secret thinking"));
    }

    #[tokio::test]
    async fn responses_and_streams_unwrap_the_envelope() {
        let request = request_with_tool();
        let body = Bytes::from(
            serde_json::json!({"response": {
                "candidates": [{"content": {"role": "model", "parts": [{"text": "Hello"}]},
                    "finishReason": "STOP"}]
            }})
            .to_string(),
        );
        let neutral = outbound().transform_response(&request, 200, &body).await.unwrap();
        assert_eq!(
            neutral
                .first_message()
                .unwrap()
                .content
                .as_ref()
                .map(axonhub_model::Content::joined_text)
                .unwrap(),
            "Hello"
        );

        let mut decoder = outbound().stream_decoder(&request);
        let deltas = decoder
            .decode(&SseEvent::data(
                serde_json::json!({"response": {
                    "candidates": [{"content": {"role": "model", "parts": [{"text": "He"}]}}]
                }})
                .to_string(),
            ))
            .unwrap();
        assert_eq!(deltas[0].first_delta().unwrap().content.as_deref(), Some("He"));
    }

    #[test]
    fn customize_executor_installs_fallback() {
        struct NoopExecutor;
        #[async_trait]
        impl HttpExecutor for NoopExecutor {
            async fn execute(
                &self,
                _request: UpstreamRequest,
            ) -> Result<axonhub_model::UpstreamResponse, axonhub_model::UpstreamFailure>
            {
                unreachable!("not called in this test")
            }
        }
        assert!(outbound().customize_executor(Arc::new(NoopExecutor)).is_some());
    }
}
