//! Claude-Code upstream: the Anthropic wire dressed up as the official CLI,
//! OAuth-only, with defensive tool-name prefixing for non-CLI clients.
//!
//! One instance serves one request: the prefixing decision made while
//! building the upstream request is reused by the response/stream paths.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;

use axonhub_model::{
    AuthConfig, Request, Response, ResponseError, ResponseMeta, TokenGetter, UpstreamRequest,
    header_remove, header_set,
};
use axonhub_protocol::claude::messages::{
    CacheControl, ContentBlock, CreateMessageRequest, CreateMessageResponse, SystemBlock,
    SystemPrompt, ToolChoiceParam,
};
use axonhub_protocol::claude::stream::MessageStreamEvent;
use axonhub_protocol::sse::SseEvent;

use super::claude::{
    ClaudeStreamDecoder, build_messages_request, neutral_from_message, parse_claude_error,
};
use crate::inbound::claude::{EventAggregate, decode_usage};
use crate::util::build_url;
use crate::{OutboundTransformer, StreamDecoder, TransformError};

const CLAUDE_CODE_SYSTEM_PRELUDE: &str =
    "You are Claude Code, Anthropic's official CLI for Claude.";
const CLAUDE_CLI_USER_AGENT: &str = "claude-cli/1.0.83 (external, cli)";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_BETA: &str =
    "oauth-2025-04-20,claude-code-20250219,interleaved-thinking-2025-05-14,fine-grained-tool-streaming-2025-05-14";
const TOOL_PREFIX: &str = "proxy_";
const OAUTH_TOKEN_PREFIX: &str = "sk-ant-oat";

pub struct ClaudeCodeOutbound {
    base_url: String,
    token_getter: Arc<dyn TokenGetter>,
    prefix_tools: AtomicBool,
}

impl ClaudeCodeOutbound {
    pub fn new(base_url: impl Into<String>, token_getter: Arc<dyn TokenGetter>) -> Self {
        Self {
            base_url: base_url.into(),
            token_getter,
            prefix_tools: AtomicBool::new(false),
        }
    }

    fn strips(&self) -> bool {
        self.prefix_tools.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl OutboundTransformer for ClaudeCodeOutbound {
    fn name(&self) -> &'static str {
        "claudecode"
    }

    async fn transform_request(
        &self,
        request: &Request,
    ) -> Result<UpstreamRequest, TransformError> {
        let mut body = build_messages_request(request)?;
        inject_system_prelude(&mut body);
        if !valid_session_user_id(body.metadata.as_ref().and_then(|m| m.user_id.as_deref())) {
            body.metadata = Some(axonhub_protocol::claude::messages::RequestMetadata {
                user_id: Some(random_session_user_id()),
            });
        }

        let tokens = self.token_getter.get().await?;
        let client_is_cli = request
            .client_user_agent()
            .is_some_and(|ua| ua.starts_with("claude-cli/"));
        let prefix = tokens.access_token.starts_with(OAUTH_TOKEN_PREFIX) && !client_is_cli;
        self.prefix_tools.store(prefix, Ordering::Relaxed);
        if prefix {
            apply_tool_prefix(&mut body);
        }

        let url = format!("{}?beta=true", build_url(&self.base_url, "v1/messages"));
        let mut upstream =
            UpstreamRequest::post_json(url, Bytes::from(serde_json::to_vec(&body)?));
        // Client-supplied anthropic headers never pass through.
        for header in ["anthropic-beta", "anthropic-version", "x-api-key"] {
            header_remove(&mut upstream.headers, header);
        }
        header_set(&mut upstream.headers, "anthropic-beta", ANTHROPIC_BETA);
        header_set(&mut upstream.headers, "anthropic-version", ANTHROPIC_VERSION);
        header_set(
            &mut upstream.headers,
            "anthropic-dangerous-direct-browser-access",
            "true",
        );
        header_set(&mut upstream.headers, "x-app", "cli");
        header_set(&mut upstream.headers, "x-stainless-lang", "js");
        header_set(&mut upstream.headers, "x-stainless-package-version", "0.55.1");
        header_set(&mut upstream.headers, "x-stainless-runtime", "node");
        header_set(&mut upstream.headers, "x-stainless-runtime-version", "v20.18.1");
        header_set(&mut upstream.headers, "x-stainless-retry-count", "0");
        let user_agent = request
            .client_user_agent()
            .filter(|ua| ua.starts_with("claude-cli/"))
            .unwrap_or(CLAUDE_CLI_USER_AGENT);
        header_set(&mut upstream.headers, "User-Agent", user_agent);
        // Bearer only; never fall back to an API key.
        upstream.auth = AuthConfig::Bearer(tokens.access_token);
        upstream.is_stream = request.is_stream();
        Ok(upstream)
    }

    async fn transform_response(
        &self,
        request: &Request,
        _status: u16,
        body: &Bytes,
    ) -> Result<Response, TransformError> {
        let wire: CreateMessageResponse = serde_json::from_slice(body)
            .map_err(|err| TransformError::MalformedUpstream(err.to_string()))?;
        let mut neutral = neutral_from_message(request, wire);
        if self.strips() {
            for choice in &mut neutral.choices {
                if let Some(message) = choice.message.as_mut() {
                    for call in &mut message.tool_calls {
                        strip_prefix_in_place(&mut call.function.name);
                    }
                }
            }
        }
        Ok(neutral)
    }

    fn stream_decoder(&self, _request: &Request) -> Box<dyn StreamDecoder> {
        Box::new(StrippingStreamDecoder {
            inner: ClaudeStreamDecoder::default(),
            strip: self.strips(),
        })
    }

    fn aggregate_stream(
        &self,
        _request: &Request,
        events: &[SseEvent],
    ) -> Result<(Bytes, ResponseMeta), TransformError> {
        let mut aggregate = EventAggregate::default();
        for event in events {
            if event.data.trim().is_empty() {
                continue;
            }
            let Ok(parsed) = serde_json::from_str::<MessageStreamEvent>(&event.data) else {
                continue;
            };
            aggregate.push(parsed);
        }
        let mut response = aggregate.into_response();
        if self.strips() {
            for block in &mut response.content {
                if let ContentBlock::ToolUse { name, .. } = block {
                    strip_prefix_in_place(name);
                }
            }
        }
        let meta = ResponseMeta {
            id: response.id.clone(),
            usage: Some(decode_usage(&response.usage)),
        };
        Ok((Bytes::from(serde_json::to_vec(&response)?), meta))
    }

    fn transform_error(&self, status: u16, body: &[u8]) -> ResponseError {
        parse_claude_error(status, body)
    }
}

fn inject_system_prelude(body: &mut CreateMessageRequest) {
    let mut prelude = SystemBlock::text(CLAUDE_CODE_SYSTEM_PRELUDE);
    prelude.cache_control = Some(CacheControl::ephemeral());
    let mut blocks = vec![prelude];
    match body.system.take() {
        Some(SystemPrompt::Text(text)) => blocks.push(SystemBlock::text(text)),
        Some(SystemPrompt::Blocks(existing)) => {
            blocks.extend(existing.into_iter().filter(|block| block.text != CLAUDE_CODE_SYSTEM_PRELUDE));
        }
        None => {}
    }
    body.system = Some(SystemPrompt::Blocks(blocks));
}

fn apply_tool_prefix(body: &mut CreateMessageRequest) {
    for tool in body.tools.iter_mut().flatten() {
        tool.name = format!("{TOOL_PREFIX}{}", tool.name);
    }
    if let Some(ToolChoiceParam::Tool { name }) = body.tool_choice.as_mut() {
        *name = format!("{TOOL_PREFIX}{name}");
    }
    for message in &mut body.messages {
        if let axonhub_protocol::claude::messages::MessageContent::Blocks(blocks) =
            &mut message.content
        {
            for block in blocks {
                if let ContentBlock::ToolUse { name, .. } = block {
                    *name = format!("{TOOL_PREFIX}{name}");
                }
            }
        }
    }
}

fn strip_prefix_in_place(name: &mut String) {
    if let Some(stripped) = name.strip_prefix(TOOL_PREFIX) {
        *name = stripped.to_string();
    }
}

/// `user_<64 hex>_account__session_<uuid v4>`
fn valid_session_user_id(user_id: Option<&str>) -> bool {
    let Some(user_id) = user_id else {
        return false;
    };
    let Some(rest) = user_id.strip_prefix("user_") else {
        return false;
    };
    let Some((hex, session)) = rest.split_once("_account__session_") else {
        return false;
    };
    hex.len() == 64
        && hex.chars().all(|c| c.is_ascii_hexdigit())
        && uuid::Uuid::parse_str(session).is_ok()
}

fn random_session_user_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("user_{hex}_account__session_{}", uuid::Uuid::new_v4())
}

struct StrippingStreamDecoder {
    inner: ClaudeStreamDecoder,
    strip: bool,
}

impl StreamDecoder for StrippingStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<Response>, TransformError> {
        let mut deltas = self.inner.decode(event)?;
        if self.strip {
            for response in &mut deltas {
                for choice in &mut response.choices {
                    if let Some(delta) = choice.delta.as_mut() {
                        for call in &mut delta.tool_calls {
                            if let Some(name) = call.name.as_mut() {
                                strip_prefix_in_place(name);
                            }
                        }
                    }
                }
            }
        }
        Ok(deltas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axonhub_model::{
        ApiFormat, AuthError, FunctionDef, Message, OAuthTokens, RawRequest, RequestType, Tool,
    };

    struct Token(&'static str);

    #[async_trait]
    impl TokenGetter for Token {
        async fn get(&self) -> Result<OAuthTokens, AuthError> {
            Ok(OAuthTokens {
                access_token: self.0.to_string(),
                ..Default::default()
            })
        }
    }

    fn request(user_agent: &str) -> Request {
        Request {
            model: "claude-sonnet-4-5".to_string(),
            request_type: Some(RequestType::Chat),
            api_format: Some(ApiFormat::Claude),
            max_completion_tokens: Some(1024),
            messages: vec![Message::user("ls the repo")],
            tools: vec![Tool::function(FunctionDef {
                name: "bash".to_string(),
                description: None,
                parameters: Some(serde_json::json!({"type": "object"})),
            })],
            raw_request: Some(RawRequest {
                headers: vec![("user-agent".to_string(), user_agent.to_string())],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn oauth_token_and_foreign_ua_prefix_tools() {
        let outbound = ClaudeCodeOutbound::new(
            "https://api.anthropic.com",
            Arc::new(Token("sk-ant-oat01-abcdef")),
        );
        let upstream = outbound.transform_request(&request("curl/8.1")).await.unwrap();
        assert!(upstream.url.ends_with("/v1/messages?beta=true"));
        let body: CreateMessageRequest =
            serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
        assert_eq!(body.tools.as_ref().unwrap()[0].name, "proxy_bash");
        assert_eq!(
            axonhub_model::header_get(&upstream.headers, "user-agent"),
            Some(CLAUDE_CLI_USER_AGENT)
        );

        // The streamed tool_use comes back to the client unprefixed.
        let mut decoder = outbound.stream_decoder(&request("curl/8.1"));
        let deltas = decoder
            .decode(&SseEvent::data(
                serde_json::json!({"type": "content_block_start", "index": 0,
                    "content_block": {"type": "tool_use", "id": "toolu_1", "name": "proxy_bash", "input": {}}})
                .to_string(),
            ))
            .unwrap();
        assert_eq!(
            deltas[0].first_delta().unwrap().tool_calls[0].name.as_deref(),
            Some("bash")
        );
    }

    #[tokio::test]
    async fn cli_user_agent_disables_prefixing_and_keeps_ua() {
        let outbound = ClaudeCodeOutbound::new(
            "https://api.anthropic.com",
            Arc::new(Token("sk-ant-oat01-abcdef")),
        );
        let upstream = outbound
            .transform_request(&request("claude-cli/1.0.83 (external, cli)"))
            .await
            .unwrap();
        let body: CreateMessageRequest =
            serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
        assert_eq!(body.tools.as_ref().unwrap()[0].name, "bash");
        assert_eq!(
            axonhub_model::header_get(&upstream.headers, "user-agent"),
            Some("claude-cli/1.0.83 (external, cli)")
        );
    }

    #[tokio::test]
    async fn injects_prelude_and_session_user_id() {
        let outbound = ClaudeCodeOutbound::new(
            "https://api.anthropic.com",
            Arc::new(Token("sk-ant-oat01-abcdef")),
        );
        let upstream = outbound.transform_request(&request("curl/8.1")).await.unwrap();
        let body: CreateMessageRequest =
            serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
        let Some(SystemPrompt::Blocks(system)) = body.system else {
            panic!("expected system blocks");
        };
        assert_eq!(system[0].text, CLAUDE_CODE_SYSTEM_PRELUDE);
        assert!(system[0].cache_control.is_some());
        let user_id = body.metadata.unwrap().user_id.unwrap();
        assert!(valid_session_user_id(Some(&user_id)), "generated id: {user_id}");
        assert_eq!(upstream.auth, AuthConfig::Bearer("sk-ant-oat01-abcdef".to_string()));
    }

    #[tokio::test]
    async fn aggregation_strips_the_prefix_globally() {
        let outbound = ClaudeCodeOutbound::new(
            "https://api.anthropic.com",
            Arc::new(Token("sk-ant-oat01-abcdef")),
        );
        // Establish the prefixing decision first.
        outbound.transform_request(&request("curl/8.1")).await.unwrap();
        let events = vec![SseEvent::data(
            serde_json::json!({"type": "content_block_start", "index": 0,
                "content_block": {"type": "tool_use", "id": "toolu_1", "name": "proxy_bash", "input": {}}})
            .to_string(),
        )];
        let (body, _) = outbound.aggregate_stream(&request("curl/8.1"), &events).unwrap();
        let response: CreateMessageResponse = serde_json::from_slice(&body).unwrap();
        let ContentBlock::ToolUse { name, .. } = &response.content[0] else {
            panic!("expected tool_use block");
        };
        assert_eq!(name, "bash");
    }

    #[test]
    fn session_user_id_validation() {
        assert!(!valid_session_user_id(None));
        assert!(!valid_session_user_id(Some("user_short_account__session_x")));
        let valid = random_session_user_id();
        assert!(valid_session_user_id(Some(&valid)));
    }
}
