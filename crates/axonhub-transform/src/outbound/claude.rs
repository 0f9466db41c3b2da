//! Anthropic Messages upstream.

use async_trait::async_trait;
use bytes::Bytes;

use axonhub_model::{
    AuthConfig, Choice, Content, ContentPart, Delta, ErrorDetail, FinishReason, Message, Request,
    Response, ResponseError, ResponseMeta, Role, ToolCall, ToolCallDelta, ToolChoice,
    UpstreamRequest, header_set, message::FunctionCall,
};
use axonhub_protocol::claude::messages::{
    CacheControl as WireCacheControl, ContentBlock, CreateMessageRequest, CreateMessageResponse,
    ImageSource, MessageContent, MessageParam, RequestMetadata, SystemBlock, SystemPrompt,
    ThinkingConfig, ToolChoiceParam, ToolParam,
};
use axonhub_protocol::claude::stream::{ContentBlockDelta, MessageStreamEvent};
use axonhub_protocol::error::ClaudeErrorBody;
use axonhub_protocol::sse::SseEvent;

use crate::inbound::claude::{EventAggregate, decode_usage};
use crate::inbound::parse_finish_reason;
use crate::util::build_url;
use crate::{OutboundTransformer, StreamDecoder, TransformError};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone)]
pub enum ClaudeAuth {
    ApiKey(String),
    Bearer(String),
}

pub struct AnthropicOutbound {
    base_url: String,
    auth: ClaudeAuth,
}

impl AnthropicOutbound {
    pub fn new(base_url: impl Into<String>, auth: ClaudeAuth) -> Self {
        Self {
            base_url: base_url.into(),
            auth,
        }
    }
}

#[async_trait]
impl OutboundTransformer for AnthropicOutbound {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn transform_request(
        &self,
        request: &Request,
    ) -> Result<UpstreamRequest, TransformError> {
        let body = build_messages_request(request)?;
        let mut upstream = UpstreamRequest::post_json(
            build_url(&self.base_url, "v1/messages"),
            Bytes::from(serde_json::to_vec(&body)?),
        );
        header_set(&mut upstream.headers, "anthropic-version", ANTHROPIC_VERSION);
        // Official channels forward the client's beta opt-ins untouched.
        if request.transform_options.pass_client_headers
            && let Some(beta) = request
                .raw_request
                .as_ref()
                .and_then(|raw| raw.header("anthropic-beta"))
        {
            header_set(&mut upstream.headers, "anthropic-beta", beta);
        }
        upstream.auth = match &self.auth {
            ClaudeAuth::ApiKey(key) => AuthConfig::api_key("x-api-key", key.clone()),
            ClaudeAuth::Bearer(token) => AuthConfig::Bearer(token.clone()),
        };
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
        Ok(neutral_from_message(request, wire))
    }

    fn stream_decoder(&self, _request: &Request) -> Box<dyn StreamDecoder> {
        Box::new(ClaudeStreamDecoder::default())
    }

    fn aggregate_stream(
        &self,
        _request: &Request,
        events: &[SseEvent],
    ) -> Result<(Bytes, ResponseMeta), TransformError> {
        aggregate_message_stream(events)
    }

    fn transform_error(&self, status: u16, body: &[u8]) -> ResponseError {
        parse_claude_error(status, body)
    }
}

pub(crate) fn parse_claude_error(status: u16, body: &[u8]) -> ResponseError {
    if let Ok(parsed) = serde_json::from_slice::<ClaudeErrorBody>(body) {
        return ResponseError {
            status,
            detail: ErrorDetail::new(parsed.error.r#type, parsed.error.message),
        };
    }
    ResponseError {
        status,
        detail: ErrorDetail::new("api_error", String::from_utf8_lossy(body).to_string()),
    }
}

pub(crate) fn aggregate_message_stream(
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
    let response = aggregate.into_response();
    let meta = ResponseMeta {
        id: response.id.clone(),
        usage: Some(decode_usage(&response.usage)),
    };
    Ok((Bytes::from(serde_json::to_vec(&response)?), meta))
}

fn effort_budget(effort: &str) -> u32 {
    match effort {
        "low" => 2048,
        "medium" => 8192,
        _ => 16384,
    }
}

pub(crate) fn build_messages_request(
    request: &Request,
) -> Result<CreateMessageRequest, TransformError> {
    let mut system_blocks: Vec<SystemBlock> = Vec::new();
    let mut messages: Vec<MessageParam> = Vec::new();
    for message in &request.messages {
        match message.role.unwrap_or(Role::User) {
            Role::System => {
                let mut block = SystemBlock::text(
                    message.content.as_ref().map(Content::joined_text).unwrap_or_default(),
                );
                if message.cache_control.is_some() {
                    block.cache_control = Some(WireCacheControl::ephemeral());
                }
                system_blocks.push(block);
            }
            Role::Tool => {
                messages.push(MessageParam {
                    role: "user".to_string(),
                    content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                        content: Some(serde_json::Value::String(
                            message.content.as_ref().map(Content::joined_text).unwrap_or_default(),
                        )),
                        is_error: None,
                    }]),
                });
            }
            role => {
                let mut blocks: Vec<ContentBlock> = Vec::new();
                if let Some(thinking) = message
                    .reasoning_content
                    .as_ref()
                    .filter(|text| !text.is_empty())
                {
                    blocks.push(ContentBlock::Thinking {
                        thinking: thinking.clone(),
                        signature: message.reasoning_signature.clone(),
                    });
                }
                match message.content.as_ref() {
                    Some(Content::Single(text)) => {
                        if !text.is_empty() {
                            blocks.push(ContentBlock::Text {
                                text: text.clone(),
                                cache_control: message
                                    .cache_control
                                    .as_ref()
                                    .map(|_| WireCacheControl::ephemeral()),
                            });
                        }
                    }
                    Some(Content::Parts(parts)) => {
                        for part in parts {
                            match part {
                                ContentPart::Text { text }
                                | ContentPart::InputText { text }
                                | ContentPart::OutputText { text } => {
                                    blocks.push(ContentBlock::Text {
                                        text: text.clone(),
                                        cache_control: None,
                                    });
                                }
                                ContentPart::ImageUrl { url, .. } => {
                                    blocks.push(ContentBlock::Image {
                                        source: image_source(url),
                                    });
                                }
                                ContentPart::Audio { .. } => {}
                            }
                        }
                    }
                    None => {}
                }
                for call in &message.tool_calls {
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input: serde_json::from_str(&call.function.arguments)
                            .unwrap_or(serde_json::Value::Object(Default::default())),
                    });
                }
                if blocks.is_empty() {
                    continue;
                }
                messages.push(MessageParam {
                    role: role.as_str().to_string(),
                    content: MessageContent::Blocks(blocks),
                });
            }
        }
    }

    let tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "any" | "required" => ToolChoiceParam::Any {},
            "none" => ToolChoiceParam::None {},
            _ => ToolChoiceParam::Auto {},
        },
        ToolChoice::Function { name } => ToolChoiceParam::Tool { name: name.clone() },
    });
    // Forced tool use is incompatible with extended thinking upstream.
    let forces_tool = matches!(
        tool_choice,
        Some(ToolChoiceParam::Any {}) | Some(ToolChoiceParam::Tool { .. })
    );
    let thinking = if forces_tool {
        None
    } else if let Some(budget) = request.reasoning_budget {
        Some(ThinkingConfig::Enabled {
            budget_tokens: budget,
        })
    } else {
        request
            .reasoning_effort
            .as_deref()
            .filter(|effort| !effort.is_empty())
            .map(|effort| ThinkingConfig::Enabled {
                budget_tokens: effort_budget(effort),
            })
    };

    Ok(CreateMessageRequest {
        model: request.model.clone(),
        max_tokens: request.max_completion_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: (!system_blocks.is_empty()).then_some(SystemPrompt::Blocks(system_blocks)),
        tools: (!request.tools.is_empty()).then(|| {
            request
                .tools
                .iter()
                .filter_map(|tool| {
                    let function = tool.function.as_ref()?;
                    Some(ToolParam {
                        name: function.name.clone(),
                        description: function.description.clone(),
                        input_schema: function
                            .parameters
                            .clone()
                            .unwrap_or(serde_json::json!({"type": "object"})),
                    })
                })
                .collect()
        }),
        tool_choice,
        thinking,
        metadata: request.metadata.get("user_id").map(|user_id| RequestMetadata {
            user_id: Some(user_id.clone()),
        }),
        stream: request.stream,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences: None,
    })
}

fn image_source(url: &str) -> ImageSource {
    if let Some(rest) = url.strip_prefix("data:")
        && let Some((media_type, data)) = rest.split_once(";base64,")
    {
        return ImageSource::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        };
    }
    ImageSource::Url {
        url: url.to_string(),
    }
}

pub(crate) fn neutral_from_message(request: &Request, wire: CreateMessageResponse) -> Response {
    let mut message = Message {
        role: Some(Role::Assistant),
        ..Default::default()
    };
    let mut text = String::new();
    for block in wire.content {
        match block {
            ContentBlock::Text { text: block_text, .. } => text.push_str(&block_text),
            ContentBlock::Thinking { thinking, signature } => {
                message
                    .reasoning_content
                    .get_or_insert_with(String::new)
                    .push_str(&thinking);
                if signature.is_some() {
                    message.reasoning_signature = signature;
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                message.tool_calls.push(ToolCall {
                    id,
                    r#type: "function".to_string(),
                    function: FunctionCall {
                        name,
                        arguments: serde_json::to_string(&input).unwrap_or_default(),
                    },
                });
            }
            _ => {}
        }
    }
    if !text.is_empty() {
        message.content = Some(Content::Single(text));
    }
    let finish_reason = wire
        .stop_reason
        .as_deref()
        .and_then(parse_finish_reason)
        .unwrap_or(FinishReason::Stop);
    Response {
        id: wire.id,
        object: "message".to_string(),
        created: 0,
        model: wire.model,
        choices: vec![Choice {
            index: 0,
            message: Some(message),
            delta: None,
            finish_reason: Some(finish_reason),
        }],
        usage: Some(decode_usage(&wire.usage)),
        request_type: request.request_type,
        api_format: request.api_format,
        ..Default::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text,
    Thinking,
    ToolUse,
}

/// Anthropic SSE events -> neutral deltas. Tool-call deltas are numbered by
/// the order tool_use blocks appear in the stream.
#[derive(Default)]
pub(crate) struct ClaudeStreamDecoder {
    id: String,
    model: String,
    blocks: std::collections::HashMap<u32, OpenBlock>,
    tool_slots: std::collections::HashMap<u32, u32>,
    tool_count: u32,
    input_tokens: u64,
    cached_tokens: Option<u64>,
}

impl ClaudeStreamDecoder {
    fn delta_response(&self, delta: Delta, finish: Option<FinishReason>) -> Response {
        Response {
            id: self.id.clone(),
            model: self.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: None,
                delta: Some(delta),
                finish_reason: finish,
            }],
            ..Default::default()
        }
    }
}

impl StreamDecoder for ClaudeStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<Response>, TransformError> {
        if event.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let Ok(parsed) = serde_json::from_str::<MessageStreamEvent>(&event.data) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        match parsed {
            MessageStreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                self.input_tokens = message.usage.input_tokens;
                self.cached_tokens = message.usage.cache_read_input_tokens;
            }
            MessageStreamEvent::ContentBlockStart { index, content_block } => match content_block {
                ContentBlock::ToolUse { id, name, .. } => {
                    self.blocks.insert(index, OpenBlock::ToolUse);
                    let slot = self.tool_count;
                    self.tool_count += 1;
                    self.tool_slots.insert(index, slot);
                    out.push(self.delta_response(
                        Delta {
                            tool_calls: vec![ToolCallDelta {
                                index: slot,
                                id: Some(id),
                                name: Some(name),
                                arguments: None,
                            }],
                            ..Default::default()
                        },
                        None,
                    ));
                }
                ContentBlock::Thinking { .. } => {
                    self.blocks.insert(index, OpenBlock::Thinking);
                }
                _ => {
                    self.blocks.insert(index, OpenBlock::Text);
                }
            },
            MessageStreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentBlockDelta::TextDelta { text } => {
                    out.push(self.delta_response(
                        Delta {
                            content: Some(text),
                            ..Default::default()
                        },
                        None,
                    ));
                }
                ContentBlockDelta::ThinkingDelta { thinking } => {
                    out.push(self.delta_response(
                        Delta {
                            reasoning_content: Some(thinking),
                            ..Default::default()
                        },
                        None,
                    ));
                }
                ContentBlockDelta::SignatureDelta { signature } => {
                    out.push(self.delta_response(
                        Delta {
                            reasoning_signature: Some(signature),
                            ..Default::default()
                        },
                        None,
                    ));
                }
                ContentBlockDelta::InputJsonDelta { partial_json } => {
                    let slot = self.tool_slots.get(&index).copied().unwrap_or(0);
                    out.push(self.delta_response(
                        Delta {
                            tool_calls: vec![ToolCallDelta {
                                index: slot,
                                id: None,
                                name: None,
                                arguments: Some(partial_json),
                            }],
                            ..Default::default()
                        },
                        None,
                    ));
                }
            },
            MessageStreamEvent::MessageDelta { delta, usage } => {
                let finish = delta
                    .stop_reason
                    .as_deref()
                    .and_then(parse_finish_reason)
                    .unwrap_or(FinishReason::Stop);
                let mut terminal = self.delta_response(Delta::default(), Some(finish));
                if let Some(usage) = usage {
                    let input = if usage.input_tokens > 0 {
                        usage.input_tokens
                    } else {
                        self.input_tokens
                    };
                    terminal.usage = Some(axonhub_model::Usage {
                        prompt_tokens: input,
                        completion_tokens: usage.output_tokens,
                        total_tokens: input + usage.output_tokens,
                        cached_tokens: usage.cache_read_input_tokens.or(self.cached_tokens),
                        reasoning_tokens: None,
                    });
                }
                out.push(terminal);
            }
            _ => {}
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axonhub_model::{ApiFormat, RequestType};

    fn request_with_effort(effort: &str) -> Request {
        Request {
            model: "claude-3-5-sonnet".to_string(),
            request_type: Some(RequestType::Chat),
            api_format: Some(ApiFormat::OpenAiResponses),
            messages: vec![Message::user("Hi")],
            reasoning_effort: Some(effort.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reasoning_effort_becomes_thinking_budget() {
        let outbound = AnthropicOutbound::new(
            "https://api.anthropic.com",
            ClaudeAuth::ApiKey("sk-ant-test".to_string()),
        );
        let upstream = outbound
            .transform_request(&request_with_effort("high"))
            .await
            .unwrap();
        assert_eq!(upstream.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(
            upstream.auth,
            AuthConfig::api_key("x-api-key", "sk-ant-test")
        );
        let body: CreateMessageRequest =
            serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
        assert_eq!(body.messages[0].role, "user");
        let Some(ThinkingConfig::Enabled { budget_tokens }) = body.thinking else {
            panic!("expected enabled thinking");
        };
        assert!(budget_tokens > 0);
        assert!(body.max_tokens > 0);
    }

    #[tokio::test]
    async fn forced_tool_choice_drops_thinking() {
        let mut request = request_with_effort("high");
        request.tool_choice = Some(ToolChoice::Mode("any".to_string()));
        let outbound = AnthropicOutbound::new(
            "https://api.anthropic.com",
            ClaudeAuth::ApiKey("sk-ant-test".to_string()),
        );
        let upstream = outbound.transform_request(&request).await.unwrap();
        let body: CreateMessageRequest =
            serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
        assert!(body.thinking.is_none());
        assert!(matches!(body.tool_choice, Some(ToolChoiceParam::Any {})));
    }

    #[tokio::test]
    async fn system_and_tool_results_move_to_their_slots() {
        let mut request = request_with_effort("");
        request.reasoning_effort = None;
        request.messages = vec![
            Message::system("be brief"),
            Message::user("run it"),
            Message {
                role: Some(Role::Tool),
                content: Some(Content::Single("ok".to_string())),
                tool_call_id: Some("toolu_1".to_string()),
                ..Default::default()
            },
        ];
        let outbound = AnthropicOutbound::new(
            "https://api.anthropic.com",
            ClaudeAuth::ApiKey("sk-ant-test".to_string()),
        );
        let upstream = outbound.transform_request(&request).await.unwrap();
        let body: CreateMessageRequest =
            serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
        let Some(SystemPrompt::Blocks(system)) = body.system else {
            panic!("expected system blocks");
        };
        assert_eq!(system[0].text, "be brief");
        assert_eq!(body.messages.len(), 2);
        let MessageContent::Blocks(blocks) = &body.messages[1].content else {
            panic!("expected blocks");
        };
        assert!(matches!(blocks[0], ContentBlock::ToolResult { ref tool_use_id, .. } if tool_use_id == "toolu_1"));
    }

    #[test]
    fn stream_decoder_tracks_blocks() {
        let mut decoder = ClaudeStreamDecoder::default();
        let events = [
            serde_json::json!({"type": "message_start", "message": {
                "id": "msg_1", "type": "message", "role": "assistant", "model": "claude-3-5-sonnet",
                "content": [], "stop_reason": null, "usage": {"input_tokens": 7, "output_tokens": 0}
            }}),
            serde_json::json!({"type": "content_block_start", "index": 0,
                "content_block": {"type": "text", "text": ""}}),
            serde_json::json!({"type": "content_block_delta", "index": 0,
                "delta": {"type": "text_delta", "text": "Hi"}}),
            serde_json::json!({"type": "content_block_start", "index": 1,
                "content_block": {"type": "tool_use", "id": "toolu_1", "name": "bash", "input": {}}}),
            serde_json::json!({"type": "content_block_delta", "index": 1,
                "delta": {"type": "input_json_delta", "partial_json": "{}"}}),
            serde_json::json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"},
                "usage": {"input_tokens": 0, "output_tokens": 9}}),
        ];
        let mut deltas = Vec::new();
        for event in events {
            deltas.extend(
                decoder
                    .decode(&SseEvent::data(event.to_string()))
                    .unwrap(),
            );
        }
        assert_eq!(deltas[0].first_delta().unwrap().content.as_deref(), Some("Hi"));
        assert_eq!(
            deltas[1].first_delta().unwrap().tool_calls[0].id.as_deref(),
            Some("toolu_1")
        );
        let terminal = deltas.last().unwrap();
        assert_eq!(terminal.finish_reason(), Some(FinishReason::ToolCalls));
        let usage = terminal.usage.as_ref().unwrap();
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 9);
    }

    #[test]
    fn claude_error_bodies_are_decoded() {
        let outbound = AnthropicOutbound::new(
            "https://api.anthropic.com",
            ClaudeAuth::ApiKey("sk-ant-test".to_string()),
        );
        let error = outbound.transform_error(
            529,
            br#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert_eq!(error.status, 529);
        assert_eq!(error.detail.r#type, "overloaded_error");
    }
}
