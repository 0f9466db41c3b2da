//! Anthropic Messages as a client-facing format.

use bytes::Bytes;
use serde_json::Value;

use axonhub_model::{
    ApiFormat, CacheControl, Content, ContentPart, FinishReason, FunctionDef, GatewayError,
    Message, RawRequest, Request, RequestType, Response, ResponseMeta, Role, Tool, ToolCall,
    ToolChoice, Usage, message::FunctionCall,
};
use axonhub_protocol::claude::messages::{
    ContentBlock, CreateMessageRequest, CreateMessageResponse, ImageSource, MessageContent,
    MessagesUsage, SystemPrompt, ThinkingConfig, ToolChoiceParam,
};
use axonhub_protocol::claude::stream::{
    ContentBlockDelta, MessageDelta, MessageStreamEvent,
};
use axonhub_protocol::error::ClaudeErrorBody;
use axonhub_protocol::sse::{SseEvent, encode_sse};

use super::parse_body;
use crate::util::{call_id, message_id};
use crate::{InboundTransformer, RenderedResponse, StreamEncoder, TransformError};

pub struct ClaudeInbound;

impl InboundTransformer for ClaudeInbound {
    fn api_format(&self) -> ApiFormat {
        ApiFormat::Claude
    }

    fn transform_request(&self, raw: &RawRequest) -> Result<Request, TransformError> {
        let wire: CreateMessageRequest = parse_body(&raw.body)?;
        if wire.model.is_empty() {
            return Err(TransformError::invalid("model is required"));
        }
        if wire.max_tokens == 0 {
            return Err(TransformError::invalid("max_tokens is required"));
        }

        let mut request = Request {
            model: wire.model,
            request_type: Some(RequestType::Chat),
            api_format: Some(ApiFormat::Claude),
            stream: wire.stream,
            max_completion_tokens: Some(wire.max_tokens),
            temperature: wire.temperature,
            top_p: wire.top_p,
            raw_request: Some(raw.clone()),
            ..Default::default()
        };
        if let Some(ThinkingConfig::Enabled { budget_tokens }) = wire.thinking {
            request.reasoning_budget = Some(budget_tokens);
        }
        if let Some(user_id) = wire.metadata.and_then(|metadata| metadata.user_id) {
            request.metadata.insert("user_id".to_string(), user_id);
        }
        if let Some(system) = wire.system {
            request.messages.push(decode_system(system));
        }
        for message in wire.messages {
            decode_message(message, &mut request.messages)?;
        }
        for tool in wire.tools.into_iter().flatten() {
            request.tools.push(Tool::function(FunctionDef {
                name: tool.name,
                description: tool.description,
                parameters: Some(tool.input_schema),
            }));
        }
        request.tool_choice = wire.tool_choice.map(|choice| match choice {
            ToolChoiceParam::Auto {} => ToolChoice::Mode("auto".to_string()),
            ToolChoiceParam::Any {} => ToolChoice::Mode("any".to_string()),
            ToolChoiceParam::None {} => ToolChoice::Mode("none".to_string()),
            ToolChoiceParam::Tool { name } => ToolChoice::Function { name },
        });
        Ok(request)
    }

    fn transform_response(&self, response: &Response) -> Result<RenderedResponse, TransformError> {
        let wire = encode_response(response)?;
        Ok(RenderedResponse::json(200, Bytes::from(serde_json::to_vec(&wire)?)))
    }

    fn stream_encoder(&self, request: &Request) -> Box<dyn StreamEncoder> {
        Box::new(ClaudeStreamEncoder::new(&request.model))
    }

    fn aggregate_stream(
        &self,
        frames: &[SseEvent],
    ) -> Result<(Bytes, ResponseMeta), TransformError> {
        let mut aggregate = EventAggregate::default();
        for frame in frames {
            if frame.data.trim().is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<MessageStreamEvent>(&frame.data) else {
                continue;
            };
            aggregate.push(event);
        }
        let response = aggregate.into_response();
        let meta = ResponseMeta {
            id: response.id.clone(),
            usage: Some(decode_usage(&response.usage)),
        };
        Ok((Bytes::from(serde_json::to_vec(&response)?), meta))
    }

    fn render_error(&self, error: &GatewayError) -> RenderedResponse {
        let body = ClaudeErrorBody::new(error.type_label(), error.message());
        RenderedResponse::json(
            error.status(),
            Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
        )
    }
}

fn decode_system(system: SystemPrompt) -> Message {
    match system {
        SystemPrompt::Text(text) => Message::system(text),
        SystemPrompt::Blocks(blocks) => {
            let cache_control = blocks
                .iter()
                .find_map(|block| block.cache_control.as_ref())
                .map(|_| CacheControl::ephemeral());
            let text: String = blocks.into_iter().map(|block| block.text).collect();
            Message {
                role: Some(Role::System),
                content: Some(Content::Single(text)),
                cache_control,
                ..Default::default()
            }
        }
    }
}

fn decode_message(
    wire: axonhub_protocol::claude::messages::MessageParam,
    messages: &mut Vec<Message>,
) -> Result<(), TransformError> {
    let role = match wire.role.as_str() {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        other => return Err(TransformError::invalid(format!("unknown role: {other}"))),
    };
    match wire.content {
        MessageContent::Text(text) => messages.push(Message {
            role: Some(role),
            content: Some(Content::Single(text)),
            ..Default::default()
        }),
        MessageContent::Blocks(blocks) => {
            let mut parts: Vec<ContentPart> = Vec::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();
            let mut reasoning: Option<String> = None;
            let mut reasoning_signature: Option<String> = None;
            let mut cache_control: Option<CacheControl> = None;
            for block in blocks {
                match block {
                    ContentBlock::Text { text, cache_control: cc } => {
                        if cc.is_some() {
                            cache_control = Some(CacheControl::ephemeral());
                        }
                        parts.push(ContentPart::Text { text });
                    }
                    ContentBlock::Image { source } => {
                        let url = match source {
                            ImageSource::Url { url } => url,
                            ImageSource::Base64 { media_type, data } => {
                                format!("data:{media_type};base64,{data}")
                            }
                        };
                        parts.push(ContentPart::ImageUrl { url, detail: None });
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(ToolCall {
                            id,
                            r#type: "function".to_string(),
                            function: FunctionCall {
                                name,
                                arguments: serde_json::to_string(&input)?,
                            },
                        });
                    }
                    ContentBlock::ToolResult { tool_use_id, content, .. } => {
                        // Tool results become their own tool-role messages.
                        let text = match content {
                            Some(Value::String(text)) => text,
                            Some(other) => serde_json::to_string(&other)?,
                            None => String::new(),
                        };
                        messages.push(Message {
                            role: Some(Role::Tool),
                            content: Some(Content::Single(text)),
                            tool_call_id: Some(tool_use_id),
                            ..Default::default()
                        });
                    }
                    ContentBlock::Thinking { thinking, signature } => {
                        reasoning = Some(match reasoning.take() {
                            Some(mut existing) => {
                                existing.push_str(&thinking);
                                existing
                            }
                            None => thinking,
                        });
                        reasoning_signature = signature.or(reasoning_signature);
                    }
                    ContentBlock::RedactedThinking { .. } => {}
                }
            }
            if parts.is_empty() && tool_calls.is_empty() && reasoning.is_none() {
                return Ok(());
            }
            messages.push(Message {
                role: Some(role),
                content: (!parts.is_empty()).then_some(Content::Parts(parts)),
                tool_calls,
                reasoning_content: reasoning,
                reasoning_signature,
                cache_control,
                ..Default::default()
            });
        }
    }
    Ok(())
}

fn stop_reason_str(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop | FinishReason::Error => "end_turn",
        FinishReason::Length => "max_tokens",
        FinishReason::ToolCalls => "tool_use",
    }
}

fn encode_response(response: &Response) -> Result<CreateMessageResponse, TransformError> {
    let mut content = Vec::new();
    if let Some(message) = response.first_message() {
        if let Some(thinking) = message
            .reasoning_content
            .as_ref()
            .filter(|text| !text.is_empty())
        {
            content.push(ContentBlock::Thinking {
                thinking: thinking.clone(),
                signature: message.reasoning_signature.clone(),
            });
        }
        let text = message.content.as_ref().map(Content::joined_text).unwrap_or_default();
        if !text.is_empty() {
            content.push(ContentBlock::Text {
                text,
                cache_control: None,
            });
        }
        for tool_call in &message.tool_calls {
            let input = if tool_call.function.arguments.is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&tool_call.function.arguments)
                    .unwrap_or(Value::String(tool_call.function.arguments.clone()))
            };
            content.push(ContentBlock::ToolUse {
                id: tool_call.id.clone(),
                name: tool_call.function.name.clone(),
                input,
            });
        }
    }
    Ok(CreateMessageResponse {
        id: if response.id.is_empty() {
            message_id()
        } else {
            response.id.clone()
        },
        r#type: "message".to_string(),
        role: "assistant".to_string(),
        model: response.model.clone(),
        content,
        stop_reason: Some(stop_reason_str(
            response.finish_reason().unwrap_or(FinishReason::Stop),
        )
        .to_string()),
        stop_sequence: None,
        usage: response.usage.as_ref().map(encode_usage).unwrap_or_default(),
    })
}

pub(crate) fn encode_usage(usage: &Usage) -> MessagesUsage {
    MessagesUsage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cache_read_input_tokens: usage.cached_tokens,
        cache_creation_input_tokens: None,
    }
}

pub(crate) fn decode_usage(usage: &MessagesUsage) -> Usage {
    Usage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.input_tokens + usage.output_tokens,
        cached_tokens: usage.cache_read_input_tokens,
        reasoning_tokens: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

/// Neutral deltas -> Anthropic SSE events.
struct ClaudeStreamEncoder {
    message_id: String,
    model: String,
    started: bool,
    block_index: u32,
    open_block: Option<BlockKind>,
    open_tool_index: Option<u32>,
    usage: Option<Usage>,
    finish_reason: Option<FinishReason>,
    terminal_sent: bool,
}

impl ClaudeStreamEncoder {
    fn new(model: &str) -> Self {
        Self {
            message_id: message_id(),
            model: model.to_string(),
            started: false,
            block_index: 0,
            open_block: None,
            open_tool_index: None,
            usage: None,
            finish_reason: None,
            terminal_sent: false,
        }
    }

    fn emit(&self, event: &MessageStreamEvent, out: &mut Vec<Bytes>) {
        if let Ok(data) = serde_json::to_string(event) {
            out.push(encode_sse(Some(event.event_name()), &data));
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<Bytes>) {
        if self.started {
            return;
        }
        self.started = true;
        let message = CreateMessageResponse {
            id: self.message_id.clone(),
            r#type: "message".to_string(),
            role: "assistant".to_string(),
            model: self.model.clone(),
            content: Vec::new(),
            stop_reason: None,
            stop_sequence: None,
            usage: MessagesUsage::default(),
        };
        self.emit(&MessageStreamEvent::MessageStart { message }, out);
    }

    fn close_block(&mut self, out: &mut Vec<Bytes>) {
        if self.open_block.take().is_some() {
            self.emit(
                &MessageStreamEvent::ContentBlockStop {
                    index: self.block_index,
                },
                out,
            );
            self.block_index += 1;
            self.open_tool_index = None;
        }
    }

    fn open_block(&mut self, kind: BlockKind, start: ContentBlock, out: &mut Vec<Bytes>) {
        if self.open_block == Some(kind) && kind != BlockKind::ToolUse {
            return;
        }
        self.close_block(out);
        self.open_block = Some(kind);
        self.emit(
            &MessageStreamEvent::ContentBlockStart {
                index: self.block_index,
                content_block: start,
            },
            out,
        );
    }

    fn emit_terminal(&mut self, out: &mut Vec<Bytes>) {
        if self.terminal_sent {
            return;
        }
        self.terminal_sent = true;
        self.close_block(out);
        self.emit(
            &MessageStreamEvent::MessageDelta {
                delta: MessageDelta {
                    stop_reason: Some(
                        stop_reason_str(self.finish_reason.unwrap_or(FinishReason::Stop))
                            .to_string(),
                    ),
                    stop_sequence: None,
                },
                usage: self.usage.as_ref().map(encode_usage),
            },
            out,
        );
        self.emit(&MessageStreamEvent::MessageStop {}, out);
    }
}

impl StreamEncoder for ClaudeStreamEncoder {
    fn encode(&mut self, delta: &Response) -> Result<Vec<Bytes>, TransformError> {
        let mut out = Vec::new();
        if delta.is_done() {
            self.ensure_started(&mut out);
            self.emit_terminal(&mut out);
            return Ok(out);
        }
        self.ensure_started(&mut out);
        if delta.usage.is_some() {
            self.usage = delta.usage.clone();
        }
        for choice in &delta.choices {
            if let Some(neutral) = choice.delta.as_ref() {
                if let Some(thinking) = neutral
                    .reasoning_content
                    .as_ref()
                    .filter(|text| !text.is_empty())
                {
                    self.open_block(
                        BlockKind::Thinking,
                        ContentBlock::Thinking {
                            thinking: String::new(),
                            signature: None,
                        },
                        &mut out,
                    );
                    self.emit(
                        &MessageStreamEvent::ContentBlockDelta {
                            index: self.block_index,
                            delta: ContentBlockDelta::ThinkingDelta {
                                thinking: thinking.clone(),
                            },
                        },
                        &mut out,
                    );
                }
                if let Some(signature) = neutral.reasoning_signature.as_ref() {
                    if self.open_block == Some(BlockKind::Thinking) {
                        self.emit(
                            &MessageStreamEvent::ContentBlockDelta {
                                index: self.block_index,
                                delta: ContentBlockDelta::SignatureDelta {
                                    signature: signature.clone(),
                                },
                            },
                            &mut out,
                        );
                    }
                }
                if let Some(text) = neutral.content.as_ref().filter(|text| !text.is_empty()) {
                    self.open_block(
                        BlockKind::Text,
                        ContentBlock::Text {
                            text: String::new(),
                            cache_control: None,
                        },
                        &mut out,
                    );
                    self.emit(
                        &MessageStreamEvent::ContentBlockDelta {
                            index: self.block_index,
                            delta: ContentBlockDelta::TextDelta { text: text.clone() },
                        },
                        &mut out,
                    );
                }
                for call in &neutral.tool_calls {
                    let starting = self.open_tool_index != Some(call.index)
                        || self.open_block != Some(BlockKind::ToolUse);
                    if starting {
                        self.close_block(&mut out);
                        self.open_block = Some(BlockKind::ToolUse);
                        self.open_tool_index = Some(call.index);
                        self.emit(
                            &MessageStreamEvent::ContentBlockStart {
                                index: self.block_index,
                                content_block: ContentBlock::ToolUse {
                                    id: call.id.clone().unwrap_or_else(call_id),
                                    name: call.name.clone().unwrap_or_default(),
                                    input: Value::Object(Default::default()),
                                },
                            },
                            &mut out,
                        );
                    }
                    if let Some(arguments) =
                        call.arguments.as_ref().filter(|text| !text.is_empty())
                    {
                        self.emit(
                            &MessageStreamEvent::ContentBlockDelta {
                                index: self.block_index,
                                delta: ContentBlockDelta::InputJsonDelta {
                                    partial_json: arguments.clone(),
                                },
                            },
                            &mut out,
                        );
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }
        if self.finish_reason.is_some() {
            self.emit_terminal(&mut out);
        }
        Ok(out)
    }
}

/// Folds Anthropic SSE events back into a unary message body.
#[derive(Default)]
pub(crate) struct EventAggregate {
    message: Option<CreateMessageResponse>,
    blocks: std::collections::BTreeMap<u32, ContentBlock>,
    json_parts: std::collections::BTreeMap<u32, String>,
    stop_reason: Option<String>,
    usage_delta: Option<MessagesUsage>,
}

impl EventAggregate {
    pub(crate) fn push(&mut self, event: MessageStreamEvent) {
        match event {
            MessageStreamEvent::MessageStart { message } => self.message = Some(message),
            MessageStreamEvent::ContentBlockStart { index, content_block } => {
                self.blocks.insert(index, content_block);
            }
            MessageStreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentBlockDelta::TextDelta { text } => {
                    if let Some(ContentBlock::Text { text: existing, .. }) =
                        self.blocks.get_mut(&index)
                    {
                        existing.push_str(&text);
                    }
                }
                ContentBlockDelta::ThinkingDelta { thinking } => {
                    if let Some(ContentBlock::Thinking { thinking: existing, .. }) =
                        self.blocks.get_mut(&index)
                    {
                        existing.push_str(&thinking);
                    }
                }
                ContentBlockDelta::SignatureDelta { signature } => {
                    if let Some(ContentBlock::Thinking { signature: existing, .. }) =
                        self.blocks.get_mut(&index)
                    {
                        *existing = Some(signature);
                    }
                }
                ContentBlockDelta::InputJsonDelta { partial_json } => {
                    self.json_parts.entry(index).or_default().push_str(&partial_json);
                }
            },
            MessageStreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if usage.is_some() {
                    self.usage_delta = usage;
                }
            }
            _ => {}
        }
    }

    pub(crate) fn into_response(self) -> CreateMessageResponse {
        let mut response = self.message.unwrap_or(CreateMessageResponse {
            id: message_id(),
            r#type: "message".to_string(),
            role: "assistant".to_string(),
            model: String::new(),
            content: Vec::new(),
            stop_reason: None,
            stop_sequence: None,
            usage: MessagesUsage::default(),
        });
        for (index, mut block) in self.blocks {
            if let ContentBlock::ToolUse { input, .. } = &mut block
                && let Some(collected) = self.json_parts.get(&index)
                && let Ok(value) = serde_json::from_str(collected)
            {
                *input = value;
            }
            response.content.push(block);
        }
        if self.stop_reason.is_some() {
            response.stop_reason = self.stop_reason;
        }
        if let Some(usage) = self.usage_delta {
            if usage.output_tokens > 0 {
                response.usage.output_tokens = usage.output_tokens;
            }
            if usage.input_tokens > 0 {
                response.usage.input_tokens = usage.input_tokens;
            }
            if usage.cache_read_input_tokens.is_some() {
                response.usage.cache_read_input_tokens = usage.cache_read_input_tokens;
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axonhub_model::{Choice, Delta, ToolCallDelta};

    fn raw(body: serde_json::Value) -> RawRequest {
        RawRequest {
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_missing_max_tokens() {
        let err = ClaudeInbound
            .transform_request(&raw(serde_json::json!({
                "model": "claude-3-5-sonnet",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .unwrap_err();
        assert!(matches!(err, TransformError::InvalidRequest(_)));
    }

    #[test]
    fn decodes_system_blocks_and_tool_results() {
        let request = ClaudeInbound
            .transform_request(&raw(serde_json::json!({
                "model": "claude-3-5-sonnet",
                "max_tokens": 1024,
                "system": [{"type": "text", "text": "be brief", "cache_control": {"type": "ephemeral"}}],
                "messages": [
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": [
                        {"type": "tool_use", "id": "toolu_1", "name": "bash", "input": {"command": "ls"}}
                    ]},
                    {"role": "user", "content": [
                        {"type": "tool_result", "tool_use_id": "toolu_1", "content": "files"}
                    ]}
                ],
                "tools": [{"name": "bash", "input_schema": {"type": "object"}}],
                "thinking": {"type": "enabled", "budget_tokens": 2048}
            })))
            .unwrap();
        assert_eq!(request.messages[0].role, Some(Role::System));
        assert!(request.messages[0].cache_control.is_some());
        assert_eq!(request.messages[2].tool_calls[0].id, "toolu_1");
        assert_eq!(
            request.messages[2].tool_calls[0].function.arguments,
            "{\"command\":\"ls\"}"
        );
        assert_eq!(request.messages[3].role, Some(Role::Tool));
        assert_eq!(request.messages[3].tool_call_id.as_deref(), Some("toolu_1"));
        assert_eq!(request.reasoning_budget, Some(2048));
        assert_eq!(request.tools.len(), 1);
    }

    fn event_names(frames: &[Bytes]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|frame| {
                std::str::from_utf8(frame)
                    .ok()?
                    .lines()
                    .find_map(|line| line.strip_prefix("event: ").map(str::to_string))
            })
            .collect()
    }

    #[test]
    fn stream_encoder_emits_anthropic_event_sequence() {
        let mut encoder = ClaudeStreamEncoder::new("claude-3-5-sonnet");
        let mut frames = Vec::new();
        let text_delta = Response {
            choices: vec![Choice {
                index: 0,
                delta: Some(Delta {
                    content: Some("Hello".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        frames.extend(encoder.encode(&text_delta).unwrap());
        let tool_delta = Response {
            choices: vec![Choice {
                index: 0,
                delta: Some(Delta {
                    tool_calls: vec![ToolCallDelta {
                        index: 0,
                        id: Some("toolu_1".to_string()),
                        name: Some("bash".to_string()),
                        arguments: Some("{}".to_string()),
                    }],
                    ..Default::default()
                }),
                finish_reason: Some(FinishReason::ToolCalls),
                ..Default::default()
            }],
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 4,
                total_tokens: 14,
                ..Default::default()
            }),
            ..Default::default()
        };
        frames.extend(encoder.encode(&tool_delta).unwrap());
        frames.extend(encoder.encode(&Response::done()).unwrap());
        assert_eq!(
            event_names(&frames),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn aggregates_stream_into_message_body() {
        let events = [
            serde_json::json!({"type": "message_start", "message": {
                "id": "msg_1", "type": "message", "role": "assistant", "model": "claude-3-5-sonnet",
                "content": [], "stop_reason": null, "usage": {"input_tokens": 9, "output_tokens": 0}
            }}),
            serde_json::json!({"type": "content_block_start", "index": 0,
                "content_block": {"type": "tool_use", "id": "toolu_1", "name": "bash", "input": {}}}),
            serde_json::json!({"type": "content_block_delta", "index": 0,
                "delta": {"type": "input_json_delta", "partial_json": "{\"command\""}}),
            serde_json::json!({"type": "content_block_delta", "index": 0,
                "delta": {"type": "input_json_delta", "partial_json": ": \"ls\"}"}}),
            serde_json::json!({"type": "content_block_stop", "index": 0}),
            serde_json::json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"},
                "usage": {"input_tokens": 0, "output_tokens": 6}}),
            serde_json::json!({"type": "message_stop"}),
        ];
        let frames: Vec<SseEvent> = events
            .iter()
            .map(|event| SseEvent::data(event.to_string()))
            .collect();
        let (body, meta) = ClaudeInbound.aggregate_stream(&frames).unwrap();
        let response: CreateMessageResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(response.stop_reason.as_deref(), Some("tool_use"));
        let ContentBlock::ToolUse { input, .. } = &response.content[0] else {
            panic!("expected tool_use block");
        };
        assert_eq!(input["command"], "ls");
        assert_eq!(meta.usage.as_ref().unwrap().prompt_tokens, 9);
        assert_eq!(meta.usage.as_ref().unwrap().completion_tokens, 6);
    }

    #[test]
    fn renders_error_in_anthropic_shape() {
        let rendered = ClaudeInbound.render_error(&GatewayError::InvalidRequest("bad".into()));
        assert_eq!(rendered.status, 400);
        let body: ClaudeErrorBody = serde_json::from_slice(&rendered.body).unwrap();
        assert_eq!(body.r#type, "error");
        assert_eq!(body.error.r#type, "invalid_request_error");
    }
}
