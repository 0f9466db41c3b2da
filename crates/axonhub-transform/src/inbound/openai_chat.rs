//! OpenAI Chat Completions as a client-facing format.

use bytes::Bytes;

use axonhub_model::{
    ApiFormat, Content, ContentPart, FunctionDef, GatewayError, Message, RawRequest, Request,
    RequestType, Response, ResponseMeta, Role, Tool, ToolCall, ToolChoice, Usage,
    message::FunctionCall,
};
use axonhub_protocol::error::{OpenAiErrorBody, OpenAiErrorDetail};
use axonhub_protocol::openai::chat::{
    ChatChoice, ChatChunkChoice, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, ChatContent, ChatContentPart, ChatDelta, ChatFunctionCall,
    ChatFunctionCallDelta, ChatResponseMessage, ChatToolCall, ChatToolCallDelta, ChatToolChoice,
    ChatUsage, CompletionTokensDetails, PromptTokensDetails,
};
use axonhub_protocol::sse::{SseEvent, encode_done_frame, encode_sse};

use super::parse_body;
use crate::util::{chat_completion_id, now_unix};
use crate::{InboundTransformer, RenderedResponse, StreamEncoder, TransformError};

pub struct OpenAiChatInbound;

impl InboundTransformer for OpenAiChatInbound {
    fn api_format(&self) -> ApiFormat {
        ApiFormat::OpenAiChat
    }

    fn transform_request(&self, raw: &RawRequest) -> Result<Request, TransformError> {
        let wire: ChatCompletionRequest = parse_body(&raw.body)?;
        if wire.model.is_empty() {
            return Err(TransformError::invalid("model is required"));
        }

        let mut request = Request {
            model: wire.model,
            request_type: Some(RequestType::Chat),
            api_format: Some(ApiFormat::OpenAiChat),
            stream: wire.stream,
            max_completion_tokens: wire.max_completion_tokens.or(wire.max_tokens),
            temperature: wire.temperature,
            top_p: wire.top_p,
            top_logprobs: wire.top_logprobs,
            reasoning_effort: wire.reasoning_effort,
            response_format: wire.response_format,
            metadata: wire.metadata.unwrap_or_default(),
            raw_request: Some(raw.clone()),
            ..Default::default()
        };

        for message in wire.messages {
            request.messages.push(decode_message(message)?);
        }
        for tool in wire.tools.into_iter().flatten() {
            if tool.r#type != "function" {
                continue;
            }
            let Some(function) = tool.function else {
                continue;
            };
            request.tools.push(Tool::function(FunctionDef {
                name: function.name,
                description: function.description,
                parameters: function.parameters,
            }));
        }
        request.tool_choice = wire.tool_choice.map(|choice| match choice {
            ChatToolChoice::Mode(mode) => ToolChoice::Mode(mode),
            ChatToolChoice::Named { function, .. } => ToolChoice::Function {
                name: function.name,
            },
        });
        Ok(request)
    }

    fn transform_response(&self, response: &Response) -> Result<RenderedResponse, TransformError> {
        let wire = encode_response(response);
        Ok(RenderedResponse::json(200, Bytes::from(serde_json::to_vec(&wire)?)))
    }

    fn stream_encoder(&self, _request: &Request) -> Box<dyn StreamEncoder> {
        Box::new(ChatStreamEncoder::default())
    }

    fn aggregate_stream(
        &self,
        frames: &[SseEvent],
    ) -> Result<(Bytes, ResponseMeta), TransformError> {
        let mut aggregate = ChunkAggregate::default();
        for frame in frames {
            if frame.is_done() || frame.data.trim().is_empty() {
                continue;
            }
            let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(&frame.data) else {
                continue;
            };
            aggregate.push(chunk);
        }
        let response = aggregate.into_response();
        let meta = ResponseMeta {
            id: response.id.clone(),
            usage: response.usage.as_ref().map(decode_usage),
        };
        Ok((Bytes::from(serde_json::to_vec(&response)?), meta))
    }

    fn render_error(&self, error: &GatewayError) -> RenderedResponse {
        render_openai_error(error)
    }
}

pub(crate) fn render_openai_error(error: &GatewayError) -> RenderedResponse {
    let (code, param) = match error {
        GatewayError::Upstream(err) => (err.detail.code.clone(), err.detail.param.clone()),
        _ => (None, None),
    };
    let body = OpenAiErrorBody {
        error: OpenAiErrorDetail {
            message: error.message(),
            r#type: error.type_label().to_string(),
            code,
            param,
        },
    };
    RenderedResponse::json(
        error.status(),
        Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
    )
}

fn decode_message(wire: axonhub_protocol::openai::chat::ChatMessage) -> Result<Message, TransformError> {
    let role = match wire.role.as_str() {
        "system" | "developer" => Role::System,
        "user" => Role::User,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        other => {
            return Err(TransformError::invalid(format!("unknown role: {other}")));
        }
    };
    if role == Role::Tool && wire.tool_call_id.is_none() {
        return Err(TransformError::invalid("tool message requires tool_call_id"));
    }
    let content = wire.content.map(|content| match content {
        ChatContent::Text(text) => Content::Single(text),
        ChatContent::Parts(parts) => Content::Parts(
            parts
                .into_iter()
                .map(|part| match part {
                    ChatContentPart::Text { text } => ContentPart::Text { text },
                    ChatContentPart::ImageUrl { image_url } => ContentPart::ImageUrl {
                        url: image_url.url,
                        detail: image_url.detail,
                    },
                    ChatContentPart::InputAudio { input_audio } => ContentPart::Audio {
                        data: input_audio.data,
                        format: input_audio.format,
                    },
                })
                .collect(),
        ),
    });
    Ok(Message {
        role: Some(role),
        content,
        tool_calls: wire
            .tool_calls
            .into_iter()
            .flatten()
            .map(|call| ToolCall {
                id: call.id,
                r#type: call.r#type,
                function: FunctionCall {
                    name: call.function.name,
                    arguments: call.function.arguments,
                },
            })
            .collect(),
        tool_call_id: wire.tool_call_id,
        name: wire.name,
        reasoning_content: wire.reasoning_content,
        ..Default::default()
    })
}

fn encode_response(response: &Response) -> ChatCompletionResponse {
    let choices = response
        .choices
        .iter()
        .map(|choice| {
            let message = choice.message.clone().unwrap_or_default();
            ChatChoice {
                index: choice.index,
                message: ChatResponseMessage {
                    role: "assistant".to_string(),
                    content: message.content.as_ref().map(Content::joined_text),
                    reasoning_content: message.reasoning_content.clone(),
                    tool_calls: (!message.tool_calls.is_empty()).then(|| {
                        message
                            .tool_calls
                            .iter()
                            .map(|call| ChatToolCall {
                                id: call.id.clone(),
                                r#type: call.r#type.clone(),
                                function: ChatFunctionCall {
                                    name: call.function.name.clone(),
                                    arguments: call.function.arguments.clone(),
                                },
                            })
                            .collect()
                    }),
                },
                finish_reason: choice.finish_reason.map(|r| r.as_str().to_string()),
            }
        })
        .collect();
    ChatCompletionResponse {
        id: non_empty_or(&response.id, chat_completion_id),
        object: "chat.completion".to_string(),
        created: if response.created > 0 {
            response.created
        } else {
            now_unix()
        },
        model: response.model.clone(),
        choices,
        usage: response.usage.as_ref().map(encode_usage),
    }
}

fn non_empty_or(value: &str, fallback: fn() -> String) -> String {
    if value.is_empty() {
        fallback()
    } else {
        value.to_string()
    }
}

pub(crate) fn encode_usage(usage: &Usage) -> ChatUsage {
    ChatUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        prompt_tokens_details: usage.cached_tokens.map(|cached_tokens| PromptTokensDetails {
            cached_tokens: Some(cached_tokens),
        }),
        completion_tokens_details: usage.reasoning_tokens.map(|reasoning_tokens| {
            CompletionTokensDetails {
                reasoning_tokens: Some(reasoning_tokens),
            }
        }),
    }
}

pub(crate) fn decode_usage(usage: &ChatUsage) -> Usage {
    Usage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        cached_tokens: usage
            .prompt_tokens_details
            .as_ref()
            .and_then(|details| details.cached_tokens),
        reasoning_tokens: usage
            .completion_tokens_details
            .as_ref()
            .and_then(|details| details.reasoning_tokens),
    }
}

/// Neutral deltas -> `chat.completion.chunk` SSE frames, `[DONE]` last.
#[derive(Default)]
struct ChatStreamEncoder {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    finished: bool,
}

impl StreamEncoder for ChatStreamEncoder {
    fn encode(&mut self, delta: &Response) -> Result<Vec<Bytes>, TransformError> {
        if delta.is_done() {
            if self.finished {
                return Ok(Vec::new());
            }
            self.finished = true;
            return Ok(vec![encode_done_frame()]);
        }
        if self.id.is_empty() {
            self.id = non_empty_or(&delta.id, chat_completion_id);
            self.model = delta.model.clone();
            self.created = if delta.created > 0 { delta.created } else { now_unix() };
        }

        let mut choices = Vec::new();
        for choice in &delta.choices {
            let Some(neutral) = choice.delta.as_ref() else {
                if choice.finish_reason.is_some() {
                    choices.push(ChatChunkChoice {
                        index: choice.index,
                        delta: ChatDelta::default(),
                        finish_reason: choice.finish_reason.map(|r| r.as_str().to_string()),
                    });
                }
                continue;
            };
            let role = if self.role_sent {
                None
            } else {
                self.role_sent = true;
                Some("assistant".to_string())
            };
            choices.push(ChatChunkChoice {
                index: choice.index,
                delta: ChatDelta {
                    role,
                    content: neutral.content.clone(),
                    reasoning_content: neutral.reasoning_content.clone(),
                    tool_calls: (!neutral.tool_calls.is_empty()).then(|| {
                        neutral
                            .tool_calls
                            .iter()
                            .map(|call| ChatToolCallDelta {
                                index: call.index,
                                id: call.id.clone(),
                                r#type: call.id.as_ref().map(|_| "function".to_string()),
                                function: Some(ChatFunctionCallDelta {
                                    name: call.name.clone(),
                                    arguments: call.arguments.clone(),
                                }),
                            })
                            .collect()
                    }),
                },
                finish_reason: choice.finish_reason.map(|r| r.as_str().to_string()),
            });
        }
        if choices.is_empty() && delta.usage.is_none() {
            return Ok(Vec::new());
        }

        let chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices,
            usage: delta.usage.as_ref().map(encode_usage),
        };
        Ok(vec![encode_sse(None, &serde_json::to_string(&chunk)?)])
    }
}

/// Folds streamed chunks back into a unary `chat.completion` body.
#[derive(Default)]
pub(crate) struct ChunkAggregate {
    id: String,
    model: String,
    created: i64,
    content: String,
    reasoning: String,
    tool_calls: Vec<ChatToolCall>,
    finish_reason: Option<String>,
    usage: Option<ChatUsage>,
}

impl ChunkAggregate {
    pub(crate) fn push(&mut self, chunk: ChatCompletionChunk) {
        if self.id.is_empty() {
            self.id = chunk.id;
            self.model = chunk.model;
            self.created = chunk.created;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                self.content.push_str(&content);
            }
            if let Some(reasoning) = choice.delta.reasoning_content {
                self.reasoning.push_str(&reasoning);
            }
            for call in choice.delta.tool_calls.into_iter().flatten() {
                let index = call.index as usize;
                while self.tool_calls.len() <= index {
                    self.tool_calls.push(ChatToolCall {
                        id: String::new(),
                        r#type: "function".to_string(),
                        function: ChatFunctionCall {
                            name: String::new(),
                            arguments: String::new(),
                        },
                    });
                }
                let slot = &mut self.tool_calls[index];
                if let Some(id) = call.id {
                    slot.id = id;
                }
                if let Some(function) = call.function {
                    if let Some(name) = function.name {
                        slot.function.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        slot.function.arguments.push_str(&arguments);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
    }

    pub(crate) fn into_response(self) -> ChatCompletionResponse {
        let finish_reason = self
            .finish_reason
            .or_else(|| Some(if self.tool_calls.is_empty() { "stop" } else { "tool_calls" }.to_string()));
        ChatCompletionResponse {
            id: self.id,
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model,
            choices: vec![ChatChoice {
                index: 0,
                message: ChatResponseMessage {
                    role: "assistant".to_string(),
                    content: (!self.content.is_empty()).then_some(self.content),
                    reasoning_content: (!self.reasoning.is_empty()).then_some(self.reasoning),
                    tool_calls: (!self.tool_calls.is_empty()).then_some(self.tool_calls),
                },
                finish_reason,
            }],
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axonhub_model::{Choice, Delta, ToolCallDelta};

    fn raw(body: serde_json::Value) -> RawRequest {
        RawRequest {
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_missing_model() {
        let err = OpenAiChatInbound
            .transform_request(&raw(serde_json::json!({"model": "", "messages": []})))
            .unwrap_err();
        assert!(matches!(err, TransformError::InvalidRequest(_)));
    }

    #[test]
    fn decodes_messages_and_tools() {
        let request = OpenAiChatInbound
            .transform_request(&raw(serde_json::json!({
                "model": "gpt-4o",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": [{"type": "text", "text": "hi"}]},
                    {"role": "tool", "content": "42", "tool_call_id": "call_1"}
                ],
                "tools": [
                    {"type": "function", "function": {"name": "add", "parameters": {"type": "object"}}},
                    {"type": "web_search"}
                ],
                "tool_choice": "auto",
                "max_tokens": 128
            })))
            .unwrap();
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[0].role, Some(Role::System));
        assert_eq!(request.messages[2].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.max_completion_tokens, Some(128));
        assert!(matches!(request.tool_choice, Some(ToolChoice::Mode(ref m)) if m == "auto"));
    }

    #[test]
    fn stream_encoder_emits_chunks_then_done() {
        let mut encoder = OpenAiChatInbound.stream_encoder(&Request::default());
        let delta = Response {
            id: "chatcmpl-1".to_string(),
            model: "gpt-4o".to_string(),
            created: 7,
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
        let frames = encoder.encode(&delta).unwrap();
        assert_eq!(frames.len(), 1);
        let text = String::from_utf8(frames[0].to_vec()).unwrap();
        assert!(text.starts_with("data: "));
        assert!(text.contains("\"role\":\"assistant\""));
        assert!(text.contains("Hello"));

        let done = encoder.encode(&Response::done()).unwrap();
        assert_eq!(done[0].as_ref(), b"data: [DONE]\n\n");
        assert!(encoder.encode(&Response::done()).unwrap().is_empty());
    }

    #[test]
    fn aggregates_chunks_with_tool_calls() {
        let frames = vec![
            SseEvent::data(
                serde_json::json!({
                    "id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 1, "model": "m",
                    "choices": [{"index": 0, "delta": {"tool_calls": [
                        {"index": 0, "id": "call_1", "type": "function", "function": {"name": "add", "arguments": "{\"a\":"}}
                    ]}, "finish_reason": null}]
                })
                .to_string(),
            ),
            SseEvent::data(
                serde_json::json!({
                    "id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 1, "model": "m",
                    "choices": [{"index": 0, "delta": {"tool_calls": [
                        {"index": 0, "function": {"arguments": "1}"}}
                    ]}, "finish_reason": "tool_calls"}],
                    "usage": {"prompt_tokens": 3, "completion_tokens": 5, "total_tokens": 8}
                })
                .to_string(),
            ),
            SseEvent::data("[DONE]"),
        ];
        let (body, meta) = OpenAiChatInbound.aggregate_stream(&frames).unwrap();
        let response: ChatCompletionResponse = serde_json::from_slice(&body).unwrap();
        let calls = response.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.arguments, "{\"a\":1}");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(meta.id, "chatcmpl-1");
        assert_eq!(meta.usage.as_ref().unwrap().total_tokens, 8);
    }

    #[test]
    fn renders_error_in_openai_shape() {
        let rendered = OpenAiChatInbound.render_error(&GatewayError::InvalidModel("x".into()));
        assert_eq!(rendered.status, 422);
        let body: OpenAiErrorBody = serde_json::from_slice(&rendered.body).unwrap();
        assert_eq!(body.error.r#type, "invalid_model_error");
    }

    #[test]
    fn tool_call_delta_roundtrip_keeps_ids() {
        let mut encoder = OpenAiChatInbound.stream_encoder(&Request::default());
        let delta = Response {
            id: "chatcmpl-2".to_string(),
            choices: vec![Choice {
                index: 0,
                delta: Some(Delta {
                    tool_calls: vec![ToolCallDelta {
                        index: 0,
                        id: Some("call_9".to_string()),
                        name: Some("run".to_string()),
                        arguments: Some("{}".to_string()),
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let frames = encoder.encode(&delta).unwrap();
        let text = String::from_utf8(frames[0].to_vec()).unwrap();
        assert!(text.contains("call_9"));
        assert!(text.contains("\"type\":\"function\""));
    }
}
