//! OpenAI-compatible upstreams: Chat Completions and Responses wires, plus
//! the Azure header dialect. Also serves embeddings and image generation.

use async_trait::async_trait;
use bytes::Bytes;

use axonhub_model::{
    ApiFormat, AuthConfig, Choice, Content, ContentPart, Delta, EmbeddingData, FinishReason,
    ImageData, Message, Request, RequestType, Response, ResponseError, ResponseMeta, Role,
    ToolCall, ToolCallDelta, ToolChoice, UpstreamRequest, message::FunctionCall,
};
use axonhub_protocol::openai::chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatContent,
    ChatContentPart, ChatFunctionCall, ChatFunctionDef, ChatImageUrl, ChatInputAudio, ChatMessage,
    ChatStreamOptions, ChatTool, ChatToolCall, ChatToolChoice, ChatToolChoiceFunction,
};
use axonhub_protocol::openai::embeddings::{EmbeddingsRequest, EmbeddingsResponse};
use axonhub_protocol::openai::images::{ImageGenerationRequest, ImageGenerationResponse};
use axonhub_protocol::openai::responses::{
    CreateResponseRequest, InputItem, InputMessageContent, OutputContent, OutputItem,
    ReasoningConfig, Response as WireResponse, ResponseInput, ResponseStatus, ResponseTool,
    ResponseToolChoice,
};
use axonhub_protocol::openai::responses_stream::ResponseStreamEvent;
use axonhub_protocol::sse::SseEvent;

use super::parse_openai_error;
use crate::inbound::openai_chat::{ChunkAggregate, decode_usage as decode_chat_usage};
use crate::inbound::openai_responses::{
    ResponsesAggregator, decode_usage as decode_responses_usage,
};
use crate::inbound::parse_finish_reason;
use crate::util::build_url;
use crate::{OutboundTransformer, StreamDecoder, TransformError};

/// Which upstream surface this transformer speaks for chat requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAiWire {
    Chat,
    Responses,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAiDialect {
    Standard,
    Azure,
}

pub struct OpenAiOutbound {
    base_url: String,
    api_key: String,
    wire: OpenAiWire,
    dialect: OpenAiDialect,
}

impl OpenAiOutbound {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            wire: OpenAiWire::Chat,
            dialect: OpenAiDialect::Standard,
        }
    }

    pub fn with_wire(mut self, wire: OpenAiWire) -> Self {
        self.wire = wire;
        self
    }

    pub fn with_dialect(mut self, dialect: OpenAiDialect) -> Self {
        self.dialect = dialect;
        self
    }

    fn auth(&self) -> AuthConfig {
        match self.dialect {
            OpenAiDialect::Standard => AuthConfig::Bearer(self.api_key.clone()),
            OpenAiDialect::Azure => AuthConfig::api_key("Api-Key", self.api_key.clone()),
        }
    }

    fn url(&self, path: &str) -> String {
        match self.dialect {
            OpenAiDialect::Standard => build_url(&self.base_url, &format!("v1/{path}")),
            // Azure bases carry deployment + api-version in the URL already.
            OpenAiDialect::Azure => build_url(&self.base_url, path),
        }
    }
}

#[async_trait]
impl OutboundTransformer for OpenAiOutbound {
    fn name(&self) -> &'static str {
        match self.dialect {
            OpenAiDialect::Standard => "openai",
            OpenAiDialect::Azure => "azure-openai",
        }
    }

    async fn transform_request(
        &self,
        request: &Request,
    ) -> Result<UpstreamRequest, TransformError> {
        let (path, body) = match request.request_type {
            Some(RequestType::Embedding) => (
                "embeddings".to_string(),
                serde_json::to_vec(&build_embeddings_request(request)?)?,
            ),
            Some(RequestType::Image) => (
                "images/generations".to_string(),
                serde_json::to_vec(&build_images_request(request)?)?,
            ),
            _ => match self.wire {
                OpenAiWire::Chat => (
                    "chat/completions".to_string(),
                    serde_json::to_vec(&build_chat_request(request))?,
                ),
                OpenAiWire::Responses => (
                    "responses".to_string(),
                    serde_json::to_vec(&build_responses_request(request))?,
                ),
            },
        };
        let mut upstream = UpstreamRequest::post_json(self.url(&path), Bytes::from(body));
        upstream.auth = self.auth();
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
            Some(RequestType::Embedding) => decode_embeddings_response(request, body),
            Some(RequestType::Image) => decode_images_response(request, body),
            _ => match self.wire {
                OpenAiWire::Chat => decode_chat_response(request, body),
                OpenAiWire::Responses => decode_responses_response(request, body),
            },
        }
    }

    fn stream_decoder(&self, _request: &Request) -> Box<dyn StreamDecoder> {
        match self.wire {
            OpenAiWire::Chat => Box::new(ChatStreamDecoder),
            OpenAiWire::Responses => Box::new(ResponsesStreamDecoder::default()),
        }
    }

    fn aggregate_stream(
        &self,
        request: &Request,
        events: &[SseEvent],
    ) -> Result<(Bytes, ResponseMeta), TransformError> {
        match self.wire {
            OpenAiWire::Chat => aggregate_chat_stream(events),
            OpenAiWire::Responses => aggregate_responses_stream(request, events),
        }
    }

    fn transform_error(&self, status: u16, body: &[u8]) -> ResponseError {
        parse_openai_error(status, body)
    }
}

pub(crate) fn aggregate_chat_stream(
    events: &[SseEvent],
) -> Result<(Bytes, ResponseMeta), TransformError> {
    let mut aggregate = ChunkAggregate::default();
    for event in events {
        if event.is_done() || event.data.trim().is_empty() {
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(&event.data) else {
            continue;
        };
        aggregate.push(chunk);
    }
    let response = aggregate.into_response();
    let meta = ResponseMeta {
        id: response.id.clone(),
        usage: response.usage.as_ref().map(decode_chat_usage),
    };
    Ok((Bytes::from(serde_json::to_vec(&response)?), meta))
}

fn aggregate_responses_stream(
    _request: &Request,
    events: &[SseEvent],
) -> Result<(Bytes, ResponseMeta), TransformError> {
    let mut aggregator = ResponsesAggregator::default();
    for event in events {
        if event.is_done() || event.data.trim().is_empty() {
            continue;
        }
        let Ok(parsed) = serde_json::from_str::<ResponseStreamEvent>(&event.data) else {
            continue;
        };
        aggregator.push(parsed);
    }
    let response = aggregator.into_response();
    let meta = ResponseMeta {
        id: response.id.clone(),
        usage: response.usage.as_ref().map(decode_responses_usage),
    };
    Ok((Bytes::from(serde_json::to_vec(&response)?), meta))
}

pub(crate) fn build_chat_request(request: &Request) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: request.model.clone(),
        messages: request.messages.iter().map(encode_chat_message).collect(),
        tools: (!request.tools.is_empty()).then(|| {
            request
                .tools
                .iter()
                .filter_map(|tool| {
                    let function = tool.function.as_ref()?;
                    Some(ChatTool {
                        r#type: "function".to_string(),
                        function: Some(ChatFunctionDef {
                            name: function.name.clone(),
                            description: function.description.clone(),
                            parameters: function.parameters.clone(),
                            strict: None,
                        }),
                    })
                })
                .collect()
        }),
        tool_choice: request.tool_choice.as_ref().map(|choice| match choice {
            ToolChoice::Mode(mode) => ChatToolChoice::Mode(normalize_chat_mode(mode)),
            ToolChoice::Function { name } => ChatToolChoice::Named {
                r#type: "function".to_string(),
                function: ChatToolChoiceFunction { name: name.clone() },
            },
        }),
        response_format: request.response_format.clone(),
        stream: request.stream,
        stream_options: request.is_stream().then_some(ChatStreamOptions {
            include_usage: Some(true),
        }),
        max_tokens: None,
        max_completion_tokens: request.max_completion_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        top_logprobs: request.top_logprobs,
        reasoning_effort: request.reasoning_effort.clone(),
        stop: None,
        metadata: (!request.metadata.is_empty()).then(|| request.metadata.clone()),
        user: None,
    }
}

/// OpenAI rejects Anthropic's "any"; the closest mode is "required".
fn normalize_chat_mode(mode: &str) -> String {
    match mode {
        "any" => "required".to_string(),
        other => other.to_string(),
    }
}

fn encode_chat_message(message: &Message) -> ChatMessage {
    let role = message.role.unwrap_or(Role::User);
    ChatMessage {
        role: role.as_str().to_string(),
        content: message.content.as_ref().map(|content| match content {
            Content::Single(text) => ChatContent::Text(text.clone()),
            Content::Parts(parts) => ChatContent::Parts(
                parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text }
                        | ContentPart::InputText { text }
                        | ContentPart::OutputText { text } => {
                            ChatContentPart::Text { text: text.clone() }
                        }
                        ContentPart::ImageUrl { url, detail } => ChatContentPart::ImageUrl {
                            image_url: ChatImageUrl {
                                url: url.clone(),
                                detail: detail.clone(),
                            },
                        },
                        ContentPart::Audio { data, format } => ChatContentPart::InputAudio {
                            input_audio: ChatInputAudio {
                                data: data.clone(),
                                format: format.clone(),
                            },
                        },
                    })
                    .collect(),
            ),
        }),
        name: message.name.clone(),
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
        tool_call_id: message.tool_call_id.clone(),
        reasoning_content: None,
    }
}

pub(crate) fn decode_chat_response(
    request: &Request,
    body: &Bytes,
) -> Result<Response, TransformError> {
    let wire: ChatCompletionResponse = serde_json::from_slice(body)
        .map_err(|err| TransformError::MalformedUpstream(err.to_string()))?;
    let choices = wire
        .choices
        .into_iter()
        .map(|choice| Choice {
            index: choice.index,
            message: Some(Message {
                role: Some(Role::Assistant),
                content: choice.message.content.map(Content::Single),
                reasoning_content: choice.message.reasoning_content,
                tool_calls: choice
                    .message
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
                ..Default::default()
            }),
            delta: None,
            finish_reason: choice.finish_reason.as_deref().and_then(parse_finish_reason),
        })
        .collect();
    Ok(Response {
        id: wire.id,
        object: wire.object,
        created: wire.created,
        model: wire.model,
        choices,
        usage: wire.usage.as_ref().map(decode_chat_usage),
        request_type: request.request_type,
        api_format: request.api_format,
        ..Default::default()
    })
}

pub(crate) fn build_responses_request(request: &Request) -> CreateResponseRequest {
    let mut instructions: Option<String> = None;
    let mut items = Vec::new();
    for message in &request.messages {
        match message.role.unwrap_or(Role::User) {
            Role::System => {
                let text = message.content.as_ref().map(Content::joined_text).unwrap_or_default();
                match instructions.as_mut() {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(&text);
                    }
                    None => instructions = Some(text),
                }
            }
            Role::Tool => {
                items.push(InputItem::FunctionCallOutput {
                    call_id: message.tool_call_id.clone().unwrap_or_default(),
                    output: message.content.as_ref().map(Content::joined_text).unwrap_or_default(),
                    status: None,
                });
            }
            role => {
                if let Some(content) = message.content.as_ref() {
                    items.push(InputItem::Message {
                        role: role.as_str().to_string(),
                        content: InputMessageContent::Text(content.joined_text()),
                        status: None,
                    });
                }
                for call in &message.tool_calls {
                    items.push(InputItem::FunctionCall {
                        id: None,
                        call_id: call.id.clone(),
                        name: call.function.name.clone(),
                        arguments: call.function.arguments.clone(),
                        status: None,
                    });
                }
            }
        }
    }
    let reasoning = (request.reasoning_effort.is_some() || request.reasoning_budget.is_some())
        .then(|| ReasoningConfig {
            effort: request.reasoning_effort.clone(),
            max_tokens: request.reasoning_budget,
            summary: None,
        });
    CreateResponseRequest {
        model: request.model.clone(),
        input: ResponseInput::Items(items),
        instructions,
        reasoning,
        tools: (!request.tools.is_empty()).then(|| {
            request
                .tools
                .iter()
                .filter_map(|tool| {
                    if let Some(function) = tool.function.as_ref() {
                        return Some(ResponseTool {
                            r#type: "function".to_string(),
                            name: Some(function.name.clone()),
                            description: function.description.clone(),
                            parameters: function.parameters.clone(),
                            strict: None,
                            extra: Default::default(),
                        });
                    }
                    if tool.r#type == "image_generation" {
                        return Some(ResponseTool {
                            r#type: "image_generation".to_string(),
                            name: None,
                            description: None,
                            parameters: None,
                            strict: None,
                            extra: tool
                                .image_generation
                                .as_ref()
                                .and_then(|value| value.as_object())
                                .map(|map| map.clone().into_iter().collect())
                                .unwrap_or_default(),
                        });
                    }
                    None
                })
                .collect()
        }),
        tool_choice: request.tool_choice.as_ref().map(|choice| match choice {
            ToolChoice::Mode(mode) => ResponseToolChoice::Mode(normalize_chat_mode(mode)),
            ToolChoice::Function { name } => ResponseToolChoice::Named {
                r#type: "function".to_string(),
                name: Some(name.clone()),
            },
        }),
        stream: request.stream,
        max_output_tokens: request.max_completion_tokens,
        max_tool_calls: request
            .transformer_metadata
            .get(axonhub_model::meta_keys::MAX_TOOL_CALLS)
            .and_then(serde_json::Value::as_u64)
            .map(|value| value as u32),
        temperature: request.temperature,
        top_p: request.top_p,
        top_logprobs: request.top_logprobs,
        include: request
            .transformer_metadata
            .get(axonhub_model::meta_keys::INCLUDE)
            .and_then(|value| serde_json::from_value(value.clone()).ok()),
        prompt_cache_key: request
            .meta_str(axonhub_model::meta_keys::PROMPT_CACHE_KEY)
            .map(str::to_string),
        prompt_cache_retention: request
            .meta_str(axonhub_model::meta_keys::PROMPT_CACHE_RETENTION)
            .map(str::to_string),
        truncation: request
            .meta_str(axonhub_model::meta_keys::TRUNCATION)
            .map(str::to_string),
        text: None,
        metadata: (!request.metadata.is_empty()).then(|| request.metadata.clone()),
        store: None,
        user: None,
    }
}

pub(crate) fn decode_responses_response(
    request: &Request,
    body: &Bytes,
) -> Result<Response, TransformError> {
    let wire: WireResponse = serde_json::from_slice(body)
        .map_err(|err| TransformError::MalformedUpstream(err.to_string()))?;
    Ok(neutral_from_wire_response(request, wire))
}

pub(crate) fn neutral_from_wire_response(request: &Request, wire: WireResponse) -> Response {
    let mut message = Message {
        role: Some(Role::Assistant),
        ..Default::default()
    };
    let mut images = Vec::new();
    let mut text = String::new();
    for item in wire.output {
        match item {
            OutputItem::Message { content, .. } => {
                for part in content {
                    if let OutputContent::OutputText { text: part_text, .. } = part {
                        text.push_str(&part_text);
                    }
                }
            }
            OutputItem::FunctionCall {
                call_id, name, arguments, ..
            } => {
                message.tool_calls.push(ToolCall {
                    id: call_id,
                    r#type: "function".to_string(),
                    function: FunctionCall { name, arguments },
                });
            }
            OutputItem::Reasoning { summary, .. } => {
                let summary_text: String =
                    summary.into_iter().map(|part| part.text).collect();
                if !summary_text.is_empty() {
                    message
                        .reasoning_content
                        .get_or_insert_with(String::new)
                        .push_str(&summary_text);
                }
            }
            OutputItem::ImageGenerationCall { result, .. } => {
                if let Some(result) = result {
                    images.push(ImageData {
                        b64_json: Some(result),
                        ..Default::default()
                    });
                }
            }
        }
    }
    if !text.is_empty() {
        message.content = Some(Content::Single(text));
    }
    let finish_reason = match wire.status {
        ResponseStatus::Incomplete => FinishReason::Length,
        ResponseStatus::Failed => FinishReason::Error,
        _ if !message.tool_calls.is_empty() => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    };
    Response {
        id: wire.id,
        object: "response".to_string(),
        created: wire.created_at,
        model: wire.model,
        choices: vec![Choice {
            index: 0,
            message: Some(message),
            delta: None,
            finish_reason: Some(finish_reason),
        }],
        usage: wire.usage.as_ref().map(decode_responses_usage),
        images,
        request_type: request.request_type,
        api_format: request.api_format,
        ..Default::default()
    }
}

fn build_embeddings_request(request: &Request) -> Result<EmbeddingsRequest, TransformError> {
    let params = request
        .embedding
        .as_ref()
        .ok_or_else(|| TransformError::invalid("missing embedding input"))?;
    Ok(EmbeddingsRequest {
        model: request.model.clone(),
        input: serde_json::from_value(params.input.clone())?,
        encoding_format: params.encoding_format.clone(),
        dimensions: params.dimensions,
        task: None,
        user: None,
    })
}

pub(crate) fn decode_embeddings_response(
    request: &Request,
    body: &Bytes,
) -> Result<Response, TransformError> {
    let wire: EmbeddingsResponse = serde_json::from_slice(body)
        .map_err(|err| TransformError::MalformedUpstream(err.to_string()))?;
    Ok(Response {
        model: wire.model,
        embeddings: wire
            .data
            .into_iter()
            .map(|item| EmbeddingData {
                index: item.index,
                embedding: item.embedding,
            })
            .collect(),
        usage: wire.usage.map(|usage| axonhub_model::Usage {
            prompt_tokens: usage.prompt_tokens,
            total_tokens: usage.total_tokens,
            ..Default::default()
        }),
        request_type: request.request_type,
        api_format: request.api_format,
        ..Default::default()
    })
}

fn build_images_request(request: &Request) -> Result<ImageGenerationRequest, TransformError> {
    let params = request
        .image
        .as_ref()
        .ok_or_else(|| TransformError::invalid("missing image prompt"))?;
    Ok(ImageGenerationRequest {
        model: Some(request.model.clone()),
        prompt: params.prompt.clone(),
        n: params.n,
        size: params.size.clone(),
        quality: params.quality.clone(),
        response_format: params.response_format.clone(),
        output_format: request
            .meta_str(axonhub_model::meta_keys::IMAGE_OUTPUT_FORMAT)
            .map(str::to_string),
        user: params.user.clone(),
    })
}

fn decode_images_response(request: &Request, body: &Bytes) -> Result<Response, TransformError> {
    let wire: ImageGenerationResponse = serde_json::from_slice(body)
        .map_err(|err| TransformError::MalformedUpstream(err.to_string()))?;
    Ok(Response {
        created: wire.created,
        model: request.model.clone(),
        images: wire
            .data
            .into_iter()
            .map(|image| ImageData {
                url: image.url,
                b64_json: image.b64_json,
                revised_prompt: image.revised_prompt,
                ..Default::default()
            })
            .collect(),
        request_type: request.request_type,
        api_format: request.api_format,
        ..Default::default()
    })
}

/// Upstream chat chunks map one-to-one onto neutral deltas.
pub(crate) struct ChatStreamDecoder;

impl StreamDecoder for ChatStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<Response>, TransformError> {
        if event.is_done() || event.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(&event.data) else {
            return Ok(Vec::new());
        };
        let choices = chunk
            .choices
            .into_iter()
            .map(|choice| Choice {
                index: choice.index,
                message: None,
                delta: Some(Delta {
                    role: choice.delta.role,
                    content: choice.delta.content,
                    reasoning_content: choice.delta.reasoning_content,
                    tool_calls: choice
                        .delta
                        .tool_calls
                        .into_iter()
                        .flatten()
                        .map(|call| ToolCallDelta {
                            index: call.index,
                            id: call.id,
                            name: call.function.as_ref().and_then(|f| f.name.clone()),
                            arguments: call.function.as_ref().and_then(|f| f.arguments.clone()),
                        })
                        .collect(),
                    ..Default::default()
                }),
                finish_reason: choice.finish_reason.as_deref().and_then(parse_finish_reason),
            })
            .collect();
        Ok(vec![Response {
            id: chunk.id,
            object: chunk.object,
            created: chunk.created,
            model: chunk.model,
            choices,
            usage: chunk.usage.as_ref().map(decode_chat_usage),
            ..Default::default()
        }])
    }
}

/// Responses events -> neutral deltas. Output ordering is preserved with an
/// item-id -> output-index map built on `output_item.added`.
#[derive(Default)]
pub(crate) struct ResponsesStreamDecoder {
    item_index: std::collections::HashMap<String, u32>,
    call_ids: std::collections::HashMap<u32, (String, String)>,
    response_id: String,
    model: String,
}

impl ResponsesStreamDecoder {
    fn delta_response(&self, delta: Delta, finish: Option<FinishReason>) -> Response {
        Response {
            id: self.response_id.clone(),
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

    fn tool_index(&self, output_index: u32) -> u32 {
        // Dense per-stream tool slot: each distinct function_call output
        // index becomes its own neutral tool index.
        output_index
    }
}

impl StreamDecoder for ResponsesStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<Response>, TransformError> {
        if event.is_done() || event.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let Ok(parsed) = serde_json::from_str::<ResponseStreamEvent>(&event.data) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        match parsed {
            ResponseStreamEvent::Created(snapshot) => {
                self.response_id = snapshot.response.id;
                self.model = snapshot.response.model;
            }
            ResponseStreamEvent::OutputItemAdded(added) => {
                let (item_id, call) = match &added.item {
                    OutputItem::Message { id, .. } | OutputItem::Reasoning { id, .. } => {
                        (id.clone(), None)
                    }
                    OutputItem::FunctionCall { id, call_id, name, .. } => {
                        (id.clone(), Some((call_id.clone(), name.clone())))
                    }
                    OutputItem::ImageGenerationCall { id, .. } => (id.clone(), None),
                };
                if let Some(item_id) = item_id {
                    self.item_index.insert(item_id, added.output_index);
                }
                if let Some((call_id, name)) = call {
                    self.call_ids
                        .insert(added.output_index, (call_id.clone(), name.clone()));
                    out.push(self.delta_response(
                        Delta {
                            tool_calls: vec![ToolCallDelta {
                                index: self.tool_index(added.output_index),
                                id: Some(call_id),
                                name: Some(name),
                                arguments: None,
                            }],
                            ..Default::default()
                        },
                        None,
                    ));
                }
            }
            ResponseStreamEvent::OutputTextDelta(delta) => {
                out.push(self.delta_response(
                    Delta {
                        content: Some(delta.delta),
                        ..Default::default()
                    },
                    None,
                ));
            }
            ResponseStreamEvent::ReasoningSummaryTextDelta(delta) => {
                out.push(self.delta_response(
                    Delta {
                        reasoning_content: Some(delta.delta),
                        ..Default::default()
                    },
                    None,
                ));
            }
            ResponseStreamEvent::FunctionCallArgumentsDelta(delta) => {
                let output_index = delta
                    .item_id
                    .as_ref()
                    .and_then(|id| self.item_index.get(id).copied())
                    .unwrap_or(delta.output_index);
                out.push(self.delta_response(
                    Delta {
                        tool_calls: vec![ToolCallDelta {
                            index: self.tool_index(output_index),
                            id: None,
                            name: None,
                            arguments: Some(delta.delta),
                        }],
                        ..Default::default()
                    },
                    None,
                ));
            }
            ResponseStreamEvent::ImageGenerationPartialImage(partial) => {
                out.push(self.delta_response(
                    Delta {
                        image_b64: Some(partial.partial_image_b64),
                        ..Default::default()
                    },
                    None,
                ));
            }
            ResponseStreamEvent::Completed(snapshot)
            | ResponseStreamEvent::Failed(snapshot)
            | ResponseStreamEvent::Incomplete(snapshot) => {
                let finish = match snapshot.response.status {
                    ResponseStatus::Incomplete => FinishReason::Length,
                    ResponseStatus::Failed => FinishReason::Error,
                    _ if !self.call_ids.is_empty() => FinishReason::ToolCalls,
                    _ => FinishReason::Stop,
                };
                let mut terminal = self.delta_response(Delta::default(), Some(finish));
                terminal.usage = snapshot.response.usage.as_ref().map(decode_responses_usage);
                out.push(terminal);
            }
            _ => {}
        }
        Ok(out)
    }
}
