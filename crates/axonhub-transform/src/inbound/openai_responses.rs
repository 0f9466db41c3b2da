//! OpenAI Responses as a client-facing format.

use bytes::Bytes;
use serde_json::Value;

use axonhub_model::{
    ApiFormat, Content, ContentPart, FinishReason, FunctionDef, GatewayError, Message, RawRequest,
    Request, RequestType, Response as NeutralResponse, ResponseMeta, Role, Tool, ToolCall,
    ToolChoice, Usage, message::FunctionCall, meta_keys,
};
use axonhub_protocol::openai::responses::{
    CreateResponseRequest, InputContentPart, InputItem, InputMessageContent, OutputContent,
    OutputItem, Response as WireResponse, ResponseInput, ResponseStatus, ResponseTool,
    ResponseToolChoice, ResponseUsage, SummaryText, InputTokensDetails, OutputTokensDetails,
};
use axonhub_protocol::openai::responses_stream::{
    ContentPartEvent, FunctionCallArgumentsDeltaEvent, FunctionCallArgumentsDoneEvent,
    ImageGenerationPartialImageEvent, OutputItemEvent, ReasoningSummaryPartEvent,
    ReasoningSummaryTextDeltaEvent, ReasoningSummaryTextDoneEvent, ResponseSnapshotEvent,
    ResponseStreamEvent, TextDeltaEvent, TextDoneEvent,
};
use axonhub_protocol::sse::{SseEvent, encode_done_frame, encode_sse};

use super::{openai_chat::render_openai_error, parse_body};
use crate::util::{call_id, message_id, now_unix, reasoning_id, response_id};
use crate::{InboundTransformer, RenderedResponse, StreamEncoder, TransformError};

pub struct OpenAiResponsesInbound;

impl InboundTransformer for OpenAiResponsesInbound {
    fn api_format(&self) -> ApiFormat {
        ApiFormat::OpenAiResponses
    }

    fn transform_request(&self, raw: &RawRequest) -> Result<Request, TransformError> {
        let wire: CreateResponseRequest = parse_body(&raw.body)?;
        if wire.model.is_empty() {
            return Err(TransformError::invalid("model is required"));
        }

        let mut request = Request {
            model: wire.model,
            request_type: Some(RequestType::Chat),
            api_format: Some(ApiFormat::OpenAiResponses),
            stream: wire.stream,
            max_completion_tokens: wire.max_output_tokens,
            temperature: wire.temperature,
            top_p: wire.top_p,
            top_logprobs: wire.top_logprobs,
            metadata: wire.metadata.unwrap_or_default(),
            raw_request: Some(raw.clone()),
            ..Default::default()
        };
        if let Some(reasoning) = wire.reasoning {
            request.reasoning_effort = reasoning.effort;
            request.reasoning_budget = reasoning.max_tokens;
        }
        if let Some(instructions) = wire.instructions.filter(|text| !text.is_empty()) {
            request.messages.push(Message::system(instructions));
        }
        match wire.input {
            ResponseInput::Text(text) => request.messages.push(Message::user(text)),
            ResponseInput::Items(items) => {
                for item in items {
                    decode_input_item(item, &mut request.messages)?;
                }
            }
        }
        for tool in wire.tools.into_iter().flatten() {
            decode_tool(tool, &mut request);
        }
        request.tool_choice = wire.tool_choice.and_then(|choice| match choice {
            ResponseToolChoice::Mode(mode) => Some(ToolChoice::Mode(mode)),
            ResponseToolChoice::Named { name: Some(name), .. } => {
                Some(ToolChoice::Function { name })
            }
            ResponseToolChoice::Named { r#type, .. } => {
                (r#type == "image_generation").then(|| ToolChoice::Mode("auto".to_string()))
            }
        });
        if let Some(include) = wire.include {
            request.set_meta(meta_keys::INCLUDE, Value::from(include));
        }
        if let Some(key) = wire.prompt_cache_key {
            request.set_meta(meta_keys::PROMPT_CACHE_KEY, key);
        }
        if let Some(retention) = wire.prompt_cache_retention {
            request.set_meta(meta_keys::PROMPT_CACHE_RETENTION, retention);
        }
        if let Some(truncation) = wire.truncation {
            request.set_meta(meta_keys::TRUNCATION, truncation);
        }
        if let Some(max_tool_calls) = wire.max_tool_calls {
            request.set_meta(meta_keys::MAX_TOOL_CALLS, max_tool_calls);
        }
        Ok(request)
    }

    fn transform_response(
        &self,
        response: &NeutralResponse,
    ) -> Result<RenderedResponse, TransformError> {
        let wire = encode_response(response);
        Ok(RenderedResponse::json(200, Bytes::from(serde_json::to_vec(&wire)?)))
    }

    fn stream_encoder(&self, request: &Request) -> Box<dyn StreamEncoder> {
        Box::new(ResponsesStreamEncoder::new(&request.model))
    }

    fn aggregate_stream(
        &self,
        frames: &[SseEvent],
    ) -> Result<(Bytes, ResponseMeta), TransformError> {
        let mut aggregator = ResponsesAggregator::default();
        for frame in frames {
            if frame.is_done() || frame.data.trim().is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<ResponseStreamEvent>(&frame.data) else {
                continue;
            };
            aggregator.push(event);
        }
        let response = aggregator.into_response();
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

fn decode_input_item(item: InputItem, messages: &mut Vec<Message>) -> Result<(), TransformError> {
    match item {
        InputItem::Message { role, content, .. } => {
            let role = match role.as_str() {
                "system" | "developer" => Role::System,
                "user" => Role::User,
                "assistant" => Role::Assistant,
                other => {
                    return Err(TransformError::invalid(format!("unknown input role: {other}")));
                }
            };
            let content = match content {
                InputMessageContent::Text(text) => Content::Single(text),
                InputMessageContent::Parts(parts) => Content::Parts(
                    parts
                        .into_iter()
                        .map(|part| match part {
                            InputContentPart::InputText { text } => ContentPart::InputText { text },
                            InputContentPart::OutputText { text } => {
                                ContentPart::OutputText { text }
                            }
                            InputContentPart::InputImage { image_url, detail } => {
                                ContentPart::ImageUrl {
                                    url: image_url,
                                    detail,
                                }
                            }
                        })
                        .collect(),
                ),
            };
            messages.push(Message {
                role: Some(role),
                content: Some(content),
                ..Default::default()
            });
        }
        InputItem::InputText { text } => messages.push(Message::user(text)),
        InputItem::InputImage { image_url, detail } => messages.push(Message {
            role: Some(Role::User),
            content: Some(Content::Parts(vec![ContentPart::ImageUrl {
                url: image_url,
                detail,
            }])),
            ..Default::default()
        }),
        InputItem::FunctionCall {
            call_id: id, name, arguments, ..
        } => messages.push(Message {
            role: Some(Role::Assistant),
            tool_calls: vec![ToolCall {
                id,
                r#type: "function".to_string(),
                function: FunctionCall { name, arguments },
            }],
            ..Default::default()
        }),
        InputItem::FunctionCallOutput { call_id, output, .. } => messages.push(Message {
            role: Some(Role::Tool),
            content: Some(Content::Single(output)),
            tool_call_id: Some(call_id),
            ..Default::default()
        }),
        InputItem::Reasoning { summary, .. } => {
            let text: String = summary.into_iter().map(|part| part.text).collect();
            if !text.is_empty() {
                messages.push(Message {
                    role: Some(Role::Assistant),
                    reasoning_content: Some(text),
                    ..Default::default()
                });
            }
        }
    }
    Ok(())
}

fn decode_tool(tool: ResponseTool, request: &mut Request) {
    match tool.r#type.as_str() {
        "function" => {
            let Some(name) = tool.name else {
                return;
            };
            request.tools.push(Tool::function(FunctionDef {
                name,
                description: tool.description,
                parameters: tool.parameters,
            }));
        }
        "image_generation" => {
            if let Some(format) = tool.extra.get("output_format").and_then(Value::as_str) {
                request.set_meta(meta_keys::IMAGE_OUTPUT_FORMAT, format);
            }
            request.tools.push(Tool {
                r#type: "image_generation".to_string(),
                function: None,
                image_generation: Some(Value::Object(tool.extra.into_iter().collect())),
            });
        }
        // Other tool types are not forwarded upstream.
        _ => {}
    }
}

fn status_for(reason: Option<FinishReason>) -> ResponseStatus {
    match reason {
        Some(FinishReason::Stop) | Some(FinishReason::ToolCalls) | None => {
            ResponseStatus::Completed
        }
        Some(FinishReason::Length) => ResponseStatus::Incomplete,
        Some(FinishReason::Error) => ResponseStatus::Failed,
    }
}

fn item_status(status: ResponseStatus) -> Option<String> {
    match status {
        ResponseStatus::Completed => Some("completed".to_string()),
        ResponseStatus::Incomplete => Some("incomplete".to_string()),
        ResponseStatus::Failed => Some("failed".to_string()),
        ResponseStatus::InProgress => Some("in_progress".to_string()),
    }
}

pub(crate) fn encode_response(response: &NeutralResponse) -> WireResponse {
    let status = status_for(response.finish_reason());
    let mut output = Vec::new();
    if let Some(message) = response.first_message() {
        if let Some(reasoning) = message
            .reasoning_content
            .as_ref()
            .filter(|text| !text.is_empty())
        {
            output.push(OutputItem::Reasoning {
                id: Some(reasoning_id()),
                summary: vec![SummaryText::new(reasoning.clone())],
                status: item_status(status),
            });
        }
        let text = message.content.as_ref().map(Content::joined_text).unwrap_or_default();
        if !text.is_empty() {
            output.push(OutputItem::Message {
                id: Some(message_id()),
                role: "assistant".to_string(),
                status: item_status(status),
                content: vec![OutputContent::OutputText {
                    text,
                    annotations: Vec::new(),
                }],
            });
        }
        for tool_call in &message.tool_calls {
            output.push(OutputItem::FunctionCall {
                id: Some(format!("fc_{}", tool_call.id.trim_start_matches("call_"))),
                call_id: tool_call.id.clone(),
                name: tool_call.function.name.clone(),
                arguments: tool_call.function.arguments.clone(),
                status: item_status(status),
            });
        }
    }
    for image in &response.images {
        output.push(OutputItem::ImageGenerationCall {
            id: Some(format!("ig_{}", uuid::Uuid::new_v4().simple())),
            status: Some("completed".to_string()),
            result: image.b64_json.clone(),
        });
    }
    WireResponse {
        id: if response.id.is_empty() {
            response_id()
        } else {
            response.id.clone()
        },
        object: "response".to_string(),
        created_at: if response.created > 0 {
            response.created
        } else {
            now_unix()
        },
        status,
        model: response.model.clone(),
        output,
        usage: response.usage.as_ref().map(encode_usage),
        error: None,
        incomplete_details: None,
        instructions: None,
        metadata: None,
    }
}

pub(crate) fn encode_usage(usage: &Usage) -> ResponseUsage {
    ResponseUsage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        input_tokens_details: usage.cached_tokens.map(|cached_tokens| InputTokensDetails {
            cached_tokens: Some(cached_tokens),
        }),
        output_tokens_details: usage.reasoning_tokens.map(|reasoning_tokens| {
            OutputTokensDetails {
                reasoning_tokens: Some(reasoning_tokens),
            }
        }),
    }
}

pub(crate) fn decode_usage(usage: &ResponseUsage) -> Usage {
    Usage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
        cached_tokens: usage
            .input_tokens_details
            .as_ref()
            .and_then(|details| details.cached_tokens),
        reasoning_tokens: usage
            .output_tokens_details
            .as_ref()
            .and_then(|details| details.reasoning_tokens),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenItem {
    Message,
    Reasoning,
    FunctionCall,
}

struct ToolItemState {
    output_index: u32,
    item_id: String,
    call_id: String,
    name: String,
    arguments: String,
}

/// Neutral deltas -> the Responses SSE alphabet.
///
/// Tracks one open top-level item at a time; starting a different item kind
/// closes the previous one first.
struct ResponsesStreamEncoder {
    response_id: String,
    model: String,
    created_at: i64,
    started: bool,
    next_output_index: u32,
    open: Option<OpenItem>,
    message_id: String,
    message_index: u32,
    message_text: String,
    reasoning_item_id: String,
    reasoning_index: u32,
    reasoning_text: String,
    tools: Vec<ToolItemState>,
    open_tool: Option<usize>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
    completed_items: Vec<OutputItem>,
    terminal_sent: bool,
}

impl ResponsesStreamEncoder {
    fn new(model: &str) -> Self {
        Self {
            response_id: response_id(),
            model: model.to_string(),
            created_at: now_unix(),
            started: false,
            next_output_index: 0,
            open: None,
            message_id: String::new(),
            message_index: 0,
            message_text: String::new(),
            reasoning_item_id: String::new(),
            reasoning_index: 0,
            reasoning_text: String::new(),
            tools: Vec::new(),
            open_tool: None,
            finish_reason: None,
            usage: None,
            completed_items: Vec::new(),
            terminal_sent: false,
        }
    }

    fn skeleton(&self, status: ResponseStatus, output: Vec<OutputItem>) -> WireResponse {
        WireResponse {
            id: self.response_id.clone(),
            object: "response".to_string(),
            created_at: self.created_at,
            status,
            model: self.model.clone(),
            output,
            usage: self.usage.as_ref().map(encode_usage),
            error: None,
            incomplete_details: None,
            instructions: None,
            metadata: None,
        }
    }

    fn push_event(&self, event: ResponseStreamEvent, out: &mut Vec<Bytes>) {
        if let Ok(data) = serde_json::to_string(&event) {
            out.push(encode_sse(Some(event.event_name()), &data));
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<Bytes>) {
        if self.started {
            return;
        }
        self.started = true;
        self.push_event(
            ResponseStreamEvent::Created(ResponseSnapshotEvent {
                response: self.skeleton(ResponseStatus::InProgress, Vec::new()),
                sequence_number: None,
            }),
            out,
        );
    }

    fn close_open_item(&mut self, out: &mut Vec<Bytes>) {
        match self.open.take() {
            Some(OpenItem::Message) => self.close_message(out),
            Some(OpenItem::Reasoning) => self.close_reasoning(out),
            Some(OpenItem::FunctionCall) => self.close_tool(out),
            None => {}
        }
    }

    fn open_message(&mut self, out: &mut Vec<Bytes>) {
        if self.open == Some(OpenItem::Message) {
            return;
        }
        self.close_open_item(out);
        self.open = Some(OpenItem::Message);
        self.message_id = message_id();
        self.message_index = self.next_output_index;
        self.next_output_index += 1;
        self.message_text.clear();
        self.push_event(
            ResponseStreamEvent::OutputItemAdded(OutputItemEvent {
                output_index: self.message_index,
                item: OutputItem::Message {
                    id: Some(self.message_id.clone()),
                    role: "assistant".to_string(),
                    status: Some("in_progress".to_string()),
                    content: Vec::new(),
                },
                sequence_number: None,
            }),
            out,
        );
        self.push_event(
            ResponseStreamEvent::ContentPartAdded(ContentPartEvent {
                item_id: Some(self.message_id.clone()),
                output_index: self.message_index,
                content_index: 0,
                part: OutputContent::OutputText {
                    text: String::new(),
                    annotations: Vec::new(),
                },
                sequence_number: None,
            }),
            out,
        );
    }

    fn close_message(&mut self, out: &mut Vec<Bytes>) {
        let item = OutputItem::Message {
            id: Some(self.message_id.clone()),
            role: "assistant".to_string(),
            status: Some("completed".to_string()),
            content: vec![OutputContent::OutputText {
                text: self.message_text.clone(),
                annotations: Vec::new(),
            }],
        };
        self.push_event(
            ResponseStreamEvent::OutputTextDone(TextDoneEvent {
                item_id: Some(self.message_id.clone()),
                output_index: self.message_index,
                content_index: 0,
                text: self.message_text.clone(),
                sequence_number: None,
            }),
            out,
        );
        self.push_event(
            ResponseStreamEvent::ContentPartDone(ContentPartEvent {
                item_id: Some(self.message_id.clone()),
                output_index: self.message_index,
                content_index: 0,
                part: OutputContent::OutputText {
                    text: self.message_text.clone(),
                    annotations: Vec::new(),
                },
                sequence_number: None,
            }),
            out,
        );
        self.push_event(
            ResponseStreamEvent::OutputItemDone(OutputItemEvent {
                output_index: self.message_index,
                item: item.clone(),
                sequence_number: None,
            }),
            out,
        );
        self.completed_items.push(item);
    }

    fn open_reasoning(&mut self, out: &mut Vec<Bytes>) {
        if self.open == Some(OpenItem::Reasoning) {
            return;
        }
        self.close_open_item(out);
        self.open = Some(OpenItem::Reasoning);
        self.reasoning_item_id = reasoning_id();
        self.reasoning_index = self.next_output_index;
        self.next_output_index += 1;
        self.reasoning_text.clear();
        self.push_event(
            ResponseStreamEvent::OutputItemAdded(OutputItemEvent {
                output_index: self.reasoning_index,
                item: OutputItem::Reasoning {
                    id: Some(self.reasoning_item_id.clone()),
                    summary: Vec::new(),
                    status: Some("in_progress".to_string()),
                },
                sequence_number: None,
            }),
            out,
        );
        self.push_event(
            ResponseStreamEvent::ReasoningSummaryPartAdded(ReasoningSummaryPartEvent {
                item_id: Some(self.reasoning_item_id.clone()),
                output_index: self.reasoning_index,
                summary_index: 0,
                part: SummaryText::new(""),
                sequence_number: None,
            }),
            out,
        );
    }

    fn close_reasoning(&mut self, out: &mut Vec<Bytes>) {
        self.push_event(
            ResponseStreamEvent::ReasoningSummaryTextDone(ReasoningSummaryTextDoneEvent {
                item_id: Some(self.reasoning_item_id.clone()),
                output_index: self.reasoning_index,
                summary_index: 0,
                text: self.reasoning_text.clone(),
                sequence_number: None,
            }),
            out,
        );
        let item = OutputItem::Reasoning {
            id: Some(self.reasoning_item_id.clone()),
            summary: vec![SummaryText::new(self.reasoning_text.clone())],
            status: Some("completed".to_string()),
        };
        self.push_event(
            ResponseStreamEvent::OutputItemDone(OutputItemEvent {
                output_index: self.reasoning_index,
                item: item.clone(),
                sequence_number: None,
            }),
            out,
        );
        self.completed_items.push(item);
    }

    fn open_tool(&mut self, slot: usize, out: &mut Vec<Bytes>) {
        if self.open == Some(OpenItem::FunctionCall) && self.open_tool == Some(slot) {
            return;
        }
        self.close_open_item(out);
        self.open = Some(OpenItem::FunctionCall);
        self.open_tool = Some(slot);
        let tool = &mut self.tools[slot];
        tool.output_index = self.next_output_index;
        self.next_output_index += 1;
        self.push_event(
            ResponseStreamEvent::OutputItemAdded(OutputItemEvent {
                output_index: self.tools[slot].output_index,
                item: OutputItem::FunctionCall {
                    id: Some(self.tools[slot].item_id.clone()),
                    call_id: self.tools[slot].call_id.clone(),
                    name: self.tools[slot].name.clone(),
                    arguments: String::new(),
                    status: Some("in_progress".to_string()),
                },
                sequence_number: None,
            }),
            out,
        );
    }

    fn close_tool(&mut self, out: &mut Vec<Bytes>) {
        let Some(slot) = self.open_tool.take() else {
            return;
        };
        let tool = &self.tools[slot];
        self.push_event(
            ResponseStreamEvent::FunctionCallArgumentsDone(FunctionCallArgumentsDoneEvent {
                item_id: Some(tool.item_id.clone()),
                output_index: tool.output_index,
                call_id: Some(tool.call_id.clone()),
                name: Some(tool.name.clone()),
                arguments: tool.arguments.clone(),
                sequence_number: None,
            }),
            out,
        );
        let item = OutputItem::FunctionCall {
            id: Some(tool.item_id.clone()),
            call_id: tool.call_id.clone(),
            name: tool.name.clone(),
            arguments: tool.arguments.clone(),
            status: Some("completed".to_string()),
        };
        self.push_event(
            ResponseStreamEvent::OutputItemDone(OutputItemEvent {
                output_index: tool.output_index,
                item: item.clone(),
                sequence_number: None,
            }),
            out,
        );
        self.completed_items.push(item);
    }

    fn emit_terminal(&mut self, out: &mut Vec<Bytes>) {
        if self.terminal_sent {
            return;
        }
        self.terminal_sent = true;
        self.close_open_item(out);
        let status = status_for(self.finish_reason);
        let response = self.skeleton(status, self.completed_items.clone());
        let event = match status {
            ResponseStatus::Failed => ResponseStreamEvent::Failed(ResponseSnapshotEvent {
                response,
                sequence_number: None,
            }),
            ResponseStatus::Incomplete => ResponseStreamEvent::Incomplete(ResponseSnapshotEvent {
                response,
                sequence_number: None,
            }),
            _ => ResponseStreamEvent::Completed(ResponseSnapshotEvent {
                response,
                sequence_number: None,
            }),
        };
        self.push_event(event, out);
    }

    fn tool_slot(&mut self, index: u32, id: Option<&str>, name: Option<&str>) -> usize {
        let slot = index as usize;
        while self.tools.len() <= slot {
            self.tools.push(ToolItemState {
                output_index: 0,
                item_id: format!("fc_{}", uuid::Uuid::new_v4().simple()),
                call_id: call_id(),
                name: String::new(),
                arguments: String::new(),
            });
        }
        if let Some(id) = id {
            self.tools[slot].call_id = id.to_string();
        }
        if let Some(name) = name {
            self.tools[slot].name = name.to_string();
        }
        slot
    }
}

impl StreamEncoder for ResponsesStreamEncoder {
    fn encode(&mut self, delta: &NeutralResponse) -> Result<Vec<Bytes>, TransformError> {
        let mut out = Vec::new();
        if delta.is_done() {
            self.ensure_started(&mut out);
            self.emit_terminal(&mut out);
            out.push(encode_done_frame());
            return Ok(out);
        }
        self.ensure_started(&mut out);
        if !delta.model.is_empty() {
            self.model = delta.model.clone();
        }
        if delta.usage.is_some() {
            self.usage = delta.usage.clone();
        }

        for choice in &delta.choices {
            if let Some(neutral) = choice.delta.as_ref() {
                if let Some(reasoning) = neutral
                    .reasoning_content
                    .as_ref()
                    .filter(|text| !text.is_empty())
                {
                    self.open_reasoning(&mut out);
                    self.reasoning_text.push_str(reasoning);
                    let event = ResponseStreamEvent::ReasoningSummaryTextDelta(
                        ReasoningSummaryTextDeltaEvent {
                            item_id: Some(self.reasoning_item_id.clone()),
                            output_index: self.reasoning_index,
                            summary_index: 0,
                            delta: reasoning.clone(),
                            sequence_number: None,
                        },
                    );
                    self.push_event(event, &mut out);
                }
                if let Some(text) = neutral.content.as_ref().filter(|text| !text.is_empty()) {
                    self.open_message(&mut out);
                    self.message_text.push_str(text);
                    let event = ResponseStreamEvent::OutputTextDelta(TextDeltaEvent {
                        item_id: Some(self.message_id.clone()),
                        output_index: self.message_index,
                        content_index: 0,
                        delta: text.clone(),
                        sequence_number: None,
                    });
                    self.push_event(event, &mut out);
                }
                for call in &neutral.tool_calls {
                    let slot =
                        self.tool_slot(call.index, call.id.as_deref(), call.name.as_deref());
                    self.open_tool(slot, &mut out);
                    if let Some(arguments) =
                        call.arguments.as_ref().filter(|text| !text.is_empty())
                    {
                        self.tools[slot].arguments.push_str(arguments);
                        let event = ResponseStreamEvent::FunctionCallArgumentsDelta(
                            FunctionCallArgumentsDeltaEvent {
                                item_id: Some(self.tools[slot].item_id.clone()),
                                output_index: self.tools[slot].output_index,
                                delta: arguments.clone(),
                                sequence_number: None,
                            },
                        );
                        self.push_event(event, &mut out);
                    }
                }
                if let Some(image) = neutral.image_b64.as_ref() {
                    let index = self.next_output_index;
                    let event = ResponseStreamEvent::ImageGenerationPartialImage(
                        ImageGenerationPartialImageEvent {
                            item_id: None,
                            output_index: index,
                            partial_image_index: 0,
                            partial_image_b64: image.clone(),
                            sequence_number: None,
                        },
                    );
                    self.push_event(event, &mut out);
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

/// Rebuilds a unary `Response` body from the Responses event alphabet,
/// indexing partial items by `output_index`.
#[derive(Default)]
pub(crate) struct ResponsesAggregator {
    response: Option<WireResponse>,
    items: std::collections::BTreeMap<u32, OutputItem>,
    texts: std::collections::BTreeMap<(u32, u32), String>,
    summaries: std::collections::BTreeMap<(u32, u32), String>,
    arguments: std::collections::BTreeMap<u32, String>,
    finished: Option<WireResponse>,
}

impl ResponsesAggregator {
    pub(crate) fn push(&mut self, event: ResponseStreamEvent) {
        match event {
            ResponseStreamEvent::Created(snapshot) | ResponseStreamEvent::InProgress(snapshot) => {
                self.response = Some(snapshot.response);
            }
            ResponseStreamEvent::Completed(snapshot)
            | ResponseStreamEvent::Failed(snapshot)
            | ResponseStreamEvent::Incomplete(snapshot) => {
                self.finished = Some(snapshot.response);
            }
            ResponseStreamEvent::OutputItemAdded(event)
            | ResponseStreamEvent::OutputItemDone(event) => {
                self.items.insert(event.output_index, event.item);
            }
            ResponseStreamEvent::OutputTextDelta(event) => {
                self.texts
                    .entry((event.output_index, event.content_index))
                    .or_default()
                    .push_str(&event.delta);
            }
            ResponseStreamEvent::OutputTextDone(event) => {
                self.texts
                    .insert((event.output_index, event.content_index), event.text);
            }
            ResponseStreamEvent::ReasoningSummaryTextDelta(event) => {
                self.summaries
                    .entry((event.output_index, event.summary_index))
                    .or_default()
                    .push_str(&event.delta);
            }
            ResponseStreamEvent::ReasoningSummaryTextDone(event) => {
                self.summaries
                    .insert((event.output_index, event.summary_index), event.text);
            }
            ResponseStreamEvent::FunctionCallArgumentsDelta(event) => {
                self.arguments
                    .entry(event.output_index)
                    .or_default()
                    .push_str(&event.delta);
            }
            ResponseStreamEvent::FunctionCallArgumentsDone(event) => {
                self.arguments.insert(event.output_index, event.arguments);
            }
            _ => {}
        }
    }

    pub(crate) fn into_response(mut self) -> WireResponse {
        if let Some(finished) = self.finished {
            // Terminal snapshots carry the authoritative output list.
            if !finished.output.is_empty() || self.items.is_empty() {
                return finished;
            }
            self.response = Some(finished);
        }
        let mut response = self.response.unwrap_or(WireResponse {
            id: response_id(),
            object: "response".to_string(),
            created_at: now_unix(),
            status: ResponseStatus::Completed,
            model: String::new(),
            output: Vec::new(),
            usage: None,
            error: None,
            incomplete_details: None,
            instructions: None,
            metadata: None,
        });
        let mut output = Vec::new();
        for (index, mut item) in self.items {
            match &mut item {
                OutputItem::Message { content, status, .. } => {
                    if let Some(text) = self.texts.get(&(index, 0)) {
                        *content = vec![OutputContent::OutputText {
                            text: text.clone(),
                            annotations: Vec::new(),
                        }];
                    }
                    *status = Some("completed".to_string());
                }
                OutputItem::Reasoning { summary, status, .. } => {
                    if let Some(text) = self.summaries.get(&(index, 0)) {
                        *summary = vec![SummaryText::new(text.clone())];
                    }
                    *status = Some("completed".to_string());
                }
                OutputItem::FunctionCall { arguments, status, .. } => {
                    if let Some(collected) = self.arguments.get(&index) {
                        *arguments = collected.clone();
                    }
                    *status = Some("completed".to_string());
                }
                OutputItem::ImageGenerationCall { .. } => {}
            }
            output.push(item);
        }
        response.output = output;
        response.status = ResponseStatus::Completed;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axonhub_model::{Choice, Delta};

    fn raw(body: serde_json::Value) -> RawRequest {
        RawRequest {
            method: "POST".to_string(),
            path: "/v1/responses".to_string(),
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn string_input_becomes_user_message() {
        let request = OpenAiResponsesInbound
            .transform_request(&raw(serde_json::json!({
                "model": "claude-3-5-sonnet",
                "input": "Hi",
                "reasoning": {"effort": "high"}
            })))
            .unwrap();
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, Some(Role::User));
        assert_eq!(request.reasoning_effort.as_deref(), Some("high"));
    }

    #[test]
    fn instructions_prepend_a_system_message() {
        let request = OpenAiResponsesInbound
            .transform_request(&raw(serde_json::json!({
                "model": "gpt-4o",
                "instructions": "be terse",
                "input": [
                    {"type": "message", "role": "user", "content": "Hi"},
                    {"type": "function_call", "call_id": "call_1", "name": "add", "arguments": "{}"},
                    {"type": "function_call_output", "call_id": "call_1", "output": "3"}
                ]
            })))
            .unwrap();
        assert_eq!(request.messages[0].role, Some(Role::System));
        assert_eq!(request.messages[2].tool_calls[0].id, "call_1");
        assert_eq!(request.messages[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn unknown_tool_types_are_skipped() {
        let request = OpenAiResponsesInbound
            .transform_request(&raw(serde_json::json!({
                "model": "gpt-4o",
                "input": "Hi",
                "tools": [
                    {"type": "function", "name": "add", "parameters": {"type": "object"}},
                    {"type": "web_search_preview"},
                    {"type": "image_generation", "output_format": "webp"}
                ]
            })))
            .unwrap();
        assert_eq!(request.tools.len(), 2);
        assert_eq!(request.tools[0].function.as_ref().unwrap().name, "add");
        assert_eq!(request.tools[1].r#type, "image_generation");
        assert_eq!(request.meta_str(meta_keys::IMAGE_OUTPUT_FORMAT), Some("webp"));
    }

    #[test]
    fn unary_response_encodes_output_items() {
        let mut message = Message::assistant("Hello");
        message.reasoning_content = Some("thought hard".to_string());
        message.tool_calls.push(ToolCall {
            id: "call_1".to_string(),
            r#type: "function".to_string(),
            function: FunctionCall {
                name: "add".to_string(),
                arguments: "{}".to_string(),
            },
        });
        let neutral = NeutralResponse {
            id: "resp_x".to_string(),
            model: "gpt-4o".to_string(),
            created: 5,
            choices: vec![Choice {
                index: 0,
                message: Some(message),
                finish_reason: Some(FinishReason::ToolCalls),
                ..Default::default()
            }],
            ..Default::default()
        };
        let rendered = OpenAiResponsesInbound.transform_response(&neutral).unwrap();
        let wire: WireResponse = serde_json::from_slice(&rendered.body).unwrap();
        assert_eq!(wire.status, ResponseStatus::Completed);
        assert_eq!(wire.output.len(), 3);
        assert!(matches!(wire.output[0], OutputItem::Reasoning { .. }));
        assert!(matches!(wire.output[1], OutputItem::Message { .. }));
        assert!(matches!(wire.output[2], OutputItem::FunctionCall { ref call_id, .. } if call_id == "call_1"));
    }

    fn collect_event_names(frames: &[Bytes]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|frame| {
                let text = std::str::from_utf8(frame).ok()?;
                text.lines()
                    .find_map(|line| line.strip_prefix("event: ").map(str::to_string))
                    .or_else(|| text.contains("[DONE]").then(|| "[DONE]".to_string()))
            })
            .collect()
    }

    #[test]
    fn stream_encoder_follows_the_event_grammar() {
        let mut encoder = ResponsesStreamEncoder::new("gpt-4o");
        let mut frames = Vec::new();
        for (content, reason) in [("He", None), ("llo", Some(FinishReason::Stop))] {
            let delta = NeutralResponse {
                choices: vec![Choice {
                    index: 0,
                    delta: Some(Delta {
                        content: Some(content.to_string()),
                        ..Default::default()
                    }),
                    finish_reason: reason,
                    ..Default::default()
                }],
                ..Default::default()
            };
            frames.extend(encoder.encode(&delta).unwrap());
        }
        frames.extend(encoder.encode(&NeutralResponse::done()).unwrap());
        let names = collect_event_names(&frames);
        assert_eq!(
            names,
            vec![
                "response.created",
                "response.output_item.added",
                "response.content_part.added",
                "response.output_text.delta",
                "response.output_text.delta",
                "response.output_text.done",
                "response.content_part.done",
                "response.output_item.done",
                "response.completed",
                "[DONE]",
            ]
        );
    }

    #[test]
    fn stream_encoder_interleaves_reasoning_and_tools() {
        let mut encoder = ResponsesStreamEncoder::new("gpt-4o");
        let mut frames = Vec::new();
        let reasoning = NeutralResponse {
            choices: vec![Choice {
                index: 0,
                delta: Some(Delta {
                    reasoning_content: Some("hmm".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        frames.extend(encoder.encode(&reasoning).unwrap());
        let tool = NeutralResponse {
            choices: vec![Choice {
                index: 0,
                delta: Some(Delta {
                    tool_calls: vec![axonhub_model::ToolCallDelta {
                        index: 0,
                        id: Some("call_7".to_string()),
                        name: Some("add".to_string()),
                        arguments: Some("{\"a\":1}".to_string()),
                    }],
                    ..Default::default()
                }),
                finish_reason: Some(FinishReason::ToolCalls),
                ..Default::default()
            }],
            ..Default::default()
        };
        frames.extend(encoder.encode(&tool).unwrap());
        frames.extend(encoder.encode(&NeutralResponse::done()).unwrap());
        let names = collect_event_names(&frames);
        assert_eq!(
            names,
            vec![
                "response.created",
                "response.output_item.added",
                "response.reasoning_summary_part.added",
                "response.reasoning_summary_text.delta",
                "response.reasoning_summary_text.done",
                "response.output_item.done",
                "response.output_item.added",
                "response.function_call_arguments.delta",
                "response.function_call_arguments.done",
                "response.output_item.done",
                "response.completed",
                "[DONE]",
            ]
        );
    }

    #[test]
    fn aggregate_rebuilds_the_unary_body() {
        let events = [
            serde_json::json!({"type": "response.created", "response": {
                "id": "resp_1", "object": "response", "created_at": 1,
                "status": "in_progress", "model": "gpt-4o", "output": []
            }}),
            serde_json::json!({"type": "response.output_item.added", "output_index": 0, "item": {
                "type": "message", "id": "msg_1", "role": "assistant", "content": []
            }}),
            serde_json::json!({"type": "response.content_part.added", "output_index": 0,
                "content_index": 0, "part": {"type": "output_text", "text": ""}}),
            serde_json::json!({"type": "response.output_text.delta", "output_index": 0, "content_index": 0, "delta": "He"}),
            serde_json::json!({"type": "response.output_text.delta", "output_index": 0, "content_index": 0, "delta": "llo"}),
            serde_json::json!({"type": "response.output_text.done", "output_index": 0, "content_index": 0, "text": "Hello"}),
            serde_json::json!({"type": "response.completed", "response": {
                "id": "resp_1", "object": "response", "created_at": 1,
                "status": "completed", "model": "gpt-4o",
                "output": [{"type": "message", "id": "msg_1", "role": "assistant", "status": "completed",
                    "content": [{"type": "output_text", "text": "Hello"}]}],
                "usage": {"input_tokens": 1, "output_tokens": 1, "total_tokens": 2}
            }}),
        ];
        let frames: Vec<SseEvent> = events
            .iter()
            .map(|event| SseEvent::data(event.to_string()))
            .collect();
        let (body, meta) = OpenAiResponsesInbound.aggregate_stream(&frames).unwrap();
        let response: WireResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(response.status, ResponseStatus::Completed);
        let OutputItem::Message { content, status, .. } = &response.output[0] else {
            panic!("expected message item");
        };
        assert_eq!(status.as_deref(), Some("completed"));
        assert!(matches!(&content[0], OutputContent::OutputText { text, .. } if text == "Hello"));
        assert_eq!(meta.id, "resp_1");
        assert_eq!(meta.usage.as_ref().unwrap().prompt_tokens, 1);
        assert_eq!(meta.usage.as_ref().unwrap().completion_tokens, 1);
    }

    #[test]
    fn aggregate_without_terminal_event_uses_indexed_items() {
        let events = [
            serde_json::json!({"type": "response.output_item.added", "output_index": 0, "item": {
                "type": "function_call", "call_id": "call_1", "name": "add", "arguments": ""
            }}),
            serde_json::json!({"type": "response.function_call_arguments.delta", "output_index": 0, "delta": "{\"a\""}),
            serde_json::json!({"type": "response.function_call_arguments.delta", "output_index": 0, "delta": ":1}"}),
        ];
        let frames: Vec<SseEvent> = events
            .iter()
            .map(|event| SseEvent::data(event.to_string()))
            .collect();
        let (body, _) = OpenAiResponsesInbound.aggregate_stream(&frames).unwrap();
        let response: WireResponse = serde_json::from_slice(&body).unwrap();
        let OutputItem::FunctionCall { arguments, .. } = &response.output[0] else {
            panic!("expected function_call item");
        };
        assert_eq!(arguments, "{\"a\":1}");
    }
}
