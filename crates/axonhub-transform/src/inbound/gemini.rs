//! Gemini `generateContent` as a client-facing format. The model name and
//! the stream/unary distinction ride on the URL path.

use bytes::Bytes;
use serde_json::Value;

use axonhub_model::{
    ApiFormat, Content, ContentPart, FinishReason, FunctionDef, GatewayError, Message, RawRequest,
    Request, RequestType, Response, ResponseMeta, Role, Tool, ToolCall, ToolChoice, Usage,
    message::FunctionCall,
};
use axonhub_protocol::error::{GeminiErrorBody, GeminiErrorDetail};
use axonhub_protocol::gemini::generate::{
    Candidate, Content as GeminiContent, FunctionCall as GeminiFunctionCall,
    GenerateContentRequest, GenerateContentResponse, Part, UsageMetadata,
};
use axonhub_protocol::sse::{SseEvent, encode_sse};

use super::parse_body;
use crate::{InboundTransformer, RenderedResponse, StreamEncoder, TransformError};

pub struct GeminiInbound;

impl InboundTransformer for GeminiInbound {
    fn api_format(&self) -> ApiFormat {
        ApiFormat::Gemini
    }

    fn transform_request(&self, raw: &RawRequest) -> Result<Request, TransformError> {
        let (model, action) = parse_model_path(&raw.path)
            .ok_or_else(|| TransformError::invalid("model is required in path"))?;
        let wire: GenerateContentRequest = parse_body(&raw.body)?;

        let mut request = Request {
            model,
            request_type: Some(RequestType::Chat),
            api_format: Some(ApiFormat::Gemini),
            stream: Some(action == "streamGenerateContent"),
            raw_request: Some(raw.clone()),
            ..Default::default()
        };
        if let Some(config) = wire.generation_config {
            request.temperature = config.temperature;
            request.top_p = config.top_p;
            request.max_completion_tokens = config.max_output_tokens;
            if let Some(thinking) = config.thinking_config
                && let Some(budget) = thinking.thinking_budget.filter(|budget| *budget > 0)
            {
                request.reasoning_budget = Some(budget as u32);
            }
        }
        if let Some(system) = wire.system_instruction {
            let text = joined_part_text(&system.parts);
            if !text.is_empty() {
                request.messages.push(Message::system(text));
            }
        }
        for content in wire.contents {
            decode_content(content, &mut request.messages)?;
        }
        for declarations in wire.tools.into_iter().flatten() {
            for declaration in declarations.function_declarations.into_iter().flatten() {
                request.tools.push(Tool::function(FunctionDef {
                    name: declaration.name,
                    description: declaration.description,
                    parameters: declaration.parameters,
                }));
            }
        }
        request.tool_choice = wire
            .tool_config
            .and_then(|config| config.function_calling_config)
            .and_then(|config| config.mode)
            .map(|mode| ToolChoice::Mode(mode.to_ascii_lowercase()));
        Ok(request)
    }

    fn transform_response(&self, response: &Response) -> Result<RenderedResponse, TransformError> {
        let wire = encode_response(response);
        Ok(RenderedResponse::json(200, Bytes::from(serde_json::to_vec(&wire)?)))
    }

    fn stream_encoder(&self, request: &Request) -> Box<dyn StreamEncoder> {
        Box::new(GeminiStreamEncoder::new(&request.model))
    }

    fn aggregate_stream(
        &self,
        frames: &[SseEvent],
    ) -> Result<(Bytes, ResponseMeta), TransformError> {
        let mut aggregate = ChunkAggregate::default();
        for frame in frames {
            if frame.data.trim().is_empty() {
                continue;
            }
            let Ok(chunk) = serde_json::from_str::<GenerateContentResponse>(&frame.data) else {
                continue;
            };
            aggregate.push(chunk);
        }
        let response = aggregate.into_response();
        let meta = ResponseMeta {
            id: response.response_id.clone().unwrap_or_default(),
            usage: response.usage_metadata.as_ref().map(decode_usage),
        };
        Ok((Bytes::from(serde_json::to_vec(&response)?), meta))
    }

    fn render_error(&self, error: &GatewayError) -> RenderedResponse {
        let status = error.status();
        let body = GeminiErrorBody {
            error: GeminiErrorDetail {
                code: status,
                message: error.message(),
                status: gemini_status_text(status).to_string(),
            },
        };
        RenderedResponse::json(
            status,
            Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
        )
    }
}

/// `/v1beta/models/gemini-2.5-pro:streamGenerateContent` -> (model, action).
fn parse_model_path(path: &str) -> Option<(String, String)> {
    let after = path.split("models/").nth(1)?;
    let (model, action) = after.split_once(':')?;
    if model.is_empty() {
        return None;
    }
    let action = action.split('?').next().unwrap_or(action);
    Some((model.to_string(), action.to_string()))
}

fn gemini_status_text(status: u16) -> &'static str {
    match status {
        400 => "INVALID_ARGUMENT",
        404 => "NOT_FOUND",
        422 => "FAILED_PRECONDITION",
        429 => "RESOURCE_EXHAUSTED",
        401 | 403 => "PERMISSION_DENIED",
        _ => "INTERNAL",
    }
}

fn joined_part_text(parts: &[Part]) -> String {
    parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect()
}

fn decode_content(
    content: GeminiContent,
    messages: &mut Vec<Message>,
) -> Result<(), TransformError> {
    let role = match content.role.as_deref() {
        Some("model") => Role::Assistant,
        _ => Role::User,
    };
    let mut parts: Vec<ContentPart> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut reasoning: Option<String> = None;
    let mut reasoning_signature: Option<String> = None;
    for part in content.parts {
        if let Some(call) = part.function_call {
            tool_calls.push(ToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{}", call.name)),
                r#type: "function".to_string(),
                function: FunctionCall {
                    arguments: serde_json::to_string(&call.args.unwrap_or(Value::Null))?,
                    name: call.name,
                },
            });
            continue;
        }
        if let Some(response) = part.function_response {
            messages.push(Message {
                role: Some(Role::Tool),
                content: Some(Content::Single(serde_json::to_string(&response.response)?)),
                tool_call_id: Some(response.id.unwrap_or_else(|| format!("call_{}", response.name))),
                name: Some(response.name),
                ..Default::default()
            });
            continue;
        }
        if let Some(data) = part.inline_data {
            parts.push(ContentPart::ImageUrl {
                url: format!("data:{};base64,{}", data.mime_type, data.data),
                detail: None,
            });
            continue;
        }
        if let Some(text) = part.text {
            if part.thought.unwrap_or(false) {
                reasoning.get_or_insert_with(String::new).push_str(&text);
                reasoning_signature = part.thought_signature.or(reasoning_signature);
            } else {
                parts.push(ContentPart::Text { text });
            }
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
        ..Default::default()
    });
    Ok(())
}

fn finish_reason_str(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop | FinishReason::ToolCalls => "STOP",
        FinishReason::Length => "MAX_TOKENS",
        FinishReason::Error => "OTHER",
    }
}

fn encode_response(response: &Response) -> GenerateContentResponse {
    let mut parts = Vec::new();
    if let Some(message) = response.first_message() {
        if let Some(thinking) = message
            .reasoning_content
            .as_ref()
            .filter(|text| !text.is_empty())
        {
            parts.push(Part {
                text: Some(thinking.clone()),
                thought: Some(true),
                thought_signature: message.reasoning_signature.clone(),
                ..Default::default()
            });
        }
        let text = message.content.as_ref().map(Content::joined_text).unwrap_or_default();
        if !text.is_empty() {
            parts.push(Part::text(text));
        }
        for tool_call in &message.tool_calls {
            parts.push(Part {
                function_call: Some(GeminiFunctionCall {
                    name: tool_call.function.name.clone(),
                    args: serde_json::from_str(&tool_call.function.arguments).ok(),
                    id: Some(tool_call.id.clone()),
                }),
                ..Default::default()
            });
        }
    }
    GenerateContentResponse {
        candidates: vec![Candidate {
            content: GeminiContent {
                role: Some("model".to_string()),
                parts,
            },
            finish_reason: Some(
                finish_reason_str(response.finish_reason().unwrap_or(FinishReason::Stop))
                    .to_string(),
            ),
            index: Some(0),
        }],
        usage_metadata: response.usage.as_ref().map(encode_usage),
        model_version: (!response.model.is_empty()).then(|| response.model.clone()),
        response_id: (!response.id.is_empty()).then(|| response.id.clone()),
    }
}

pub(crate) fn encode_usage(usage: &Usage) -> UsageMetadata {
    UsageMetadata {
        prompt_token_count: Some(usage.prompt_tokens),
        candidates_token_count: Some(usage.completion_tokens),
        total_token_count: Some(usage.total_tokens),
        thoughts_token_count: usage.reasoning_tokens,
        cached_content_token_count: usage.cached_tokens,
    }
}

pub(crate) fn decode_usage(usage: &UsageMetadata) -> Usage {
    Usage {
        prompt_tokens: usage.prompt_token_count.unwrap_or(0),
        completion_tokens: usage.candidates_token_count.unwrap_or(0),
        total_tokens: usage.total_token_count.unwrap_or(0),
        cached_tokens: usage.cached_content_token_count,
        reasoning_tokens: usage.thoughts_token_count,
    }
}

/// Neutral deltas -> Gemini SSE chunks (`alt=sse` framing, data-only).
struct GeminiStreamEncoder {
    model: String,
    finished: bool,
}

impl GeminiStreamEncoder {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            finished: false,
        }
    }
}

impl StreamEncoder for GeminiStreamEncoder {
    fn encode(&mut self, delta: &Response) -> Result<Vec<Bytes>, TransformError> {
        if delta.is_done() || self.finished {
            return Ok(Vec::new());
        }
        let mut parts = Vec::new();
        let mut finish_reason = None;
        for choice in &delta.choices {
            if let Some(neutral) = choice.delta.as_ref() {
                if let Some(thinking) = neutral
                    .reasoning_content
                    .as_ref()
                    .filter(|text| !text.is_empty())
                {
                    parts.push(Part {
                        text: Some(thinking.clone()),
                        thought: Some(true),
                        ..Default::default()
                    });
                }
                if let Some(text) = neutral.content.as_ref().filter(|text| !text.is_empty()) {
                    parts.push(Part::text(text.clone()));
                }
                for call in &neutral.tool_calls {
                    // Gemini tool calls arrive whole, not as argument deltas.
                    if let (Some(name), Some(arguments)) = (&call.name, &call.arguments) {
                        parts.push(Part {
                            function_call: Some(GeminiFunctionCall {
                                name: name.clone(),
                                args: serde_json::from_str(arguments).ok(),
                                id: call.id.clone(),
                            }),
                            ..Default::default()
                        });
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                finish_reason = Some(reason);
            }
        }
        if parts.is_empty() && finish_reason.is_none() && delta.usage.is_none() {
            return Ok(Vec::new());
        }
        if finish_reason.is_some() {
            self.finished = true;
        }
        let chunk = GenerateContentResponse {
            candidates: vec![Candidate {
                content: GeminiContent {
                    role: Some("model".to_string()),
                    parts,
                },
                finish_reason: finish_reason.map(|reason| finish_reason_str(reason).to_string()),
                index: Some(0),
            }],
            usage_metadata: delta.usage.as_ref().map(encode_usage),
            model_version: (!self.model.is_empty()).then(|| self.model.clone()),
            response_id: None,
        };
        Ok(vec![encode_sse(None, &serde_json::to_string(&chunk)?)])
    }
}

#[derive(Default)]
pub(crate) struct ChunkAggregate {
    text: String,
    thinking: String,
    function_calls: Vec<GeminiFunctionCall>,
    finish_reason: Option<String>,
    usage: Option<UsageMetadata>,
    model_version: Option<String>,
    response_id: Option<String>,
}

impl ChunkAggregate {
    pub(crate) fn push(&mut self, chunk: GenerateContentResponse) {
        if chunk.usage_metadata.is_some() {
            self.usage = chunk.usage_metadata;
        }
        if self.model_version.is_none() {
            self.model_version = chunk.model_version;
        }
        if self.response_id.is_none() {
            self.response_id = chunk.response_id;
        }
        for candidate in chunk.candidates {
            if candidate.finish_reason.is_some() {
                self.finish_reason = candidate.finish_reason;
            }
            for part in candidate.content.parts {
                if let Some(call) = part.function_call {
                    self.function_calls.push(call);
                } else if let Some(text) = part.text {
                    if part.thought.unwrap_or(false) {
                        self.thinking.push_str(&text);
                    } else {
                        self.text.push_str(&text);
                    }
                }
            }
        }
    }

    pub(crate) fn into_response(self) -> GenerateContentResponse {
        let mut parts = Vec::new();
        if !self.thinking.is_empty() {
            parts.push(Part {
                text: Some(self.thinking),
                thought: Some(true),
                ..Default::default()
            });
        }
        if !self.text.is_empty() {
            parts.push(Part::text(self.text));
        }
        for call in self.function_calls {
            parts.push(Part {
                function_call: Some(call),
                ..Default::default()
            });
        }
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: GeminiContent {
                    role: Some("model".to_string()),
                    parts,
                },
                finish_reason: self.finish_reason.or_else(|| Some("STOP".to_string())),
                index: Some(0),
            }],
            usage_metadata: self.usage,
            model_version: self.model_version,
            response_id: self.response_id,
        }
    }
}
