//! Gemini `generateContent` upstream.

use async_trait::async_trait;
use bytes::Bytes;

use axonhub_model::{
    AuthConfig, Choice, Content, ContentPart, Delta, ErrorDetail, FinishReason, ImageData,
    Message, Request, Response, ResponseError, ResponseMeta, Role, ToolCall, ToolCallDelta,
    ToolChoice, UpstreamRequest, message::FunctionCall,
};
use axonhub_protocol::error::GeminiErrorBody;
use axonhub_protocol::gemini::generate::{
    Content as GeminiContent, FunctionCall as GeminiFunctionCall, FunctionCallingConfig,
    FunctionDeclaration, FunctionResponse, GenerateContentRequest, GenerateContentResponse,
    GenerationConfig, Part, ThinkingConfig, ToolConfig, ToolDeclarations,
};
use axonhub_protocol::sse::SseEvent;

use crate::inbound::gemini::{ChunkAggregate, decode_usage};
use crate::inbound::parse_finish_reason;
use crate::schema::sanitize;
use crate::util::build_url;
use crate::{OutboundTransformer, StreamDecoder, TransformError};

pub struct GeminiOutbound {
    base_url: String,
    api_key: String,
}

impl GeminiOutbound {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl OutboundTransformer for GeminiOutbound {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn transform_request(
        &self,
        request: &Request,
    ) -> Result<UpstreamRequest, TransformError> {
        let body = build_generate_request(request)?;
        let action = if request.is_stream() {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let url = build_url(
            &self.base_url,
            &format!("v1beta/models/{}:{action}", request.model),
        );
        let mut upstream =
            UpstreamRequest::post_json(url, Bytes::from(serde_json::to_vec(&body)?));
        upstream.auth = AuthConfig::api_key("x-goog-api-key", self.api_key.clone());
        upstream.is_stream = request.is_stream();
        Ok(upstream)
    }

    async fn transform_response(
        &self,
        request: &Request,
        _status: u16,
        body: &Bytes,
    ) -> Result<Response, TransformError> {
        let wire: GenerateContentResponse = serde_json::from_slice(body)
            .map_err(|err| TransformError::MalformedUpstream(err.to_string()))?;
        Ok(neutral_from_generate(request, wire))
    }

    fn stream_decoder(&self, _request: &Request) -> Box<dyn StreamDecoder> {
        Box::new(GeminiStreamDecoder::default())
    }

    fn aggregate_stream(
        &self,
        _request: &Request,
        events: &[SseEvent],
    ) -> Result<(Bytes, ResponseMeta), TransformError> {
        aggregate_generate_stream(events)
    }

    fn transform_error(&self, status: u16, body: &[u8]) -> ResponseError {
        parse_gemini_error(status, body)
    }
}

pub(crate) fn parse_gemini_error(status: u16, body: &[u8]) -> ResponseError {
    if let Ok(parsed) = serde_json::from_slice::<GeminiErrorBody>(body) {
        return ResponseError {
            status,
            detail: ErrorDetail::new(parsed.error.status, parsed.error.message),
        };
    }
    ResponseError {
        status,
        detail: ErrorDetail::new("api_error", String::from_utf8_lossy(body).to_string()),
    }
}

pub(crate) fn aggregate_generate_stream(
    events: &[SseEvent],
) -> Result<(Bytes, ResponseMeta), TransformError> {
    let mut aggregate = ChunkAggregate::default();
    for event in events {
        if event.data.trim().is_empty() || event.is_done() {
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<GenerateContentResponse>(&event.data) else {
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

pub(crate) fn build_generate_request(
    request: &Request,
) -> Result<GenerateContentRequest, TransformError> {
    let mut system_parts: Vec<Part> = Vec::new();
    let mut contents: Vec<GeminiContent> = Vec::new();
    for message in &request.messages {
        match message.role.unwrap_or(Role::User) {
            Role::System => {
                let text = message.content.as_ref().map(Content::joined_text).unwrap_or_default();
                if !text.is_empty() {
                    system_parts.push(Part::text(text));
                }
            }
            Role::Tool => {
                contents.push(GeminiContent {
                    role: Some("user".to_string()),
                    parts: vec![Part {
                        function_response: Some(FunctionResponse {
                            name: message.name.clone().unwrap_or_else(|| "tool".to_string()),
                            response: serde_json::json!({
                                "result": message
                                    .content
                                    .as_ref()
                                    .map(Content::joined_text)
                                    .unwrap_or_default()
                            }),
                            id: message.tool_call_id.clone(),
                        }),
                        ..Default::default()
                    }],
                });
            }
            role => {
                let mut parts: Vec<Part> = Vec::new();
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
                match message.content.as_ref() {
                    Some(Content::Single(text)) => {
                        if !text.is_empty() {
                            parts.push(Part::text(text.clone()));
                        }
                    }
                    Some(Content::Parts(content_parts)) => {
                        for part in content_parts {
                            match part {
                                ContentPart::Text { text }
                                | ContentPart::InputText { text }
                                | ContentPart::OutputText { text } => {
                                    parts.push(Part::text(text.clone()));
                                }
                                ContentPart::ImageUrl { url, .. } => {
                                    if let Some(inline) = inline_data_from_url(url) {
                                        parts.push(inline);
                                    }
                                }
                                ContentPart::Audio { .. } => {}
                            }
                        }
                    }
                    None => {}
                }
                for call in &message.tool_calls {
                    parts.push(Part {
                        function_call: Some(GeminiFunctionCall {
                            name: call.function.name.clone(),
                            args: serde_json::from_str(&call.function.arguments).ok(),
                            id: Some(call.id.clone()),
                        }),
                        ..Default::default()
                    });
                }
                if parts.is_empty() {
                    continue;
                }
                contents.push(GeminiContent {
                    role: Some(if role == Role::Assistant { "model" } else { "user" }.to_string()),
                    parts,
                });
            }
        }
    }

    let thinking_config = request.reasoning_budget.map(|budget| ThinkingConfig {
        thinking_budget: Some(budget as i64),
        include_thoughts: Some(true),
    });
    let generation_config = GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.max_completion_tokens,
        thinking_config,
        ..Default::default()
    };
    let has_generation_config = generation_config != GenerationConfig::default();

    let tools: Vec<FunctionDeclaration> = request
        .tools
        .iter()
        .filter_map(|tool| {
            let function = tool.function.as_ref()?;
            Some(FunctionDeclaration {
                name: function.name.clone(),
                description: function.description.clone(),
                parameters: function.parameters.as_ref().map(sanitize),
            })
        })
        .collect();

    let tool_config = request.tool_choice.as_ref().map(|choice| {
        let config = match choice {
            ToolChoice::Mode(mode) => FunctionCallingConfig {
                mode: Some(match mode.as_str() {
                    "any" | "required" => "ANY",
                    "none" => "NONE",
                    _ => "AUTO",
                }
                .to_string()),
                allowed_function_names: None,
            },
            ToolChoice::Function { name } => FunctionCallingConfig {
                mode: Some("ANY".to_string()),
                allowed_function_names: Some(vec![name.clone()]),
            },
        };
        ToolConfig {
            function_calling_config: Some(config),
        }
    });

    Ok(GenerateContentRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then_some(GeminiContent {
            role: None,
            parts: system_parts,
        }),
        generation_config: has_generation_config.then_some(generation_config),
        tools: (!tools.is_empty()).then(|| {
            vec![ToolDeclarations {
                function_declarations: Some(tools),
            }]
        }),
        tool_config,
    })
}

fn inline_data_from_url(url: &str) -> Option<Part> {
    let rest = url.strip_prefix("data:")?;
    let (mime_type, data) = rest.split_once(";base64,")?;
    Some(Part {
        inline_data: Some(axonhub_protocol::gemini::generate::InlineData {
            mime_type: mime_type.to_string(),
            data: data.to_string(),
        }),
        ..Default::default()
    })
}

pub(crate) fn neutral_from_generate(
    request: &Request,
    wire: GenerateContentResponse,
) -> Response {
    let mut message = Message {
        role: Some(Role::Assistant),
        ..Default::default()
    };
    let mut images = Vec::new();
    let mut text = String::new();
    let mut finish_reason = None;
    for candidate in wire.candidates {
        if let Some(reason) = candidate.finish_reason.as_deref() {
            finish_reason = parse_finish_reason(reason).or(finish_reason);
        }
        for part in candidate.content.parts {
            if let Some(call) = part.function_call {
                message.tool_calls.push(ToolCall {
                    id: call
                        .id
                        .unwrap_or_else(|| format!("call_{}", message.tool_calls.len())),
                    r#type: "function".to_string(),
                    function: FunctionCall {
                        arguments: serde_json::to_string(
                            &call.args.unwrap_or(serde_json::Value::Null),
                        )
                        .unwrap_or_default(),
                        name: call.name,
                    },
                });
                continue;
            }
            if let Some(inline) = part.inline_data {
                images.push(ImageData {
                    b64_json: Some(inline.data),
                    content_type: Some(inline.mime_type),
                    ..Default::default()
                });
                continue;
            }
            if let Some(part_text) = part.text {
                if part.thought.unwrap_or(false) {
                    message
                        .reasoning_content
                        .get_or_insert_with(String::new)
                        .push_str(&part_text);
                    if part.thought_signature.is_some() {
                        message.reasoning_signature = part.thought_signature;
                    }
                } else {
                    text.push_str(&part_text);
                }
            }
        }
    }
    if !text.is_empty() {
        message.content = Some(Content::Single(text));
    }
    let finish_reason = if !message.tool_calls.is_empty() {
        FinishReason::ToolCalls
    } else {
        finish_reason.unwrap_or(FinishReason::Stop)
    };
    Response {
        id: wire.response_id.unwrap_or_default(),
        object: "generate_content_response".to_string(),
        model: wire.model_version.unwrap_or_else(|| request.model.clone()),
        choices: vec![Choice {
            index: 0,
            message: Some(message),
            delta: None,
            finish_reason: Some(finish_reason),
        }],
        usage: wire.usage_metadata.as_ref().map(decode_usage),
        images,
        request_type: request.request_type,
        api_format: request.api_format,
        ..Default::default()
    }
}

/// Gemini stream chunks -> neutral deltas. Tool calls arrive whole.
#[derive(Default)]
pub(crate) struct GeminiStreamDecoder {
    id: String,
    model: String,
    tool_count: u32,
}

impl GeminiStreamDecoder {
    pub(crate) fn push_chunk(&mut self, chunk: GenerateContentResponse) -> Vec<Response> {
        if let Some(id) = chunk.response_id.as_ref() {
            self.id = id.clone();
        }
        if let Some(model) = chunk.model_version.as_ref() {
            self.model = model.clone();
        }
        let mut delta = Delta::default();
        let mut finish = None;
        for candidate in &chunk.candidates {
            if let Some(reason) = candidate.finish_reason.as_deref() {
                finish = parse_finish_reason(reason).or(finish);
            }
            for part in &candidate.content.parts {
                if let Some(call) = part.function_call.as_ref() {
                    let slot = self.tool_count;
                    self.tool_count += 1;
                    delta.tool_calls.push(ToolCallDelta {
                        index: slot,
                        id: Some(
                            call.id.clone().unwrap_or_else(|| format!("call_{slot}")),
                        ),
                        name: Some(call.name.clone()),
                        arguments: Some(
                            serde_json::to_string(
                                &call.args.clone().unwrap_or(serde_json::Value::Null),
                            )
                            .unwrap_or_default(),
                        ),
                    });
                    continue;
                }
                if let Some(inline) = part.inline_data.as_ref() {
                    delta.image_b64 = Some(inline.data.clone());
                    continue;
                }
                if let Some(text) = part.text.as_ref() {
                    if part.thought.unwrap_or(false) {
                        delta
                            .reasoning_content
                            .get_or_insert_with(String::new)
                            .push_str(text);
                    } else {
                        delta
                            .content
                            .get_or_insert_with(String::new)
                            .push_str(text);
                    }
                }
            }
        }
        if finish.is_some() && !delta.tool_calls.is_empty() {
            finish = Some(FinishReason::ToolCalls);
        }
        let empty = delta == Delta::default();
        if empty && finish.is_none() && chunk.usage_metadata.is_none() {
            return Vec::new();
        }
        vec![Response {
            id: self.id.clone(),
            model: self.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: None,
                delta: Some(delta),
                finish_reason: finish,
            }],
            usage: chunk.usage_metadata.as_ref().map(decode_usage),
            ..Default::default()
        }]
    }
}

impl StreamDecoder for GeminiStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<Response>, TransformError> {
        if event.data.trim().is_empty() || event.is_done() {
            return Ok(Vec::new());
        }
        let Ok(chunk) = serde_json::from_str::<GenerateContentResponse>(&event.data) else {
            return Ok(Vec::new());
        };
        Ok(self.push_chunk(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axonhub_model::{ApiFormat, FunctionDef, RequestType, Tool};

    fn chat_request() -> Request {
        Request {
            model: "gemini-2.5-pro".to_string(),
            request_type: Some(RequestType::Chat),
            api_format: Some(ApiFormat::OpenAiChat),
            messages: vec![Message::system("be brief"), Message::user("hi")],
            stream: Some(true),
            reasoning_budget: Some(1024),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stream_url_uses_sse_alt() {
        let outbound = GeminiOutbound::new("https://generativelanguage.googleapis.com", "gk");
        let upstream = outbound.transform_request(&chat_request()).await.unwrap();
        assert_eq!(
            upstream.url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse"
        );
        assert_eq!(upstream.auth, AuthConfig::api_key("x-goog-api-key", "gk"));
        let body: GenerateContentRequest =
            serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
        assert!(body.system_instruction.is_some());
        assert_eq!(
            body.generation_config
                .as_ref()
                .unwrap()
                .thinking_config
                .as_ref()
                .unwrap()
                .thinking_budget,
            Some(1024)
        );
    }

    #[tokio::test]
    async fn tool_schemas_are_sanitized_and_uppercased() {
        let mut request = chat_request();
        request.tools.push(Tool::function(FunctionDef {
            name: "t".to_string(),
            description: None,
            parameters: Some(serde_json::json!({
                "type": "object",
                "properties": {"mode": {"const": "json"}}
            })),
        }));
        request.tool_choice = Some(ToolChoice::Function { name: "t".to_string() });
        let outbound = GeminiOutbound::new("https://generativelanguage.googleapis.com", "gk");
        let upstream = outbound.transform_request(&request).await.unwrap();
        let body: serde_json::Value =
            serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
        let parameters = &body["tools"][0]["functionDeclarations"][0]["parameters"];
        assert_eq!(parameters["type"], "OBJECT");
        assert_eq!(parameters["properties"]["mode"]["enum"], serde_json::json!(["json"]));
        assert_eq!(
            body["toolConfig"]["functionCallingConfig"]["allowedFunctionNames"],
            serde_json::json!(["t"])
        );
    }

    #[tokio::test]
    async fn candidates_unwrap_into_neutral_parts() {
        let outbound = GeminiOutbound::new("https://generativelanguage.googleapis.com", "gk");
        let body = Bytes::from(
            serde_json::json!({
                "candidates": [{"content": {"role": "model", "parts": [
                    {"text": "thinking...", "thought": true},
                    {"text": "Hello"},
                    {"functionCall": {"name": "add", "args": {"a": 1}}}
                ]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 6, "totalTokenCount": 10}
            })
            .to_string(),
        );
        let neutral = outbound
            .transform_response(&chat_request(), 200, &body)
            .await
            .unwrap();
        let message = neutral.first_message().unwrap();
        assert_eq!(message.reasoning_content.as_deref(), Some("thinking..."));
        assert_eq!(
            message.content.as_ref().map(Content::joined_text).unwrap(),
            "Hello"
        );
        assert_eq!(message.tool_calls[0].function.name, "add");
        assert_eq!(neutral.finish_reason(), Some(FinishReason::ToolCalls));
    }

    #[test]
    fn gemini_error_bodies_are_decoded() {
        let outbound = GeminiOutbound::new("https://generativelanguage.googleapis.com", "gk");
        let error = outbound.transform_error(
            429,
            br#"{"error":{"code":429,"message":"quota","status":"RESOURCE_EXHAUSTED"}}"#,
        );
        assert_eq!(error.detail.r#type, "RESOURCE_EXHAUSTED");
    }
}
