//! Cross-format properties: decode with one inbound transformer, encode
//! with another provider's outbound, and check the semantics survive.

use std::sync::Arc;

use bytes::Bytes;

use axonhub_model::{ApiFormat, AuthError, OAuthTokens, RawRequest, TokenGetter};
use axonhub_protocol::sse::SseEvent;
use axonhub_transform::inbound::inbound_for;
use axonhub_transform::outbound::claude::{AnthropicOutbound, ClaudeAuth};
use axonhub_transform::outbound::gemini::GeminiOutbound;
use axonhub_transform::outbound::openai::{OpenAiOutbound, OpenAiWire};
use axonhub_transform::OutboundTransformer;

fn raw(path: &str, body: serde_json::Value) -> RawRequest {
    RawRequest {
        method: "POST".to_string(),
        path: path.to_string(),
        query: None,
        headers: Vec::new(),
        body: Bytes::from(serde_json::to_vec(&body).unwrap()),
    }
}

struct StaticToken;

#[async_trait::async_trait]
impl TokenGetter for StaticToken {
    async fn get(&self) -> Result<OAuthTokens, AuthError> {
        Ok(OAuthTokens {
            access_token: "sk-ant-oat01-test".to_string(),
            ..Default::default()
        })
    }
}

#[tokio::test]
async fn responses_request_lands_as_anthropic_thinking_call() {
    let inbound = inbound_for(ApiFormat::OpenAiResponses);
    let request = inbound
        .transform_request(&raw(
            "/v1/responses",
            serde_json::json!({
                "model": "claude-3-5-sonnet",
                "input": "Hi",
                "reasoning": {"effort": "high"}
            }),
        ))
        .unwrap();
    assert_eq!(request.model, "claude-3-5-sonnet");
    assert_eq!(request.reasoning_effort.as_deref(), Some("high"));

    let outbound = AnthropicOutbound::new(
        "https://api.anthropic.com",
        ClaudeAuth::ApiKey("sk-ant-x".to_string()),
    );
    let upstream = outbound.transform_request(&request).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
    assert_eq!(body["model"], "claude-3-5-sonnet");
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(body["messages"][0]["content"][0]["text"], "Hi");
    assert_eq!(body["thinking"]["type"], "enabled");
    assert!(body["thinking"]["budget_tokens"].as_u64().unwrap() > 0);
    assert!(body["max_tokens"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn chat_round_trip_preserves_order_and_tool_call_ids() {
    let inbound = inbound_for(ApiFormat::OpenAiChat);
    let request = inbound
        .transform_request(&raw(
            "/v1/chat/completions",
            serde_json::json!({
                "model": "gpt-4o",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "add 1 and 2"},
                    {"role": "assistant", "tool_calls": [
                        {"id": "call_7", "type": "function",
                         "function": {"name": "add", "arguments": "{\"a\":1,\"b\":2}"}}
                    ]},
                    {"role": "tool", "content": "3", "tool_call_id": "call_7"}
                ],
                "tools": [
                    {"type": "function", "function": {"name": "add", "parameters": {"type": "object"}}},
                    {"type": "function", "function": {"name": "sub", "parameters": {"type": "object"}}}
                ]
            }),
        ))
        .unwrap();

    let outbound = OpenAiOutbound::new("https://api.openai.com", "sk-test");
    let upstream = outbound.transform_request(&request).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
    let roles: Vec<&str> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|message| message["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["system", "user", "assistant", "tool"]);
    assert_eq!(body["messages"][2]["tool_calls"][0]["id"], "call_7");
    assert_eq!(body["messages"][3]["tool_call_id"], "call_7");
    let tool_names: Vec<&str> = body["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|tool| tool["function"]["name"].as_str().unwrap())
        .collect();
    assert_eq!(tool_names, vec!["add", "sub"]);
}

#[tokio::test]
async fn gemini_client_reaches_anthropic_upstream() {
    let inbound = inbound_for(ApiFormat::Gemini);
    let request = inbound
        .transform_request(&raw(
            "/v1beta/models/claude-3-5-sonnet:generateContent",
            serde_json::json!({
                "contents": [{"role": "user", "parts": [{"text": "hello"}]}],
                "systemInstruction": {"parts": [{"text": "terse"}]}
            }),
        ))
        .unwrap();
    let outbound = AnthropicOutbound::new(
        "https://api.anthropic.com",
        ClaudeAuth::Bearer("sk-ant-oat01-test".to_string()),
    );
    let upstream = outbound.transform_request(&request).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
    assert_eq!(body["system"][0]["text"], "terse");
    assert_eq!(body["messages"][0]["content"][0]["text"], "hello");
}

#[tokio::test]
async fn claude_client_reaches_gemini_upstream() {
    let inbound = inbound_for(ApiFormat::Claude);
    let request = inbound
        .transform_request(&raw(
            "/v1/messages",
            serde_json::json!({
                "model": "gemini-2.5-pro",
                "max_tokens": 256,
                "messages": [{"role": "user", "content": "hello"}],
                "tools": [{"name": "lookup", "input_schema": {
                    "type": "object",
                    "properties": {"q": {"type": "string"}}
                }}]
            }),
        ))
        .unwrap();
    let outbound = GeminiOutbound::new("https://generativelanguage.googleapis.com", "gk");
    let upstream = outbound.transform_request(&request).await.unwrap();
    assert!(upstream.url.contains("models/gemini-2.5-pro:generateContent"));
    let body: serde_json::Value = serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
    assert_eq!(body["contents"][0]["parts"][0]["text"], "hello");
    let declaration = &body["tools"][0]["functionDeclarations"][0];
    assert_eq!(declaration["name"], "lookup");
    assert_eq!(declaration["parameters"]["type"], "OBJECT");
    assert_eq!(
        body["generationConfig"]["maxOutputTokens"].as_u64().unwrap(),
        256
    );
}

#[tokio::test]
async fn rendering_the_same_upstream_body_twice_is_identical() {
    let upstream_body = Bytes::from(
        serde_json::json!({
            "id": "msg_1", "type": "message", "role": "assistant", "model": "claude-3-5-sonnet",
            "content": [
                {"type": "thinking", "thinking": "let me see", "signature": "sig"},
                {"type": "text", "text": "Hello"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 4, "output_tokens": 2}
        })
        .to_string(),
    );
    let inbound = inbound_for(ApiFormat::Claude);
    let outbound = AnthropicOutbound::new(
        "https://api.anthropic.com",
        ClaudeAuth::ApiKey("sk-ant-x".to_string()),
    );
    let request = inbound
        .transform_request(&raw(
            "/v1/messages",
            serde_json::json!({
                "model": "claude-3-5-sonnet", "max_tokens": 64,
                "messages": [{"role": "user", "content": "hi"}]
            }),
        ))
        .unwrap();

    let first = outbound
        .transform_response(&request, 200, &upstream_body)
        .await
        .unwrap();
    let second = outbound
        .transform_response(&request, 200, &upstream_body)
        .await
        .unwrap();
    let rendered_first = inbound.transform_response(&first).unwrap();
    let rendered_second = inbound.transform_response(&second).unwrap();
    assert_eq!(rendered_first.body, rendered_second.body);

    let body: serde_json::Value = serde_json::from_slice(&rendered_first.body).unwrap();
    assert_eq!(body["content"][0]["type"], "thinking");
    assert_eq!(body["content"][1]["text"], "Hello");
    assert_eq!(body["usage"]["input_tokens"], 4);
}

#[tokio::test]
async fn aggregating_a_responses_stream_matches_the_unary_decode() {
    let completed = serde_json::json!({
        "id": "resp_9", "object": "response", "created_at": 8,
        "status": "completed", "model": "gpt-4o",
        "output": [{"type": "message", "id": "msg_9", "role": "assistant", "status": "completed",
            "content": [{"type": "output_text", "text": "Hello"}]}],
        "usage": {"input_tokens": 1, "output_tokens": 1, "total_tokens": 2}
    });
    let events: Vec<SseEvent> = [
        serde_json::json!({"type": "response.created", "response": {
            "id": "resp_9", "object": "response", "created_at": 8,
            "status": "in_progress", "model": "gpt-4o", "output": []
        }}),
        serde_json::json!({"type": "response.output_text.delta", "output_index": 0, "content_index": 0, "delta": "He"}),
        serde_json::json!({"type": "response.output_text.delta", "output_index": 0, "content_index": 0, "delta": "llo"}),
        serde_json::json!({"type": "response.completed", "response": completed}),
    ]
    .iter()
    .map(|event| SseEvent::data(event.to_string()))
    .collect();

    let outbound =
        OpenAiOutbound::new("https://api.openai.com", "sk-test").with_wire(OpenAiWire::Responses);
    let request = inbound_for(ApiFormat::OpenAiResponses)
        .transform_request(&raw(
            "/v1/responses",
            serde_json::json!({"model": "gpt-4o", "input": "Hi"}),
        ))
        .unwrap();

    let (aggregated, meta) = outbound.aggregate_stream(&request, &events).unwrap();
    let unary_body = Bytes::from(completed.to_string());
    let from_stream = outbound
        .transform_response(&request, 200, &aggregated)
        .await
        .unwrap();
    let from_unary = outbound
        .transform_response(&request, 200, &unary_body)
        .await
        .unwrap();

    assert_eq!(from_stream.first_message(), from_unary.first_message());
    assert_eq!(from_stream.usage, from_unary.usage);
    assert_eq!(meta.id, "resp_9");
    assert_eq!(meta.usage.as_ref().unwrap().total_tokens, 2);
}

#[tokio::test]
async fn claude_code_over_gemini_wire_strips_prefixes_end_to_end() {
    use axonhub_transform::outbound::claudecode::ClaudeCodeOutbound;

    // A plain OpenAI chat client calls a claude-code channel.
    let inbound = inbound_for(ApiFormat::OpenAiChat);
    let mut request = inbound
        .transform_request(&raw(
            "/v1/chat/completions",
            serde_json::json!({
                "model": "claude-sonnet-4-5",
                "messages": [{"role": "user", "content": "ls"}],
                "tools": [{"type": "function", "function": {"name": "bash", "parameters": {"type": "object"}}}]
            }),
        ))
        .unwrap();
    request.raw_request = Some(RawRequest {
        headers: vec![("user-agent".to_string(), "curl/8.1".to_string())],
        ..Default::default()
    });

    let outbound = ClaudeCodeOutbound::new("https://api.anthropic.com", Arc::new(StaticToken));
    let upstream = outbound.transform_request(&request).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
    assert_eq!(body["tools"][0]["name"], "proxy_bash");

    // The upstream answers with the prefixed name; the client never sees it.
    let upstream_body = Bytes::from(
        serde_json::json!({
            "id": "msg_2", "type": "message", "role": "assistant", "model": "claude-sonnet-4-5",
            "content": [{"type": "tool_use", "id": "toolu_1", "name": "proxy_bash", "input": {}}],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 2, "output_tokens": 2}
        })
        .to_string(),
    );
    let neutral = outbound
        .transform_response(&request, 200, &upstream_body)
        .await
        .unwrap();
    assert_eq!(
        neutral.first_message().unwrap().tool_calls[0].function.name,
        "bash"
    );
    let rendered = inbound.transform_response(&neutral).unwrap();
    let body: serde_json::Value = serde_json::from_slice(&rendered.body).unwrap();
    assert_eq!(
        body["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
        "bash"
    );
}
