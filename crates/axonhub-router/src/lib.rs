//! Thin axum ingress: maps each public endpoint to its inbound wire format
//! and hands the raw request to the pipeline.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::Response as AxumResponse;
use axum::routing::post;
use bytes::Bytes;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;

use axonhub_core::{Pipeline, PipelineOutcome};
use axonhub_model::{ApiFormat, RawRequest};

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub struct AppState {
    pub pipeline: Pipeline,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(responses))
        .route("/v1/messages", post(messages))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/rerank", post(rerank))
        .route("/v1/images/generations", post(images))
        .route("/v1beta/models/{model_action}", post(gemini))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
) -> AxumResponse {
    dispatch(state, ApiFormat::OpenAiChat, request).await
}

async fn responses(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
) -> AxumResponse {
    dispatch(state, ApiFormat::OpenAiResponses, request).await
}

async fn messages(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
) -> AxumResponse {
    dispatch(state, ApiFormat::Claude, request).await
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
) -> AxumResponse {
    let (parts, body) = request.into_parts();
    let Ok(body) = axum::body::to_bytes(body, MAX_BODY_BYTES).await else {
        return simple_error(StatusCode::BAD_REQUEST, "request body unreadable");
    };
    // The Jina dialect is recognized by its `task` knob.
    let format = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|value| value.get("task").cloned())
        .map_or(ApiFormat::OpenAiEmbeddings, |_| ApiFormat::JinaEmbeddings);
    run(state, format, raw_from(parts, body)).await
}

async fn rerank(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
) -> AxumResponse {
    dispatch(state, ApiFormat::JinaRerank, request).await
}

async fn images(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
) -> AxumResponse {
    dispatch(state, ApiFormat::OpenAiImageGeneration, request).await
}

async fn gemini(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
) -> AxumResponse {
    dispatch(state, ApiFormat::Gemini, request).await
}

async fn dispatch(
    state: Arc<AppState>,
    format: ApiFormat,
    request: axum::extract::Request,
) -> AxumResponse {
    let (parts, body) = request.into_parts();
    let Ok(body) = axum::body::to_bytes(body, MAX_BODY_BYTES).await else {
        return simple_error(StatusCode::BAD_REQUEST, "request body unreadable");
    };
    run(state, format, raw_from(parts, body)).await
}

fn raw_from(parts: axum::http::request::Parts, body: Bytes) -> RawRequest {
    RawRequest {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect(),
        body,
    }
}

async fn run(state: Arc<AppState>, format: ApiFormat, raw: RawRequest) -> AxumResponse {
    match state.pipeline.handle(format, raw).await {
        PipelineOutcome::Unary(rendered) => {
            let mut builder = AxumResponse::builder().status(rendered.status);
            for (name, value) in &rendered.headers {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::try_from(name.as_str()),
                    HeaderValue::try_from(value.as_str()),
                ) {
                    builder = builder.header(name, value);
                }
            }
            builder
                .body(Body::from(rendered.body))
                .unwrap_or_else(|err| {
                    error!(error = %err, "response build failed");
                    simple_error(StatusCode::INTERNAL_SERVER_ERROR, "response build failed")
                })
        }
        PipelineOutcome::Stream {
            content_type,
            frames,
        } => {
            let stream = ReceiverStream::new(frames).map(Ok::<Bytes, Infallible>);
            AxumResponse::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|err| {
                    error!(error = %err, "stream response build failed");
                    simple_error(StatusCode::INTERNAL_SERVER_ERROR, "response build failed")
                })
        }
    }
}

fn simple_error(status: StatusCode, message: &str) -> AxumResponse {
    let body = serde_json::json!({
        "error": {"message": message, "type": "invalid_request_error"}
    });
    AxumResponse::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("static error response")
}
