//! The protocol-neutral data model and the shared gateway contracts.
//!
//! Inbound transformers decode client requests into [`Request`]; outbound
//! transformers re-encode it for a provider and map the provider's answer
//! back into [`Response`]. Everything between the two edges speaks only
//! these types.

pub mod auth;
pub mod error;
pub mod message;
pub mod request;
pub mod response;
pub mod upstream;

pub use auth::{AuthError, OAuthTokens, TokenGetter};
pub use error::{ErrorDetail, GatewayError, ResponseError};
pub use message::{
    CacheControl, Content, ContentPart, FunctionDef, Message, Role, Tool, ToolCall, ToolChoice,
};
pub use request::{
    ApiFormat, EmbeddingParams, ImageParams, RawRequest, RerankParams, Request, RequestType,
    TransformOptions, meta_keys,
};
pub use response::{
    Choice, Delta, EmbeddingData, FinishReason, ImageData, RerankScore, Response, ResponseMeta,
    ToolCallDelta, Usage,
};
pub use upstream::{
    AuthConfig, Headers, HttpExecutor, HttpMethod, UpstreamBody, UpstreamFailure, UpstreamRequest,
    UpstreamResponse, TransportErrorKind, header_get, header_remove, header_set,
};
