//! Gateway core: the pipeline executor and the infrastructure it stands on
//! (HTTP transport, streaming plumbing, OAuth token cache, channel store,
//! cache capability).

pub mod cache;
pub mod channel;
pub mod http;
pub mod oauth;
pub mod pipeline;
pub mod stream;

pub use cache::{Cache, CacheError, MemoryCache, NoopCache};
pub use channel::{
    AntigravityRouting, Channel, ChannelCredential, ChannelFileLoader, ChannelStore, Provider,
};
pub use http::{HttpClientConfig, WreqExecutor};
pub use oauth::{ExchangeStrategy, OAuthTokenProvider, RefreshTokenExchange};
pub use pipeline::{Pipeline, PipelineOutcome};
pub use stream::{EventStream, SseEventStream};
