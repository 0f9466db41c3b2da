use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use axonhub_core::oauth::{ExchangeStrategy, OAuthTokenProvider};
use axonhub_model::{AuthError, OAuthTokens, TokenGetter};

struct CountingExchange {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl ExchangeStrategy for CountingExchange {
    async fn refresh(&self, current: &OAuthTokens) -> Result<OAuthTokens, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Let concurrent callers pile up behind the refresh lock.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        if self.fail {
            return Err(AuthError::Refresh("exchange rejected".to_string()));
        }
        Ok(OAuthTokens {
            access_token: "fresh-token".to_string(),
            refresh_token: current.refresh_token.clone(),
            expires_at: far_future(),
            ..Default::default()
        })
    }
}

fn far_future() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp() + 3600
}

fn expired_tokens() -> OAuthTokens {
    OAuthTokens {
        access_token: "stale-token".to_string(),
        refresh_token: "rt".to_string(),
        expires_at: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn concurrent_callers_share_one_refresh() {
    let exchange = Arc::new(CountingExchange {
        calls: AtomicUsize::new(0),
        fail: false,
    });
    struct Shared(Arc<CountingExchange>);
    #[async_trait]
    impl ExchangeStrategy for Shared {
        async fn refresh(&self, current: &OAuthTokens) -> Result<OAuthTokens, AuthError> {
            self.0.refresh(current).await
        }
    }

    let provider = Arc::new(OAuthTokenProvider::new(
        expired_tokens(),
        Box::new(Shared(exchange.clone())),
    ));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let provider = provider.clone();
        handles.push(tokio::spawn(async move { provider.get().await }));
    }
    for handle in handles {
        let tokens = handle.await.unwrap().unwrap();
        assert_eq!(tokens.access_token, "fresh-token");
    }
    assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn live_tokens_skip_the_exchange() {
    let provider = OAuthTokenProvider::new(
        OAuthTokens {
            access_token: "live".to_string(),
            refresh_token: "rt".to_string(),
            expires_at: far_future(),
            ..Default::default()
        },
        Box::new(CountingExchange {
            calls: AtomicUsize::new(0),
            fail: true,
        }),
    );
    let tokens = provider.get().await.unwrap();
    assert_eq!(tokens.access_token, "live");
}

#[tokio::test]
async fn refresh_failure_is_surfaced_not_swallowed() {
    let provider = OAuthTokenProvider::new(
        expired_tokens(),
        Box::new(CountingExchange {
            calls: AtomicUsize::new(0),
            fail: true,
        }),
    );
    let err = provider.get().await.unwrap_err();
    assert!(matches!(err, AuthError::Refresh(_)));
}

#[tokio::test]
async fn refresh_hook_sees_the_new_tokens() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
    let seen_in_hook = seen.clone();
    let provider = OAuthTokenProvider::new(
        expired_tokens(),
        Box::new(CountingExchange {
            calls: AtomicUsize::new(0),
            fail: false,
        }),
    )
    .with_refresh_hook(Box::new(move |tokens| {
        seen_in_hook.lock().unwrap().push(tokens.access_token.clone());
    }));
    provider.get().await.unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), ["fresh-token"]);
}
