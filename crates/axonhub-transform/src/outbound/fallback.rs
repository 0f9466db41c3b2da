//! Endpoint fallback for providers that expose several interchangeable
//! endpoints behind one logical API. Routes around per-endpoint quota
//! exhaustion while keeping per-model isolation: a cooldown on
//! `(model A, endpoint X)` never affects model B.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use axonhub_model::{
    HttpExecutor, TransportErrorKind, UpstreamFailure, UpstreamRequest, UpstreamResponse,
};

/// Meta key carrying the routing model name on the upstream request.
pub const MODEL_META_KEY: &str = "antigravity_model";

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
const DEFAULT_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct FailureEntry {
    last_failed_at: Instant,
    status_code: u16,
    cooldown_until: Instant,
}

/// Per-(model, endpoint) failure bookkeeping.
///
/// One lock guards the table; reads take it shared, mutation exclusive.
/// Entries expire lazily: any read older than the TTL evicts.
#[derive(Debug)]
pub struct HealthTracker {
    entries: RwLock<HashMap<(String, String), FailureEntry>>,
    cooldown: Duration,
    ttl: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthStats {
    pub total_entries: usize,
    pub in_cooldown: usize,
    pub expired: usize,
    /// `model|endpoint` -> seconds until the cooldown lifts.
    pub cooldown_entries: BTreeMap<String, u64>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN, DEFAULT_TTL)
    }
}

impl HealthTracker {
    pub fn new(cooldown: Duration, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cooldown,
            ttl,
        }
    }

    pub fn should_skip(&self, model: &str, endpoint: &str) -> bool {
        let key = (model.to_string(), endpoint.to_string());
        let now = Instant::now();
        let expired = {
            let entries = self.entries.read().expect("health tracker lock poisoned");
            match entries.get(&key) {
                None => return false,
                Some(entry) if now.duration_since(entry.last_failed_at) > self.ttl => true,
                Some(entry) => return now < entry.cooldown_until,
            }
        };
        if expired {
            self.entries
                .write()
                .expect("health tracker lock poisoned")
                .remove(&key);
        }
        false
    }

    pub fn record_failure(&self, model: &str, endpoint: &str, status_code: u16) {
        let now = Instant::now();
        self.entries
            .write()
            .expect("health tracker lock poisoned")
            .insert(
                (model.to_string(), endpoint.to_string()),
                FailureEntry {
                    last_failed_at: now,
                    status_code,
                    cooldown_until: now + self.cooldown,
                },
            );
    }

    pub fn record_success(&self, model: &str, endpoint: &str) {
        self.entries
            .write()
            .expect("health tracker lock poisoned")
            .remove(&(model.to_string(), endpoint.to_string()));
    }

    pub fn get_failure(&self, model: &str, endpoint: &str) -> Option<u16> {
        self.entries
            .read()
            .expect("health tracker lock poisoned")
            .get(&(model.to_string(), endpoint.to_string()))
            .map(|entry| entry.status_code)
    }

    pub fn stats(&self) -> HealthStats {
        let now = Instant::now();
        let entries = self.entries.read().expect("health tracker lock poisoned");
        let mut stats = HealthStats {
            total_entries: entries.len(),
            ..Default::default()
        };
        for ((model, endpoint), entry) in entries.iter() {
            if now.duration_since(entry.last_failed_at) > self.ttl {
                stats.expired += 1;
            } else if now < entry.cooldown_until {
                stats.in_cooldown += 1;
                stats.cooldown_entries.insert(
                    format!("{model}|{endpoint}"),
                    entry.cooldown_until.duration_since(now).as_secs(),
                );
            }
        }
        stats
    }
}

fn retryable_status(status: u16) -> bool {
    matches!(status, 429 | 403 | 404) || (500..600).contains(&status)
}

/// Wraps an inner executor with ordered-endpoint retry.
pub struct EndpointFallbackExecutor {
    endpoints: Vec<String>,
    tracker: Arc<HealthTracker>,
    inner: Arc<dyn HttpExecutor>,
}

impl EndpointFallbackExecutor {
    pub fn new(
        endpoints: Vec<String>,
        tracker: Arc<HealthTracker>,
        inner: Arc<dyn HttpExecutor>,
    ) -> Self {
        Self {
            endpoints,
            tracker,
            inner,
        }
    }

    fn available_endpoints(&self, model: &str) -> Vec<&str> {
        self.endpoints
            .iter()
            .map(String::as_str)
            .filter(|endpoint| !self.tracker.should_skip(model, endpoint))
            .collect()
    }
}

#[async_trait]
impl HttpExecutor for EndpointFallbackExecutor {
    async fn execute(
        &self,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamFailure> {
        let model = request.meta_get(MODEL_META_KEY).unwrap_or("").to_string();
        let available = self.available_endpoints(&model);
        if available.is_empty() {
            return Err(UpstreamFailure::Transport {
                kind: TransportErrorKind::Other,
                message: format!("all endpoints in cooldown for model {model}"),
            });
        }

        let mut last: Option<Result<UpstreamResponse, UpstreamFailure>> = None;
        for (attempt, endpoint) in available.iter().enumerate() {
            let attempt_request = request.with_base_url(endpoint);
            match self.inner.execute(attempt_request).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    self.tracker.record_success(&model, endpoint);
                    if attempt > 0 {
                        debug!(%model, %endpoint, attempt, "endpoint fallback succeeded");
                    }
                    return Ok(response);
                }
                Ok(response) if retryable_status(response.status) => {
                    warn!(
                        %model,
                        %endpoint,
                        status = response.status,
                        "endpoint unavailable, trying next"
                    );
                    self.tracker.record_failure(&model, endpoint, response.status);
                    last = Some(Ok(response));
                }
                Ok(response) => return Ok(response),
                Err(failure) => {
                    if request.is_stream && failure.status().is_none() {
                        // No status to judge by mid-handshake: move on.
                        warn!(%model, %endpoint, "transport failure on stream, trying next");
                        last = Some(Err(failure));
                        continue;
                    }
                    return Err(failure);
                }
            }
        }
        last.unwrap_or(Err(UpstreamFailure::Transport {
            kind: TransportErrorKind::Other,
            message: format!("all endpoints exhausted for model {model}"),
        }))
    }
}
