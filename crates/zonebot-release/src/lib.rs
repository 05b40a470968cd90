//! Zonebot Release Coordinator
//!
//! Notifies one or more external quarantine services that a user should be
//! released, with per-call timeout, bounded retry for transient failures,
//! result memoization, and a circuit breaker in front of the whole path.
//! Failure is never fatal to the caller.

pub mod breaker;

pub use breaker::{BreakerState, CircuitBreaker};

use reqwest::{Client, ClientBuilder, StatusCode};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use zonebot_cache::{keys, TtlCache};
use zonebot_config::ReleaseConfig;

#[derive(Debug, Error)]
pub enum ReleaseFailure {
    /// Timeouts, 429, 5xx, connection resets: worth retrying.
    #[error("transient: {0}")]
    Transient(String),
    /// Auth failures, malformed requests, unknown chat/user: retrying
    /// cannot help.
    #[error("permanent: {0}")]
    Permanent(String),
}

/// One resolved fan-out destination.
#[derive(Debug, Clone)]
struct ReleaseTarget {
    label: String,
    base_url: String,
    secret: String,
}

pub struct ReleaseCoordinator {
    client: Client,
    config: ReleaseConfig,
    cache: Arc<TtlCache>,
    breaker: Mutex<CircuitBreaker>,
}

impl ReleaseCoordinator {
    pub fn new(config: ReleaseConfig, cache: Arc<TtlCache>) -> Self {
        let client = ClientBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        let breaker = Mutex::new(CircuitBreaker::new(
            config.breaker_threshold,
            Duration::from_secs(config.breaker_cooldown_secs),
        ));

        Self {
            client,
            config,
            cache,
            breaker,
        }
    }

    /// Ask every configured quarantine target to release the user. Returns
    /// true when at least one target confirmed. The breaker counts one
    /// outcome per outer call, not per retry attempt.
    pub async fn release(&self, user_id: i64) -> bool {
        if !self.acquire_breaker() {
            warn!("Release for user {} skipped: circuit breaker open", user_id);
            return false;
        }

        let cache_key = keys::release(user_id);
        if let Some(cached) = self.cache.get_json::<bool>(&cache_key) {
            self.cancel_breaker();
            debug!("Release for user {} served from cache: {}", user_id, cached);
            return cached;
        }

        let targets = self.targets();
        if targets.is_empty() {
            self.cancel_breaker();
            debug!("No release targets configured; skipping user {}", user_id);
            return false;
        }

        let success = if targets.len() == 1 {
            self.call_with_retry(&targets[0], user_id).await
        } else {
            self.fan_out(&targets, user_id).await
        };

        self.cache
            .set_json(&cache_key, &success, self.config.result_ttl_secs);
        self.record_breaker(success);

        if success {
            info!("User {} released from quarantine", user_id);
        } else {
            warn!("Release failed for user {} on all targets", user_id);
        }
        success
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker
            .lock()
            .map(|b| b.state())
            .unwrap_or(BreakerState::Closed)
    }

    fn acquire_breaker(&self) -> bool {
        self.breaker.lock().map(|mut b| b.try_acquire()).unwrap_or(true)
    }

    fn cancel_breaker(&self) {
        if let Ok(mut breaker) = self.breaker.lock() {
            breaker.cancel();
        }
    }

    fn record_breaker(&self, success: bool) {
        if let Ok(mut breaker) = self.breaker.lock() {
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
    }

    fn targets(&self) -> Vec<ReleaseTarget> {
        let default_secret = self.config.secret_key.clone().unwrap_or_default();
        let mut targets = Vec::new();

        for peer in self.config.quarantine_peers() {
            targets.push(ReleaseTarget {
                label: peer.id.clone(),
                base_url: normalize_target_url(&peer.url),
                secret: peer.secret.clone().unwrap_or_else(|| default_secret.clone()),
            });
        }

        if let Some(base_url) = self.config.base_url.as_deref() {
            let base_url = base_url.trim();
            if !base_url.is_empty() {
                targets.push(ReleaseTarget {
                    label: "primary".to_string(),
                    base_url: normalize_target_url(base_url),
                    secret: default_secret,
                });
            }
        }

        targets
    }

    /// Single-target path: up to `retry_attempts` tries with capped-linear
    /// backoff, but only for transiently-classified failures.
    async fn call_with_retry(&self, target: &ReleaseTarget, user_id: i64) -> bool {
        for attempt in 1..=self.config.retry_attempts {
            match self.call_target(target, user_id).await {
                Ok(()) => return true,
                Err(ReleaseFailure::Permanent(reason)) => {
                    warn!(
                        "Release target {} rejected user {} permanently: {}",
                        target.label, user_id, reason
                    );
                    return false;
                }
                Err(ReleaseFailure::Transient(reason)) => {
                    warn!(
                        "Release target {} attempt {}/{} failed for user {}: {}",
                        target.label, attempt, self.config.retry_attempts, user_id, reason
                    );
                    if attempt < self.config.retry_attempts {
                        let backoff = Duration::from_secs((attempt as u64).min(2));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        false
    }

    /// Multi-target path: every target is tried exactly once, in parallel;
    /// one target failing never aborts the others.
    async fn fan_out(&self, targets: &[ReleaseTarget], user_id: i64) -> bool {
        let mut set = JoinSet::new();

        for target in targets {
            let client = self.client.clone();
            let target = target.clone();
            let self_bot_id = self.config.self_bot_id.clone();
            set.spawn(async move {
                let outcome = call_release_endpoint(&client, &target, user_id, &self_bot_id).await;
                (target.label, outcome)
            });
        }

        let mut any_success = false;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((label, Ok(()))) => {
                    debug!("Release target {} confirmed user {}", label, user_id);
                    any_success = true;
                }
                Ok((label, Err(err))) => {
                    warn!("Release target {} failed for user {}: {}", label, user_id, err);
                }
                Err(err) => {
                    warn!("Release fan-out task panicked: {}", err);
                }
            }
        }
        any_success
    }

    async fn call_target(
        &self,
        target: &ReleaseTarget,
        user_id: i64,
    ) -> Result<(), ReleaseFailure> {
        call_release_endpoint(&self.client, target, user_id, &self.config.self_bot_id).await
    }
}

async fn call_release_endpoint(
    client: &Client,
    target: &ReleaseTarget,
    user_id: i64,
    self_bot_id: &str,
) -> Result<(), ReleaseFailure> {
    let url = format!("{}/api/release-user", target.base_url);
    let body = serde_json::json!({
        "userId": user_id,
        "secretKey": target.secret,
        "sourceBot": self_bot_id,
    });

    let resp = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(classify_request_error)?;

    let status = resp.status();
    if !status.is_success() {
        return Err(classify_status(status));
    }

    let payload: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| ReleaseFailure::Transient(format!("response decode failed: {}", e)))?;

    if body_indicates_success(&payload) {
        Ok(())
    } else {
        Err(ReleaseFailure::Permanent(format!(
            "no affirmative success flag in response: {}",
            payload
        )))
    }
}

fn classify_request_error(err: reqwest::Error) -> ReleaseFailure {
    // Timeouts, resets, and connect errors are all transient network noise.
    ReleaseFailure::Transient(err.to_string())
}

fn classify_status(status: StatusCode) -> ReleaseFailure {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ReleaseFailure::Transient(format!("HTTP {}", status))
    } else {
        ReleaseFailure::Permanent(format!("HTTP {}", status))
    }
}

/// Success is reported via a truthy `success` flag; some peer revisions
/// shorten the key to `s`.
fn body_indicates_success(payload: &serde_json::Value) -> bool {
    let flag = payload.get("success").or_else(|| payload.get("s"));
    match flag {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(serde_json::Value::String(s)) => !s.is_empty() && s != "false" && s != "0",
        _ => false,
    }
}

/// Prepend https:// to schemeless URLs and strip trailing slashes.
pub fn normalize_target_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let normalized = with_scheme.trim_end_matches('/').to_string();
    if url::Url::parse(&normalized).is_err() {
        warn!("Release target URL '{}' does not parse cleanly", raw);
    }
    normalized
}
