//! Core rate limiter implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::decision::{CheckOutcome, RateLimitResult};
use super::identifier::{IdentityPolicy, Identifier, RequestContext};
use super::profile::RateLimitConfig;
use super::store::{CounterStore, StoreError, WindowCounter};

/// Fixed-window rate limiter over a shared counter store.
///
/// The limiter itself holds no counters; all state lives in the store, so
/// it can be cloned into any number of request handlers.
#[derive(Clone)]
pub struct RateLimiter {
    /// Where the window counters live
    store: Arc<dyn CounterStore>,
    /// How identifiers are derived from requests
    policy: IdentityPolicy,
    /// Upper bound on a single store call
    timeout: Option<Duration>,
}

impl RateLimiter {
    /// Create a rate limiter over the given store.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            policy: IdentityPolicy::default(),
            timeout: None,
        }
    }

    /// Use a custom identity policy.
    pub fn with_identity_policy(mut self, policy: IdentityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Treat store calls slower than `timeout` as failures.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The identity policy in use.
    pub fn identity_policy(&self) -> &IdentityPolicy {
        &self.policy
    }

    /// Derive the identifier a request is counted under.
    pub fn identify<C>(&self, ctx: &C, config: &RateLimitConfig) -> Identifier
    where
        C: RequestContext + ?Sized,
    {
        Identifier::resolve(ctx, config.use_user_id, &self.policy)
    }

    /// Count the request and decide whether it may proceed.
    ///
    /// Never fails: if the store cannot be reached the request is allowed.
    pub async fn check_rate_limit<C>(&self, ctx: &C, config: &RateLimitConfig) -> RateLimitResult
    where
        C: RequestContext + Sync + ?Sized,
    {
        self.check(ctx, config).await.into_result()
    }

    /// Same as [`RateLimiter::check_rate_limit`].
    pub async fn rate_limit<C>(&self, ctx: &C, config: &RateLimitConfig) -> RateLimitResult
    where
        C: RequestContext + Sync + ?Sized,
    {
        self.check_rate_limit(ctx, config).await
    }

    /// Count the request, reporting whether the store took part in the decision.
    pub async fn check<C>(&self, ctx: &C, config: &RateLimitConfig) -> CheckOutcome
    where
        C: RequestContext + Sync + ?Sized,
    {
        let identifier = self.identify(ctx, config);
        self.check_identifier(&identifier, config).await
    }

    /// Count one request for an already derived identifier.
    #[tracing::instrument(skip(self, config), fields(prefix = %config.key_prefix))]
    pub async fn check_identifier(
        &self,
        identifier: &Identifier,
        config: &RateLimitConfig,
    ) -> CheckOutcome {
        let window = Duration::from_secs(config.window_seconds);

        if config.max_requests == 0 {
            debug!(identifier = %identifier, "Zero-quota profile, rejecting");
            return CheckOutcome::Enforced(RateLimitResult {
                allowed: false,
                remaining: 0,
                limit: 0,
                reset_at: expiry_secs(Utc::now(), window),
            });
        }

        let key = config.key_for(identifier.as_str());

        // The clock is read after the store answers so that the TTL is never
        // counted from an earlier instant than the store measured it.
        match self.call(self.store.increment(&key, window)).await {
            Ok(counter) => {
                let result = decide(counter, config, Utc::now());
                trace!(
                    key = %key,
                    count = counter.count,
                    remaining = result.remaining,
                    "Rate limit counted"
                );
                if !result.allowed {
                    debug!(
                        key = %key,
                        count = counter.count,
                        limit = config.max_requests,
                        "Rate limit exceeded"
                    );
                }
                CheckOutcome::Enforced(result)
            }
            Err(error) => {
                warn!(key = %key, error = %error, "Rate limit store failed, allowing request");
                CheckOutcome::FailedOpen {
                    result: RateLimitResult {
                        allowed: true,
                        remaining: config.max_requests.saturating_sub(1),
                        limit: config.max_requests,
                        reset_at: expiry_secs(Utc::now(), window),
                    },
                    error,
                }
            }
        }
    }

    /// Drop the counter for an identifier, starting a fresh window.
    ///
    /// Store failures are logged and swallowed; see
    /// [`RateLimiter::try_reset_rate_limit`] to observe them.
    pub async fn reset_rate_limit(&self, identifier: &str, key_prefix: &str) {
        if let Err(error) = self.try_reset_rate_limit(identifier, key_prefix).await {
            warn!(
                identifier = %identifier,
                prefix = %key_prefix,
                error = %error,
                "Failed to reset rate limit"
            );
        }
    }

    /// Drop the counter for an identifier, reporting store failures.
    #[tracing::instrument(skip(self))]
    pub async fn try_reset_rate_limit(
        &self,
        identifier: &str,
        key_prefix: &str,
    ) -> Result<(), StoreError> {
        let key = format!("{}:{}", key_prefix, identifier);
        self.call(self.store.delete(&key)).await?;
        debug!(key = %key, "Rate limit reset");
        Ok(())
    }

    /// Inspect an identifier's window without counting a request.
    ///
    /// `allowed` tells whether one more request would pass. Returns `None`
    /// when the store cannot answer.
    #[tracing::instrument(skip(self, config), fields(prefix = %config.key_prefix))]
    pub async fn get_rate_limit_status(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
    ) -> Option<RateLimitResult> {
        let key = config.key_for(identifier);

        let counter = match self.call(self.store.peek(&key)).await {
            Ok(counter) => counter,
            Err(error) => {
                warn!(key = %key, error = %error, "Rate limit status unavailable");
                return None;
            }
        };

        let now = Utc::now();
        let max = u64::from(config.max_requests);
        let (count, reset_at) = match counter {
            Some(counter) => (counter.count, expiry_secs(now, counter.ttl)),
            None => (0, now.timestamp()),
        };

        Some(RateLimitResult {
            allowed: count < max,
            remaining: max.saturating_sub(count) as u32,
            limit: config.max_requests,
            reset_at,
        })
    }

    /// Run a store call under the configured timeout.
    async fn call<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| StoreError::Timeout(limit))?,
            None => fut.await,
        }
    }
}

/// Turn a freshly incremented counter into a decision. The request that
/// pushes the count past the limit is the first one rejected.
fn decide(counter: WindowCounter, config: &RateLimitConfig, now: DateTime<Utc>) -> RateLimitResult {
    let max = u64::from(config.max_requests);
    RateLimitResult {
        allowed: counter.count <= max,
        remaining: max.saturating_sub(counter.count) as u32,
        limit: config.max_requests,
        reset_at: expiry_secs(now, counter.ttl),
    }
}

/// Unix second by which a window with `ttl` left at `now` has expired,
/// rounded up to the next whole second.
fn expiry_secs(now: DateTime<Utc>, ttl: Duration) -> i64 {
    let ttl_micros = ttl.as_micros() + u128::from(ttl.subsec_nanos() % 1_000 > 0);
    let expires = now
        .timestamp_micros()
        .saturating_add(i64::try_from(ttl_micros).unwrap_or(i64::MAX));
    expires.div_euclid(1_000_000) + i64::from(expires.rem_euclid(1_000_000) > 0)
}
