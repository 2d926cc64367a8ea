//! Rate limit service implementation.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::ratekeeper::v1::{
    rate_limit_service_server::RateLimitService, CheckRateLimitRequest, CheckRateLimitResponse,
    GetRateLimitStatusRequest, GetRateLimitStatusResponse, RateLimitDecision, RequestMetadata,
    ResetRateLimitRequest, ResetRateLimitResponse,
};

use crate::ratelimit::{ProfileSet, RateLimitConfig, RateLimitResult, RateLimiter, RequestContext};

impl RequestContext for RequestMetadata {
    fn client_address(&self) -> Option<&str> {
        Some(self.remote_address.as_str()).filter(|a| !a.is_empty())
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    fn user_id(&self) -> Option<&str> {
        Some(self.user_id.as_str()).filter(|id| !id.is_empty())
    }
}

impl From<&RateLimitResult> for RateLimitDecision {
    fn from(result: &RateLimitResult) -> Self {
        Self {
            allowed: result.allowed,
            remaining: result.remaining,
            limit: result.limit,
            reset_at: Some(prost_types::Timestamp {
                seconds: result.reset_at,
                nanos: 0,
            }),
            retry_after_seconds: result.retry_after(),
        }
    }
}

/// Implementation of the RateLimitService gRPC interface.
pub struct RateLimitServiceImpl {
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
    /// Profiles callers may refer to by name
    profiles: Arc<ProfileSet>,
}

impl RateLimitServiceImpl {
    /// Create a new RateLimitServiceImpl with the given rate limiter.
    pub fn new(rate_limiter: Arc<RateLimiter>, profiles: Arc<ProfileSet>) -> Self {
        Self {
            rate_limiter,
            profiles,
        }
    }

    fn profile(&self, name: &str) -> Result<&RateLimitConfig, Status> {
        if name.is_empty() {
            warn!("Received rate limit request with empty profile");
            return Err(Status::invalid_argument("profile is required"));
        }
        self.profiles
            .get(name)
            .ok_or_else(|| Status::not_found(format!("unknown profile '{}'", name)))
    }
}

fn require<'a>(value: &'a str, field: &str) -> Result<&'a str, Status> {
    if value.is_empty() {
        return Err(Status::invalid_argument(format!("{} is required", field)));
    }
    Ok(value)
}

#[tonic::async_trait]
impl RateLimitService for RateLimitServiceImpl {
    /// Count one request against a profile.
    ///
    /// Store trouble never turns into a gRPC error here: the request is let
    /// through and the response is flagged as degraded.
    #[instrument(skip(self, request), fields(profile = %request.get_ref().profile))]
    async fn check_rate_limit(
        &self,
        request: Request<CheckRateLimitRequest>,
    ) -> Result<Response<CheckRateLimitResponse>, Status> {
        let req = request.into_inner();
        let config = self.profile(&req.profile)?;
        let metadata = req.request.unwrap_or_default();

        let identifier = self.rate_limiter.identify(&metadata, config);
        let outcome = self.rate_limiter.check_identifier(&identifier, config).await;
        let degraded = outcome.is_degraded();
        let result = outcome.into_result();

        debug!(
            profile = %req.profile,
            identifier = %identifier,
            allowed = result.allowed,
            remaining = result.remaining,
            degraded = degraded,
            "Rate limit decision made"
        );

        let response_headers = result
            .headers()
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();

        Ok(Response::new(CheckRateLimitResponse {
            decision: Some(RateLimitDecision::from(&result)),
            identifier: identifier.to_string(),
            degraded,
            response_headers,
        }))
    }

    #[instrument(skip(self, request), fields(profile = %request.get_ref().profile))]
    async fn get_rate_limit_status(
        &self,
        request: Request<GetRateLimitStatusRequest>,
    ) -> Result<Response<GetRateLimitStatusResponse>, Status> {
        let req = request.into_inner();
        let config = self.profile(&req.profile)?;
        let identifier = require(&req.identifier, "identifier")?;

        let status = self
            .rate_limiter
            .get_rate_limit_status(identifier, config)
            .await
            .map(|result| RateLimitDecision::from(&result));

        Ok(Response::new(GetRateLimitStatusResponse { status }))
    }

    #[instrument(skip(self, request), fields(key_prefix = %request.get_ref().key_prefix))]
    async fn reset_rate_limit(
        &self,
        request: Request<ResetRateLimitRequest>,
    ) -> Result<Response<ResetRateLimitResponse>, Status> {
        let req = request.into_inner();
        let key_prefix = require(&req.key_prefix, "key_prefix")?;
        let identifier = require(&req.identifier, "identifier")?;

        self.rate_limiter
            .try_reset_rate_limit(identifier, key_prefix)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;

        info!(key_prefix = %key_prefix, identifier = %identifier, "Rate limit reset");
        Ok(Response::new(ResetRateLimitResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::MemoryStore;
    use std::collections::HashMap;

    fn service() -> RateLimitServiceImpl {
        let mut overrides = HashMap::new();
        overrides.insert("tiny".to_string(), RateLimitConfig::new(2, 60, "test:tiny"));
        let profiles = ProfileSet::builtin().with_overrides(overrides).unwrap();
        let rate_limiter = Arc::new(RateLimiter::new(Arc::new(MemoryStore::new())));
        RateLimitServiceImpl::new(rate_limiter, Arc::new(profiles))
    }

    fn check_request(profile: &str, remote_address: &str) -> Request<CheckRateLimitRequest> {
        Request::new(CheckRateLimitRequest {
            profile: profile.to_string(),
            request: Some(RequestMetadata {
                remote_address: remote_address.to_string(),
                ..Default::default()
            }),
        })
    }

    #[tokio::test]
    async fn test_empty_profile_rejected() {
        let result = service().check_rate_limit(check_request("", "1.2.3.4")).await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_unknown_profile_not_found() {
        let result = service().check_rate_limit(check_request("nope", "1.2.3.4")).await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_profile_lookup_ignores_case() {
        let response = service()
            .check_rate_limit(check_request("Tiny", "1.2.3.4"))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.decision.unwrap().limit, 2);
    }

    #[tokio::test]
    async fn test_check_counts_and_denies() {
        let service = service();

        for expected_remaining in [1, 0] {
            let response = service
                .check_rate_limit(check_request("tiny", "1.2.3.4"))
                .await
                .unwrap()
                .into_inner();
            let decision = response.decision.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(response.identifier, "ip:1.2.3.4");
            assert!(!response.degraded);
        }

        let response = service
            .check_rate_limit(check_request("tiny", "1.2.3.4"))
            .await
            .unwrap()
            .into_inner();
        let decision = response.decision.unwrap();
        assert!(!decision.allowed);
        assert!(decision.retry_after_seconds > 0);
        assert!(response.response_headers.contains_key("Retry-After"));
        assert_eq!(response.response_headers["X-RateLimit-Limit"], "2");
    }

    #[tokio::test]
    async fn test_check_without_metadata_uses_unknown_bucket() {
        let response = service()
            .check_rate_limit(Request::new(CheckRateLimitRequest {
                profile: "tiny".to_string(),
                request: None,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.identifier, "ip:unknown");
    }

    #[tokio::test]
    async fn test_metadata_headers_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("X-Forwarded-For".to_string(), "203.0.113.7, 10.0.0.1".to_string());
        let metadata = RequestMetadata {
            headers,
            ..Default::default()
        };

        assert_eq!(metadata.header("x-forwarded-for"), Some("203.0.113.7, 10.0.0.1"));
        assert_eq!(metadata.client_address(), None);
    }

    #[tokio::test]
    async fn test_status_and_reset() {
        let service = service();
        service
            .check_rate_limit(check_request("tiny", "1.2.3.4"))
            .await
            .unwrap();

        let status = service
            .get_rate_limit_status(Request::new(GetRateLimitStatusRequest {
                profile: "tiny".to_string(),
                identifier: "ip:1.2.3.4".to_string(),
            }))
            .await
            .unwrap()
            .into_inner()
            .status
            .unwrap();
        assert_eq!(status.remaining, 1);

        service
            .reset_rate_limit(Request::new(ResetRateLimitRequest {
                key_prefix: "test:tiny".to_string(),
                identifier: "ip:1.2.3.4".to_string(),
            }))
            .await
            .unwrap();

        let status = service
            .get_rate_limit_status(Request::new(GetRateLimitStatusRequest {
                profile: "tiny".to_string(),
                identifier: "ip:1.2.3.4".to_string(),
            }))
            .await
            .unwrap()
            .into_inner()
            .status
            .unwrap();
        assert_eq!(status.remaining, 2);
    }

    #[tokio::test]
    async fn test_reset_requires_fields() {
        let result = service()
            .reset_rate_limit(Request::new(ResetRateLimitRequest {
                key_prefix: String::new(),
                identifier: "ip:1.2.3.4".to_string(),
            }))
            .await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }
}
