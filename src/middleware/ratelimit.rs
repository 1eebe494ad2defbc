use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Variable;
use crate::error::{ProxyError, Result};
use crate::model::MiddlewareInstance;
use crate::mux::chain::{Attempt, Middleware, ProxyRequest};

/// Token-bucket rate limit payload: `requests` per `periodSeconds` with
/// `burst` extra capacity, counted per `variable` dimension.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSettings {
    pub requests: i64,
    pub period_seconds: i64,
    #[serde(default)]
    pub burst: i64,
    pub variable: String,
}

/// Chain middleware limiting request rates per client dimension. Requests
/// over the rate are answered 429 without touching an endpoint.
pub struct RateLimit {
    settings: RateLimitSettings,
    variable: Variable,
    limiter: DefaultKeyedRateLimiter<String>,
}

impl RateLimit {
    pub fn from_instance(instance: &MiddlewareInstance) -> Result<Arc<dyn Middleware>> {
        let settings: RateLimitSettings = serde_json::from_value(instance.payload.clone())
            .map_err(|e| ProxyError::Config(format!("bad ratelimit payload: {e}")))?;
        Ok(Self::new(settings)?)
    }

    pub fn new(settings: RateLimitSettings) -> Result<Arc<Self>> {
        let variable = Variable::parse(&settings.variable)?;
        if settings.requests <= 0 {
            return Err(ProxyError::Config(format!(
                "requests should be > 0, got {}",
                settings.requests
            )));
        }
        if settings.burst < 0 {
            return Err(ProxyError::Config(format!(
                "burst should be >= 0, got {}",
                settings.burst
            )));
        }
        if settings.period_seconds <= 0 {
            return Err(ProxyError::Config(format!(
                "period seconds should be > 0, got {}",
                settings.period_seconds
            )));
        }

        let requests = settings.requests.clamp(1, u32::MAX as i64) as u32;
        let replenish = Duration::from_secs(settings.period_seconds as u64) / requests;
        let burst = settings.burst.clamp(1, u32::MAX as i64) as u32;
        let quota = Quota::with_period(replenish)
            .ok_or_else(|| ProxyError::Config("rate period too small".into()))?
            .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN));

        Ok(Arc::new(Self {
            settings,
            variable,
            limiter: RateLimiter::keyed(quota),
        }))
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }
}

#[async_trait]
impl Middleware for RateLimit {
    async fn on_request(&self, req: &mut ProxyRequest) -> Result<Option<Response<Body>>> {
        let key = self.variable.extract(req);
        match self.limiter.check_key(&key) {
            Ok(_) => Ok(None),
            Err(_) => {
                debug!(key = %key, "rate limit exceeded");
                Ok(Some(
                    (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response(),
                ))
            }
        }
    }

    async fn on_response(&self, _req: &ProxyRequest, _attempt: &Attempt) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::chain::tests::test_request;
    use serde_json::json;

    fn settings(requests: i64, period: i64, burst: i64) -> RateLimitSettings {
        RateLimitSettings {
            requests,
            period_seconds: period,
            burst,
            variable: "client.ip".into(),
        }
    }

    #[test]
    fn validates_payload() {
        assert!(RateLimit::new(settings(0, 1, 1)).is_err());
        assert!(RateLimit::new(settings(10, 0, 1)).is_err());
        assert!(RateLimit::new(settings(10, 1, -1)).is_err());
        assert!(RateLimit::new(settings(10, 1, 0)).is_ok());
        assert!(RateLimit::new(RateLimitSettings {
            variable: "request.cookie".into(),
            ..settings(10, 1, 1)
        })
        .is_err());
    }

    #[test]
    fn parses_wire_payload() {
        let instance = MiddlewareInstance {
            kind: "ratelimit".into(),
            id: "rl1".into(),
            priority: 0,
            payload: json!({
                "requests": 12,
                "periodSeconds": 3,
                "burst": 20,
                "variable": "client.ip",
            }),
        };
        assert!(RateLimit::from_instance(&instance).is_ok());

        let bad = MiddlewareInstance {
            payload: json!({"requests": "many"}),
            ..instance
        };
        assert!(RateLimit::from_instance(&bad).is_err());
    }

    #[tokio::test]
    async fn limits_per_key() {
        // 1 request per hour, burst 1: the second immediate request trips.
        let limiter = RateLimit::new(settings(1, 3600, 1)).unwrap();
        let mut req = test_request();

        assert!(limiter.on_request(&mut req).await.unwrap().is_none());
        let denied = limiter.on_request(&mut req).await.unwrap().unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

        // A different client ip has its own bucket.
        let mut other = test_request();
        other.client_addr = "10.0.0.9:1234".parse().unwrap();
        assert!(limiter.on_request(&mut other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn burst_allows_extra_requests() {
        let limiter = RateLimit::new(settings(1, 3600, 3)).unwrap();
        let mut req = test_request();
        for _ in 0..3 {
            assert!(limiter.on_request(&mut req).await.unwrap().is_none());
        }
        assert!(limiter.on_request(&mut req).await.unwrap().is_some());
    }
}
