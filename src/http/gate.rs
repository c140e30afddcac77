//! Request gate: the boundary between HTTP and the rate limiter.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use tracing::{debug, instrument, warn};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{ClientIdentity, QuotaStatus, RateLimiter, Threshold, Verdict};

/// A request that passed the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub limit: Threshold,
    pub remaining: u64,
    pub reset_after: Duration,
}

/// Extracts client identities and asks the limiter about them.
#[derive(Debug)]
pub struct RequestGate {
    limiter: Arc<RateLimiter>,
    trust_proxy: bool,
}

impl RequestGate {
    /// Create a gate that identifies clients by peer address only.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            trust_proxy: false,
        }
    }

    /// Honor `X-Forwarded-For` / `X-Real-IP`.
    ///
    /// Only enable behind a proxy that overwrites these headers; otherwise
    /// clients can pick their own identity and dodge the limit.
    pub fn trust_proxy(mut self, trust: bool) -> Self {
        self.trust_proxy = trust;
        self
    }

    /// Work out who is calling.
    pub fn identify(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Result<ClientIdentity> {
        if self.trust_proxy {
            if let Some(ip) = forwarded_ip(headers) {
                return Ok(ClientIdentity::from(ip));
            }
        }

        peer.map(|addr| ClientIdentity::from(addr.ip()))
            .ok_or(TurnstileError::MissingClientIdentity)
    }

    /// Count the request against the caller's quota.
    ///
    /// Denials come back as [`TurnstileError::RateLimitExceeded`]; limiter
    /// failures pass through unchanged so they render as 503, not 429.
    #[instrument(skip(self, identity), fields(identity = %identity))]
    pub async fn admit(&self, identity: &ClientIdentity) -> Result<Admission> {
        match self.limiter.check(identity).await {
            Ok(Verdict::Allowed {
                limit,
                remaining,
                reset_after,
            }) => {
                debug!(remaining = remaining, "Request admitted");
                Ok(Admission {
                    limit,
                    remaining,
                    reset_after,
                })
            }
            Ok(Verdict::Denied { retry_after, .. }) => {
                debug!(retry_after_secs = retry_after.as_secs(), "Request denied");
                Err(TurnstileError::RateLimitExceeded { retry_after })
            }
            Err(error) => {
                warn!(error = %error, "Rate limit check failed");
                Err(error)
            }
        }
    }

    /// The caller's quota, without counting a request.
    pub async fn status(&self, identity: &ClientIdentity) -> Result<QuotaStatus> {
        self.limiter.status(identity).await
    }
}

/// Leftmost valid `X-Forwarded-For` entry, then `X-Real-IP`.
fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        })
}

/// Extractor yielding the caller's identity as judged by the gate.
#[derive(Debug, Clone)]
pub struct Caller(pub ClientIdentity);

#[async_trait]
impl FromRequestParts<Arc<RequestGate>> for Caller {
    type Rejection = TurnstileError;

    async fn from_request_parts(
        parts: &mut Parts,
        gate: &Arc<RequestGate>,
    ) -> std::result::Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        gate.identify(&parts.headers, peer).map(Caller)
    }
}
