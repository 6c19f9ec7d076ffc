//! Fixed-window rate limiting over the shared key-value store.
//!
//! Key pattern: `ratelimit:{class}:{identity}`, for example
//! `ratelimit:auth:login:203.0.113.7:abc123`.
//!
//! Each check is a single atomic increment-with-expiry in the store, so
//! concurrent requests on the same key never lose updates and a counter can
//! never outlive its window.

use crate::auth::middleware::{AppState, AuthContext};
use crate::error::AppError;
use crate::metrics::MetricsSink;
use crate::storage::{KvStore, StoreError};
use axum::{
    extract::{ConnectInfo, Request},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("invalid rate limit policy: {0}")]
    InvalidPolicy(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Route classes with their own limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Every request, keyed by client IP.
    Global,
    /// Credential submissions, keyed by client IP and login name.
    Auth,
    /// Authenticated API calls, keyed by user.
    Api,
}

impl RouteClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::Global => "global",
            RouteClass::Auth => "auth",
            RouteClass::Api => "api",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub limit: u64,
    pub window: Duration,
}

/// Who a counter belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitKey {
    Ip(IpAddr),
    User(String),
    Login { ip: IpAddr, login: String },
}

impl RateLimitKey {
    /// Full store key for this identity under `class`.
    pub fn storage_key(&self, class: RouteClass) -> String {
        match self {
            RateLimitKey::Ip(ip) => format!("ratelimit:{}:ip:{}", class.as_str(), ip),
            RateLimitKey::User(id) => format!("ratelimit:{}:user:{}", class.as_str(), id),
            RateLimitKey::Login { ip, login } => format!(
                "ratelimit:{}:login:{}:{}",
                class.as_str(),
                ip,
                login.trim().to_lowercase()
            ),
        }
    }
}

/// Outcome of one counted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub count: u64,
    pub remaining: u64,
    /// Time until the window resets.
    pub reset: Duration,
    pub exceeded: bool,
}

impl RateLimitStatus {
    fn reset_secs(&self) -> u64 {
        // Round up so clients never retry before the window is gone
        let secs = self.reset.as_secs();
        if self.reset.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }

    /// Write `X-RateLimit-*` headers, plus `Retry-After` when exceeded.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_secs()));
        if self.exceeded {
            headers.insert(
                axum::http::header::RETRY_AFTER,
                HeaderValue::from(self.reset_secs()),
            );
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { store, metrics }
    }

    /// Count one request against `key` and report where it stands.
    pub async fn check(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateLimitStatus, RateLimitError> {
        if limit == 0 {
            return Err(RateLimitError::InvalidPolicy("limit must be positive"));
        }
        if window.is_zero() {
            return Err(RateLimitError::InvalidPolicy("window must be positive"));
        }

        let counted = self.store.incr_window(key, window).await?;

        Ok(RateLimitStatus {
            limit,
            count: counted.count,
            remaining: limit.saturating_sub(counted.count),
            reset: counted.resets_in,
            exceeded: counted.count > limit,
        })
    }

    /// Check a typed key under a route class policy.
    pub async fn check_class(
        &self,
        class: RouteClass,
        key: &RateLimitKey,
        policy: RateLimitPolicy,
    ) -> Result<RateLimitStatus, RateLimitError> {
        let status = self
            .check(&key.storage_key(class), policy.limit, policy.window)
            .await?;
        if status.exceeded {
            self.metrics.rate_limited(class.as_str());
        }
        Ok(status)
    }

    /// Drop a counter, restarting its budget.
    pub async fn clear(&self, key: &str) -> Result<(), RateLimitError> {
        self.store.del(key).await?;
        Ok(())
    }

    pub async fn clear_class(
        &self,
        class: RouteClass,
        key: &RateLimitKey,
    ) -> Result<(), RateLimitError> {
        self.clear(&key.storage_key(class)).await
    }
}

/// Hash an IP for log fields so raw client addresses never reach the logs.
pub fn ip_hash(ip: &IpAddr) -> String {
    let mut hasher = std::hash::DefaultHasher::new();
    ip.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Client address for rate limiting.
///
/// With `trusted_proxy_count` proxies in front of the service, the client is
/// the entry that many hops from the right of `X-Forwarded-For`. Anything
/// further left is client-controlled and ignored. Without trusted proxies, or
/// when the header is short, the peer address is used.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trusted_proxy_count: usize) -> IpAddr {
    let fallback = peer.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    if trusted_proxy_count == 0 {
        return fallback;
    }

    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .collect();

    hops.len()
        .checked_sub(trusted_proxy_count)
        .and_then(|index| hops.get(index))
        .and_then(|hop| hop.parse().ok())
        .unwrap_or(fallback)
}

/// Extract the rate-limit key for a request.
pub type KeyExtractor = fn(&Request, &AppState) -> RateLimitKey;

/// Key by client IP.
pub fn ip_key(req: &Request, state: &AppState) -> RateLimitKey {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    RateLimitKey::Ip(client_ip(
        req.headers(),
        peer,
        state.config.trusted_proxy_count,
    ))
}

/// Key by authenticated user, falling back to client IP when the gate has
/// not bound an identity.
pub fn user_key(req: &Request, state: &AppState) -> RateLimitKey {
    match req.extensions().get::<AuthContext>() {
        Some(ctx) => RateLimitKey::User(ctx.identity.user_id.clone()),
        None => ip_key(req, state),
    }
}

async fn enforce(
    state: &AppState,
    class: RouteClass,
    extract: KeyExtractor,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let key = extract(&req, state);
    let policy = state.config.rate_limit_policy(class);

    let status = match state.limiter.check_class(class, &key, policy).await {
        Ok(status) => status,
        Err(e) => {
            // Counter store down: let the request through, the session
            // layer fails closed on its own.
            tracing::error!(error = %e, class = class.as_str(), "Rate limit check failed");
            return Ok(next.run(req).await);
        }
    };

    if status.exceeded {
        if let RateLimitKey::Ip(ip) = &key {
            tracing::warn!(action = "rate_limited", class = class.as_str(), ip_hash = %ip_hash(ip), "Rate limit exceeded");
        } else {
            tracing::warn!(action = "rate_limited", class = class.as_str(), "Rate limit exceeded");
        }
        return Err(AppError::RateLimited(status));
    }

    let mut response = next.run(req).await;
    // A narrower limiter further in already reported its own counter
    if !response.headers().contains_key(X_RATELIMIT_LIMIT) {
        status.apply_headers(response.headers_mut());
    }
    Ok(response)
}

/// Per-IP limit applied to every route in a router.
pub async fn limit_global(
    axum::extract::State(state): axum::extract::State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    enforce(&state, RouteClass::Global, ip_key, req, next).await
}

/// Per-user limit for authenticated API routes. Layer inside `require_auth`.
pub async fn limit_api(
    axum::extract::State(state): axum::extract::State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    enforce(&state, RouteClass::Api, user_key, req, next).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CountingMetrics;
    use crate::storage::MemoryStore;

    fn limiter() -> (RateLimiter, Arc<CountingMetrics>) {
        let metrics = Arc::new(CountingMetrics::new());
        (
            RateLimiter::new(Arc::new(MemoryStore::new()), metrics.clone()),
            metrics,
        )
    }

    const WINDOW: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_first_n_allowed_then_exceeded() {
        let (limiter, _) = limiter();

        for i in 1..=5 {
            let status = limiter.check("k", 5, WINDOW).await.unwrap();
            assert_eq!(status.count, i);
            assert_eq!(status.remaining, 5 - i);
            assert!(!status.exceeded);
        }

        let status = limiter.check("k", 5, WINDOW).await.unwrap();
        assert_eq!(status.count, 6);
        assert_eq!(status.remaining, 0);
        assert!(status.exceeded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_lose_no_updates() {
        let (limiter, _) = limiter();
        let n = 50u64;

        let mut tasks = Vec::new();
        for _ in 0..2 * n {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move {
                limiter.check("burst", n, WINDOW).await.unwrap()
            }));
        }

        let mut exceeded = 0;
        for task in tasks {
            if task.await.unwrap().exceeded {
                exceeded += 1;
            }
        }
        assert_eq!(exceeded, n);

        let last = limiter.check("burst", n, WINDOW).await.unwrap();
        assert_eq!(last.count, 2 * n + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets() {
        let (limiter, _) = limiter();
        limiter.check("k", 1, WINDOW).await.unwrap();
        assert!(limiter.check("k", 1, WINDOW).await.unwrap().exceeded);

        tokio::time::advance(Duration::from_secs(61)).await;
        let status = limiter.check("k", 1, WINDOW).await.unwrap();
        assert_eq!(status.count, 1);
        assert!(!status.exceeded);
    }

    #[tokio::test]
    async fn test_invalid_policy_rejected_before_store() {
        let (limiter, _) = limiter();
        assert!(matches!(
            limiter.check("k", 0, WINDOW).await,
            Err(RateLimitError::InvalidPolicy(_))
        ));
        assert!(matches!(
            limiter.check("k", 5, Duration::ZERO).await,
            Err(RateLimitError::InvalidPolicy(_))
        ));
        // Neither call counted
        assert_eq!(limiter.check("k", 5, WINDOW).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_clear_restarts_budget() {
        let (limiter, metrics) = limiter();
        let key = RateLimitKey::Login {
            ip: "203.0.113.7".parse().unwrap(),
            login: "Abc123".to_string(),
        };
        let policy = RateLimitPolicy {
            limit: 1,
            window: WINDOW,
        };

        limiter.check_class(RouteClass::Auth, &key, policy).await.unwrap();
        assert!(limiter
            .check_class(RouteClass::Auth, &key, policy)
            .await
            .unwrap()
            .exceeded);
        assert_eq!(metrics.get("ratelimit.auth"), 1);

        limiter.clear_class(RouteClass::Auth, &key).await.unwrap();
        let status = limiter.check_class(RouteClass::Auth, &key, policy).await.unwrap();
        assert_eq!(status.count, 1);
    }

    #[test]
    fn test_storage_keys() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(
            RateLimitKey::Ip(ip).storage_key(RouteClass::Global),
            "ratelimit:global:ip:203.0.113.7"
        );
        assert_eq!(
            RateLimitKey::User("u1".to_string()).storage_key(RouteClass::Api),
            "ratelimit:api:user:u1"
        );
        assert_eq!(
            RateLimitKey::Login {
                ip,
                login: " ABC123 ".to_string()
            }
            .storage_key(RouteClass::Auth),
            "ratelimit:auth:login:203.0.113.7:abc123"
        );
    }

    #[test]
    fn test_headers() {
        let status = RateLimitStatus {
            limit: 5,
            count: 6,
            remaining: 0,
            reset: Duration::from_millis(899_400),
            exceeded: true,
        };
        let mut headers = HeaderMap::new();
        status.apply_headers(&mut headers);

        assert_eq!(headers[X_RATELIMIT_LIMIT], "5");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "0");
        assert_eq!(headers[X_RATELIMIT_RESET], "900");
        assert_eq!(headers[axum::http::header::RETRY_AFTER], "900");

        let mut headers = HeaderMap::new();
        RateLimitStatus {
            exceeded: false,
            remaining: 1,
            ..status
        }
        .apply_headers(&mut headers);
        assert!(headers.get(axum::http::header::RETRY_AFTER).is_none());
    }

    #[test]
    fn test_client_ip() {
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.1.1.1, 203.0.113.7, 10.0.0.2"),
        );

        // No trusted proxies: header ignored
        assert_eq!(client_ip(&headers, Some(peer), 0), peer);
        // One trusted proxy: rightmost entry
        assert_eq!(
            client_ip(&headers, Some(peer), 1),
            "10.0.0.2".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            client_ip(&headers, Some(peer), 2),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );
        // More proxies than hops: fall back to the peer
        assert_eq!(client_ip(&headers, Some(peer), 4), peer);
        // Garbage hop: fall back to the peer
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(client_ip(&headers, Some(peer), 1), peer);
    }

    #[test]
    fn test_ip_hash_hides_address() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        let hashed = ip_hash(&ip);
        assert_ne!(hashed, ip.to_string());
        assert_eq!(hashed, ip_hash(&ip));
        assert_ne!(hashed, ip_hash(&"203.0.113.8".parse().unwrap()));
    }
}
