//! Injected metrics sink.
//!
//! Components that report timings or outcomes take an `Arc<dyn MetricsSink>`
//! at construction. There is no process-wide registry.

use dashmap::DashMap;
use std::time::Duration;

/// How a request's identity resolution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthOutcome {
    Authenticated,
    Anonymous,
    SessionAbsent,
    TokenRejected(&'static str),
    Inactive,
    StoreFailure,
    Forbidden,
}

impl AuthOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthOutcome::Authenticated => "authenticated",
            AuthOutcome::Anonymous => "anonymous",
            AuthOutcome::SessionAbsent => "session_absent",
            AuthOutcome::TokenRejected(kind) => *kind,
            AuthOutcome::Inactive => "inactive",
            AuthOutcome::StoreFailure => "store_failure",
            AuthOutcome::Forbidden => "forbidden",
        }
    }
}

/// Receiver for store timings and auth outcomes.
pub trait MetricsSink: Send + Sync {
    /// One call against the shared key-value store.
    fn store_call(&self, op: &'static str, elapsed: Duration, ok: bool);

    /// Terminal outcome of identity resolution for one request.
    fn auth_outcome(&self, outcome: AuthOutcome);

    /// A rate-limited request was rejected.
    fn rate_limited(&self, scope: &'static str);
}

/// Emits every observation as a `tracing` event at debug level.
#[derive(Debug, Default, Clone)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn store_call(&self, op: &'static str, elapsed: Duration, ok: bool) {
        tracing::debug!(metric = "store_call", op, elapsed_us = elapsed.as_micros() as u64, ok);
    }

    fn auth_outcome(&self, outcome: AuthOutcome) {
        tracing::debug!(metric = "auth_outcome", outcome = outcome.as_str());
    }

    fn rate_limited(&self, scope: &'static str) {
        tracing::debug!(metric = "rate_limited", scope);
    }
}

/// In-memory counters keyed by metric name, used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    counters: DashMap<String, u64>,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, zero if never incremented.
    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }

    fn bump(&self, name: String) {
        *self.counters.entry(name).or_insert(0) += 1;
    }
}

impl MetricsSink for CountingMetrics {
    fn store_call(&self, op: &'static str, _elapsed: Duration, ok: bool) {
        let status = if ok { "ok" } else { "err" };
        self.bump(format!("store.{}.{}", op, status));
    }

    fn auth_outcome(&self, outcome: AuthOutcome) {
        self.bump(format!("auth.{}", outcome.as_str()));
    }

    fn rate_limited(&self, scope: &'static str) {
        self.bump(format!("ratelimit.{}", scope));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_metrics() {
        let metrics = CountingMetrics::new();
        metrics.store_call("get", Duration::from_millis(1), true);
        metrics.store_call("get", Duration::from_millis(1), true);
        metrics.store_call("get", Duration::from_millis(1), false);
        metrics.auth_outcome(AuthOutcome::TokenRejected("token_expired"));
        metrics.rate_limited("auth");

        assert_eq!(metrics.get("store.get.ok"), 2);
        assert_eq!(metrics.get("store.get.err"), 1);
        assert_eq!(metrics.get("auth.token_expired"), 1);
        assert_eq!(metrics.get("ratelimit.auth"), 1);
        assert_eq!(metrics.get("never"), 0);
    }
}
