//! Per-provider circuit breaker: five consecutive handshake failures
//! within a 60s window disable that provider for 30s.
//!
//! Grounded on `gateway::SlidingWindowRateLimiter`'s shape —
//! a `parking_lot::Mutex`-guarded `HashMap` with a short critical
//! section per call, sized for this crate's process-wide, init-at-start
//! provider table rather than a runtime-growing one.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::model::ProviderKind;

struct ProviderState {
    failure_times: Vec<Instant>,
    disabled_until: Option<Instant>,
}

impl Default for ProviderState {
    fn default() -> Self {
        Self { failure_times: Vec::new(), disabled_until: None }
    }
}

pub struct CircuitBreaker {
    threshold: u32,
    window: Duration,
    cooldown: Duration,
    state: Mutex<HashMap<ProviderKind, ProviderState>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self { threshold, window, cooldown, state: Mutex::new(HashMap::new()) }
    }

    /// Whether `provider` is currently disabled (cooldown not yet elapsed).
    pub fn is_open(&self, provider: ProviderKind) -> bool {
        let guard = self.state.lock();
        match guard.get(&provider).and_then(|s| s.disabled_until) {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    /// Records a handshake failure; disables the provider if the
    /// threshold is crossed within the window.
    pub fn record_handshake_failure(&self, provider: ProviderKind) {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let entry = guard.entry(provider).or_default();
        entry.failure_times.retain(|t| now.duration_since(*t) <= self.window);
        entry.failure_times.push(now);
        if entry.failure_times.len() as u32 >= self.threshold {
            entry.disabled_until = Some(now + self.cooldown);
            entry.failure_times.clear();
        }
    }

    /// Clears failure history on a successful handshake.
    pub fn record_handshake_success(&self, provider: ProviderKind) {
        let mut guard = self.state.lock();
        if let Some(entry) = guard.get_mut(&provider) {
            entry.failure_times.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(60), Duration::from_secs(30));
        for _ in 0..4 {
            breaker.record_handshake_failure(ProviderKind::OpenAi);
        }
        assert!(!breaker.is_open(ProviderKind::OpenAi));
        breaker.record_handshake_failure(ProviderKind::OpenAi);
        assert!(breaker.is_open(ProviderKind::OpenAi));
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(60), Duration::from_secs(30));
        for _ in 0..4 {
            breaker.record_handshake_failure(ProviderKind::Gemini);
        }
        breaker.record_handshake_success(ProviderKind::Gemini);
        breaker.record_handshake_failure(ProviderKind::Gemini);
        assert!(!breaker.is_open(ProviderKind::Gemini));
    }

    #[test]
    fn providers_are_tracked_independently() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60), Duration::from_secs(30));
        breaker.record_handshake_failure(ProviderKind::Xai);
        assert!(breaker.is_open(ProviderKind::Xai));
        assert!(!breaker.is_open(ProviderKind::Ultravox));
    }
}
