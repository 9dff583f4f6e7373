//! Login attempt limiting middleware.
//!
//! Per-identifier attempt counts in fixed windows that reset wholesale once
//! stale. Exceeding `max_attempts` inside a window blocks the identifier for
//! `block_duration`; a block replaces the window entirely.

use crate::clock::{span, SharedClock};
use crate::config::AttemptLimiterConfig;
use crate::reclaim::Reclaimer;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of [`AttemptLimiter::check_limit`]. Being blocked is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimitDecision {
    pub allowed: bool,
    pub remaining_attempts: u32,
    pub blocked_until: Option<DateTime<Utc>>,
}

impl LimitDecision {
    fn allowed(remaining_attempts: u32) -> Self {
        Self {
            allowed: true,
            remaining_attempts,
            blocked_until: None,
        }
    }

    fn blocked(until: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            remaining_attempts: 0,
            blocked_until: Some(until),
        }
    }

    /// Seconds until the block lifts, rounded up.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<u64> {
        let until = self.blocked_until?;
        let ms = (until - now).num_milliseconds().max(0) as u64;
        Some(ms.div_ceil(1000))
    }
}

struct AttemptWindow {
    count: u32,
    window_start: DateTime<Utc>,
    last_attempt: DateTime<Utc>,
}

struct BlockEntry {
    blocked_until: DateTime<Utc>,
    blocked_at: DateTime<Utc>,
}

#[derive(Default)]
struct LimiterState {
    windows: HashMap<String, AttemptWindow>,
    blocks: HashMap<String, BlockEntry>,
}

impl LimiterState {
    /// Active block expiry; a stale block is removed on the way.
    fn active_block(&mut self, identifier: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let until = self.blocks.get(identifier)?.blocked_until;
        if now <= until {
            Some(until)
        } else {
            self.blocks.remove(identifier);
            None
        }
    }

    /// Count one attempt, replacing a stale window. Returns the new count.
    fn bump(&mut self, identifier: &str, now: DateTime<Utc>, window: chrono::Duration) -> u32 {
        let entry = self
            .windows
            .entry(identifier.to_string())
            .or_insert(AttemptWindow {
                count: 0,
                window_start: now,
                last_attempt: now,
            });

        if now - entry.window_start > window {
            *entry = AttemptWindow {
                count: 0,
                window_start: now,
                last_attempt: now,
            };
        }

        entry.count = entry.count.saturating_add(1);
        entry.last_attempt = now;
        entry.count
    }

    fn block(&mut self, identifier: &str, now: DateTime<Utc>, duration: chrono::Duration) -> DateTime<Utc> {
        let blocked_until = now
            .checked_add_signed(duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.windows.remove(identifier);
        self.blocks.insert(
            identifier.to_string(),
            BlockEntry {
                blocked_until,
                blocked_at: now,
            },
        );
        blocked_until
    }
}

/// Live entry counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterStats {
    pub tracking: usize,
    pub blocked: usize,
}

/// Per-identifier attempt limiter with escalation to temporary blocks.
pub struct AttemptLimiter {
    config: AttemptLimiterConfig,
    clock: SharedClock,
    state: Mutex<LimiterState>,
    reclaimer: Reclaimer,
}

impl std::fmt::Debug for AttemptLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptLimiter")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl AttemptLimiter {
    pub fn new(config: AttemptLimiterConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(LimiterState::default()),
            reclaimer: Reclaimer::new(),
        }
    }

    /// Create a limiter and start its reclamation task.
    pub fn spawn(config: AttemptLimiterConfig, clock: SharedClock) -> Arc<Self> {
        let limiter = Arc::new(Self::new(config, clock));
        limiter.reclaimer.start(
            "attempt-limiter",
            limiter.config.cleanup_interval(),
            &limiter,
            |l: &AttemptLimiter| {
                l.reclaim();
            },
        );
        limiter
    }

    pub fn config(&self) -> &AttemptLimiterConfig {
        &self.config
    }

    /// Count an attempt and decide whether it may proceed.
    pub fn check_limit(&self, identifier: &str) -> LimitDecision {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if let Some(until) = state.active_block(identifier, now) {
            return LimitDecision::blocked(until);
        }

        match self.count_attempt(&mut state, identifier, now) {
            Some(until) => LimitDecision::blocked(until),
            None => {
                let count = state.windows.get(identifier).map_or(0, |w| w.count);
                LimitDecision::allowed(self.config.max_attempts.saturating_sub(count))
            }
        }
    }

    /// Count an attempt the caller already knows failed. Ignored while blocked.
    pub fn record_failed_attempt(&self, identifier: &str) {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if state.active_block(identifier, now).is_some() {
            return;
        }
        self.count_attempt(&mut state, identifier, now);
    }

    /// Returns the block expiry if this attempt crossed the threshold.
    fn count_attempt(
        &self,
        state: &mut LimiterState,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let count = state.bump(identifier, now, span(self.config.window()));
        if count <= self.config.max_attempts {
            return None;
        }

        let until = state.block(identifier, now, span(self.config.block_duration()));
        warn!(
            identifier = %identifier,
            attempts = count,
            blocked_until = %until,
            "Attempt limit exceeded, blocking"
        );
        Some(until)
    }

    /// Clear both the window and any block.
    pub fn record_successful_attempt(&self, identifier: &str) {
        let mut state = self.state.lock();
        state.windows.remove(identifier);
        if state.blocks.remove(identifier).is_some() {
            debug!(identifier = %identifier, "Block cleared by successful attempt");
        }
    }

    /// Block directly for `duration`, or the configured block length.
    pub fn block(&self, identifier: &str, duration: Option<Duration>) -> DateTime<Utc> {
        let now = self.clock.now();
        let duration = duration.unwrap_or_else(|| self.config.block_duration());
        let until = self.state.lock().block(identifier, now, span(duration));
        info!(identifier = %identifier, blocked_until = %until, "Identifier blocked");
        until
    }

    /// Lift a block. Does not restore any window.
    pub fn unblock(&self, identifier: &str) -> bool {
        let now = self.clock.now();
        let Some(entry) = self.state.lock().blocks.remove(identifier) else {
            return false;
        };
        info!(
            identifier = %identifier,
            blocked_for_ms = (now - entry.blocked_at).num_milliseconds(),
            "Identifier unblocked"
        );
        true
    }

    pub fn is_blocked(&self, identifier: &str) -> bool {
        self.blocked_until(identifier).is_some()
    }

    /// Expiry of the active block, if any.
    pub fn blocked_until(&self, identifier: &str) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.state.lock().active_block(identifier, now)
    }

    /// Time of the last counted attempt in the current window.
    pub fn last_attempt(&self, identifier: &str) -> Option<DateTime<Utc>> {
        self.state.lock().windows.get(identifier).map(|w| w.last_attempt)
    }

    /// Decision for a blocked identifier without counting an attempt.
    pub fn blocked_decision(&self, identifier: &str) -> Option<LimitDecision> {
        self.blocked_until(identifier).map(LimitDecision::blocked)
    }

    /// Remove stale windows and expired blocks. Returns how many went.
    pub fn reclaim(&self) -> usize {
        let now = self.clock.now();
        let window = span(self.config.window());
        let mut state = self.state.lock();

        let before = state.windows.len() + state.blocks.len();
        state.windows.retain(|_, w| now - w.window_start <= window);
        state.blocks.retain(|_, b| now <= b.blocked_until);
        let removed = before - (state.windows.len() + state.blocks.len());

        if removed > 0 {
            debug!(removed, "Reclaimed attempt limiter entries");
        }
        removed
    }

    pub fn stats(&self) -> LimiterStats {
        let state = self.state.lock();
        LimiterStats {
            tracking: state.windows.len(),
            blocked: state.blocks.len(),
        }
    }

    /// Stop reclamation and clear all state. Idempotent.
    pub fn shutdown(&self) {
        self.reclaimer.stop();
        let mut state = self.state.lock();
        state.windows.clear();
        state.blocks.clear();
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Rejection for a blocked identifier: 429 with `Retry-After`.
pub fn blocked_response(decision: &LimitDecision, now: DateTime<Utc>) -> Response {
    let retry_after = decision.retry_after(now).unwrap_or(0);
    let body = serde_json::json!({
        "error": "too_many_attempts",
        "message": "Too many attempts. Please try again later.",
        "retry_after_seconds": retry_after,
        "blocked_until": decision.blocked_until.map(|t| t.to_rfc3339()),
    });

    (
        StatusCode::TOO_MANY_REQUESTS,
        [("Retry-After", retry_after.to_string())],
        axum::Json(body),
    )
        .into_response()
}

/// Limiter key for a client address.
pub fn ip_key(addr: &SocketAddr) -> String {
    format!("ip:{}", addr.ip())
}

/// Attempt limiting middleware keyed by client IP.
pub async fn attempt_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(limiter): State<Arc<AttemptLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = ip_key(&addr);
    let decision = limiter.check_limit(&key);

    if decision.allowed {
        return next.run(request).await;
    }

    warn!(
        ip = %addr.ip(),
        blocked_until = ?decision.blocked_until,
        "Attempt limit exceeded"
    );
    blocked_response(&decision, limiter.now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn limiter(max_attempts: u32, clock: &ManualClock) -> AttemptLimiter {
        let config = AttemptLimiterConfig {
            max_attempts,
            window_ms: 15 * 60 * 1000,
            block_duration_ms: 30 * 60 * 1000,
            cleanup_interval_ms: 60 * 1000,
        };
        AttemptLimiter::new(config, clock.shared())
    }

    #[test]
    fn test_allows_exactly_max_attempts() {
        let clock = ManualClock::starting_now();
        let limiter = limiter(5, &clock);

        for expected_remaining in (0..5).rev() {
            let decision = limiter.check_limit("user:ace");
            assert!(decision.allowed);
            assert_eq!(decision.remaining_attempts, expected_remaining);
            assert!(decision.blocked_until.is_none());
        }

        let sixth = limiter.check_limit("user:ace");
        assert!(!sixth.allowed);
        assert_eq!(sixth.remaining_attempts, 0);
        assert!(sixth.blocked_until.unwrap() > clock.now());
        assert!(limiter.is_blocked("user:ace"));
        // blocking supersedes the window
        assert_eq!(limiter.stats(), LimiterStats { tracking: 0, blocked: 1 });
    }

    #[test]
    fn test_blocked_checks_do_not_mutate() {
        let clock = ManualClock::starting_now();
        let limiter = limiter(1, &clock);
        limiter.check_limit("k");
        let first = limiter.check_limit("k");
        clock.advance(Duration::from_secs(5));
        let second = limiter.check_limit("k");

        assert_eq!(first.blocked_until, second.blocked_until);
        assert_eq!(limiter.stats().tracking, 0);
    }

    #[test]
    fn test_success_clears_block() {
        let clock = ManualClock::starting_now();
        let limiter = limiter(5, &clock);
        for _ in 0..6 {
            limiter.check_limit("user:ace");
        }
        assert!(limiter.is_blocked("user:ace"));

        limiter.record_successful_attempt("user:ace");

        let decision = limiter.check_limit("user:ace");
        assert!(decision.allowed);
        assert_eq!(decision.remaining_attempts, 4);
    }

    #[test]
    fn test_stale_window_resets_instead_of_decaying() {
        let clock = ManualClock::starting_now();
        let limiter = limiter(5, &clock);
        for _ in 0..4 {
            limiter.check_limit("k");
        }

        clock.advance(Duration::from_secs(15 * 60) + Duration::from_millis(1));

        let decision = limiter.check_limit("k");
        assert!(decision.allowed);
        assert_eq!(decision.remaining_attempts, 4);
        assert_eq!(limiter.last_attempt("k"), Some(clock.now()));
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let clock = ManualClock::starting_now();
        let limiter = limiter(2, &clock);
        limiter.check_limit("k");
        clock.advance(Duration::from_secs(15 * 60));
        // exactly window_ms later the window still counts
        assert_eq!(limiter.check_limit("k").remaining_attempts, 0);
    }

    #[test]
    fn test_failed_attempts_trigger_block() {
        let clock = ManualClock::starting_now();
        let limiter = limiter(3, &clock);

        for _ in 0..3 {
            limiter.record_failed_attempt("ip:10.0.0.1");
        }
        assert!(!limiter.is_blocked("ip:10.0.0.1"));

        limiter.record_failed_attempt("ip:10.0.0.1");
        assert!(limiter.is_blocked("ip:10.0.0.1"));
        let until = limiter.blocked_until("ip:10.0.0.1").unwrap();
        assert_eq!(until, clock.now() + chrono::Duration::minutes(30));

        // recorded failures while blocked do not extend the block
        let before = limiter.check_limit("ip:10.0.0.1").blocked_until;
        clock.advance(Duration::from_secs(60));
        limiter.record_failed_attempt("ip:10.0.0.1");
        assert_eq!(limiter.check_limit("ip:10.0.0.1").blocked_until, before);
    }

    #[test]
    fn test_block_expires_lazily() {
        let clock = ManualClock::starting_now();
        let limiter = limiter(5, &clock);
        let until = limiter.block("k", Some(Duration::from_secs(10)));
        assert_eq!(until, clock.now() + chrono::Duration::seconds(10));

        clock.advance(Duration::from_secs(10));
        assert!(limiter.is_blocked("k"));

        clock.advance(Duration::from_millis(1));
        assert!(!limiter.is_blocked("k"));
        assert_eq!(limiter.stats().blocked, 0);
    }

    #[test]
    fn test_direct_block_clears_window_and_unblock_does_not_restore() {
        let clock = ManualClock::starting_now();
        let limiter = limiter(5, &clock);
        for _ in 0..4 {
            limiter.check_limit("k");
        }
        let until = limiter.block("k", None);
        assert_eq!(until, clock.now() + chrono::Duration::minutes(30));
        assert_eq!(limiter.stats(), LimiterStats { tracking: 0, blocked: 1 });

        assert!(limiter.unblock("k"));
        assert!(!limiter.unblock("k"));

        let decision = limiter.check_limit("k");
        assert_eq!(decision.remaining_attempts, 4);
    }

    #[test]
    fn test_unbounded_block_saturates() {
        let clock = ManualClock::starting_now();
        let limiter = limiter(5, &clock);

        let until = limiter.block("k", Some(Duration::MAX));
        assert_eq!(until, DateTime::<Utc>::MAX_UTC);
        assert!(limiter.is_blocked("k"));
        assert!(!limiter.check_limit("k").allowed);

        clock.advance(Duration::from_secs(100 * 365 * 24 * 3600));
        assert!(limiter.is_blocked("k"));
        assert_eq!(limiter.reclaim(), 0);
    }

    #[test]
    fn test_concurrent_checks_allow_exactly_max_attempts() {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
        use std::sync::Barrier;
        use std::thread;

        const THREADS: usize = 8;
        const CALLS_PER_THREAD: usize = 25;
        let clock = ManualClock::starting_now();
        let limiter = Arc::new(limiter(5, &clock));
        let allowed = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(THREADS + 1));

        let sweeper = {
            let limiter = Arc::clone(&limiter);
            let done = Arc::clone(&done);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                while !done.load(Ordering::Acquire) {
                    limiter.reclaim();
                    thread::yield_now();
                }
            })
        };

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let allowed = Arc::clone(&allowed);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..CALLS_PER_THREAD {
                        if limiter.check_limit("ip:10.0.0.1").allowed {
                            allowed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        done.store(true, Ordering::Release);
        sweeper.join().unwrap();

        assert_eq!(allowed.load(Ordering::Relaxed), 5);
        assert!(limiter.is_blocked("ip:10.0.0.1"));
        assert_eq!(limiter.stats(), LimiterStats { tracking: 0, blocked: 1 });
    }

    #[test]
    fn test_login_scenario_after_window_and_unblock() {
        let clock = ManualClock::starting_now();
        let limiter = AttemptLimiter::new(
            AttemptLimiterConfig {
                max_attempts: 5,
                window_ms: 900_000,
                ..AttemptLimiterConfig::default()
            },
            clock.shared(),
        );
        let ip = "ip:1.2.3.4";

        let mut last = None;
        for _ in 0..6 {
            last = Some(limiter.check_limit(ip));
            clock.advance(Duration::from_millis(100));
        }
        assert!(!last.unwrap().allowed);

        clock.advance(Duration::from_millis(900_001));
        limiter.unblock(ip);

        let seventh = limiter.check_limit(ip);
        assert!(seventh.allowed);
        assert_eq!(seventh.remaining_attempts, 4);
    }

    #[test]
    fn test_reclaim_removes_stale_entries() {
        let clock = ManualClock::starting_now();
        let limiter = limiter(5, &clock);
        limiter.check_limit("stale");
        limiter.block("short", Some(Duration::from_secs(60)));
        limiter.block("long", Some(Duration::from_secs(3600)));

        assert_eq!(limiter.reclaim(), 0);

        clock.advance(Duration::from_secs(16 * 60));
        limiter.check_limit("fresh");

        assert_eq!(limiter.reclaim(), 2);
        assert_eq!(limiter.stats(), LimiterStats { tracking: 1, blocked: 1 });
        assert_eq!(limiter.reclaim(), 0);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = Utc::now();
        let decision = LimitDecision::blocked(now + chrono::Duration::milliseconds(1_500));
        assert_eq!(decision.retry_after(now), Some(2));
        assert_eq!(LimitDecision::allowed(3).retry_after(now), None);
    }

    #[test]
    fn test_blocked_response_status() {
        let now = Utc::now();
        let response = blocked_response(&LimitDecision::blocked(now + chrono::Duration::seconds(30)), now);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["Retry-After"], "30");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_clears_state() {
        let clock = ManualClock::starting_now();
        let limiter = AttemptLimiter::spawn(AttemptLimiterConfig::default(), clock.shared());
        limiter.check_limit("k");
        limiter.block("b", None);

        limiter.shutdown();
        limiter.shutdown();

        assert_eq!(limiter.stats(), LimiterStats::default());
        assert!(!limiter.reclaimer.is_running());
    }
}
