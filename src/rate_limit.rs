//! Per-client request rate limiting
//!
//! Sliding-window counter: each key owns a `(window_start, count)` pair that
//! resets once the window has elapsed. Bursts straddling a window boundary
//! can briefly reach twice the nominal rate; in exchange each key costs O(1)
//! memory.
//!
//! Keys live in a `DashMap`, so the check-and-increment for one key happens
//! under that key's shard lock and unrelated clients do not contend.

use crate::config::RateLimitConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Checks between sweeps of fully expired entries
const SWEEP_INTERVAL: u64 = 1024;

/// Outcome of a rate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCheck {
    pub allowed: bool,
    /// Milliseconds until the key's window resets; 0 when allowed
    pub retry_after_ms: u64,
}

impl RateCheck {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    window_start: Instant,
    count: u32,
}

pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    exempt: Vec<String>,
    entries: DashMap<String, WindowEntry>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration, exempt: Vec<String>) -> Self {
        Self {
            max_requests,
            window,
            exempt: exempt.into_iter().map(|k| k.to_ascii_lowercase()).collect(),
            entries: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window(), config.exempt.clone())
    }

    /// Check `key` against its quota and, if admitted, record the request.
    pub fn check(&self, key: &str) -> RateCheck {
        self.check_at(key, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading.
    pub fn check_at(&self, key: &str, now: Instant) -> RateCheck {
        if self.is_exempt(key) {
            return RateCheck::allowed();
        }

        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.sweep(now);
        }

        let mut entry = self.entries.entry(key.to_string()).or_insert(WindowEntry {
            window_start: now,
            count: 0,
        });

        let mut elapsed = now.saturating_duration_since(entry.window_start);
        if elapsed >= self.window {
            entry.window_start = now;
            entry.count = 0;
            elapsed = Duration::ZERO;
        }

        if entry.count >= self.max_requests {
            let remaining = self.window - elapsed;
            return RateCheck {
                allowed: false,
                retry_after_ms: (remaining.as_millis() as u64).max(1),
            };
        }

        entry.count += 1;
        RateCheck::allowed()
    }

    pub fn is_exempt(&self, key: &str) -> bool {
        self.exempt.iter().any(|k| k.eq_ignore_ascii_case(key))
    }

    /// Drop entries whose window has fully elapsed.
    pub fn sweep(&self, now: Instant) {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.window_start) < self.window);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Rate limiter swept {} expired entries", removed);
        }
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}
