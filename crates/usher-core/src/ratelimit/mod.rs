//! Sliding-window rate limiting for sync submissions.
//!
//! The reconciliation service takes the limiter as an injected component
//! rather than global state, keyed by caller identity (the operator
//! subject behind the credential, not a network address): one station
//! syncing aggressively must not starve the others.
//!
//! Rejected requests surface as a retryable rate-limited outcome; the
//! dispatcher retries them with backoff, so hitting the ceiling is never
//! data loss.
//!
//! Memory is bounded two ways, as in any limiter fed by untrusted input:
//! cleanup runs every `cleanup_interval` requests to drop idle callers,
//! and `max_tracked_callers` hard-caps the map. When the cap is reached
//! and a new caller arrives, cleanup is forced; if still full, the request
//! is rejected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use thiserror::Error;

/// Returned when a request exceeds the ceiling.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("rate limit exceeded")]
pub struct RateLimitExceeded;

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests allowed within the window.
    pub max_requests: u32,

    /// Sliding window size in seconds.
    pub window_secs: u64,

    /// How often cleanup runs (every N requests).
    pub cleanup_interval: u64,

    /// Hard cap on tracked caller identities.
    pub max_tracked_callers: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            // A station drains its whole outbox in one call, so even busy
            // venues sit far below this.
            max_requests: 60,
            window_secs: 60,
            cleanup_interval: 100,
            max_tracked_callers: 10_000,
        }
    }
}

/// In-memory sliding-window rate limiter keyed by caller identity.
pub struct RateLimiter {
    config: RateLimitConfig,
    // Caller identity -> timestamps of requests inside the window.
    state: RwLock<HashMap<String, Vec<Instant>>>,
    request_count: AtomicU64,
}

impl RateLimiter {
    /// Creates a limiter with the given configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HashMap::new()),
            request_count: AtomicU64::new(0),
        }
    }

    /// Checks whether a request from `caller` is allowed, recording it if so.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] when the caller is over the ceiling,
    /// or when the tracked-caller cap is reached and cleanup cannot make
    /// room for a new caller.
    pub fn check(&self, caller: &str) -> Result<(), RateLimitExceeded> {
        let now = Instant::now();
        let window = std::time::Duration::from_secs(self.config.window_secs);
        let cutoff = now.checked_sub(window).unwrap_or(now);

        // Relaxed is fine: a missed or doubled cleanup is harmless.
        let count = self.request_count.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.cleanup_interval == 0 {
            tracing::debug!(request_count = count, "running periodic rate limiter cleanup");
            self.cleanup();
        }

        {
            let state = self.read_state();

            if let Some(timestamps) = state.get(caller) {
                let recent = timestamps.iter().filter(|&&t| t > cutoff).count();
                if recent >= self.config.max_requests as usize {
                    tracing::warn!(
                        caller = %caller,
                        requests = recent,
                        max = self.config.max_requests,
                        "rate limit exceeded"
                    );
                    return Err(RateLimitExceeded);
                }
            } else if state.len() >= self.config.max_tracked_callers {
                drop(state);
                self.cleanup();

                let state = self.read_state();
                if !state.contains_key(caller) && state.len() >= self.config.max_tracked_callers {
                    tracing::warn!(
                        caller = %caller,
                        tracked = state.len(),
                        "rejecting new caller: tracked-caller cap reached"
                    );
                    return Err(RateLimitExceeded);
                }
            }
        }

        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Re-check under the write lock; another thread may have filled the
        // map between our read and here.
        if !state.contains_key(caller) && state.len() >= self.config.max_tracked_callers {
            return Err(RateLimitExceeded);
        }

        let timestamps = state.entry(caller.to_string()).or_default();
        timestamps.retain(|&t| t > cutoff);
        if timestamps.len() >= self.config.max_requests as usize {
            return Err(RateLimitExceeded);
        }
        timestamps.push(now);

        Ok(())
    }

    /// Drops callers with no requests inside the window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = std::time::Duration::from_secs(self.config.window_secs);
        let cutoff = now.checked_sub(window).unwrap_or(now);

        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.retain(|_, timestamps| {
            timestamps.retain(|&t| t > cutoff);
            !timestamps.is_empty()
        });
    }

    /// Number of caller identities currently tracked.
    #[must_use]
    pub fn tracked_callers(&self) -> usize {
        self.read_state().len()
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Vec<Instant>>> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
