//! Sliding-window request admission control.
//!
//! This module provides the [`RateLimiter`] struct which caps how many requests
//! may start inside a rolling time window. Each admitted request occupies one
//! slot until `window` has elapsed since its admission.
//!
//! # Overview
//!
//! Two independent instances are used in practice: one for catalog API calls
//! (capacity 15) and one for download submissions to the engine (capacity 99).
//! Both use a 61 second window so a per-minute server quota is never hit on
//! the boundary.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use mirror_core::download::RateLimiter;
//!
//! let limiter = Arc::new(RateLimiter::new(2));
//!
//! assert!(limiter.admit());
//! assert!(limiter.admit());
//! // Window is full until the oldest entry expires.
//! assert!(!limiter.admit());
//! assert_eq!(limiter.to_string(), "2/2");
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument};

/// Window used when none is given: one minute plus a second of slack.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(61);

/// Default capacity for download submissions per window.
pub const DEFAULT_DOWNLOAD_CAPACITY: usize = 99;

/// Default capacity for catalog API calls per window.
pub const DEFAULT_API_CAPACITY: usize = 15;

/// Sliding-window rate limiter.
///
/// Holds a FIFO of expiry instants. All operations take one short-lived
/// mutex; nothing awaits or blocks while it is held, so the limiter can be
/// shared by `Arc` across tasks.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    expiries: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter with the default 61 second window.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_window(capacity, DEFAULT_WINDOW)
    }

    /// Creates a limiter with an explicit window.
    #[must_use]
    pub fn with_window(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            expiries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Maximum number of requests admitted per window.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Length of the sliding window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.expiries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn purge(entries: &mut VecDeque<Instant>, now: Instant) {
        while entries.front().is_some_and(|expiry| *expiry <= now) {
            entries.pop_front();
        }
    }

    /// Admits one request if the window has room.
    ///
    /// Returns `true` and records the request when fewer than `capacity`
    /// unexpired entries remain; returns `false` without side effects otherwise.
    pub fn admit(&self) -> bool {
        let now = Instant::now();
        let mut entries = self.entries();
        Self::purge(&mut entries, now);

        if entries.len() < self.capacity {
            entries.push_back(now + self.window);
            true
        } else {
            false
        }
    }

    /// Time until the oldest entry expires; zero when nothing is recorded.
    #[must_use]
    pub fn time_until_next_slot(&self) -> Duration {
        let now = Instant::now();
        let mut entries = self.entries();
        Self::purge(&mut entries, now);

        entries
            .front()
            .map_or(Duration::ZERO, |oldest| oldest.saturating_duration_since(now))
    }

    /// Drops expired entries.
    pub fn refresh(&self) {
        let now = Instant::now();
        Self::purge(&mut self.entries(), now);
    }

    /// Forgets every recorded request.
    ///
    /// Used after the server imposed an out-of-band penalty that already
    /// covered the window.
    pub fn reset(&self) {
        self.entries().clear();
    }

    /// Number of unexpired entries.
    #[must_use]
    pub fn occupancy(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        Self::purge(&mut entries, now);
        entries.len()
    }

    /// Returns true when the next `admit` would fail.
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.occupancy() >= self.capacity
    }

    /// Waits until a slot is free, then takes it.
    ///
    /// The mutex is never held across the sleep.
    #[instrument(skip(self), fields(capacity = self.capacity))]
    pub async fn acquire(&self) {
        loop {
            if self.admit() {
                return;
            }
            let wait = self.time_until_next_slot();
            debug!(wait_ms = wait.as_millis(), "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

impl fmt::Display for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.occupancy(), self.capacity)
    }
}
