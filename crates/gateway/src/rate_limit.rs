//! Per-sender sliding-window rate limiting.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

/// Default maximum messages per sender per window.
pub const DEFAULT_MAX_PER_WINDOW: usize = 10;

/// Default window width.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// How often the owner should call [`SenderRateLimiter::cleanup`].
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Sliding-window limiter: a sender is limited once it has `max` timestamps
/// inside the window. Checking while limited does not consume a slot.
#[derive(Debug)]
pub struct SenderRateLimiter {
    max: usize,
    window: Duration,
    senders: HashMap<String, VecDeque<Instant>>,
}

impl SenderRateLimiter {
    #[must_use]
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            senders: HashMap::new(),
        }
    }

    /// Whether `sender_id` is currently limited. When not limited, the call
    /// records one message against the window.
    pub fn is_limited(&mut self, sender_id: &str) -> bool {
        self.is_limited_at(sender_id, Instant::now())
    }

    fn is_limited_at(&mut self, sender_id: &str, now: Instant) -> bool {
        let window = self.window;
        let stamps = self.senders.entry(sender_id.to_string()).or_default();
        while let Some(front) = stamps.front() {
            if now.duration_since(*front) > window {
                stamps.pop_front();
            } else {
                break;
            }
        }
        if stamps.len() >= self.max {
            return true;
        }
        stamps.push_back(now);
        false
    }

    /// Drop senders whose window has fully drained. Call periodically so an
    /// idle sender does not pin an entry forever.
    pub fn cleanup(&mut self) {
        self.cleanup_at(Instant::now());
    }

    fn cleanup_at(&mut self, now: Instant) {
        let window = self.window;
        self.senders.retain(|_, stamps| {
            while let Some(front) = stamps.front() {
                if now.duration_since(*front) > window {
                    stamps.pop_front();
                } else {
                    break;
                }
            }
            !stamps.is_empty()
        });
    }

    #[cfg(test)]
    fn tracked_senders(&self) -> usize {
        self.senders.len()
    }
}

impl Default for SenderRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_WINDOW, DEFAULT_WINDOW)
    }
}
