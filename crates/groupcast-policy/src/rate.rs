//! Sliding-window rate limiter shared by every outbound sender

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const RATE_WINDOW: Duration = Duration::from_secs(60);
pub const RATE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Caps actions to N per trailing 60-second window.
///
/// `acquire` never rejects: it suspends the caller until one more action fits.
#[derive(Debug, Default)]
pub struct RateLimiter {
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn trim(window: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= RATE_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    fn reserve(&self, limit_per_minute: u32) -> Option<Instant> {
        let limit = limit_per_minute.max(1) as usize;
        let now = Instant::now();
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        Self::trim(&mut window, now);
        if window.len() >= limit {
            return None;
        }
        window.push_back(now);
        Some(now)
    }

    /// Record one action if it fits under `limit_per_minute`. A zero limit is treated as one.
    pub fn try_acquire(&self, limit_per_minute: u32) -> bool {
        self.reserve(limit_per_minute).is_some()
    }

    /// Wait for room in the window and record one action; returns the recorded slot.
    pub async fn acquire(&self, limit_per_minute: u32) -> Instant {
        let mut waited = false;
        loop {
            if let Some(slot) = self.reserve(limit_per_minute) {
                return slot;
            }
            if !waited {
                debug!("Rate limit of {}/min reached, waiting", limit_per_minute);
                waited = true;
            }
            tokio::time::sleep(RATE_POLL_INTERVAL).await;
        }
    }

    /// Give back a slot from `acquire` whose action was never performed.
    pub fn release(&self, slot: Instant) -> bool {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        match window.iter().rposition(|recorded| *recorded == slot) {
            Some(index) => {
                window.remove(index);
                true
            }
            None => false,
        }
    }

    /// Actions recorded in the trailing window.
    pub fn recent(&self) -> usize {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        Self::trim(&mut window, Instant::now());
        window.len()
    }
}
