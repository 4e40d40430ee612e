//! Rolling-window call ceiling shared by all tasks talking to one API

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Admits at most `limit` calls within any window of length `window`
///
/// The ledger holds the admission times of the calls inside the current
/// window. It is only touched while the lock is held and the lock is never
/// held across a suspension point; waiting happens outside of it and is
/// followed by a fresh check, so concurrent waiters cannot overshoot.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    ledger: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            window,
            ledger: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[inline]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait until one more call fits into the window, then record it
    pub async fn acquire(&self) {
        loop {
            let wait = match self.try_acquire(Instant::now()) {
                None => return,
                Some(wait) => wait,
            };
            tracing::debug!(
                "Rate limit of {} calls per {:?} reached, waiting {:?}",
                self.limit,
                self.window,
                wait
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Number of admissions still inside the window ending now
    pub fn in_window(&self) -> usize {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune(&mut ledger, Instant::now());
        ledger.len()
    }

    /// Record a call at `now` if it fits; otherwise return how long to wait
    fn try_acquire(&self, now: Instant) -> Option<Duration> {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune(&mut ledger, now);
        if ledger.len() < self.limit {
            ledger.push_back(now);
            return None;
        }
        let oldest = ledger.front().copied().unwrap_or(now);
        Some(self.window.saturating_sub(now.duration_since(oldest)))
    }

    fn prune(&self, ledger: &mut VecDeque<Instant>, now: Instant) {
        while ledger
            .front()
            .is_some_and(|&oldest| now.duration_since(oldest) >= self.window)
        {
            ledger.pop_front();
        }
    }
}
